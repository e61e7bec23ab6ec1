//! Command-line interface.
//!
//! ```text
//! arxiv-to-speech run 1706.03762 2301.12345 --concurrency 4
//! arxiv-to-speech run --query "speculative decoding" --max-results 5
//! arxiv-to-speech resume                 # every Failed record
//! arxiv-to-speech status 1706.03762
//! arxiv-to-speech reset 1706.03762
//! arxiv-to-speech search "diffusion models"
//! arxiv-to-speech init                   # write default settings.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, AppPaths};
use crate::paper::normalize_paper_id;
use crate::pipeline::{BatchReport, Driver, PipelineStateMachine, ProcessingRecord};
use crate::rate_limit::RateGates;
use crate::stages::{ArxivClient, Executors};
use crate::store::{ArtifactStore, FsArtifactStore};

/// Default number of results for `search` and `run --query`.
const DEFAULT_SEARCH_RESULTS: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "arxiv-to-speech", version, about = "Turn arXiv papers into spoken summaries")]
pub struct Cli {
    /// Path to settings.toml (default: platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Root of the artifact store (overrides settings)
    #[arg(long, global = true, env = "ARXIV_TO_SPEECH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process papers to audio summaries
    Run(RunArgs),

    /// Retry papers whose record is Failed
    Resume {
        /// Paper ids (default: every failed record)
        ids: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the stored record of papers
    Status {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Forget progress and artifacts of papers
    Reset {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// List the most recent papers matching a query
    Search {
        query: String,

        #[arg(long, default_value_t = DEFAULT_SEARCH_RESULTS)]
        max_results: usize,
    },

    /// Write a settings.toml holding the defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// arXiv ids or URLs
    pub ids: Vec<String>,

    /// Also process the most recent papers matching this query
    #[arg(long)]
    pub query: Option<String>,

    /// Process at most this many papers
    #[arg(long)]
    pub max_results: Option<usize>,

    /// Papers processed at once (overrides settings)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Retry papers whose record is Failed instead of reporting them
    #[arg(long)]
    pub resume: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Application wiring
// ---------------------------------------------------------------------------

/// Everything a command needs, built once from config.
struct App {
    config: AppConfig,
    store: Arc<dyn ArtifactStore>,
    gates: RateGates,
    machine: Arc<PipelineStateMachine>,
}

impl App {
    fn build(config: AppConfig) -> Result<Self> {
        let root = config.storage.resolved_data_dir();
        let store: Arc<dyn ArtifactStore> = Arc::new(
            FsArtifactStore::open(&root)
                .with_context(|| format!("cannot open store at {}", root.display()))?,
        );
        log::info!("cli: store at {}", root.display());

        let gates = RateGates::from_config(&config.rate_limit);
        let executors = Executors::from_config(&config, store.clone(), &gates);
        let machine = Arc::new(PipelineStateMachine::new(
            store.clone(),
            executors,
            &config.pipeline,
        ));
        Ok(Self {
            config,
            store,
            gates,
            machine,
        })
    }

    fn driver(&self, concurrency: Option<usize>, cancel: &CancellationToken) -> Driver {
        let driver = Driver::new(self.machine.clone(), &self.config.driver);
        let driver = match concurrency {
            Some(n) => driver.with_concurrency(n),
            None => driver,
        };
        // Forward the Ctrl-C token into the driver's own.
        let inner = driver.cancellation_token();
        let outer = cancel.clone();
        tokio::spawn(async move {
            outer.cancelled().await;
            inner.cancel();
        });
        driver
    }

    fn arxiv(&self) -> ArxivClient {
        ArxivClient::new(&self.config.arxiv, self.gates.arxiv.clone())
    }
}

/// Execute a parsed command.
///
/// Returns `Ok(true)` when every requested paper is complete (or the command
/// does not process papers), `Ok(false)` on partial failure.
pub async fn execute(cli: Cli, mut config: AppConfig, cancel: CancellationToken) -> Result<bool> {
    if let Command::Init { force } = cli.command {
        return init(cli.config, &config, force).map(|_| true);
    }

    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = Some(dir);
    }
    let app = App::build(config)?;

    match cli.command {
        Command::Run(args) => run(&app, args, &cancel).await,
        Command::Resume { ids, json } => {
            let ids = normalize_all(&ids)?;
            let driver = app.driver(None, &cancel);
            let scope = (!ids.is_empty()).then_some(ids.as_slice());
            let report = driver.resume_failed(scope).await?;
            print_report(&report, json)?;
            Ok(report.is_success())
        }
        Command::Status { ids } => {
            for id in normalize_all(&ids)? {
                match app.store.load_status(&id)? {
                    Some(rec) => print_record(&rec),
                    None => println!("{id}: no record"),
                }
            }
            Ok(true)
        }
        Command::Reset { ids } => {
            for id in normalize_all(&ids)? {
                let rec = app.machine.reset(&id).await?;
                println!("{}: {}", rec.paper_id, rec.stage);
            }
            Ok(true)
        }
        Command::Search { query, max_results } => {
            for paper in app.arxiv().search(&query, max_results).await? {
                let date = paper
                    .published
                    .map(|p| p.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                println!("{:<18} {:<10}  {}", paper.paper_id, date, paper.display_title());
            }
            Ok(true)
        }
        Command::Init { .. } => unreachable!("handled above"),
    }
}

async fn run(app: &App, args: RunArgs, cancel: &CancellationToken) -> Result<bool> {
    let mut ids = normalize_all(&args.ids)?;
    if let Some(query) = &args.query {
        let limit = args.max_results.unwrap_or(DEFAULT_SEARCH_RESULTS);
        let found = app.arxiv().search(query, limit).await?;
        ids.extend(found.into_iter().map(|p| p.paper_id));
    }
    if ids.is_empty() {
        bail!("nothing to do: give paper ids or --query");
    }

    let driver = app.driver(args.concurrency, cancel);
    let report = driver
        .process_requested(&ids, args.max_results, args.resume)
        .await?;
    print_report(&report, args.json)?;
    Ok(report.is_success())
}

fn init(path: Option<PathBuf>, config: &AppConfig, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| AppPaths::new().settings_file);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    config.save_to(&path)?;
    println!("wrote {}", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn normalize_all(raw: &[String]) -> Result<Vec<String>> {
    raw.iter()
        .map(|r| normalize_paper_id(r).with_context(|| format!("invalid paper id: {r:?}")))
        .collect()
}

fn print_report(report: &BatchReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

fn print_record(rec: &ProcessingRecord) {
    println!("{}", rec.paper_id);
    println!("  stage:    {}", rec.stage);
    println!("  attempts: {}", rec.attempt_count);
    if let Some(err) = &rec.last_error {
        println!("  error:    {err} (at {})", err.at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    for (step, artifact) in &rec.artifact_refs {
        println!("  {:<9} {artifact}", format!("{step}:"));
    }
    println!("  updated:  {}", rec.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
}
