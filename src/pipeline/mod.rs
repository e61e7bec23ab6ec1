//! Processing pipeline for arXiv papers.
//!
//! Drives each paper through download → extract → summarize → synthesize,
//! persisting progress after every step so a run can resume where it broke.
//!
//! # Architecture
//!
//! ```text
//! Driver::process_batch(ids)           bounded concurrency, cancellation
//!        │
//!        ▼
//! PipelineStateMachine::run_until_cancelled(id)
//!        │   loops advance(), sleeping backoffs via Sleeper
//!        ▼
//! PipelineStateMachine::advance(id)    per-paper lock, one step
//!        │
//!        ├─ Executors::for_step(step).execute(input, metadata)
//!        └─ ArtifactStore::record_status(record)
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arxiv_to_speech::config::AppConfig;
//! use arxiv_to_speech::pipeline::{Driver, PipelineStateMachine};
//! use arxiv_to_speech::rate_limit::RateGates;
//! use arxiv_to_speech::stages::Executors;
//! use arxiv_to_speech::store::{ArtifactStore, FsArtifactStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::default();
//!     let store: Arc<dyn ArtifactStore> =
//!         Arc::new(FsArtifactStore::open(config.storage.resolved_data_dir())?);
//!     let gates = RateGates::from_config(&config.rate_limit);
//!     let executors = Executors::from_config(&config, store.clone(), &gates);
//!
//!     let machine = PipelineStateMachine::new(store, executors, &config.pipeline);
//!     let driver = Driver::new(Arc::new(machine), &config.driver);
//!
//!     let report = driver.process_batch(&["1706.03762".to_string()], None).await;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod machine;
pub mod record;
pub mod report;
pub mod retry;
pub mod stage;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use driver::{select_ids, Driver};
pub use machine::{KeyedLocks, PipelineError, PipelineStateMachine, StepOutcome};
pub use record::{ErrorKind, ProcessingRecord, StageError};
pub use report::{BatchCounts, BatchReport, PaperStatus, ReportEntry};
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use stage::{Stage, Step};
