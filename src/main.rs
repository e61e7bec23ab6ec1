//! Application entry point for arxiv-to-speech.
//!
//! # Startup sequence
//!
//! 1. Parse the command line ([`Cli`]).
//! 2. Initialise logging (`info`, or `debug` with `-v`; `RUST_LOG` wins).
//! 3. Load [`AppConfig`] from `--config` or the platform config dir
//!    (defaults on first run), then apply environment overrides.
//! 4. Create the [`tokio`] runtime (multi-thread).
//! 5. Arm Ctrl-C: the first signal cancels the batch cooperatively.
//! 6. Run the command and map the outcome to an exit code:
//!    `0` all done, `2` some papers failed, `1` error.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use arxiv_to_speech::cli::{self, Cli};
use arxiv_to_speech::config::AppConfig;

fn main() -> ExitCode {
    // 1. CLI
    let args = Cli::parse();

    // 2. Logging
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
    log::info!("arxiv-to-speech v{}", env!("CARGO_PKG_VERSION"));

    // 3. Config
    let loaded = match &args.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("config: {e:#}");
            return ExitCode::from(1);
        }
    };
    config.apply_env_overrides();

    // 4. Tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to create tokio runtime: {e}");
            return ExitCode::from(1);
        }
    };

    rt.block_on(async move {
        // 5. Ctrl-C
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("interrupt received, finishing current steps");
                    cancel.cancel();
                }
            });
        }

        // 6. Command
        match cli::execute(args, config, cancel).await {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::from(2),
            Err(e) => {
                log::error!("{e:#}");
                ExitCode::from(1)
            }
        }
    })
}
