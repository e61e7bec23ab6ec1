//! Configuration module for arxiv-to-speech.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for each subsystem,
//! `AppPaths` for cross-platform config/data directories, and TOML
//! persistence via `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AppConfig, ArxivConfig, DriverConfig, LlmConfig, LlmProvider, PipelineConfig, RateLimitConfig,
    StorageConfig, TtsConfig,
};
