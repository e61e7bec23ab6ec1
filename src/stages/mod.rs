//! Stage executors: one external call per pipeline step.
//!
//! # Capability
//!
//! Every step is served by a [`StageExecutor`]: it receives the artifact of
//! the previous step (none for `Download`) plus the paper metadata, persists
//! its own output through the shared [`ArtifactStore`](crate::store::ArtifactStore)
//! and returns the reference.  Executors decide whether a failure is worth
//! retrying.
//!
//! ```text
//! Download   ArxivDownloader       arXiv Atom API + PDF    → paper.pdf, metadata.json
//! Extract    PdfTextExtractor      pdf-extract (blocking)  → extracted.md
//! Summarize  ApiSummarizer         /v1/chat/completions    → summary.txt
//!            AnthropicSummarizer   /v1/messages            → summary.txt
//! Synthesize ApiSynthesizer        /v1/audio/speech        → audio.mp3
//! ```

pub mod arxiv;
pub mod extract;
pub mod http;
pub mod prompt;
pub mod summarize;
pub mod synthesize;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::AppConfig;
use crate::paper::PaperMetadata;
use crate::pipeline::Step;
use crate::rate_limit::RateGates;
use crate::store::{ArtifactRef, ArtifactStore, StoreError};

pub use arxiv::{ArxivClient, ArxivDownloader, ArxivError};
pub use extract::PdfTextExtractor;
pub use prompt::PromptBuilder;
pub use summarize::{summarizer_for, AnthropicSummarizer, ApiSummarizer};
pub use synthesize::ApiSynthesizer;

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Whether a failed step may succeed on another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => f.write_str("retryable"),
            ErrorClass::Permanent => f.write_str("permanent"),
        }
    }
}

/// A classified step failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub class: ErrorClass,
    pub message: String,
}

impl ExecutorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }
}

/// Disk trouble is retried; a bad or missing reference is not.
impl From<StoreError> for ExecutorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidRef(_) | StoreError::NotFound(_) => {
                ExecutorError::permanent(e.to_string())
            }
            _ => ExecutorError::retryable(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// StageExecutor trait
// ---------------------------------------------------------------------------

/// One pipeline step.
///
/// Implementors must be `Send + Sync`; they are shared as
/// `Arc<dyn StageExecutor>` by every worker.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        input: Option<&ArtifactRef>,
        metadata: &PaperMetadata,
    ) -> Result<ArtifactRef, ExecutorError>;
}

/// The closed step → executor table.
#[derive(Clone)]
pub struct Executors {
    pub download: Arc<dyn StageExecutor>,
    pub extract: Arc<dyn StageExecutor>,
    pub summarize: Arc<dyn StageExecutor>,
    pub synthesize: Arc<dyn StageExecutor>,
}

impl Executors {
    /// The real executors, wired to `store` and the shared rate gates.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn ArtifactStore>,
        gates: &RateGates,
    ) -> Self {
        let arxiv = ArxivClient::new(&config.arxiv, gates.arxiv.clone());
        Self {
            download: Arc::new(ArxivDownloader::new(arxiv, store.clone())),
            extract: Arc::new(PdfTextExtractor::new(store.clone())),
            summarize: summarizer_for(&config.llm, store.clone(), gates.llm.clone()),
            synthesize: Arc::new(ApiSynthesizer::from_config(
                &config.tts,
                store,
                gates.tts.clone(),
            )),
        }
    }

    pub fn for_step(&self, step: Step) -> &Arc<dyn StageExecutor> {
        match step {
            Step::Download => &self.download,
            Step::Extract => &self.extract,
            Step::Summarize => &self.summarize,
            Step::Synthesize => &self.synthesize,
        }
    }
}

/// The input artifact an executor requires; a missing one cannot be fixed by
/// retrying.
pub(crate) fn require_input(input: Option<&ArtifactRef>) -> Result<&ArtifactRef, ExecutorError> {
    input.ok_or_else(|| ExecutorError::permanent("missing input artifact"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_are_classified() {
        let io = StoreError::Io {
            path: "x".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(ExecutorError::from(io).is_retryable());
        assert!(!ExecutorError::from(StoreError::NotFound("r".into())).is_retryable());
    }

    #[test]
    fn executor_error_displays_message() {
        let e = ExecutorError::permanent("HTTP 404");
        assert_eq!(e.to_string(), "HTTP 404");
        assert_eq!(e.class.to_string(), "permanent");
    }

    #[test]
    fn require_input_rejects_none() {
        let err = require_input(None).unwrap_err();
        assert_eq!(err.class, ErrorClass::Permanent);
    }
}
