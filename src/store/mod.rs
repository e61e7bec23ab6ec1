//! Artifact store: keyed persistence of stage outputs and status records.
//!
//! # Layout
//!
//! ```text
//! <root>/papers/<paper dir>/
//!     status.json      ProcessingRecord
//!     metadata.json    PaperMetadata
//!     paper.pdf        download
//!     extracted.md     extract
//!     summary.txt      summarize
//!     audio.mp3        synthesize
//! ```
//!
//! The physical layout is an implementation detail of [`FsArtifactStore`];
//! callers only hold opaque [`ArtifactRef`]s.  [`MemoryArtifactStore`] keeps
//! everything in process and is what the tests use.

pub mod fs;
pub mod memory;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paper::PaperMetadata;
use crate::pipeline::{ProcessingRecord, Step};

pub use fs::FsArtifactStore;
pub use memory::MemoryArtifactStore;

// ---------------------------------------------------------------------------
// ArtifactRef
// ---------------------------------------------------------------------------

/// Opaque location of a persisted stage output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File name used for the output of `step`.
pub fn artifact_file_name(step: Step) -> &'static str {
    match step {
        Step::Download => "paper.pdf",
        Step::Extract => "extracted.md",
        Step::Summarize => "summary.txt",
        Step::Synthesize => "audio.mp3",
    }
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

/// Errors raised by an [`ArtifactStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The reference does not point inside this store.
    #[error("invalid artifact reference: {0}")]
    InvalidRef(String),

    #[error("artifact not found: {0}")]
    NotFound(String),
}

// ---------------------------------------------------------------------------
// ArtifactStore trait
// ---------------------------------------------------------------------------

/// Persistence used by the state machine and the stage executors.
///
/// Implementations must be `Send + Sync`; the store is shared behind an
/// `Arc<dyn ArtifactStore>` by every worker.  Concurrent writes to the *same*
/// paper never happen because the state machine serializes per paper id.
pub trait ArtifactStore: Send + Sync {
    /// Persist the output of `step` and return its reference.
    fn put(&self, paper_id: &str, step: Step, bytes: &[u8]) -> Result<ArtifactRef, StoreError>;

    /// Reference of a stored output, if present.
    fn get(&self, paper_id: &str, step: Step) -> Result<Option<ArtifactRef>, StoreError>;

    /// Contents behind a reference.
    fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError>;

    /// Persist the status record of `record.paper_id`.
    fn record_status(&self, record: &ProcessingRecord) -> Result<(), StoreError>;

    /// Status record of a paper, if one was ever written.
    fn load_status(&self, paper_id: &str) -> Result<Option<ProcessingRecord>, StoreError>;

    /// Every status record in the store.
    fn list_statuses(&self) -> Result<Vec<ProcessingRecord>, StoreError>;

    fn put_metadata(&self, metadata: &PaperMetadata) -> Result<(), StoreError>;

    fn load_metadata(&self, paper_id: &str) -> Result<Option<PaperMetadata>, StoreError>;

    /// Remove every stage output of a paper.  Status and metadata stay.
    fn discard_artifacts(&self, paper_id: &str) -> Result<(), StoreError>;
}

/// Read an artifact as UTF-8 text (lossy).
pub fn read_text(store: &dyn ArtifactStore, artifact: &ArtifactRef) -> Result<String, StoreError> {
    let bytes = store.read(artifact)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
