//! Filesystem-backed [`ArtifactStore`].
//!
//! Every write lands in a `.tmp` sibling first and is then renamed over the
//! target, so a crash never leaves a half-written `status.json` behind.
//! References are paths relative to the store root
//! (`papers/1706.03762/paper.pdf`).

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{artifact_file_name, ArtifactRef, ArtifactStore, StoreError};
use crate::paper::PaperMetadata;
use crate::pipeline::{ProcessingRecord, Step};

const PAPERS_DIR: &str = "papers";
const STATUS_FILE: &str = "status.json";
const METADATA_FILE: &str = "metadata.json";

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let papers = root.join(PAPERS_DIR);
        fs::create_dir_all(&papers).map_err(|e| io_err(&papers, e))?;
        log::debug!("store: opened {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path behind a reference.
    pub fn resolve(&self, artifact: &ArtifactRef) -> Result<PathBuf, StoreError> {
        let rel = Path::new(artifact.as_str());
        let inside = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !inside || !rel.starts_with(PAPERS_DIR) {
            return Err(StoreError::InvalidRef(artifact.to_string()));
        }
        Ok(self.root.join(rel))
    }

    fn paper_rel_dir(paper_id: &str) -> PathBuf {
        Path::new(PAPERS_DIR).join(encode_id(paper_id))
    }

    fn paper_dir(&self, paper_id: &str) -> PathBuf {
        self.root.join(Self::paper_rel_dir(paper_id))
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value).map_err(|e| json_err(path, e))?;
        write_atomic(path, &bytes)
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| json_err(path, e))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, paper_id: &str, step: Step, bytes: &[u8]) -> Result<ArtifactRef, StoreError> {
        let rel = Self::paper_rel_dir(paper_id).join(artifact_file_name(step));
        write_atomic(&self.root.join(&rel), bytes)?;
        log::debug!(
            "store: wrote {} bytes for {} ({})",
            bytes.len(),
            paper_id,
            step
        );
        Ok(ArtifactRef::new(rel_to_ref(&rel)))
    }

    fn get(&self, paper_id: &str, step: Step) -> Result<Option<ArtifactRef>, StoreError> {
        let rel = Self::paper_rel_dir(paper_id).join(artifact_file_name(step));
        Ok(self
            .root
            .join(&rel)
            .is_file()
            .then(|| ArtifactRef::new(rel_to_ref(&rel))))
    }

    fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(artifact)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == IoErrorKind::NotFound {
                StoreError::NotFound(artifact.to_string())
            } else {
                io_err(&path, e)
            }
        })
    }

    fn record_status(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        let path = self.paper_dir(&record.paper_id).join(STATUS_FILE);
        self.write_json(&path, record)
    }

    fn load_status(&self, paper_id: &str) -> Result<Option<ProcessingRecord>, StoreError> {
        self.read_json(&self.paper_dir(paper_id).join(STATUS_FILE))
    }

    fn list_statuses(&self) -> Result<Vec<ProcessingRecord>, StoreError> {
        let papers = self.root.join(PAPERS_DIR);
        let entries = match fs::read_dir(&papers) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&papers, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&papers, e))?;
            let status = entry.path().join(STATUS_FILE);
            if let Some(record) = self.read_json::<ProcessingRecord>(&status)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));
        Ok(records)
    }

    fn put_metadata(&self, metadata: &PaperMetadata) -> Result<(), StoreError> {
        let path = self.paper_dir(&metadata.paper_id).join(METADATA_FILE);
        self.write_json(&path, metadata)
    }

    fn load_metadata(&self, paper_id: &str) -> Result<Option<PaperMetadata>, StoreError> {
        self.read_json(&self.paper_dir(paper_id).join(METADATA_FILE))
    }

    fn discard_artifacts(&self, paper_id: &str) -> Result<(), StoreError> {
        let dir = self.paper_dir(paper_id);
        for step in Step::ALL {
            let path = dir.join(artifact_file_name(step));
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("store: removed {}", path.display()),
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path, e)),
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Directory name for a paper id.
///
/// `[A-Za-z0-9.-]` is kept; every other byte (including `_` itself and a
/// leading `.`) becomes `_XX` hex, so distinct ids never share a directory.
/// Old-style ids contain a `/`: `hep-th/9901001` → `hep-th_2F9901001`.
pub fn encode_id(paper_id: &str) -> String {
    if paper_id.is_empty() {
        return "_".to_string();
    }
    let mut name = String::with_capacity(paper_id.len());
    for (i, b) in paper_id.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'-' || (b == b'.' && i > 0);
        if keep {
            name.push(char::from(b));
        } else {
            name.push_str(&format!("_{b:02X}"));
        }
    }
    name
}

/// Refs always use `/`, whatever the platform separator.
fn rel_to_ref(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_err(path: &Path, source: serde_json::Error) -> StoreError {
    StoreError::Json {
        path: path.display().to_string(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
