//! In-process [`ArtifactStore`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use super::{ArtifactRef, ArtifactStore, StoreError};
use crate::paper::PaperMetadata;
use crate::pipeline::{ProcessingRecord, Step};

#[derive(Default)]
struct Inner {
    artifacts: HashMap<(String, Step), Vec<u8>>,
    statuses: HashMap<String, ProcessingRecord>,
    metadata: HashMap<String, PaperMetadata>,
}

/// Keeps every artifact and record in a `HashMap`.
///
/// References have the form `mem://<paper id>/<step>`.
#[derive(Default)]
pub struct MemoryArtifactStore {
    inner: Mutex<Inner>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn make_ref(paper_id: &str, step: Step) -> ArtifactRef {
        ArtifactRef::new(format!("mem://{paper_id}/{step}"))
    }

    fn parse_ref(artifact: &ArtifactRef) -> Option<(String, Step)> {
        let rest = artifact.as_str().strip_prefix("mem://")?;
        let (paper_id, step) = rest.rsplit_once('/')?;
        let step = Step::ALL.into_iter().find(|s| s.as_str() == step)?;
        Some((paper_id.to_string(), step))
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, paper_id: &str, step: Step, bytes: &[u8]) -> Result<ArtifactRef, StoreError> {
        self.lock()
            .artifacts
            .insert((paper_id.to_string(), step), bytes.to_vec());
        Ok(Self::make_ref(paper_id, step))
    }

    fn get(&self, paper_id: &str, step: Step) -> Result<Option<ArtifactRef>, StoreError> {
        let present = self
            .lock()
            .artifacts
            .contains_key(&(paper_id.to_string(), step));
        Ok(present.then(|| Self::make_ref(paper_id, step)))
    }

    fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, StoreError> {
        let key = Self::parse_ref(artifact)
            .ok_or_else(|| StoreError::InvalidRef(artifact.to_string()))?;
        self.lock()
            .artifacts
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(artifact.to_string()))
    }

    fn record_status(&self, record: &ProcessingRecord) -> Result<(), StoreError> {
        self.lock()
            .statuses
            .insert(record.paper_id.clone(), record.clone());
        Ok(())
    }

    fn load_status(&self, paper_id: &str) -> Result<Option<ProcessingRecord>, StoreError> {
        Ok(self.lock().statuses.get(paper_id).cloned())
    }

    fn list_statuses(&self) -> Result<Vec<ProcessingRecord>, StoreError> {
        let mut records: Vec<_> = self.lock().statuses.values().cloned().collect();
        records.sort_by(|a, b| a.paper_id.cmp(&b.paper_id));
        Ok(records)
    }

    fn put_metadata(&self, metadata: &PaperMetadata) -> Result<(), StoreError> {
        self.lock()
            .metadata
            .insert(metadata.paper_id.clone(), metadata.clone());
        Ok(())
    }

    fn load_metadata(&self, paper_id: &str) -> Result<Option<PaperMetadata>, StoreError> {
        Ok(self.lock().metadata.get(paper_id).cloned())
    }

    fn discard_artifacts(&self, paper_id: &str) -> Result<(), StoreError> {
        self.lock().artifacts.retain(|(id, _), _| id != paper_id);
        Ok(())
    }
}
