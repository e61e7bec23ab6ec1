//! Batch driver: runs many papers through the state machine.
//!
//! ```text
//! ids ─▶ dedupe ─▶ truncate(max_results) ─▶ stream::buffer_unordered(concurrency)
//!                                               └─▶ run_until_cancelled(id) ─▶ ReportEntry
//! ```
//!
//! One paper's failure never stops the others.  Cancellation is checked
//! before each paper starts and between its steps.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use super::machine::{PipelineError, PipelineStateMachine};
use super::report::{BatchReport, ReportEntry};
use super::stage::Stage;
use crate::config::DriverConfig;

pub struct Driver {
    machine: Arc<PipelineStateMachine>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl Driver {
    pub fn new(machine: Arc<PipelineStateMachine>, config: &DriverConfig) -> Self {
        Self {
            machine,
            concurrency: config.concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Token that stops the driver cooperatively when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn machine(&self) -> &Arc<PipelineStateMachine> {
        &self.machine
    }

    /// Run every paper in `paper_ids` (duplicates dropped, first
    /// `max_results` kept) to completion or failure.
    pub async fn process_batch(
        &self,
        paper_ids: &[String],
        max_results: Option<usize>,
    ) -> BatchReport {
        let ids = select_ids(paper_ids, max_results);
        log::info!(
            "driver: processing {} papers, concurrency {}",
            ids.len(),
            self.concurrency
        );
        self.run_all(ids).await
    }

    /// [`process_batch`](Self::process_batch) that leaves papers whose record
    /// is already `Failed` alone unless `rerun_failed`.  Those are reported
    /// from their record; entries keep request order either way.
    pub async fn process_requested(
        &self,
        paper_ids: &[String],
        max_results: Option<usize>,
        rerun_failed: bool,
    ) -> Result<BatchReport, PipelineError> {
        let selected = select_ids(paper_ids, max_results);

        let mut held: HashMap<String, ReportEntry> = HashMap::new();
        let mut to_run = Vec::new();
        for id in &selected {
            match self.machine.store().load_status(id)? {
                Some(rec) if rec.stage == Stage::Failed && !rerun_failed => {
                    log::info!("driver: {id} failed earlier, not re-running");
                    held.insert(id.clone(), ReportEntry::from_record(&rec));
                }
                _ => to_run.push(id.clone()),
            }
        }

        let ran = self.process_batch(&to_run, None).await;
        let entries = selected
            .iter()
            .filter_map(|id| held.remove(id).or_else(|| ran.entry(id).cloned()))
            .collect();
        Ok(BatchReport::new(entries))
    }

    /// Re-run records currently `Failed`: the given ids, or every stored one.
    /// Attempt counters are kept.
    pub async fn resume_failed(
        &self,
        paper_ids: Option<&[String]>,
    ) -> Result<BatchReport, PipelineError> {
        let store = self.machine.store();
        let failed: Vec<String> = match paper_ids {
            Some(ids) => {
                let mut failed = Vec::new();
                for id in ids {
                    match store.load_status(id)? {
                        Some(rec) if rec.stage == Stage::Failed => {
                            if !failed.contains(&rec.paper_id) {
                                failed.push(rec.paper_id);
                            }
                        }
                        Some(rec) => {
                            log::info!("driver: {id} is {}, not resuming", rec.stage)
                        }
                        None => log::warn!("driver: {id} has no record, not resuming"),
                    }
                }
                failed
            }
            None => store
                .list_statuses()?
                .into_iter()
                .filter(|rec| rec.stage == Stage::Failed)
                .map(|rec| rec.paper_id)
                .collect(),
        };

        log::info!("driver: resuming {} failed papers", failed.len());
        Ok(self.run_all(failed).await)
    }

    async fn run_all(&self, ids: Vec<String>) -> BatchReport {
        let mut results: Vec<(usize, ReportEntry)> = stream::iter(ids.into_iter().enumerate())
            .map(|(index, id)| async move { (index, self.run_one(id).await) })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        let report = BatchReport::new(results.into_iter().map(|(_, e)| e).collect());
        log::info!(
            "driver: batch done ({} complete, {} failed, {} in progress, {} cancelled)",
            report.counts.complete,
            report.counts.failed,
            report.counts.in_progress,
            report.counts.cancelled
        );
        report
    }

    async fn run_one(&self, paper_id: String) -> ReportEntry {
        if self.cancel.is_cancelled() {
            return ReportEntry::cancelled(&paper_id, self.current_stage(&paper_id));
        }

        match self
            .machine
            .run_until_cancelled(&paper_id, &self.cancel)
            .await
        {
            Ok(_) => self.entry_from_store(&paper_id),
            Err(PipelineError::Cancelled) => match self.machine.status(&paper_id) {
                Ok(Some(rec)) => ReportEntry::from_record(&rec),
                _ => ReportEntry::cancelled(&paper_id, Stage::NotStarted),
            },
            Err(e) => {
                log::error!("driver: {paper_id}: {e}");
                ReportEntry::failed(&paper_id, self.current_stage(&paper_id), e.to_string())
            }
        }
    }

    fn entry_from_store(&self, paper_id: &str) -> ReportEntry {
        match self.machine.status(paper_id) {
            Ok(Some(rec)) => ReportEntry::from_record(&rec),
            Ok(None) => ReportEntry::failed(paper_id, Stage::NotStarted, "no record".into()),
            Err(e) => ReportEntry::failed(paper_id, Stage::NotStarted, e.to_string()),
        }
    }

    fn current_stage(&self, paper_id: &str) -> Stage {
        match self.machine.status(paper_id) {
            Ok(Some(rec)) => rec.stage,
            _ => Stage::NotStarted,
        }
    }
}

/// Drop duplicates (first occurrence wins) and keep at most `max_results`.
pub fn select_ids(paper_ids: &[String], max_results: Option<usize>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids: Vec<String> = paper_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect();
    if let Some(max) = max_results {
        ids.truncate(max);
    }
    ids
}
