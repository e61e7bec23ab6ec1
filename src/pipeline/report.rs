//! Per-batch outcome summary.

use std::fmt;

use serde::Serialize;

use super::record::ProcessingRecord;
use super::stage::Stage;

/// Where a paper ended up when the batch finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperStatus {
    Complete,
    Failed,
    /// Started but stopped before a final stage (cancelled mid-run).
    InProgress,
    /// Never started because the batch was cancelled first.
    Cancelled,
}

impl fmt::Display for PaperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            PaperStatus::Complete => "complete",
            PaperStatus::Failed => "failed",
            PaperStatus::InProgress => "in progress",
            PaperStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    pub paper_id: String,
    pub status: PaperStatus,
    pub stage: Stage,
    pub error: Option<String>,
}

impl ReportEntry {
    /// Entry reflecting a persisted record.
    pub fn from_record(record: &ProcessingRecord) -> Self {
        let status = match record.stage {
            Stage::Complete => PaperStatus::Complete,
            Stage::Failed => PaperStatus::Failed,
            _ => PaperStatus::InProgress,
        };
        Self {
            paper_id: record.paper_id.clone(),
            status,
            stage: record.stage,
            error: record.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    pub fn cancelled(paper_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            paper_id: paper_id.into(),
            status: PaperStatus::Cancelled,
            stage,
            error: None,
        }
    }

    /// Infrastructure failure; the record itself may be unreadable.
    pub fn failed(paper_id: impl Into<String>, stage: Stage, error: String) -> Self {
        Self {
            paper_id: paper_id.into(),
            status: PaperStatus::Failed,
            stage,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub total: usize,
    pub complete: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub cancelled: usize,
}

/// Outcome of `process_batch` / `resume_failed`, entries in request order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub entries: Vec<ReportEntry>,
    pub counts: BatchCounts,
}

impl BatchReport {
    pub fn new(entries: Vec<ReportEntry>) -> Self {
        let mut counts = BatchCounts {
            total: entries.len(),
            ..BatchCounts::default()
        };
        for e in &entries {
            match e.status {
                PaperStatus::Complete => counts.complete += 1,
                PaperStatus::Failed => counts.failed += 1,
                PaperStatus::InProgress => counts.in_progress += 1,
                PaperStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Self { entries, counts }
    }

    /// `true` iff every entry is `Complete`.
    pub fn is_success(&self) -> bool {
        self.counts.complete == self.counts.total
    }

    pub fn entry(&self, paper_id: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.paper_id == paper_id)
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for e in &self.entries {
            write!(f, "{:<24} {:<12} {}", e.paper_id, e.status, e.stage)?;
            if let Some(err) = &e.error {
                write!(f, "  {err}")?;
            }
            writeln!(f)?;
        }
        let c = &self.counts;
        write!(
            f,
            "{} papers: {} complete, {} failed, {} in progress, {} cancelled",
            c.total, c.complete, c.failed, c.in_progress, c.cancelled
        )
    }
}
