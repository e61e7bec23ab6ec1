//! The persisted per-paper status record.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::{Stage, Step};
use crate::store::ArtifactRef;

// ---------------------------------------------------------------------------
// ErrorKind / StageError
// ---------------------------------------------------------------------------

/// Classification stored with the last failure of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient failure; the step will be retried.
    Retryable,
    /// The step cannot succeed with the same inputs.
    Permanent,
    /// A retryable failure hit the attempt cap.
    AttemptsExhausted,
    /// `run_to_completion` ran out of its total step budget.
    StepLimitExceeded,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Retryable => "retryable",
            ErrorKind::Permanent => "permanent",
            ErrorKind::AttemptsExhausted => "attempts_exhausted",
            ErrorKind::StepLimitExceeded => "step_limit_exceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure recorded for a paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub step: Step,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed ({}): {}", self.step, self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// ProcessingRecord
// ---------------------------------------------------------------------------

/// Status and artifact references of one paper.
///
/// Mutated only by the pipeline state machine; the methods below keep the
/// record invariants (forward-only stage, refs only for completed steps,
/// attempt counter reset on advance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub paper_id: String,
    pub stage: Stage,
    pub attempt_count: u32,
    pub last_error: Option<StageError>,
    /// Step that escalated the record to `Failed`.
    #[serde(default)]
    pub failed_step: Option<Step>,
    #[serde(default)]
    pub artifact_refs: BTreeMap<Step, ArtifactRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    /// A fresh `NotStarted` record.
    pub fn new(paper_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            paper_id: paper_id.into(),
            stage: Stage::NotStarted,
            attempt_count: 0,
            last_error: None,
            failed_step: None,
            artifact_refs: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The step `advance` would execute next, if any.
    ///
    /// A failed record re-runs its failed step.  Records written before
    /// `failed_step` existed fall back to the first step without an artifact.
    pub fn pending_step(&self) -> Option<Step> {
        match self.stage {
            Stage::Failed => self.failed_step.or_else(|| {
                Step::ALL
                    .into_iter()
                    .find(|s| !self.artifact_refs.contains_key(s))
            }),
            stage => stage.next_step(),
        }
    }

    /// Artifact reference of `step`, if it completed.
    pub fn artifact(&self, step: Step) -> Option<&ArtifactRef> {
        self.artifact_refs.get(&step)
    }

    /// Record a successful `step`.
    pub fn complete_step(&mut self, step: Step, artifact: ArtifactRef) {
        self.artifact_refs.insert(step, artifact);
        self.stage = step.completes_into();
        self.attempt_count = 0;
        self.last_error = None;
        self.failed_step = None;
        self.touch();
    }

    /// `AudioGenerated` → `Complete`.
    pub fn finalize(&mut self) {
        self.stage = Stage::Complete;
        self.touch();
    }

    /// Count a failed attempt of `step` without leaving the current stage.
    pub fn note_attempt_failure(&mut self, step: Step, kind: ErrorKind, message: String) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(StageError {
            step,
            kind,
            message,
            at: Utc::now(),
        });
        self.touch();
    }

    /// Escalate to `Failed` at `step`; returns the recorded error.
    pub fn fail(&mut self, step: Step, kind: ErrorKind, message: String) -> StageError {
        let error = StageError {
            step,
            kind,
            message,
            at: Utc::now(),
        };
        self.stage = Stage::Failed;
        self.failed_step = Some(step);
        self.last_error = Some(error.clone());
        self.touch();
        error
    }

    /// Back to `NotStarted`, dropping counters, error and artifact refs.
    pub fn reset(&mut self) {
        self.stage = Stage::NotStarted;
        self.attempt_count = 0;
        self.last_error = None;
        self.failed_step = None;
        self.artifact_refs.clear();
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
