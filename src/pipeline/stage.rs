//! Stage model of the paper pipeline.
//!
//! [`Stage`] is the persisted position of a paper; [`Step`] is the closed set
//! of units of work that move it forward.
//!
//! ```text
//! NotStarted ──Download──▶ Downloaded ──Extract──▶ Extracted
//!            ──Summarize──▶ Summarized ──Synthesize──▶ AudioGenerated ──▶ Complete
//! any non-terminal stage ──error──▶ Failed
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of work, executed by exactly one stage executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Download,
    Extract,
    Summarize,
    Synthesize,
}

impl Step {
    /// All steps in pipeline order.
    pub const ALL: [Step; 4] = [
        Step::Download,
        Step::Extract,
        Step::Summarize,
        Step::Synthesize,
    ];

    /// The step whose artifact this step consumes.
    ///
    /// ```
    /// use arxiv_to_speech::pipeline::Step;
    ///
    /// assert_eq!(Step::Download.input_step(), None);
    /// assert_eq!(Step::Summarize.input_step(), Some(Step::Extract));
    /// ```
    pub fn input_step(self) -> Option<Step> {
        match self {
            Step::Download => None,
            Step::Extract => Some(Step::Download),
            Step::Summarize => Some(Step::Extract),
            Step::Synthesize => Some(Step::Summarize),
        }
    }

    /// Stage a record enters when this step succeeds.
    pub fn completes_into(self) -> Stage {
        match self {
            Step::Download => Stage::Downloaded,
            Step::Extract => Stage::Extracted,
            Step::Summarize => Stage::Summarized,
            Step::Synthesize => Stage::AudioGenerated,
        }
    }

    /// Stable lowercase name, used in logs, file names and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Step::Download => "download",
            Step::Extract => "extract",
            Step::Summarize => "summarize",
            Step::Synthesize => "synthesize",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Persisted processing position of a paper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    NotStarted,
    Downloaded,
    Extracted,
    Summarized,
    AudioGenerated,
    Complete,
    Failed,
}

impl Stage {
    /// Position along the forward order; `None` for `Failed`.
    pub fn ordinal(self) -> Option<u8> {
        match self {
            Stage::NotStarted => Some(0),
            Stage::Downloaded => Some(1),
            Stage::Extracted => Some(2),
            Stage::Summarized => Some(3),
            Stage::AudioGenerated => Some(4),
            Stage::Complete => Some(5),
            Stage::Failed => None,
        }
    }

    /// The step that moves a record out of this stage.
    ///
    /// `AudioGenerated` only needs finalizing, and the terminal stages have
    /// no step of their own.
    pub fn next_step(self) -> Option<Step> {
        match self {
            Stage::NotStarted => Some(Step::Download),
            Stage::Downloaded => Some(Step::Extract),
            Stage::Extracted => Some(Step::Summarize),
            Stage::Summarized => Some(Step::Synthesize),
            Stage::AudioGenerated | Stage::Complete | Stage::Failed => None,
        }
    }

    /// `true` for `Complete` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Failed)
    }

    /// Whether moving from `self` to `to` respects the forward-only rule.
    ///
    /// Any non-terminal stage may fail; `Failed` may only be left by
    /// completing the failed step, which is checked by the state machine.
    pub fn can_transition_to(self, to: Stage) -> bool {
        if to == Stage::Failed {
            return self != Stage::Complete;
        }
        match (self.ordinal(), to.ordinal()) {
            (Some(from), Some(to)) => to == from + 1,
            (None, Some(to)) => to > 0,
            _ => false,
        }
    }

    /// A short human-readable label for reports.
    pub fn label(self) -> &'static str {
        match self {
            Stage::NotStarted => "Not started",
            Stage::Downloaded => "Downloaded",
            Stage::Extracted => "Extracted",
            Stage::Summarized => "Summarized",
            Stage::AudioGenerated => "Audio generated",
            Stage::Complete => "Complete",
            Stage::Failed => "Failed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
