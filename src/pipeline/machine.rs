//! Pipeline state machine: moves one paper forward one step at a time.
//!
//! # advance(paper_id)
//!
//! ```text
//! lock(paper_id)
//!   └─▶ load record (or create NotStarted and persist it)
//!         ├─ Complete        → AlreadyComplete, nothing written
//!         ├─ AudioGenerated  → finalize → Advanced(Complete)
//!         └─ pending step    → executor.execute(input ref, metadata) under timeout
//!               (rate-gate queueing is not timed)
//!               ├─ Ok   → store ref, advance stage, zero attempts → Advanced(stage)
//!               └─ Err  → attempts += 1
//!                     ├─ permanent              → Failed
//!                     ├─ retryable, cap reached → Failed (attempts_exhausted)
//!                     └─ retryable              → Retrying { backoff }
//! ```
//!
//! `advance` never sleeps.  [`PipelineStateMachine::run_to_completion`] loops
//! it, sleeping each backoff through the injected [`Sleeper`], and fails the
//! record once it has spent `max_total_steps` calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::record::{ErrorKind, ProcessingRecord, StageError};
use super::retry::{RetryPolicy, Sleeper, TokioSleeper};
use super::stage::{Stage, Step};
use crate::config::PipelineConfig;
use crate::paper::PaperMetadata;
use crate::rate_limit::GateWait;
use crate::stages::{ErrorClass, ExecutorError, Executors};
use crate::store::{ArtifactRef, ArtifactStore, StoreError};

// ---------------------------------------------------------------------------
// StepOutcome / PipelineError
// ---------------------------------------------------------------------------

/// Result of one `advance` (or of a whole `run_to_completion`).
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A step succeeded; the record is now at this stage.
    Advanced(Stage),
    /// A retryable failure below the attempt cap.  The caller decides whether
    /// and when to call again.
    Retrying {
        step: Step,
        attempt: u32,
        backoff: Duration,
    },
    /// The record is now `Failed`.
    Failed { step: Step, error: StageError },
    /// Nothing to do.
    AlreadyComplete,
}

impl StepOutcome {
    /// `true` when no further `advance` would change anything without an
    /// operator action.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepOutcome::Advanced(Stage::Complete)
                | StepOutcome::AlreadyComplete
                | StepOutcome::Failed { .. }
        )
    }
}

/// Infrastructure failures.  Step failures never surface here; they are
/// recorded on the paper.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The run was cancelled before the paper reached a final stage.
    #[error("cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// KeyedLocks
// ---------------------------------------------------------------------------

/// One async mutex per paper id.
///
/// Entries nobody holds are pruned on the next lookup.
#[derive(Default)]
pub struct KeyedLocks {
    map: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|_, m| Arc::strong_count(m) > 1);
            map.entry(key.to_string()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

// ---------------------------------------------------------------------------
// PipelineStateMachine
// ---------------------------------------------------------------------------

pub struct PipelineStateMachine {
    store: Arc<dyn ArtifactStore>,
    executors: Executors,
    policy: RetryPolicy,
    config: PipelineConfig,
    sleeper: Arc<dyn Sleeper>,
    locks: KeyedLocks,
}

impl PipelineStateMachine {
    pub fn new(store: Arc<dyn ArtifactStore>, executors: Executors, config: &PipelineConfig) -> Self {
        Self {
            store,
            executors,
            policy: RetryPolicy::from_config(config),
            config: config.clone(),
            sleeper: Arc::new(TokioSleeper),
            locks: KeyedLocks::default(),
        }
    }

    /// Replace the real tokio sleep, e.g. with one that returns at once.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current record of a paper, without side effects.
    pub fn status(&self, paper_id: &str) -> Result<Option<ProcessingRecord>, PipelineError> {
        Ok(self.store.load_status(paper_id)?)
    }

    // -----------------------------------------------------------------------
    // advance
    // -----------------------------------------------------------------------

    /// Attempt exactly the next pending step of `paper_id`.
    pub async fn advance(&self, paper_id: &str) -> Result<StepOutcome, PipelineError> {
        let _guard = self.locks.lock(paper_id).await;

        let mut record = match self.store.load_status(paper_id)? {
            Some(record) => record,
            None => {
                let record = ProcessingRecord::new(paper_id);
                self.store.record_status(&record)?;
                log::debug!("pipeline: {paper_id} created");
                record
            }
        };

        if record.stage == Stage::Complete {
            return Ok(StepOutcome::AlreadyComplete);
        }

        let Some(step) = record.pending_step() else {
            // AudioGenerated, or a Failed record whose every artifact exists.
            self.commit_finalize(&mut record)?;
            return Ok(StepOutcome::Advanced(Stage::Complete));
        };

        let input = match step.input_step() {
            None => None,
            Some(prev) => match record.artifact(prev) {
                Some(artifact) => Some(artifact.clone()),
                None => {
                    let err = ExecutorError::permanent(format!("no {prev} artifact recorded"));
                    return self.on_failure(&mut record, step, err);
                }
            },
        };

        let metadata = self
            .store
            .load_metadata(paper_id)?
            .unwrap_or_else(|| PaperMetadata::bare(paper_id));

        log::info!(
            "pipeline: {paper_id} running {step} (attempt {})",
            record.attempt_count + 1
        );

        match self.execute_timed(step, input.as_ref(), &metadata).await {
            Ok(artifact) => {
                let from = record.stage;
                record.complete_step(step, artifact);
                debug_assert!(from.can_transition_to(record.stage));
                if step == Step::Synthesize {
                    record.finalize();
                }
                self.store.record_status(&record)?;
                log::info!("pipeline: {paper_id} {step} ok → {}", record.stage);
                Ok(StepOutcome::Advanced(record.stage))
            }
            Err(err) => self.on_failure(&mut record, step, err),
        }
    }

    /// Run the step's executor under its timeout.  Time spent queued on rate
    /// gates pushes the deadline back; only the work itself is timed.
    async fn execute_timed(
        &self,
        step: Step,
        input: Option<&ArtifactRef>,
        metadata: &PaperMetadata,
    ) -> Result<ArtifactRef, ExecutorError> {
        let limit = self.config.timeout_for(step);
        let queued = GateWait::new();
        let call = queued.measure(self.executors.for_step(step).execute(input, metadata));
        tokio::pin!(call);

        let mut deadline = Instant::now() + limit;
        let mut credited = Duration::ZERO;
        loop {
            tokio::select! {
                result = &mut call => return result,
                _ = tokio::time::sleep_until(deadline) => {
                    let waited = queued.total();
                    if waited <= credited {
                        return Err(ExecutorError::retryable(format!(
                            "{step} timed out after {limit:?}"
                        )));
                    }
                    deadline += waited - credited;
                    credited = waited;
                }
            }
        }
    }

    fn commit_finalize(&self, record: &mut ProcessingRecord) -> Result<(), PipelineError> {
        record.finalize();
        self.store.record_status(record)?;
        log::info!("pipeline: {} finalized → Complete", record.paper_id);
        Ok(())
    }

    fn on_failure(
        &self,
        record: &mut ProcessingRecord,
        step: Step,
        err: ExecutorError,
    ) -> Result<StepOutcome, PipelineError> {
        let kind = match err.class {
            ErrorClass::Retryable => ErrorKind::Retryable,
            ErrorClass::Permanent => ErrorKind::Permanent,
        };
        record.note_attempt_failure(step, kind, err.message.clone());
        let attempt = record.attempt_count;

        let outcome = match kind {
            ErrorKind::Retryable if !self.policy.exhausted(attempt) => {
                let backoff = self.policy.backoff(attempt);
                log::warn!(
                    "pipeline: {} {step} attempt {attempt} failed, retry in {backoff:?}: {}",
                    record.paper_id,
                    err.message
                );
                StepOutcome::Retrying {
                    step,
                    attempt,
                    backoff,
                }
            }
            ErrorKind::Retryable => {
                let error = record.fail(
                    step,
                    ErrorKind::AttemptsExhausted,
                    format!("{} (after {attempt} attempts)", err.message),
                );
                log::error!("pipeline: {} {error}", record.paper_id);
                StepOutcome::Failed { step, error }
            }
            _ => {
                let error = record.fail(step, ErrorKind::Permanent, err.message);
                log::error!("pipeline: {} {error}", record.paper_id);
                StepOutcome::Failed { step, error }
            }
        };

        self.store.record_status(record)?;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // run_to_completion
    // -----------------------------------------------------------------------

    /// Advance until `Complete` or `Failed`, honouring backoffs.
    pub async fn run_to_completion(&self, paper_id: &str) -> Result<StepOutcome, PipelineError> {
        self.run_until_cancelled(paper_id, &CancellationToken::new())
            .await
    }

    /// [`run_to_completion`](Self::run_to_completion) that stops between steps
    /// (and abandons backoff sleeps) once `cancel` fires.
    pub async fn run_until_cancelled(
        &self,
        paper_id: &str,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, PipelineError> {
        let mut calls = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if calls >= self.config.max_total_steps {
                return self.escalate_step_limit(paper_id, calls).await;
            }
            calls += 1;

            let outcome = self.advance(paper_id).await?;
            if outcome.is_final() {
                return Ok(outcome);
            }
            if let StepOutcome::Retrying { backoff, .. } = outcome {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = self.sleeper.sleep(backoff) => {}
                }
            }
        }
    }

    async fn escalate_step_limit(
        &self,
        paper_id: &str,
        calls: u32,
    ) -> Result<StepOutcome, PipelineError> {
        let _guard = self.locks.lock(paper_id).await;
        let mut record = self
            .store
            .load_status(paper_id)?
            .unwrap_or_else(|| ProcessingRecord::new(paper_id));
        if record.stage == Stage::Complete {
            return Ok(StepOutcome::AlreadyComplete);
        }

        let step = record.pending_step().unwrap_or(Step::Synthesize);
        let error = record.fail(
            step,
            ErrorKind::StepLimitExceeded,
            format!("no progress after {calls} steps"),
        );
        self.store.record_status(&record)?;
        log::error!("pipeline: {paper_id} {error}");
        Ok(StepOutcome::Failed { step, error })
    }

    // -----------------------------------------------------------------------
    // reset
    // -----------------------------------------------------------------------

    /// Operator action: back to `NotStarted`, stored artifacts discarded.
    pub async fn reset(&self, paper_id: &str) -> Result<ProcessingRecord, PipelineError> {
        let _guard = self.locks.lock(paper_id).await;
        let mut record = self
            .store
            .load_status(paper_id)?
            .unwrap_or_else(|| ProcessingRecord::new(paper_id));
        record.reset();
        self.store.discard_artifacts(paper_id)?;
        self.store.record_status(&record)?;
        log::info!("pipeline: {paper_id} reset");
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::rate_limit::RateGate;
    use crate::stages::StageExecutor;
    use crate::store::{ArtifactRef, MemoryArtifactStore};

    /// Plays back a script of results, then succeeds forever.  A success
    /// stores `"<step> of <paper>"` as the artifact.
    pub struct ScriptedExecutor {
        step: Step,
        store: Arc<MemoryArtifactStore>,
        script: Mutex<VecDeque<Result<(), ExecutorError>>>,
        fail_always: Mutex<Option<ExecutorError>>,
        fail_papers: Mutex<HashMap<String, ExecutorError>>,
        delay: Mutex<Option<Duration>>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        inputs: Mutex<Vec<Option<ArtifactRef>>>,
    }

    impl ScriptedExecutor {
        pub fn new(step: Step, store: Arc<MemoryArtifactStore>) -> Self {
            Self {
                step,
                store,
                script: Mutex::new(VecDeque::new()),
                fail_always: Mutex::new(None),
                fail_papers: Mutex::new(HashMap::new()),
                delay: Mutex::new(None),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                inputs: Mutex::new(Vec::new()),
            }
        }

        pub fn push(&self, result: Result<(), ExecutorError>) {
            self.script.lock().unwrap().push_back(result);
        }

        pub fn fail_always(&self, err: ExecutorError) {
            *self.fail_always.lock().unwrap() = Some(err);
        }

        /// Fail every call for one paper.
        pub fn fail_paper(&self, paper_id: &str, err: ExecutorError) {
            self.fail_papers
                .lock()
                .unwrap()
                .insert(paper_id.to_string(), err);
        }

        pub fn heal_paper(&self, paper_id: &str) {
            self.fail_papers.lock().unwrap().remove(paper_id);
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        pub fn heal(&self) {
            *self.fail_always.lock().unwrap() = None;
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn inputs(&self) -> Vec<Option<ArtifactRef>> {
            self.inputs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            input: Option<&ArtifactRef>,
            metadata: &PaperMetadata,
        ) -> Result<ArtifactRef, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inputs.lock().unwrap().push(input.cloned());

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
            }

            let per_paper = self
                .fail_papers
                .lock()
                .unwrap()
                .get(&metadata.paper_id)
                .cloned();
            if let Some(err) = per_paper {
                return Err(err);
            }
            let always = self.fail_always.lock().unwrap().clone();
            if let Some(err) = always {
                return Err(err);
            }
            let next = self.script.lock().unwrap().pop_front();
            if let Some(Err(err)) = next {
                return Err(err);
            }

            let body = format!("{} of {}", self.step, metadata.paper_id);
            Ok(self.store.put(&metadata.paper_id, self.step, body.as_bytes())?)
        }
    }

    /// Takes a slot on a shared rate gate, works for `work`, then stores
    /// its artifact.
    pub struct GatedExecutor {
        step: Step,
        gate: Arc<RateGate>,
        store: Arc<MemoryArtifactStore>,
        work: Duration,
        calls: AtomicUsize,
    }

    impl GatedExecutor {
        pub fn new(
            step: Step,
            gate: Arc<RateGate>,
            store: Arc<MemoryArtifactStore>,
            work: Duration,
        ) -> Self {
            Self {
                step,
                gate,
                store,
                work,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageExecutor for GatedExecutor {
        async fn execute(
            &self,
            _input: Option<&ArtifactRef>,
            metadata: &PaperMetadata,
        ) -> Result<ArtifactRef, ExecutorError> {
            self.gate.acquire().await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            Ok(self.store.put(&metadata.paper_id, self.step, b"gated")?)
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryArtifactStore>,
        pub download: Arc<ScriptedExecutor>,
        pub extract: Arc<ScriptedExecutor>,
        pub summarize: Arc<ScriptedExecutor>,
        pub synthesize: Arc<ScriptedExecutor>,
    }

    impl Harness {
        pub fn new() -> Self {
            let store = Arc::new(MemoryArtifactStore::new());
            let exec = |step| Arc::new(ScriptedExecutor::new(step, store.clone()));
            Self {
                download: exec(Step::Download),
                extract: exec(Step::Extract),
                summarize: exec(Step::Summarize),
                synthesize: exec(Step::Synthesize),
                store,
            }
        }

        pub fn executors(&self) -> Executors {
            Executors {
                download: self.download.clone(),
                extract: self.extract.clone(),
                summarize: self.summarize.clone(),
                synthesize: self.synthesize.clone(),
            }
        }

        pub fn total_calls(&self) -> usize {
            self.download.calls()
                + self.extract.calls()
                + self.summarize.calls()
                + self.synthesize.calls()
        }

        pub fn machine(&self, config: &PipelineConfig) -> PipelineStateMachine {
            PipelineStateMachine::new(self.store.clone(), self.executors(), config)
        }
    }

    pub fn fast_config() -> PipelineConfig {
        PipelineConfig {
            max_attempts: 3,
            max_total_steps: 32,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            ..PipelineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::rate_limit::RateGate;
    use crate::pipeline::retry::test_support::RecordingSleeper;

    fn setup() -> (Harness, PipelineStateMachine) {
        let h = Harness::new();
        let m = h.machine(&fast_config());
        (h, m)
    }

    fn load(h: &Harness, id: &str) -> ProcessingRecord {
        h.store.load_status(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn four_advances_reach_complete() {
        let (h, m) = setup();
        let mut stages = Vec::new();
        for _ in 0..4 {
            match m.advance("p").await.unwrap() {
                StepOutcome::Advanced(stage) => stages.push(stage),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(
            stages,
            vec![
                Stage::Downloaded,
                Stage::Extracted,
                Stage::Summarized,
                Stage::Complete
            ]
        );

        let rec = load(&h, "p");
        assert_eq!(rec.stage, Stage::Complete);
        assert_eq!(rec.artifact_refs.len(), 4);
        assert_eq!(h.total_calls(), 4);
    }

    #[tokio::test]
    async fn each_step_receives_previous_artifact() {
        let (h, m) = setup();
        m.run_to_completion("p").await.unwrap();
        let rec = load(&h, "p");

        assert_eq!(h.download.inputs(), vec![None]);
        assert_eq!(
            h.extract.inputs(),
            vec![rec.artifact(Step::Download).cloned()]
        );
        assert_eq!(
            h.synthesize.inputs(),
            vec![rec.artifact(Step::Summarize).cloned()]
        );
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let (h, m) = setup();
        m.run_to_completion("p").await.unwrap();
        let before = load(&h, "p");

        assert_eq!(m.advance("p").await.unwrap(), StepOutcome::AlreadyComplete);
        assert_eq!(
            m.run_to_completion("p").await.unwrap(),
            StepOutcome::AlreadyComplete
        );
        assert_eq!(load(&h, "p"), before);
        assert_eq!(h.total_calls(), 4);
    }

    #[tokio::test]
    async fn resume_runs_only_the_failed_step() {
        let (h, m) = setup();
        h.summarize.push(Err(ExecutorError::permanent("context too long")));

        let outcome = m.run_to_completion("p").await.unwrap();
        assert!(matches!(
            outcome,
            StepOutcome::Failed {
                step: Step::Summarize,
                ..
            }
        ));
        let failed = load(&h, "p");
        assert_eq!(failed.stage, Stage::Failed);
        assert_eq!(failed.failed_step, Some(Step::Summarize));
        assert_eq!(failed.artifact_refs.len(), 2);

        let outcome = m.run_to_completion("p").await.unwrap();
        assert_eq!(outcome, StepOutcome::Advanced(Stage::Complete));
        assert_eq!(h.download.calls(), 1);
        assert_eq!(h.extract.calls(), 1);
        assert_eq!(h.summarize.calls(), 2);
        assert_eq!(h.synthesize.calls(), 1);
        assert_eq!(
            h.summarize.inputs()[1],
            failed.artifact(Step::Extract).cloned()
        );
    }

    #[tokio::test]
    async fn retry_cap_escalates_to_failed() {
        let (h, m) = setup();
        m.advance("p").await.unwrap();
        m.advance("p").await.unwrap();
        h.summarize.fail_always(ExecutorError::retryable("HTTP 503"));

        assert_eq!(
            m.advance("p").await.unwrap(),
            StepOutcome::Retrying {
                step: Step::Summarize,
                attempt: 1,
                backoff: Duration::from_millis(10),
            }
        );
        assert_eq!(load(&h, "p").stage, Stage::Extracted);
        assert_eq!(
            m.advance("p").await.unwrap(),
            StepOutcome::Retrying {
                step: Step::Summarize,
                attempt: 2,
                backoff: Duration::from_millis(20),
            }
        );

        match m.advance("p").await.unwrap() {
            StepOutcome::Failed { step, error } => {
                assert_eq!(step, Step::Summarize);
                assert_eq!(error.kind, ErrorKind::AttemptsExhausted);
            }
            other => panic!("unexpected {other:?}"),
        }
        let rec = load(&h, "p");
        assert_eq!(rec.stage, Stage::Failed);
        assert_eq!(rec.attempt_count, 3);
        assert_eq!(h.summarize.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_short_circuits() {
        let (h, m) = setup();
        h.download.push(Err(ExecutorError::permanent("HTTP 404")));

        let outcome = m.run_to_completion("p").await.unwrap();
        match outcome {
            StepOutcome::Failed { step, error } => {
                assert_eq!(step, Step::Download);
                assert_eq!(error.kind, ErrorKind::Permanent);
                assert_eq!(error.message, "HTTP 404");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.download.calls(), 1);
        assert_eq!(load(&h, "p").attempt_count, 1);
    }

    #[tokio::test]
    async fn success_after_retries_zeroes_attempts() {
        let h = Harness::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let m = h.machine(&fast_config()).with_sleeper(sleeper.clone());
        h.extract.push(Err(ExecutorError::retryable("timeout")));
        h.extract.push(Err(ExecutorError::retryable("timeout")));

        let outcome = m.run_to_completion("p").await.unwrap();
        assert_eq!(outcome, StepOutcome::Advanced(Stage::Complete));
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        let rec = load(&h, "p");
        assert_eq!(rec.attempt_count, 0);
        assert!(rec.last_error.is_none());
    }

    #[tokio::test]
    async fn exhausted_record_gets_one_more_attempt_on_resume() {
        let h = Harness::new();
        let m = h
            .machine(&fast_config())
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        h.download.fail_always(ExecutorError::retryable("connect refused"));
        m.run_to_completion("p").await.unwrap();
        assert_eq!(h.download.calls(), 3);

        let outcome = m.run_to_completion("p").await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        assert_eq!(h.download.calls(), 4);
        assert_eq!(load(&h, "p").attempt_count, 4);

        h.download.heal();
        assert_eq!(
            m.run_to_completion("p").await.unwrap(),
            StepOutcome::Advanced(Stage::Complete)
        );
    }

    #[tokio::test]
    async fn reset_clears_state_and_artifacts() {
        let (h, m) = setup();
        m.run_to_completion("p").await.unwrap();

        let rec = m.reset("p").await.unwrap();
        assert_eq!(rec.stage, Stage::NotStarted);
        assert!(rec.artifact_refs.is_empty());
        assert_eq!(load(&h, "p"), rec);
        for step in Step::ALL {
            assert_eq!(h.store.get("p", step).unwrap(), None);
        }

        assert_eq!(
            m.advance("p").await.unwrap(),
            StepOutcome::Advanced(Stage::Downloaded)
        );
    }

    #[tokio::test]
    async fn missing_input_ref_is_permanent() {
        let (h, m) = setup();
        let mut rec = ProcessingRecord::new("p");
        rec.stage = Stage::Downloaded;
        h.store.record_status(&rec).unwrap();

        match m.advance("p").await.unwrap() {
            StepOutcome::Failed { step, error } => {
                assert_eq!(step, Step::Extract);
                assert_eq!(error.kind, ErrorKind::Permanent);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.extract.calls(), 0);
    }

    #[tokio::test]
    async fn audio_generated_finalizes_without_executor() {
        let (h, m) = setup();
        let mut rec = ProcessingRecord::new("p");
        rec.stage = Stage::AudioGenerated;
        h.store.record_status(&rec).unwrap();

        assert_eq!(
            m.advance("p").await.unwrap(),
            StepOutcome::Advanced(Stage::Complete)
        );
        assert_eq!(h.total_calls(), 0);
    }

    #[tokio::test]
    async fn step_limit_escalates_livelock() {
        let h = Harness::new();
        let config = PipelineConfig {
            max_attempts: 100,
            max_total_steps: 5,
            ..fast_config()
        };
        let m = h
            .machine(&config)
            .with_sleeper(Arc::new(RecordingSleeper::default()));
        h.download.fail_always(ExecutorError::retryable("HTTP 429"));

        match m.run_to_completion("p").await.unwrap() {
            StepOutcome::Failed { step, error } => {
                assert_eq!(step, Step::Download);
                assert_eq!(error.kind, ErrorKind::StepLimitExceeded);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.download.calls(), 5);
        assert_eq!(load(&h, "p").stage, Stage::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn executor_timeout_is_retryable() {
        let (h, m) = setup();
        h.download.set_delay(Duration::from_secs(3600));

        match m.advance("p").await.unwrap() {
            StepOutcome::Retrying { step, attempt, .. } => {
                assert_eq!(step, Step::Download);
                assert_eq!(attempt, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        let err = load(&h, "p").last_error.unwrap();
        assert_eq!(err.kind, ErrorKind::Retryable);
        assert!(err.message.contains("timed out"));
    }

    fn gated_machine(
        h: &Harness,
        gate: Arc<RateGate>,
        work: Duration,
    ) -> (Arc<GatedExecutor>, PipelineStateMachine) {
        let gated = Arc::new(GatedExecutor::new(Step::Download, gate, h.store.clone(), work));
        let mut executors = h.executors();
        executors.download = gated.clone();
        let config = PipelineConfig {
            download_timeout_secs: 5,
            ..fast_config()
        };
        (gated, PipelineStateMachine::new(h.store.clone(), executors, &config))
    }

    #[tokio::test(start_paused = true)]
    async fn rate_gate_queueing_is_not_timed() {
        let h = Harness::new();
        let gate = Arc::new(RateGate::new("arxiv", Duration::from_secs(60)));
        gate.acquire().await;
        let (gated, m) = gated_machine(&h, gate, Duration::from_secs(1));

        assert_eq!(
            m.advance("p").await.unwrap(),
            StepOutcome::Advanced(Stage::Downloaded)
        );
        assert_eq!(gated.calls(), 1);
        assert!(load(&h, "p").last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn work_after_the_gate_is_still_timed() {
        let h = Harness::new();
        let gate = Arc::new(RateGate::new("arxiv", Duration::from_secs(3)));
        gate.acquire().await;
        let (_, m) = gated_machine(&h, gate, Duration::from_secs(6));

        assert!(matches!(
            m.advance("p").await.unwrap(),
            StepOutcome::Retrying { step: Step::Download, attempt: 1, .. }
        ));
        let err = load(&h, "p").last_error.unwrap();
        assert_eq!(err.message, "download timed out after 5s");
    }

    #[tokio::test]
    async fn concurrent_advances_on_one_paper_are_serialized() {
        let (h, m) = setup();
        let (a, b) = tokio::join!(m.advance("p"), m.advance("p"));
        let mut stages = vec![a.unwrap(), b.unwrap()];
        stages.sort_by_key(|o| match o {
            StepOutcome::Advanced(s) => s.ordinal(),
            _ => None,
        });
        assert_eq!(
            stages,
            vec![
                StepOutcome::Advanced(Stage::Downloaded),
                StepOutcome::Advanced(Stage::Extracted)
            ]
        );
        assert_eq!(h.download.calls(), 1);
        assert_eq!(h.extract.calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_step() {
        let (h, m) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = m.run_until_cancelled("p", &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(h.total_calls(), 0);
    }

    #[tokio::test]
    async fn cancel_abandons_backoff_sleep() {
        let h = Harness::new();
        let config = PipelineConfig {
            backoff_base_ms: 3_600_000,
            backoff_max_ms: 3_600_000,
            ..fast_config()
        };
        let m = Arc::new(h.machine(&config));
        h.download.push(Err(ExecutorError::retryable("HTTP 503")));

        let cancel = CancellationToken::new();
        let task = {
            let m = m.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { m.run_until_cancelled("p", &cancel).await })
        };
        while h.download.calls() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert_eq!(load(&h, "p").attempt_count, 1);
    }

    #[tokio::test]
    async fn status_is_read_only() {
        let (h, m) = setup();
        assert!(m.status("p").unwrap().is_none());
        assert!(h.store.load_status("p").unwrap().is_none());
    }

    #[tokio::test]
    async fn locks_are_pruned() {
        let locks = KeyedLocks::default();
        drop(locks.lock("a").await);
        drop(locks.lock("b").await);
        let _c = locks.lock("c").await;
        assert_eq!(locks.len(), 1);
    }
}
