//! Minimum-interval rate gates, one per external API.
//!
//! A gate remembers when it last let a caller through; [`RateGate::acquire`]
//! sleeps just long enough to keep calls `min_interval` apart.  Only the
//! calling task waits, other papers keep running.
//!
//! Time spent queued on a gate is charged to the [`GateWait`] the caller runs
//! under (if any), so step timeouts can leave it out.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

pub struct RateGate {
    name: &'static str,
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(name: &'static str, min_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for a slot.  Holding the lock while sleeping queues callers in
    /// arrival order.
    pub async fn acquire(&self) {
        let _queued = GATE_WAIT.try_with(GateWait::enter).ok();
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + self.min_interval;
            let now = Instant::now();
            if ready_at > now {
                let wait = ready_at - now;
                log::debug!("rate_limit: {} waiting {:?}", self.name, wait);
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// GateWait
// ---------------------------------------------------------------------------

tokio::task_local! {
    static GATE_WAIT: GateWait;
}

/// Accumulates the time one task spends queued on rate gates.
#[derive(Clone, Default)]
pub struct GateWait {
    state: Arc<StdMutex<WaitState>>,
}

#[derive(Default)]
struct WaitState {
    total: Duration,
    since: Option<Instant>,
}

impl GateWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut`, charging every gate wait inside it to this meter.
    pub async fn measure<F: Future>(&self, fut: F) -> F::Output {
        GATE_WAIT.scope(self.clone(), fut).await
    }

    /// Queued time so far, including a wait still in progress.
    pub fn total(&self) -> Duration {
        let state = self.lock();
        state.total + state.since.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn enter(&self) -> WaitCharge {
        self.lock().since = Some(Instant::now());
        WaitCharge(self.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WaitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Closes the open wait when `acquire` returns or is dropped.
struct WaitCharge(GateWait);

impl Drop for WaitCharge {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        if let Some(since) = state.since.take() {
            state.total += since.elapsed();
        }
    }
}

// ---------------------------------------------------------------------------
// RateGates
// ---------------------------------------------------------------------------

/// The gates shared by every worker.
#[derive(Clone)]
pub struct RateGates {
    pub arxiv: Arc<RateGate>,
    pub llm: Arc<RateGate>,
    pub tts: Arc<RateGate>,
}

impl RateGates {
    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self {
            arxiv: Arc::new(RateGate::new(
                "arxiv",
                Duration::from_millis(cfg.arxiv_interval_ms),
            )),
            llm: Arc::new(RateGate::new("llm", Duration::from_millis(cfg.llm_interval_ms))),
            tts: Arc::new(RateGate::new("tts", Duration::from_millis(cfg.tts_interval_ms))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_acquire_is_immediate() {
        let gate = RateGate::new("t", Duration::from_secs(3));
        let start = Instant::now();
        gate.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_acquires_are_spaced() {
        let gate = RateGate::new("t", Duration::from_secs(3));
        let start = Instant::now();
        gate.acquire().await;
        gate.acquire().await;
        gate.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_gate() {
        let gate = Arc::new(RateGate::new("t", Duration::from_millis(500)));
        let start = Instant::now();
        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let g = gate.clone();
                tokio::spawn(async move {
                    g.acquire().await;
                    Instant::now()
                })
            })
            .collect();

        let mut times = Vec::new();
        for t in tasks {
            times.push(t.await.unwrap());
        }
        times.sort();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_wait_is_charged_to_the_meter() {
        let gate = RateGate::new("t", Duration::from_secs(3));
        gate.acquire().await;

        let meter = GateWait::new();
        meter
            .measure(async {
                gate.acquire().await;
                tokio::time::sleep(Duration::from_secs(10)).await;
            })
            .await;
        assert_eq!(meter.total(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_in_progress_counts() {
        let gate = Arc::new(RateGate::new("t", Duration::from_secs(3)));
        gate.acquire().await;

        let meter = GateWait::new();
        let task = {
            let (gate, meter) = (gate.clone(), meter.clone());
            tokio::spawn(async move { meter.measure(gate.acquire()).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(meter.total() >= Duration::from_secs(1));
        task.await.unwrap();
        assert_eq!(meter.total(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn acquire_outside_a_meter_is_fine() {
        let gate = RateGate::new("t", Duration::ZERO);
        gate.acquire().await;
    }

    #[test]
    fn gates_from_config() {
        let gates = RateGates::from_config(&RateLimitConfig::default());
        assert_eq!(gates.arxiv.name(), "arxiv");
        assert_eq!(gates.arxiv.min_interval, Duration::from_millis(3000));
        assert_eq!(gates.tts.min_interval, Duration::from_millis(500));
    }
}
