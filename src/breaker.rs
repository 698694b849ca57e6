//! Per-endpoint circuit breaker
//!
//! State machine per key: Closed → Open when the rolling window holds at
//! least `request_volume_threshold` samples and the errored share reaches
//! `error_percent_threshold`; Open → HalfOpen after `sleep_window_ms`, which
//! admits exactly one probe; probe success closes the circuit, probe failure
//! re-opens it with a fresh sleep window. Guarded execution also enforces the
//! concurrency semaphore and the call deadline. Counter updates and state
//! transitions are linearizable per key.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::clock::{Clock, MonotonicClock};
use crate::context::CallCtx;
use crate::settings::BreakerConfig;
use crate::CallError;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Terminal classification of one guarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Success,
    ExecutionError,
    Timeout,
    ShortCircuit,
    ConcurrencyReject,
    Canceled,
    DeadlineExceeded,
}

const WINDOW_BUCKETS: u64 = 10;

#[derive(Debug, Default, Clone, Copy)]
struct Bucket {
    second: u64,
    attempts: u64,
    successes: u64,
    errors: u64,
    failures: u64,
    timeouts: u64,
    short_circuits: u64,
    rejects: u64,
    canceled: u64,
    deadline_exceeded: u64,
}

impl Bucket {
    fn clear(&mut self, second: u64) {
        *self = Bucket { second, ..Bucket::default() };
    }
}

/// Aggregated counters over the rolling window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowTotals {
    pub attempts: u64,
    pub successes: u64,
    pub errors: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub short_circuits: u64,
    pub rejects: u64,
    pub canceled: u64,
    pub deadline_exceeded: u64,
}

#[derive(Debug)]
struct RollingWindow {
    buckets: [Bucket; WINDOW_BUCKETS as usize],
}

impl RollingWindow {
    fn new() -> Self {
        Self { buckets: [Bucket::default(); WINDOW_BUCKETS as usize] }
    }

    fn bucket(&mut self, now_sec: u64) -> &mut Bucket {
        let idx = (now_sec % WINDOW_BUCKETS) as usize;
        if self.buckets[idx].second != now_sec {
            self.buckets[idx].clear(now_sec);
        }
        &mut self.buckets[idx]
    }

    fn record(&mut self, outcome: Outcome, now_sec: u64) {
        let bucket = self.bucket(now_sec);
        match outcome {
            Outcome::Success => {
                bucket.attempts += 1;
                bucket.successes += 1;
            }
            Outcome::ExecutionError => {
                bucket.attempts += 1;
                bucket.errors += 1;
                bucket.failures += 1;
            }
            Outcome::Timeout => {
                bucket.attempts += 1;
                bucket.errors += 1;
                bucket.timeouts += 1;
            }
            Outcome::ShortCircuit => {
                // Short-circuited calls never ran; they stay out of the
                // attempt and error tallies that drive the threshold.
                bucket.short_circuits += 1;
            }
            Outcome::ConcurrencyReject => {
                bucket.attempts += 1;
                bucket.errors += 1;
                bucket.rejects += 1;
            }
            Outcome::Canceled => {
                bucket.attempts += 1;
                bucket.errors += 1;
                bucket.canceled += 1;
            }
            Outcome::DeadlineExceeded => {
                bucket.attempts += 1;
                bucket.errors += 1;
                bucket.deadline_exceeded += 1;
            }
        }
    }

    fn totals(&self, now_sec: u64) -> WindowTotals {
        let oldest = now_sec.saturating_sub(WINDOW_BUCKETS - 1);
        let mut totals = WindowTotals::default();
        for bucket in &self.buckets {
            if bucket.second < oldest || bucket.second > now_sec {
                continue;
            }
            totals.attempts += bucket.attempts;
            totals.successes += bucket.successes;
            totals.errors += bucket.errors;
            totals.failures += bucket.failures;
            totals.timeouts += bucket.timeouts;
            totals.short_circuits += bucket.short_circuits;
            totals.rejects += bucket.rejects;
            totals.canceled += bucket.canceled;
            totals.deadline_exceeded += bucket.deadline_exceeded;
        }
        totals
    }

    fn reset(&mut self) {
        self.buckets = [Bucket::default(); WINDOW_BUCKETS as usize];
    }
}

/// One circuit breaker guarding all calls for a single command key.
#[derive(Debug)]
pub struct Breaker {
    config: BreakerConfig,
    state: AtomicU8,
    opened_at_millis: AtomicU64,
    probe_in_flight: AtomicBool,
    window: Mutex<RollingWindow>,
    semaphore: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
}

impl Breaker {
    /// Build a breaker from a normalized config (no zero fields).
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_requests));
        Self {
            config,
            state: AtomicU8::new(STATE_CLOSED),
            opened_at_millis: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            window: Mutex::new(RollingWindow::new()),
            semaphore,
            clock,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    /// Whether calls are currently short-circuited (open or probing).
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_CLOSED
    }

    /// Calls currently holding a concurrency permit.
    pub fn in_flight(&self) -> usize {
        self.config.max_concurrent_requests.saturating_sub(self.semaphore.available_permits())
    }

    /// Rolling-window counters as of now.
    pub fn window_totals(&self) -> WindowTotals {
        let now_sec = self.clock.now_millis() / 1000;
        self.window.lock().expect("breaker window poisoned").totals(now_sec)
    }

    /// Execute `fut` under this breaker's admission, concurrency, and
    /// deadline rules.
    pub async fn run<T, F>(&self, ctx: &CallCtx, key: &str, fut: F) -> Result<T, CallError>
    where
        F: std::future::Future<Output = Result<T, CallError>>,
    {
        if let Err(err) = ctx.check() {
            self.record(outcome_of(&err));
            return Err(err);
        }

        let is_probe = match self.admit() {
            Some(is_probe) => is_probe,
            None => {
                self.record(Outcome::ShortCircuit);
                return Err(CallError::ShortCircuit { key: key.to_string() });
            }
        };

        let breaker_timeout = Duration::from_millis(self.config.timeout_ms);
        let breaker_deadline = Instant::now() + breaker_timeout;
        // The effective deadline is the earlier of the breaker's own timeout
        // and the caller's context deadline.
        let (deadline, deadline_is_ctx) = match ctx.deadline() {
            Some(d) if d < breaker_deadline => (d, true),
            _ => (breaker_deadline, false),
        };

        let start = Instant::now();
        let permit = tokio::select! {
            permit = self.semaphore.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.finish(is_probe, Outcome::ExecutionError);
                    return Err(CallError::Internal {
                        message: format!("breaker semaphore closed for {}", key),
                    });
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                self.finish(is_probe, Outcome::ConcurrencyReject);
                return Err(CallError::ConcurrencyReject {
                    max: self.config.max_concurrent_requests,
                });
            }
            _ = ctx.canceled() => {
                self.finish(is_probe, Outcome::Canceled);
                return Err(CallError::Canceled);
            }
        };

        let result = tokio::select! {
            res = fut => res,
            _ = tokio::time::sleep_until(deadline) => {
                if deadline_is_ctx {
                    Err(CallError::DeadlineExceeded)
                } else {
                    Err(CallError::Timeout { elapsed: start.elapsed(), timeout: breaker_timeout })
                }
            }
            _ = ctx.canceled() => Err(CallError::Canceled),
        };
        drop(permit);

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(err) => outcome_of(err),
        };
        self.finish(is_probe, outcome);
        result
    }

    /// Admission decision: `Some(is_probe)` to execute, `None` to
    /// short-circuit.
    fn admit(&self) -> Option<bool> {
        loop {
            match self.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened = self.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(opened);
                    if elapsed < self.config.sleep_window_ms {
                        return None;
                    }
                    match self.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.probe_in_flight.store(true, Ordering::Release);
                            tracing::info!("circuit → half-open");
                            return Some(true);
                        }
                        Err(STATE_CLOSED) => return Some(false),
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    // A probe is already in flight; everyone else waits out
                    // the verdict.
                    if self.probe_in_flight.swap(true, Ordering::AcqRel) {
                        return None;
                    }
                    return Some(true);
                }
                _ => return Some(false),
            }
        }
    }

    fn finish(&self, is_probe: bool, outcome: Outcome) {
        self.record(outcome);

        if is_probe {
            if outcome == Outcome::Success {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.opened_at_millis.store(0, Ordering::Release);
                    self.window.lock().expect("breaker window poisoned").reset();
                    tracing::info!("circuit → closed");
                }
            } else if self
                .state
                .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                tracing::warn!("probe failed, circuit → open");
            }
            self.probe_in_flight.store(false, Ordering::Release);
            return;
        }

        if outcome != Outcome::Success {
            self.maybe_open();
        }
    }

    fn maybe_open(&self) {
        if self.state.load(Ordering::Acquire) != STATE_CLOSED {
            return;
        }
        let now = self.clock.now_millis();
        let totals =
            self.window.lock().expect("breaker window poisoned").totals(now / 1000);
        if totals.attempts < self.config.request_volume_threshold {
            return;
        }
        if totals.errors * 100 < totals.attempts * self.config.error_percent_threshold as u64 {
            return;
        }
        if self
            .state
            .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.opened_at_millis.store(now, Ordering::Release);
            tracing::error!(
                attempts = totals.attempts,
                errors = totals.errors,
                threshold = self.config.error_percent_threshold,
                "circuit → open"
            );
        }
    }

    fn record(&self, outcome: Outcome) {
        let now_sec = self.clock.now_millis() / 1000;
        self.window.lock().expect("breaker window poisoned").record(outcome, now_sec);
    }
}

pub(crate) fn outcome_of(err: &CallError) -> Outcome {
    match err {
        CallError::Timeout { .. } => Outcome::Timeout,
        CallError::DeadlineExceeded => Outcome::DeadlineExceeded,
        CallError::Canceled => Outcome::Canceled,
        CallError::ShortCircuit { .. } => Outcome::ShortCircuit,
        CallError::ConcurrencyReject { .. } => Outcome::ConcurrencyReject,
        _ => Outcome::ExecutionError,
    }
}
