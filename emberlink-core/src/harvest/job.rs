//! Per-feature harvest job state
//!
//! Each registered feature owns one job against its configured endpoint. The
//! job is a small state machine:
//!
//! ```text
//! Idle ──tick/trigger──▶ Scheduled ──begin──▶ InFlight ──▶ Idle      (accepted)
//!  ▲                                             │
//!  │◀───────── backoff expired ── Backoff ◀──────┤ (retryable)
//!  │                                             │
//!  └──── retry ceiling exhausted ────────────────┤
//!                                    Aborted ◀───┘ (permanent / teardown)
//! ```
//!
//! `Aborted` is terminal. The `generation` counter guards against stale
//! completions: an in-flight send that resolves after the job was aborted or
//! re-armed is discarded, never applied.

use std::time::{Duration, Instant};

/// Retry and backoff tuning shared by all jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per cycle before the buffer is dropped and counted
    pub max_retries: u32,
    /// First backoff delay
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before attempt number `retry_count` (1-based).
    ///
    /// Exponential doubling from `base_delay`, capped at `max_delay`:
    /// monotonically non-decreasing and bounded.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// State of a harvest job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting for the next timer tick or trigger
    Idle,
    /// Picked up this turn, harvest attempt imminent
    Scheduled,
    /// A send is outstanding; further triggers coalesce
    InFlight,
    /// Retryable failure: holding off until the deadline passes
    Backoff { until: Instant },
    /// Terminal: permanent failure or teardown
    Aborted,
}

/// One feature's harvest job.
#[derive(Debug)]
pub struct HarvestJob {
    /// Feature this job harvests
    pub feature: String,
    /// Endpoint path at the collector
    pub endpoint: String,
    /// Recurring harvest interval
    pub interval: Duration,

    pub state: JobState,
    /// Consecutive retryable failures in the current cycle
    pub retry_count: u32,
    /// When the last send attempt started
    pub last_attempt_at: Option<Instant>,
    /// Next recurring fire time
    pub next_fire: Instant,
    /// A trigger arrived while a send was outstanding
    pub trigger_pending: bool,
    /// Bumped on abort/re-arm; stale completions carry an older value
    pub generation: u64,

    /// Events lost to dropped payloads (retry exhaustion or permanent failure)
    pub dropped_payload_events: u64,
}

impl HarvestJob {
    /// Create a job with its timer armed `interval` from `now`.
    pub fn new(
        feature: impl Into<String>,
        endpoint: impl Into<String>,
        interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            feature: feature.into(),
            endpoint: endpoint.into(),
            interval,
            state: JobState::Idle,
            retry_count: 0,
            last_attempt_at: None,
            next_fire: now + interval,
            trigger_pending: false,
            generation: 0,
            dropped_payload_events: 0,
        }
    }

    /// Whether this job should harvest at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.state {
            JobState::Idle => self.trigger_pending || now >= self.next_fire,
            JobState::Backoff { until } => now >= until,
            _ => false,
        }
    }

    /// The next instant this job wants attention, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            JobState::Idle => Some(self.next_fire),
            JobState::Backoff { until } => Some(until),
            _ => None,
        }
    }

    /// Re-arm the recurring timer from `now`.
    pub fn rearm(&mut self, now: Instant) {
        self.next_fire = now + self.interval;
    }

    /// Terminal cancellation: no further sends, stale completions discarded.
    pub fn abort(&mut self) {
        self.state = JobState::Aborted;
        self.trigger_pending = false;
        self.generation += 1;
    }
}
