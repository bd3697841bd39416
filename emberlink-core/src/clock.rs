//! Clock synchronization between the agent and the collector
//!
//! Every event is recorded in agent-relative monotonic milliseconds. The
//! [`TimeKeeper`] reconciles that local clock with the collector's
//! authoritative clock using round-trip timing samples, so harvest payloads
//! carry comparable, correctable timestamps.
//!
//! ```text
//! agent start            sample round trip               harvest
//!     │ origin_time_ms       │ offset_ms learned            │ timestamps
//!     ▼                      ▼                              ▼ server-aligned
//! ────●──────────────────────●──────────────────────────────●──────────▶
//! ```
//!
//! Until the first valid sample lands, the keeper runs in *degraded mode*:
//! `now_ms` and the conversions fall back to the uncorrected local estimate,
//! and payloads are marked accordingly. Degraded mode is reported, not fatal.

use std::time::Instant;

/// A round-trip timing sample supplied by an external sample source.
///
/// All fields are in milliseconds. `client_sent_at_ms` and
/// `client_received_at_ms` come from the agent's local clock; `server_time_ms`
/// is the collector's clock as reported in the response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSample {
    /// Local time when the timing request left the agent
    pub client_sent_at_ms: i64,
    /// Local time when the response arrived
    pub client_received_at_ms: i64,
    /// Server time carried in the response
    pub server_time_ms: i64,
}

/// Correction state between the local clock and the collector clock.
///
/// Owned exclusively by [`TimeKeeper`]; mutated only by
/// [`TimeKeeper::synchronize`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockState {
    /// Correction added to local time to approximate server time
    pub offset_ms: i64,
    /// Wall-clock epoch milliseconds when the keeper was created
    pub origin_time_ms: i64,
    /// False until at least one valid sample has been processed
    pub ready: bool,
}

/// Maintains the correction offset between the local monotonic clock and the
/// collector's clock.
#[derive(Debug)]
pub struct TimeKeeper {
    state: ClockState,
    /// Monotonic anchor matching `state.origin_time_ms`
    origin: Instant,
    /// Sanity ceiling for round-trip latency; samples above it are discarded
    max_rtt_ms: i64,
    /// Samples discarded for negative or excessive rtt
    rejected_samples: u64,
}

impl TimeKeeper {
    /// Create a keeper anchored at the current wall-clock time.
    pub fn new(max_rtt_ms: i64) -> Self {
        Self::with_origin(chrono::Utc::now().timestamp_millis(), max_rtt_ms)
    }

    /// Create a keeper with an explicit wall-clock origin (epoch ms).
    pub fn with_origin(origin_time_ms: i64, max_rtt_ms: i64) -> Self {
        Self {
            state: ClockState {
                offset_ms: 0,
                origin_time_ms,
                ready: false,
            },
            origin: Instant::now(),
            max_rtt_ms,
            rejected_samples: 0,
        }
    }

    /// Process a round-trip timing sample.
    ///
    /// The server time at the midpoint of the round trip estimates the server
    /// clock at the moment the response arrived:
    /// `estimate = server_time + rtt/2`, so
    /// `offset = estimate - client_received_at`.
    ///
    /// Samples with a negative round trip (clock went backwards mid-request)
    /// or a round trip above the sanity ceiling are discarded; a bad sample
    /// never flips `ready` or moves the offset. Returns whether the sample
    /// was accepted.
    pub fn synchronize(&mut self, sample: TimingSample) -> bool {
        let rtt = sample.client_received_at_ms - sample.client_sent_at_ms;
        if rtt < 0 || rtt > self.max_rtt_ms {
            self.rejected_samples += 1;
            tracing::warn!(
                rtt_ms = rtt,
                max_rtt_ms = self.max_rtt_ms,
                "Discarding clock sample with out-of-range round trip"
            );
            return false;
        }

        let estimated_server_at_receipt = sample.server_time_ms + rtt / 2;
        let offset_ms = estimated_server_at_receipt - sample.client_received_at_ms;
        let first = !self.state.ready;

        self.state.offset_ms = offset_ms;
        self.state.ready = true;

        tracing::debug!(
            offset_ms,
            rtt_ms = rtt,
            first_sample = first,
            "Clock synchronized"
        );
        true
    }

    /// Current snapshot of the correction state.
    pub fn state(&self) -> ClockState {
        self.state
    }

    /// True once at least one valid sample has been processed.
    pub fn is_ready(&self) -> bool {
        self.state.ready
    }

    /// Number of samples discarded for failing the sanity checks.
    pub fn rejected_samples(&self) -> u64 {
        self.rejected_samples
    }

    /// Agent-relative monotonic milliseconds since the keeper was created.
    ///
    /// This is the timestamp space events are recorded in.
    pub fn relative_now_ms(&self) -> i64 {
        self.origin.elapsed().as_millis() as i64
    }

    /// Best available estimate of the current server time in epoch ms.
    ///
    /// Before synchronization this is the uncorrected local estimate; callers
    /// must treat it as approximate until [`TimeKeeper::is_ready`] is true.
    pub fn now_ms(&self) -> i64 {
        let local = self.state.origin_time_ms + self.relative_now_ms();
        if self.state.ready {
            local + self.state.offset_ms
        } else {
            local
        }
    }

    /// Convert an agent-relative timestamp to server-aligned epoch ms.
    pub fn convert_relative_ms(&self, relative_ms: i64) -> i64 {
        self.state.origin_time_ms + relative_ms + self.applied_offset()
    }

    /// Convert a server-aligned epoch ms timestamp to agent-relative ms.
    ///
    /// Inverse of [`TimeKeeper::convert_relative_ms`].
    pub fn convert_absolute_ms(&self, absolute_ms: i64) -> i64 {
        absolute_ms - self.state.origin_time_ms - self.applied_offset()
    }

    /// Re-derive a server-aligned timestamp for an event recorded earlier.
    ///
    /// Identical math to [`TimeKeeper::convert_relative_ms`], but named for
    /// the retroactive case: an event recorded while the keeper was degraded
    /// picks up the correction from a sample that arrived later, without the
    /// event being re-recorded.
    pub fn correct_relative_ms(&self, relative_ms: i64) -> i64 {
        self.convert_relative_ms(relative_ms)
    }

    /// Re-derive an agent-relative timestamp from a server-aligned one after
    /// the offset changed.
    pub fn correct_absolute_ms(&self, absolute_ms: i64) -> i64 {
        self.convert_absolute_ms(absolute_ms)
    }

    fn applied_offset(&self) -> i64 {
        if self.state.ready {
            self.state.offset_ms
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keeper() -> TimeKeeper {
        TimeKeeper::with_origin(1_000_000, 5_000)
    }

    #[test]
    fn test_synchronize_midpoint_math() {
        let mut tk = keeper();
        let accepted = tk.synchronize(TimingSample {
            client_sent_at_ms: 100,
            client_received_at_ms: 140,
            server_time_ms: 1000,
        });

        // rtt = 40, estimate at receipt = 1000 + 20 = 1020, offset = 1020 - 140
        assert!(accepted);
        assert!(tk.is_ready());
        assert_eq!(tk.state().offset_ms, 880);
    }

    #[test]
    fn test_negative_rtt_discarded() {
        let mut tk = keeper();
        let accepted = tk.synchronize(TimingSample {
            client_sent_at_ms: 200,
            client_received_at_ms: 150,
            server_time_ms: 1000,
        });

        assert!(!accepted);
        assert!(!tk.is_ready());
        assert_eq!(tk.state().offset_ms, 0);
        assert_eq!(tk.rejected_samples(), 1);
    }

    #[test]
    fn test_excessive_rtt_discarded() {
        let mut tk = keeper();
        let accepted = tk.synchronize(TimingSample {
            client_sent_at_ms: 0,
            client_received_at_ms: 10_000,
            server_time_ms: 1000,
        });

        assert!(!accepted);
        assert!(!tk.is_ready());
    }

    #[test]
    fn test_bad_sample_preserves_prior_offset() {
        let mut tk = keeper();
        tk.synchronize(TimingSample {
            client_sent_at_ms: 100,
            client_received_at_ms: 140,
            server_time_ms: 1000,
        });
        assert_eq!(tk.state().offset_ms, 880);

        tk.synchronize(TimingSample {
            client_sent_at_ms: 500,
            client_received_at_ms: 400,
            server_time_ms: 9999,
        });
        assert_eq!(tk.state().offset_ms, 880);
        assert!(tk.is_ready());
    }

    #[test]
    fn test_conversions_are_mutual_inverses() {
        let mut tk = keeper();
        tk.synchronize(TimingSample {
            client_sent_at_ms: 100,
            client_received_at_ms: 140,
            server_time_ms: 1000,
        });

        for t in [-500, 0, 1, 12_345, 9_999_999] {
            assert_eq!(tk.convert_absolute_ms(tk.convert_relative_ms(t)), t);
            assert_eq!(tk.convert_relative_ms(tk.convert_absolute_ms(t)), t);
        }
    }

    #[test]
    fn test_degraded_mode_applies_no_offset() {
        let tk = keeper();
        assert!(!tk.is_ready());
        assert_eq!(tk.convert_relative_ms(50), 1_000_050);
    }

    #[test]
    fn test_late_sample_corrects_earlier_timestamp() {
        let mut tk = keeper();

        // Recorded while degraded: conversion has no correction yet.
        let recorded_rel = 250;
        assert_eq!(tk.correct_relative_ms(recorded_rel), 1_000_250);

        tk.synchronize(TimingSample {
            client_sent_at_ms: 100,
            client_received_at_ms: 140,
            server_time_ms: 1000,
        });

        // Same stored relative timestamp now picks up the offset.
        assert_eq!(tk.correct_relative_ms(recorded_rel), 1_000_250 + 880);
    }
}
