//! Per-feature event aggregation
//!
//! The aggregator accumulates recorded events into one buffer per feature and
//! hands complete buffers to the harvest scheduler. It is the hot path of the
//! pipeline: `record` must stay cheap and must never grow without bound.
//!
//! Two limits guard each buffer, a max event count and a max byte size.
//! Crossing either raises a flush request toward the scheduler
//! (backpressure); only when a buffer reaches twice its limits — there is no
//! room to hold a second buffer's worth — are the oldest events evicted, and
//! every eviction is counted. Loss is never silent.

use std::collections::HashMap;

use crate::clock::TimeKeeper;
use crate::error::{Error, Result};
use crate::event::{EventBuffer, TelemetryEvent};

/// Buffer limits for one feature.
#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    /// Soft cap on buffered events; crossing it requests a flush
    pub max_events: usize,
    /// Soft cap on approximate buffered bytes; crossing it requests a flush
    pub max_bytes: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_events: 1000,
            max_bytes: 64 * 1024,
        }
    }
}

/// Aggregation counters, reported through diagnostics.
#[derive(Debug, Default, Clone)]
pub struct AggregatorStats {
    /// Events accepted into a buffer
    pub recorded: u64,
    /// Events evicted under the overflow policy
    pub dropped_overflow: u64,
    /// Records addressed to features never registered
    pub unknown_feature: u64,
    /// Attribute values downgraded to null at record time
    pub sanitized_attrs: u64,
}

/// One feature's aggregation slot.
#[derive(Debug)]
struct FeatureSlot {
    buffer: EventBuffer,
    limits: BufferLimits,
    blocked: bool,
    flush_requested: bool,
    dropped_events: u64,
}

/// Accumulates structured events into per-feature buffers with defined
/// merge/flush semantics.
#[derive(Debug, Default)]
pub struct EventAggregator {
    slots: HashMap<String, FeatureSlot>,
    stats: AggregatorStats,
}

impl EventAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer slot for a feature.
    ///
    /// Re-registering an existing feature keeps its current buffer.
    pub fn register(&mut self, clock: &TimeKeeper, feature: &str, limits: BufferLimits) {
        self.slots
            .entry(feature.to_string())
            .or_insert_with(|| FeatureSlot {
                buffer: EventBuffer::new(feature, clock.relative_now_ms()),
                limits,
                blocked: false,
                flush_requested: false,
                dropped_events: 0,
            });
    }

    /// Remove a feature's slot entirely (session teardown).
    pub fn deregister(&mut self, feature: &str) {
        self.slots.remove(feature);
    }

    /// Record an event into a feature's active buffer.
    ///
    /// Timestamps are normalized against the keeper's relative clock: a
    /// negative timestamp means "not provided" and is filled with the current
    /// relative time; a timestamp from the future is clamped to now.
    ///
    /// No-op for blocked features. Records for unregistered features are
    /// counted and dropped rather than surfaced as errors; nothing throws
    /// across the instrumentation boundary.
    pub fn record(&mut self, clock: &TimeKeeper, feature: &str, mut event: TelemetryEvent) {
        let Some(slot) = self.slots.get_mut(feature) else {
            self.stats.unknown_feature += 1;
            tracing::debug!(feature, "Dropping record for unregistered feature");
            return;
        };
        if slot.blocked {
            return;
        }

        let now_rel = clock.relative_now_ms();
        if event.timestamp_ms < 0 || event.timestamp_ms > now_rel {
            event.timestamp_ms = now_rel;
        }

        let mut sanitized = 0u64;
        for value in event.attributes.values_mut() {
            let (clean, changed) = std::mem::replace(value, crate::event::AttrValue::Null)
                .sanitized();
            *value = clean;
            if changed {
                sanitized += 1;
            }
        }
        if sanitized > 0 {
            self.stats.sanitized_attrs += sanitized;
            tracing::debug!(feature, count = sanitized, "Sanitized non-finite attributes");
        }

        slot.buffer.push(event);
        self.stats.recorded += 1;

        slot.enforce_limits(feature, &mut self.stats);
    }

    /// Atomically swap the feature's active buffer for a fresh empty one and
    /// return the old buffer.
    ///
    /// An empty result is valid and cheap; callers skip the transport call.
    pub fn flush(&mut self, clock: &TimeKeeper, feature: &str) -> Result<EventBuffer> {
        let slot = self
            .slots
            .get_mut(feature)
            .ok_or_else(|| Error::UnknownFeature(feature.to_string()))?;

        slot.flush_requested = false;
        let fresh = EventBuffer::new(feature, clock.relative_now_ms());
        Ok(std::mem::replace(&mut slot.buffer, fresh))
    }

    /// Push an unsent buffer's events back onto the front of the active
    /// buffer, preserving original order relative to events recorded since.
    ///
    /// Used by the scheduler after a retryable transport failure. The
    /// overflow policy is re-applied afterwards, so a reinstated buffer that
    /// no longer fits evicts its oldest events (counted, as always).
    pub fn reinstate(&mut self, feature: &str, mut buffer: EventBuffer) -> Result<()> {
        let slot = self
            .slots
            .get_mut(feature)
            .ok_or_else(|| Error::UnknownFeature(feature.to_string()))?;

        while let Some(event) = slot.buffer.pop_oldest() {
            buffer.push(event);
        }
        // The merged buffer keeps the older creation time.
        std::mem::swap(&mut slot.buffer, &mut buffer);

        slot.enforce_limits(feature, &mut self.stats);
        Ok(())
    }

    /// Drain pending backpressure flush requests.
    pub fn take_flush_requests(&mut self) -> Vec<String> {
        let mut requests: Vec<String> = self
            .slots
            .iter_mut()
            .filter(|(_, slot)| slot.flush_requested && !slot.blocked)
            .map(|(name, slot)| {
                slot.flush_requested = false;
                name.clone()
            })
            .collect();
        requests.sort();
        requests
    }

    /// One-way block: all subsequent records for the feature become no-ops.
    pub fn block(&mut self, feature: &str) {
        if let Some(slot) = self.slots.get_mut(feature) {
            slot.blocked = true;
        }
    }

    /// Whether a feature's slot is blocked.
    pub fn is_blocked(&self, feature: &str) -> bool {
        self.slots.get(feature).map(|s| s.blocked).unwrap_or(false)
    }

    /// Number of events currently buffered for a feature.
    pub fn pending_count(&self, feature: &str) -> usize {
        self.slots.get(feature).map(|s| s.buffer.len()).unwrap_or(0)
    }

    /// Events evicted from a feature's buffer under the overflow policy.
    pub fn dropped_events(&self, feature: &str) -> u64 {
        self.slots
            .get(feature)
            .map(|s| s.dropped_events)
            .unwrap_or(0)
    }

    /// Aggregate counters across all features.
    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }
}

impl FeatureSlot {
    /// Raise a flush request past the soft limits; evict past the hard cap.
    ///
    /// The hard cap is twice the soft limits: the slot can hold the buffer
    /// that should have flushed plus one more, and no more.
    fn enforce_limits(&mut self, feature: &str, stats: &mut AggregatorStats) {
        let over_events = self.buffer.len() > self.limits.max_events;
        let over_bytes = self.buffer.approx_bytes > self.limits.max_bytes;
        if (over_events || over_bytes) && !self.flush_requested {
            self.flush_requested = true;
            tracing::debug!(
                feature,
                events = self.buffer.len(),
                approx_bytes = self.buffer.approx_bytes,
                "Buffer over soft limit, requesting flush"
            );
        }

        let mut evicted = 0u64;
        while self.buffer.len() > self.limits.max_events * 2
            || self.buffer.approx_bytes > self.limits.max_bytes * 2
        {
            if self.buffer.pop_oldest().is_none() {
                break;
            }
            evicted += 1;
        }
        if evicted > 0 {
            self.dropped_events += evicted;
            stats.dropped_overflow += evicted;
            tracing::warn!(feature, evicted, "Buffer overflow, evicted oldest events");
        }
    }
}
