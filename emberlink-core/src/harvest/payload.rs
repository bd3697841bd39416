//! Harvest payload envelope
//!
//! Converts a flushed [`EventBuffer`] into the JSON envelope the Brightwell
//! collector accepts. Timestamp conversion happens here, at payload-build
//! time, using the keeper's *current* offset: events recorded before the
//! first synchronization sample landed are corrected retroactively.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::clock::TimeKeeper;
use crate::error::Result;
use crate::event::{AttrValue, EventBuffer};

/// One event as it appears on the wire: server-aligned absolute timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct PayloadEvent {
    /// Event type
    #[serde(rename = "type")]
    pub event_type: String,

    /// Server-aligned epoch milliseconds
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,

    /// Scalar attributes
    pub attributes: BTreeMap<String, AttrValue>,
}

/// The envelope POSTed to a harvest endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestPayload {
    /// Feature the events belong to
    pub feature: String,

    /// Server-aligned send time in epoch milliseconds
    pub sent_at_ms: i64,

    /// False when the clock is still degraded; the collector treats the
    /// timestamps in this payload as approximate
    pub clock_ready: bool,

    /// Events in record order
    pub events: Vec<PayloadEvent>,
}

impl HarvestPayload {
    /// Build the envelope for a flushed buffer.
    pub fn build(clock: &TimeKeeper, buffer: &EventBuffer) -> Self {
        let events = buffer
            .events
            .iter()
            .map(|event| PayloadEvent {
                event_type: event.event_type.clone(),
                timestamp_ms: clock.correct_relative_ms(event.timestamp_ms),
                attributes: event.attributes.clone(),
            })
            .collect();

        Self {
            feature: buffer.feature.clone(),
            sent_at_ms: clock.now_ms(),
            clock_ready: clock.is_ready(),
            events,
        }
    }

    /// Serialize to the JSON string the obfuscation stage rewrites.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
