//! Core event model for the telemetry pipeline
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Feature** | A named instrumentation source (ajax, errors, page-actions) |
//! | **Event** | One observation recorded by a feature, immutable once buffered |
//! | **Buffer** | The insertion-ordered batch of events a feature accumulates between harvests |
//! | **Harvest** | Flushing a buffer and transmitting it to the collector |
//!
//! Event timestamps are recorded in *agent-relative* milliseconds (monotonic
//! time since the pipeline started). They are converted to server-aligned
//! absolute time only when a harvest payload is built, so a clock
//! synchronization sample that arrives late still corrects every event that
//! was recorded before it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

// ============================================
// Attribute values
// ============================================

/// A scalar attribute value attached to an event.
///
/// Attributes are deliberately restricted to scalars so that payloads stay
/// flat and the obfuscation stage operates on predictable text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// String value
    Str(String),
    /// Numeric value (always carried as f64 on the wire)
    Num(f64),
    /// Boolean value
    Bool(bool),
    /// Explicit null
    Null,
}

impl AttrValue {
    /// Approximate serialized size in bytes, used for buffer accounting.
    pub fn approx_size_bytes(&self) -> usize {
        match self {
            AttrValue::Str(s) => s.len() + 2,
            AttrValue::Num(_) => 12,
            AttrValue::Bool(_) => 5,
            AttrValue::Null => 4,
        }
    }

    /// Validate a value at record time.
    ///
    /// Non-finite numbers cannot be represented in JSON; they are downgraded
    /// to `Null` rather than poisoning the whole payload.
    pub fn sanitized(self) -> (AttrValue, bool) {
        match self {
            AttrValue::Num(n) if !n.is_finite() => (AttrValue::Null, true),
            other => (other, false),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<f64> for AttrValue {
    fn from(n: f64) -> Self {
        AttrValue::Num(n)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Num(n as f64)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

// ============================================
// Events
// ============================================

/// A single telemetry event recorded by a feature.
///
/// Immutable once recorded; owned by the buffer that holds it until flushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Event type (e.g. "ajax", "error", "page-action")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Agent-relative timestamp in milliseconds
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,

    /// Scalar attributes, keyed by name (sorted for stable serialization)
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl TelemetryEvent {
    /// Create an event with an explicit agent-relative timestamp.
    pub fn new(event_type: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp_ms,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute insertion.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Approximate serialized size in bytes, used for buffer accounting.
    pub fn approx_size_bytes(&self) -> usize {
        let attrs: usize = self
            .attributes
            .iter()
            .map(|(k, v)| k.len() + 4 + v.approx_size_bytes())
            .sum();
        self.event_type.len() + 32 + attrs
    }
}

// ============================================
// Buffers
// ============================================

/// An insertion-ordered batch of events belonging to exactly one feature.
///
/// A buffer is owned by a single aggregator slot at a time; `flush` and
/// `reinstate` transfer ownership wholesale so no reader can ever observe a
/// half-flushed buffer.
#[derive(Debug, Clone)]
pub struct EventBuffer {
    /// Feature this buffer belongs to
    pub feature: String,

    /// Agent-relative creation time in milliseconds
    pub created_at_ms: i64,

    /// Buffered events in record order
    pub events: VecDeque<TelemetryEvent>,

    /// Running approximate size of `events` in bytes
    pub approx_bytes: usize,
}

impl EventBuffer {
    /// Create an empty buffer for a feature.
    pub fn new(feature: impl Into<String>, created_at_ms: i64) -> Self {
        Self {
            feature: feature.into(),
            created_at_ms,
            events: VecDeque::new(),
            approx_bytes: 0,
        }
    }

    /// Append an event, updating the byte accounting.
    pub fn push(&mut self, event: TelemetryEvent) {
        self.approx_bytes += event.approx_size_bytes();
        self.events.push_back(event);
    }

    /// Remove and return the oldest event, updating the byte accounting.
    pub fn pop_oldest(&mut self) -> Option<TelemetryEvent> {
        let event = self.events.pop_front()?;
        self.approx_bytes = self.approx_bytes.saturating_sub(event.approx_size_bytes());
        Some(event)
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when no events are buffered.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_value_sanitized_rejects_non_finite() {
        let (v, changed) = AttrValue::Num(f64::NAN).sanitized();
        assert_eq!(v, AttrValue::Null);
        assert!(changed);

        let (v, changed) = AttrValue::Num(1.5).sanitized();
        assert_eq!(v, AttrValue::Num(1.5));
        assert!(!changed);
    }

    #[test]
    fn test_attr_value_serializes_as_scalar() {
        let json = serde_json::to_string(&AttrValue::Str("x".into())).unwrap();
        assert_eq!(json, "\"x\"");
        let json = serde_json::to_string(&AttrValue::Num(3.0)).unwrap();
        assert_eq!(json, "3.0");
        let json = serde_json::to_string(&AttrValue::Null).unwrap();
        assert_eq!(json, "null");
    }

    #[test]
    fn test_buffer_push_pop_accounting() {
        let mut buffer = EventBuffer::new("ajax", 0);
        let event = TelemetryEvent::new("ajax", 10).with_attr("url", "/api/users");
        let size = event.approx_size_bytes();

        buffer.push(event);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.approx_bytes, size);

        let popped = buffer.pop_oldest().unwrap();
        assert_eq!(popped.event_type, "ajax");
        assert!(buffer.is_empty());
        assert_eq!(buffer.approx_bytes, 0);
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let event = TelemetryEvent::new("error", 42)
            .with_attr("message", "boom")
            .with_attr("fatal", true)
            .with_attr("count", 3.0);

        let json = serde_json::to_string(&event).unwrap();
        let back: TelemetryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
