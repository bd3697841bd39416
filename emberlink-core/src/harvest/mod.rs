//! Harvest pipeline: payload building, scheduling, and transport
//!
//! A harvest is the act of flushing a feature's buffered events and
//! transmitting them to the collector. The flow per attempt:
//!
//! ```text
//! EventAggregator.flush ─▶ HarvestPayload.build ─▶ Obfuscator.obfuscate
//!                                                         │
//!            HarvestScheduler.complete_harvest ◀── Transport.send
//! ```
//!
//! Scheduling state lives in [`scheduler::HarvestScheduler`]; the transport
//! is an injected capability so the whole flow runs against a mock in tests.

pub mod job;
pub mod payload;
pub mod scheduler;
pub mod transport;

pub use job::{JobState, RetryPolicy};
pub use payload::HarvestPayload;
pub use scheduler::{HarvestDisposition, HarvestScheduler, HarvestStats, PreparedHarvest};
pub use transport::{HttpTransport, SendOutcome, Transport};
