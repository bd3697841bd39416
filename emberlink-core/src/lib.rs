//! # emberlink-core
//!
//! Core library for emberlink - a client-side telemetry agent.
//!
//! This library provides:
//! - Clock synchronization against the collector's authoritative time
//! - Per-feature event aggregation with overflow backpressure
//! - Rule-based payload obfuscation
//! - Harvest scheduling with retry, backoff, and coalescing
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through four stages:
//! - **Record:** instrumentation feeds events into per-feature buffers
//! - **Flush:** the scheduler atomically swaps a buffer out on its timer
//! - **Obfuscate:** the serialized payload is rewritten against the rule set
//! - **Send:** the transport delivers it and classifies the outcome
//!
//! ## Example
//!
//! ```rust,no_run
//! use emberlink_core::{Config, HttpTransport, TelemetryAgent, TelemetryEvent};
//!
//! # async fn example() -> emberlink_core::Result<()> {
//! let config = Config::load()?;
//! let transport = HttpTransport::new(&config.collector)?;
//! let (agent, handle) = TelemetryAgent::new(&config, transport)?;
//!
//! handle.record("ajax", TelemetryEvent::new("ajax", -1).with_attr("url", "/api"));
//! agent.run().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use agent::{AgentHandle, Command, PipelineDiagnostics, TelemetryAgent};
pub use aggregate::{AggregatorStats, BufferLimits, EventAggregator};
pub use clock::{ClockState, TimeKeeper, TimingSample};
pub use config::Config;
pub use error::{Error, Result};
pub use event::{AttrValue, EventBuffer, TelemetryEvent};
pub use feature::FeatureRegistry;
pub use harvest::{
    HarvestScheduler, HarvestStats, HttpTransport, SendOutcome, Transport,
};
pub use obfuscate::{ObfuscationRule, Obfuscator};

// Public modules
pub mod agent;
pub mod aggregate;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod feature;
pub mod harvest;
pub mod logging;
pub mod obfuscate;
