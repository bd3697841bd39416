//! Telemetry agent: composition root and run loop
//!
//! [`TelemetryAgent`] owns the whole pipeline — clock, aggregator,
//! obfuscator, scheduler, feature registry, and the injected transport — and
//! drives it from a single task on the host's event loop. Every mutation of
//! shared state runs to completion between awaits; the only suspension
//! points are transport sends and timer sleeps, which is what makes the
//! "at most one in-flight send per job" invariant checkable synchronously.
//!
//! Instrumentation talks to the agent through a cloneable [`AgentHandle`]:
//! a bounded command channel with non-blocking sends. A full channel drops
//! the command and counts it; nothing on the instrumentation side ever
//! blocks or panics because of the pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::aggregate::{AggregatorStats, BufferLimits, EventAggregator};
use crate::clock::{TimeKeeper, TimingSample};
use crate::config::{Config, FeatureConfig};
use crate::error::Result;
use crate::event::TelemetryEvent;
use crate::feature::FeatureRegistry;
use crate::harvest::{
    HarvestDisposition, HarvestScheduler, HarvestStats, RetryPolicy, Transport,
};
use crate::obfuscate::Obfuscator;

/// Commands accepted by the agent's run loop.
#[derive(Debug)]
pub enum Command {
    /// Record an event for a feature
    Record {
        feature: String,
        event: TelemetryEvent,
    },
    /// Forced harvest for a feature (e.g. host teardown imminent)
    TriggerHarvest { feature: String },
    /// Feed a clock synchronization sample
    Synchronize { sample: TimingSample },
    /// One-way block of a feature
    Block { feature: String },
    /// Graceful shutdown: best-effort final harvest, then exit
    Shutdown,
}

/// Capacity of the command channel between instrumentation and the agent.
const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Cloneable, non-blocking instrumentation surface.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    dropped: Arc<AtomicU64>,
}

impl AgentHandle {
    /// Record an event. Never blocks; a full queue drops and counts.
    pub fn record(&self, feature: impl Into<String>, event: TelemetryEvent) {
        self.send(Command::Record {
            feature: feature.into(),
            event,
        });
    }

    /// Request an immediate harvest for a feature.
    pub fn trigger_harvest(&self, feature: impl Into<String>) {
        self.send(Command::TriggerHarvest {
            feature: feature.into(),
        });
    }

    /// Feed a round-trip timing sample to the clock.
    pub fn synchronize(&self, sample: TimingSample) {
        self.send(Command::Synchronize { sample });
    }

    /// Block a feature permanently.
    pub fn block(&self, feature: impl Into<String>) {
        self.send(Command::Block {
            feature: feature.into(),
        });
    }

    /// Ask the agent to shut down gracefully.
    ///
    /// Unlike the other methods this waits for queue space: shutdown must
    /// not be lost to a momentarily full channel.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    /// Commands dropped because the channel was full.
    pub fn dropped_commands(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, command: Command) {
        if self.tx.try_send(command).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Counters snapshot across the whole pipeline, for diagnostics reporting.
#[derive(Debug, Clone)]
pub struct PipelineDiagnostics {
    /// Aggregation counters
    pub aggregator: AggregatorStats,
    /// Harvest counters
    pub harvest: HarvestStats,
    /// Clock samples discarded by the sanity checks
    pub clock_rejected_samples: u64,
    /// True once the clock has processed a valid sample
    pub clock_ready: bool,
    /// Instrumentation commands dropped at the channel
    pub dropped_commands: u64,
}

/// The assembled telemetry pipeline.
pub struct TelemetryAgent<T: Transport> {
    clock: TimeKeeper,
    obfuscator: Obfuscator,
    aggregator: EventAggregator,
    scheduler: HarvestScheduler,
    registry: FeatureRegistry,
    transport: T,
    /// Per-feature: permanent failure blocks the feature itself
    cascade_block: HashMap<String, bool>,
    rx: mpsc::Receiver<Command>,
    dropped_commands: Arc<AtomicU64>,
}

impl<T: Transport> TelemetryAgent<T> {
    /// Assemble the pipeline from configuration and a transport.
    ///
    /// Fails closed on a malformed obfuscation rule set: with no previously
    /// valid rules to fall back to, the agent refuses to start rather than
    /// ship unobfuscated payloads.
    pub fn new(config: &Config, transport: T) -> Result<(Self, AgentHandle)> {
        config.validate()?;
        let obfuscator = Obfuscator::compile(&config.obfuscation.rules)?;
        let clock = TimeKeeper::new(config.clock.max_rtt_ms);
        let scheduler = HarvestScheduler::new(RetryPolicy {
            max_retries: config.harvest.max_retries,
            base_delay: Duration::from_millis(config.harvest.backoff_base_ms),
            max_delay: Duration::from_millis(config.harvest.backoff_ceiling_ms),
        });

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let dropped_commands = Arc::new(AtomicU64::new(0));

        let mut agent = Self {
            clock,
            obfuscator,
            aggregator: EventAggregator::new(),
            scheduler,
            registry: FeatureRegistry::new(),
            transport,
            cascade_block: HashMap::new(),
            rx,
            dropped_commands: Arc::clone(&dropped_commands),
        };
        for feature in &config.features {
            agent.register_feature(feature, &config.buffer.into());
        }

        let handle = AgentHandle {
            tx,
            dropped: dropped_commands,
        };
        Ok((agent, handle))
    }

    /// Wire a feature into the registry, the aggregator, and the scheduler.
    fn register_feature(&mut self, feature: &FeatureConfig, defaults: &BufferLimits) {
        let limits = BufferLimits {
            max_events: feature.max_events.unwrap_or(defaults.max_events),
            max_bytes: feature.max_bytes.unwrap_or(defaults.max_bytes),
        };
        let now = agent_now();

        self.registry
            .register(&feature.name, self.clock.relative_now_ms());
        self.aggregator.register(&self.clock, &feature.name, limits);
        self.scheduler.register_job(
            &feature.name,
            &feature.endpoint,
            Duration::from_millis(feature.interval_ms),
            now,
        );
        self.cascade_block
            .insert(feature.name.clone(), feature.cascade_block);

        tracing::info!(
            feature = %feature.name,
            endpoint = %feature.endpoint,
            interval_ms = feature.interval_ms,
            "Feature registered"
        );
    }

    /// Drive the pipeline until shutdown.
    ///
    /// Returns the final diagnostics snapshot.
    pub async fn run(mut self) -> PipelineDiagnostics {
        loop {
            // Backpressure first: buffers past their soft limit harvest
            // ahead of their timers.
            for feature in self.aggregator.take_flush_requests() {
                if self.scheduler.request_harvest(&feature).unwrap_or(false) {
                    self.harvest(&feature).await;
                }
            }

            let command = match self.scheduler.next_deadline() {
                Some(deadline) => {
                    let sleep =
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                    tokio::select! {
                        command = self.rx.recv() => command,
                        _ = sleep => {
                            self.tick().await;
                            continue;
                        }
                    }
                }
                None => self.rx.recv().await,
            };

            match command {
                // A closed channel means every handle is gone; treat it as
                // an implicit shutdown.
                Some(Command::Shutdown) | None => {
                    self.shutdown().await;
                    return self.diagnostics();
                }
                Some(command) => self.apply(command).await,
            }
        }
    }

    /// Harvest every job whose timer or backoff deadline has passed.
    async fn tick(&mut self) {
        for feature in self.scheduler.due_features(agent_now()) {
            self.harvest(&feature).await;
        }
    }

    async fn apply(&mut self, command: Command) {
        match command {
            Command::Record { feature, event } => {
                self.aggregator.record(&self.clock, &feature, event);
            }
            Command::TriggerHarvest { feature } => {
                if self.registry.is_blocked(&feature) {
                    return;
                }
                match self.scheduler.request_harvest(&feature) {
                    Ok(true) => self.harvest(&feature).await,
                    Ok(false) => {} // coalesced or aborted
                    Err(e) => tracing::debug!(feature = %feature, error = %e, "Trigger ignored"),
                }
            }
            Command::Synchronize { sample } => {
                self.clock.synchronize(sample);
            }
            Command::Block { feature } => self.block_feature(&feature),
            Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /// Run one harvest attempt for a feature, honoring a coalesced trigger
    /// that arrived while the send was outstanding.
    async fn harvest(&mut self, feature: &str) {
        loop {
            let prepared = match self.scheduler.begin_harvest(
                &self.clock,
                &mut self.aggregator,
                &self.obfuscator,
                feature,
                agent_now(),
            ) {
                Ok(Some(prepared)) => prepared,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(feature, error = %e, "Harvest failed to start");
                    return;
                }
            };

            let outcome = self.transport.send(&prepared.endpoint, &prepared.body).await;
            let disposition = self.scheduler.complete_harvest(
                &mut self.aggregator,
                prepared,
                outcome,
                agent_now(),
            );

            match disposition {
                HarvestDisposition::Accepted {
                    trigger_pending: true,
                } => continue,
                HarvestDisposition::PermanentlyFailed { events_lost } => {
                    tracing::warn!(feature, events_lost, "Feature endpoint aborted");
                    if self.cascade_block.get(feature).copied().unwrap_or(false) {
                        self.block_feature(feature);
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    /// One-way block, propagated to the aggregator (records become no-ops)
    /// and the scheduler (timer cancelled, stale completions discarded).
    fn block_feature(&mut self, feature: &str) {
        if self.registry.block(feature) {
            tracing::info!(feature, "Feature blocked");
        }
        self.aggregator.block(feature);
        let _ = self.scheduler.abort(feature);
    }

    /// Best-effort final harvest for every live feature, then teardown.
    ///
    /// One attempt per feature, no retries; an in-flight failure here is
    /// logged and the events are dropped with the session.
    async fn shutdown(&mut self) {
        tracing::info!("Telemetry agent shutting down");
        for feature in self.scheduler.active_features() {
            let prepared = match self.scheduler.begin_final_harvest(
                &self.clock,
                &mut self.aggregator,
                &self.obfuscator,
                &feature,
                agent_now(),
            ) {
                Ok(Some(prepared)) => prepared,
                _ => {
                    let _ = self.scheduler.abort(&feature);
                    continue;
                }
            };

            let outcome = self.transport.send(&prepared.endpoint, &prepared.body).await;
            let disposition = self.scheduler.complete_harvest(
                &mut self.aggregator,
                prepared,
                outcome,
                agent_now(),
            );
            if disposition != (HarvestDisposition::Accepted { trigger_pending: false })
                && disposition != (HarvestDisposition::Accepted { trigger_pending: true })
            {
                tracing::warn!(feature = %feature, ?disposition, "Final harvest not delivered");
            }
            let _ = self.scheduler.abort(&feature);
        }
    }

    /// Snapshot of all pipeline counters.
    pub fn diagnostics(&self) -> PipelineDiagnostics {
        PipelineDiagnostics {
            aggregator: self.aggregator.stats().clone(),
            harvest: self.scheduler.stats().clone(),
            clock_rejected_samples: self.clock.rejected_samples(),
            clock_ready: self.clock.is_ready(),
            dropped_commands: self.dropped_commands.load(Ordering::Relaxed),
        }
    }
}

/// The run loop's clock: tokio's notion of now, so tests driving the loop
/// under a paused runtime control harvest timing deterministically.
fn agent_now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl From<crate::config::BufferConfig> for BufferLimits {
    fn from(config: crate::config::BufferConfig) -> Self {
        Self {
            max_events: config.max_events,
            max_bytes: config.max_bytes,
        }
    }
}
