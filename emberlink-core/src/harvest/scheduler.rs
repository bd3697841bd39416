//! Harvest scheduling and completion handling
//!
//! The scheduler decides when a feature's buffer is transmitted and what
//! happens to it afterwards. Every state transition is synchronous; the only
//! asynchronous step — the transport send — happens *between*
//! [`HarvestScheduler::begin_harvest`] and
//! [`HarvestScheduler::complete_harvest`], which the composition root glues
//! together:
//!
//! ```text
//! let Some(prepared) = scheduler.begin_harvest(…, "ajax", now)? else { … };
//! let outcome = transport.send(&prepared.endpoint, &prepared.body).await;
//! scheduler.complete_harvest(&mut aggregator, prepared, outcome, now);
//! ```
//!
//! Keeping the machine synchronous makes the invariants directly testable
//! with a fake clock and canned outcomes: at most one in-flight send per job,
//! coalesced triggers, reinstated buffers on retryable failure, and stale
//! completions discarded after an abort.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::aggregate::EventAggregator;
use crate::clock::TimeKeeper;
use crate::error::{Error, Result};
use crate::event::EventBuffer;
use crate::obfuscate::Obfuscator;

use super::job::{HarvestJob, JobState, RetryPolicy};
use super::payload::HarvestPayload;
use super::transport::SendOutcome;

/// A harvest that has been flushed, serialized, and obfuscated, waiting on
/// its transport send.
///
/// Holds the flushed buffer so a retryable failure can reinstate it, and the
/// job generation so a stale completion can be recognized and discarded.
#[derive(Debug)]
pub struct PreparedHarvest {
    /// Feature being harvested
    pub feature: String,
    /// Endpoint path to send to
    pub endpoint: String,
    /// Obfuscated JSON payload
    pub body: Vec<u8>,
    buffer: EventBuffer,
    generation: u64,
}

impl PreparedHarvest {
    /// Number of events carried by this harvest.
    pub fn event_count(&self) -> usize {
        self.buffer.len()
    }
}

/// What `complete_harvest` did with a transport outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestDisposition {
    /// Payload accepted; `trigger_pending` reports a coalesced trigger that
    /// should be honored now
    Accepted { trigger_pending: bool },
    /// Retryable failure; events reinstated, job backing off
    Retrying { retry_count: u32 },
    /// Retry ceiling exhausted; buffer dropped and counted, job back to Idle
    CycleDropped { events_lost: usize },
    /// Permanent failure; job aborted, caller propagates the block
    PermanentlyFailed { events_lost: usize },
    /// Completion arrived after an abort or re-arm; result discarded
    Stale,
}

/// Harvest counters, reported through diagnostics.
#[derive(Debug, Default, Clone)]
pub struct HarvestStats {
    /// Payloads accepted by the collector
    pub payloads_sent: u64,
    /// Events accepted by the collector
    pub events_sent: u64,
    /// Payloads that hit a retryable failure and were reinstated
    pub payloads_retried: u64,
    /// Payloads dropped (retry exhaustion or permanent failure)
    pub payloads_dropped: u64,
    /// Events lost with dropped payloads
    pub events_dropped: u64,
}

/// Drives periodic and on-demand flushes of aggregator buffers toward the
/// transport, with retry, backpressure, and coalescing semantics.
#[derive(Debug, Default)]
pub struct HarvestScheduler {
    jobs: HashMap<String, HarvestJob>,
    policy: RetryPolicy,
    stats: HarvestStats,
}

impl HarvestScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            jobs: HashMap::new(),
            policy,
            stats: HarvestStats::default(),
        }
    }

    /// Register a recurring harvest job for a feature.
    ///
    /// The timer is armed one interval from `now`.
    pub fn register_job(
        &mut self,
        feature: &str,
        endpoint: &str,
        interval: Duration,
        now: Instant,
    ) {
        self.jobs
            .entry(feature.to_string())
            .or_insert_with(|| HarvestJob::new(feature, endpoint, interval, now));
    }

    /// Remove a feature's job entirely (session teardown).
    pub fn deregister_job(&mut self, feature: &str) {
        self.jobs.remove(feature);
    }

    /// Explicit harvest request (forced flush, backpressure, page unload).
    ///
    /// Returns true when the caller should run a harvest now. While a send
    /// is outstanding or the job is backing off, the request is recorded and
    /// coalesced instead; an aborted job ignores it.
    pub fn request_harvest(&mut self, feature: &str) -> Result<bool> {
        let job = self.job_mut(feature)?;
        match job.state {
            JobState::Aborted => Ok(false),
            JobState::InFlight | JobState::Backoff { .. } => {
                job.trigger_pending = true;
                Ok(false)
            }
            JobState::Idle | JobState::Scheduled => {
                job.state = JobState::Scheduled;
                Ok(true)
            }
        }
    }

    /// Collect the features whose timers or backoff deadlines have passed,
    /// marking them `Scheduled`.
    pub fn due_features(&mut self, now: Instant) -> Vec<String> {
        let mut due: Vec<String> = self
            .jobs
            .iter_mut()
            .filter(|(_, job)| job.is_due(now))
            .map(|(name, job)| {
                job.state = JobState::Scheduled;
                name.clone()
            })
            .collect();
        due.sort();
        due
    }

    /// The earliest instant any job wants attention, for the run loop's
    /// sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.jobs.values().filter_map(|job| job.deadline()).min()
    }

    /// Flush, serialize, and obfuscate a feature's buffer, moving its job to
    /// `InFlight`.
    ///
    /// Returns `None` without a transport call when the harvest is coalesced
    /// (already in flight), held (backoff, aborted), or cheap (empty buffer).
    pub fn begin_harvest(
        &mut self,
        clock: &TimeKeeper,
        aggregator: &mut EventAggregator,
        obfuscator: &Obfuscator,
        feature: &str,
        now: Instant,
    ) -> Result<Option<PreparedHarvest>> {
        self.begin_inner(clock, aggregator, obfuscator, feature, now, false)
    }

    /// Best-effort final harvest for teardown: ignores a backoff hold but
    /// still refuses to duplicate an in-flight send.
    pub fn begin_final_harvest(
        &mut self,
        clock: &TimeKeeper,
        aggregator: &mut EventAggregator,
        obfuscator: &Obfuscator,
        feature: &str,
        now: Instant,
    ) -> Result<Option<PreparedHarvest>> {
        self.begin_inner(clock, aggregator, obfuscator, feature, now, true)
    }

    fn begin_inner(
        &mut self,
        clock: &TimeKeeper,
        aggregator: &mut EventAggregator,
        obfuscator: &Obfuscator,
        feature: &str,
        now: Instant,
        ignore_backoff: bool,
    ) -> Result<Option<PreparedHarvest>> {
        let job = self.job_mut(feature)?;
        match job.state {
            JobState::InFlight => {
                // Coalesce: at most one in-flight send per job.
                job.trigger_pending = true;
                return Ok(None);
            }
            JobState::Aborted => return Ok(None),
            JobState::Backoff { until } if !ignore_backoff && now < until => {
                return Ok(None);
            }
            _ => {}
        }
        job.trigger_pending = false;
        job.rearm(now);
        let endpoint = job.endpoint.clone();
        let generation = job.generation;

        let buffer = aggregator.flush(clock, feature)?;
        if buffer.is_empty() {
            // Valid, cheap case: no events, no network call.
            self.job_mut(feature)?.state = JobState::Idle;
            return Ok(None);
        }

        let payload = HarvestPayload::build(clock, &buffer);
        let json = match payload.to_json() {
            Ok(json) => json,
            Err(e) => {
                // Keep the events; the next interval retries serialization.
                aggregator.reinstate(feature, buffer)?;
                self.job_mut(feature)?.state = JobState::Idle;
                return Err(e);
            }
        };
        let body = obfuscator.obfuscate(&json).into_bytes();

        let job = self.job_mut(feature)?;
        job.state = JobState::InFlight;
        job.last_attempt_at = Some(now);

        tracing::debug!(
            feature,
            events = buffer.len(),
            bytes = body.len(),
            "Harvest in flight"
        );

        Ok(Some(PreparedHarvest {
            feature: feature.to_string(),
            endpoint,
            body,
            buffer,
            generation,
        }))
    }

    /// Apply a transport outcome to the job that produced `prepared`.
    ///
    /// Completions from a previous generation (the job was aborted or torn
    /// down while the send was suspended) are discarded.
    pub fn complete_harvest(
        &mut self,
        aggregator: &mut EventAggregator,
        prepared: PreparedHarvest,
        outcome: SendOutcome,
        now: Instant,
    ) -> HarvestDisposition {
        let Some(job) = self.jobs.get_mut(&prepared.feature) else {
            return HarvestDisposition::Stale;
        };
        if job.generation != prepared.generation || job.state == JobState::Aborted {
            tracing::debug!(
                feature = %prepared.feature,
                "Discarding stale harvest completion"
            );
            return HarvestDisposition::Stale;
        }

        let events = prepared.buffer.len();
        match outcome {
            SendOutcome::Accepted => {
                job.retry_count = 0;
                job.state = JobState::Idle;
                self.stats.payloads_sent += 1;
                self.stats.events_sent += events as u64;
                tracing::debug!(feature = %prepared.feature, events, "Harvest accepted");
                HarvestDisposition::Accepted {
                    trigger_pending: job.trigger_pending,
                }
            }
            SendOutcome::Retryable(reason) => {
                job.retry_count += 1;
                if job.retry_count > self.policy.max_retries {
                    // Ceiling exhausted: the cycle converts to a counted
                    // drop; future intervals proceed normally. A coalesced
                    // trigger dies with the cycle it targeted.
                    job.retry_count = 0;
                    job.state = JobState::Idle;
                    job.trigger_pending = false;
                    job.dropped_payload_events += events as u64;
                    self.stats.payloads_dropped += 1;
                    self.stats.events_dropped += events as u64;
                    tracing::warn!(
                        feature = %prepared.feature,
                        events,
                        reason = %reason,
                        "Retry ceiling exhausted, dropping harvest"
                    );
                    HarvestDisposition::CycleDropped {
                        events_lost: events,
                    }
                } else {
                    let retry_count = job.retry_count;
                    let until = now + self.policy.backoff_delay(retry_count);
                    job.state = JobState::Backoff { until };
                    self.stats.payloads_retried += 1;
                    tracing::info!(
                        feature = %prepared.feature,
                        retry_count,
                        reason = %reason,
                        "Retryable harvest failure, reinstating events"
                    );
                    if aggregator.reinstate(&prepared.feature, prepared.buffer).is_err() {
                        // Feature vanished mid-flight; nothing to reinstate into.
                        self.stats.events_dropped += events as u64;
                    }
                    HarvestDisposition::Retrying { retry_count }
                }
            }
            SendOutcome::Permanent(reason) => {
                job.dropped_payload_events += events as u64;
                job.abort();
                self.stats.payloads_dropped += 1;
                self.stats.events_dropped += events as u64;
                tracing::warn!(
                    feature = %prepared.feature,
                    events,
                    reason = %reason,
                    "Permanent harvest failure, aborting job"
                );
                HarvestDisposition::PermanentlyFailed {
                    events_lost: events,
                }
            }
        }
    }

    /// Cancel a feature's job: no further sends, stale completions discarded.
    pub fn abort(&mut self, feature: &str) -> Result<()> {
        self.job_mut(feature)?.abort();
        Ok(())
    }

    /// Features with a job that has not been aborted.
    pub fn active_features(&self) -> Vec<String> {
        let mut features: Vec<String> = self
            .jobs
            .values()
            .filter(|job| job.state != JobState::Aborted)
            .map(|job| job.feature.clone())
            .collect();
        features.sort();
        features
    }

    /// Current state of a feature's job.
    pub fn job_state(&self, feature: &str) -> Option<JobState> {
        self.jobs.get(feature).map(|job| job.state)
    }

    /// Current retry count of a feature's job.
    pub fn retry_count(&self, feature: &str) -> Option<u32> {
        self.jobs.get(feature).map(|job| job.retry_count)
    }

    /// Events lost to dropped payloads for a feature.
    pub fn dropped_payload_events(&self, feature: &str) -> u64 {
        self.jobs
            .get(feature)
            .map(|job| job.dropped_payload_events)
            .unwrap_or(0)
    }

    /// Aggregate counters across all jobs.
    pub fn stats(&self) -> &HarvestStats {
        &self.stats
    }

    fn job_mut(&mut self, feature: &str) -> Result<&mut HarvestJob> {
        self.jobs
            .get_mut(feature)
            .ok_or_else(|| Error::UnknownFeature(feature.to_string()))
    }
}
