//! emberlink-agent - run the telemetry pipeline against a JSONL event feed
//!
//! Reads one JSON object per line from stdin and feeds it into the pipeline:
//!
//! - `{"type": "ajax", "attributes": {"url": "/api"}}` records an event for
//!   the default feature (or `"feature": "..."` to address another one)
//! - `{"sync": {"client_sent_at_ms": ..., "client_received_at_ms": ...,
//!   "server_time_ms": ...}}` feeds a clock synchronization sample
//!
//! Harvested payloads go to the Brightwell collector configured in
//! `~/.config/emberlink/config.toml`. On EOF or ctrl-c the agent performs a
//! best-effort final flush before exiting.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use emberlink_core::{
    AgentHandle, AttrValue, Config, HttpTransport, TelemetryAgent, TelemetryEvent, TimingSample,
};

#[derive(Parser)]
#[command(name = "emberlink-agent")]
#[command(about = "Buffer and harvest telemetry events to a Brightwell collector")]
#[command(version)]
struct Args {
    /// Config file path (defaults to the XDG location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Feature to record events under when a line names none
    #[arg(short, long, default_value = "events")]
    feature: String,
}

/// One line of the stdin feed.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputLine {
    Sync { sync: SyncSample },
    Event(EventLine),
}

#[derive(Debug, Deserialize)]
struct SyncSample {
    client_sent_at_ms: i64,
    client_received_at_ms: i64,
    server_time_ms: i64,
}

#[derive(Debug, Deserialize)]
struct EventLine {
    /// Feature to record under; falls back to the --feature default
    feature: Option<String>,

    #[serde(rename = "type")]
    event_type: String,

    /// Agent-relative milliseconds; omitted means "now"
    #[serde(default = "default_timestamp")]
    timestamp_ms: i64,

    #[serde(default)]
    attributes: BTreeMap<String, AttrValue>,
}

fn default_timestamp() -> i64 {
    -1
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };

    // Initialize logging
    let _log_guard =
        emberlink_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("emberlink-agent starting");

    let transport = HttpTransport::new(&config.collector).context("failed to create transport")?;
    let (agent, handle) =
        TelemetryAgent::new(&config, transport).context("failed to assemble pipeline")?;

    println!(
        "Collector: {}",
        config.collector.base_url.as_deref().unwrap_or("")
    );
    println!("Features:  {}", feature_summary(&config));

    let agent_task = tokio::spawn(agent.run());

    feed_stdin(&handle, &args.feature).await;

    // EOF or ctrl-c: best-effort final flush, then report.
    handle.shutdown().await;
    let report = agent_task.await.context("agent task failed")?;

    println!(
        "Sent {} payload(s) / {} event(s); dropped {} event(s)",
        report.harvest.payloads_sent, report.harvest.events_sent, report.harvest.events_dropped
    );
    if !report.clock_ready {
        println!("Clock never synchronized; timestamps were sent uncorrected");
    }
    tracing::info!(
        payloads_sent = report.harvest.payloads_sent,
        events_sent = report.harvest.events_sent,
        events_dropped = report.harvest.events_dropped,
        "emberlink-agent done"
    );

    Ok(())
}

/// Pump stdin lines into the pipeline until EOF or ctrl-c.
async fn feed_stdin(handle: &AgentHandle, default_feature: &str) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                return;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return, // EOF
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read stdin");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<InputLine>(&line) {
            Ok(InputLine::Sync { sync }) => {
                handle.synchronize(TimingSample {
                    client_sent_at_ms: sync.client_sent_at_ms,
                    client_received_at_ms: sync.client_received_at_ms,
                    server_time_ms: sync.server_time_ms,
                });
            }
            Ok(InputLine::Event(event)) => {
                let feature = event.feature.as_deref().unwrap_or(default_feature);
                handle.record(
                    feature,
                    TelemetryEvent {
                        event_type: event.event_type,
                        timestamp_ms: event.timestamp_ms,
                        attributes: event.attributes,
                    },
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed input line");
            }
        }
    }
}

fn feature_summary(config: &Config) -> String {
    if config.features.is_empty() {
        return "(none configured)".to_string();
    }
    config
        .features
        .iter()
        .map(|f| f.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
