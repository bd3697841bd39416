//! Integration tests for the emberlink telemetry pipeline
//!
//! These tests drive the assembled agent end to end against a scripted mock
//! transport, under a paused tokio clock so timer and backoff behavior is
//! deterministic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use emberlink_core::{Config, SendOutcome, TelemetryAgent, TelemetryEvent, Transport};

/// A transport that records every send and replays a scripted outcome list
/// (defaulting to `Accepted` once the script runs out).
#[derive(Debug, Clone, Default)]
struct MockTransport {
    calls: Arc<Mutex<Vec<SentPayload>>>,
    script: Arc<Mutex<VecDeque<SendOutcome>>>,
}

#[derive(Debug, Clone)]
struct SentPayload {
    endpoint: String,
    body: String,
}

impl MockTransport {
    fn scripted(outcomes: Vec<SendOutcome>) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(outcomes.into())),
        }
    }

    fn calls(&self) -> Vec<SentPayload> {
        self.calls.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    async fn send(&self, endpoint: &str, body: &[u8]) -> SendOutcome {
        self.calls.lock().unwrap().push(SentPayload {
            endpoint: endpoint.to_string(),
            body: String::from_utf8_lossy(body).to_string(),
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Accepted)
    }
}

/// Agent configuration with one fast-harvesting feature and short backoff.
fn test_config() -> Config {
    let toml = r#"
[harvest]
max_retries = 3
backoff_base_ms = 100
backoff_ceiling_ms = 1000

[[features]]
name = "ajax"
endpoint = "/harvest/ajax"
interval_ms = 1000

[[obfuscation.rules]]
pattern = "secret"
replacement = "***"
"#;
    toml::from_str(toml).expect("test config should parse")
}

fn event(name: &str) -> TelemetryEvent {
    TelemetryEvent::new("ajax", -1).with_attr("name", name)
}

// ============================================
// Timer-driven harvests
// ============================================

#[tokio::test(start_paused = true)]
async fn test_timer_harvest_delivers_recorded_events() {
    let transport = MockTransport::default();
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    handle.record("ajax", event("a"));
    handle.record("ajax", event("b"));

    // Past the 1s interval the timer fires and the buffer ships.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].endpoint, "/harvest/ajax");
    assert!(calls[0].body.contains("\"a\""));
    assert!(calls[0].body.contains("\"b\""));

    handle.shutdown().await;
    let report = agent_task.await.unwrap();
    assert_eq!(report.harvest.payloads_sent, 1);
    assert_eq!(report.harvest.events_sent, 2);
    assert_eq!(report.aggregator.recorded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_empty_interval_makes_no_transport_call() {
    let transport = MockTransport::default();
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    // Several intervals with nothing recorded: empty flushes stay local.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(transport.calls().is_empty());

    handle.shutdown().await;
    let report = agent_task.await.unwrap();
    assert_eq!(report.harvest.payloads_sent, 0);
}

// ============================================
// Explicit triggers
// ============================================

#[tokio::test(start_paused = true)]
async fn test_trigger_harvest_ships_before_timer() {
    let transport = MockTransport::default();
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    handle.record("ajax", event("a"));
    handle.trigger_harvest("ajax");
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(transport.calls().len(), 1);

    handle.shutdown().await;
    agent_task.await.unwrap();
}

// ============================================
// Retry and failure handling
// ============================================

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_then_success_loses_nothing() {
    let transport = MockTransport::scripted(vec![
        SendOutcome::Retryable("API status 503".into()),
        SendOutcome::Retryable("API status 503".into()),
    ]);
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    for name in ["a", "b", "c"] {
        handle.record("ajax", event(name));
    }
    handle.trigger_harvest("ajax");

    // Two failures back off (100ms, 200ms), the third attempt succeeds.
    tokio::time::sleep(Duration::from_secs(3)).await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 3);
    // Every original event survives into the eventually-sent payload.
    for name in ["a", "b", "c"] {
        assert!(calls[2].body.contains(&format!("\"{}\"", name)));
    }

    handle.shutdown().await;
    let report = agent_task.await.unwrap();
    assert_eq!(report.harvest.payloads_retried, 2);
    assert_eq!(report.harvest.payloads_sent, 1);
    assert_eq!(report.harvest.events_sent, 3);
    assert_eq!(report.harvest.events_dropped, 0);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_aborts_endpoint() {
    let transport = MockTransport::scripted(vec![SendOutcome::Permanent("API status 410".into())]);
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    handle.record("ajax", event("a"));
    handle.trigger_harvest("ajax");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.calls().len(), 1);

    // The job is aborted: neither timers nor triggers send again.
    handle.record("ajax", event("b"));
    handle.trigger_harvest("ajax");
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.calls().len(), 1);

    handle.shutdown().await;
    let report = agent_task.await.unwrap();
    assert_eq!(report.harvest.payloads_dropped, 1);
    assert_eq!(report.harvest.events_dropped, 1);
}

// ============================================
// Blocking
// ============================================

#[tokio::test(start_paused = true)]
async fn test_blocked_feature_is_fully_inert() {
    let transport = MockTransport::default();
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    handle.block("ajax");
    tokio::time::sleep(Duration::from_millis(10)).await;

    handle.record("ajax", event("a"));
    handle.trigger_harvest("ajax");
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(transport.calls().is_empty());

    handle.shutdown().await;
    let report = agent_task.await.unwrap();
    assert_eq!(report.aggregator.recorded, 0);
    assert_eq!(report.harvest.payloads_sent, 0);
}

// ============================================
// Obfuscation
// ============================================

#[tokio::test(start_paused = true)]
async fn test_payloads_are_obfuscated_before_send() {
    let transport = MockTransport::default();
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    handle.record(
        "ajax",
        TelemetryEvent::new("ajax", -1).with_attr("token", "secret123"),
    );
    handle.trigger_harvest("ajax");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].body.contains("secret"));
    assert!(calls[0].body.contains("***123"));

    handle.shutdown().await;
    agent_task.await.unwrap();
}

#[test]
fn test_invalid_rule_set_refuses_to_start() {
    let toml = r#"
[[features]]
name = "ajax"
endpoint = "/harvest/ajax"

[[obfuscation.rules]]
pattern = "([unclosed"
replacement = "x"
"#;
    let config: Config = toml::from_str(toml).unwrap();
    let result = TelemetryAgent::new(&config, MockTransport::default());
    assert!(result.is_err());
}

// ============================================
// Clock synchronization
// ============================================

#[tokio::test(start_paused = true)]
async fn test_sync_samples_reach_the_clock() {
    let transport = MockTransport::default();
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    handle.record("ajax", event("pre-sync"));
    handle.synchronize(emberlink_core::TimingSample {
        client_sent_at_ms: 100,
        client_received_at_ms: 140,
        server_time_ms: 1000,
    });
    // Out-of-range sample: discarded, counted, changes nothing.
    handle.synchronize(emberlink_core::TimingSample {
        client_sent_at_ms: 500,
        client_received_at_ms: 400,
        server_time_ms: 9999,
    });
    handle.trigger_harvest("ajax");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    // The payload was stamped after the valid sample landed.
    assert!(calls[0].body.contains("\"clock_ready\":true"));

    handle.shutdown().await;
    let report = agent_task.await.unwrap();
    assert!(report.clock_ready);
    assert_eq!(report.clock_rejected_samples, 1);
}

// ============================================
// Shutdown
// ============================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_performs_final_flush() {
    let transport = MockTransport::default();
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    handle.record("ajax", event("last-words"));
    // Shut down well before the harvest interval elapses.
    handle.shutdown().await;
    let report = agent_task.await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].body.contains("last-words"));
    assert_eq!(report.harvest.events_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_every_handle_shuts_the_agent_down() {
    let transport = MockTransport::default();
    let (agent, handle) = TelemetryAgent::new(&test_config(), transport.clone()).unwrap();
    let agent_task = tokio::spawn(agent.run());

    handle.record("ajax", event("a"));
    drop(handle);

    let report = agent_task.await.unwrap();
    assert_eq!(report.harvest.events_sent, 1);
    assert_eq!(transport.calls().len(), 1);
}
