//! Relay stage behavior against the mock transport
//!
//! Each test runs the full `RelayStage::run` loop in a task and drives the
//! broker side through a `MockHandle`: deliveries, dropped sessions and
//! scripted connect, subscribe and publish failures.

use pipeline_relay::config::RelayConfig;
use pipeline_relay::error::{DecodeError, RelayError};
use pipeline_relay::relay::{RelayStage, RelayStats, SHUTDOWN_GRACE_PERIOD};
use pipeline_relay::testing::{MockHandle, MockTransport};
use pipeline_relay::transform::{FnTransform, PrefixTransform, Transform};
use pipeline_relay::transport::mqtt::ConnectionState;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const INPUT: &str = "pipeline/default_input";
const OUTPUT: &str = "pipeline/default_output";
const WAIT: Duration = Duration::from_secs(5);

type StageResult = (RelayStage<MockTransport>, Result<RelayStats, RelayError>);

struct RunningStage {
    handle: MockHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<StageResult>,
}

impl RunningStage {
    /// Request shutdown and wait for `run` to return
    async fn stop(self) -> StageResult {
        self.shutdown.send(true).unwrap();
        timeout(SHUTDOWN_GRACE_PERIOD + Duration::from_secs(1), self.task)
            .await
            .expect("stage should stop within the grace period")
            .unwrap()
    }
}

fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.reconnect.initial_delay_ms = 10;
    config.reconnect.max_delay_ms = 50;
    config
}

fn spawn_stage(config: RelayConfig, transform: Arc<dyn Transform>) -> RunningStage {
    let (transport, handle) = MockTransport::new();
    spawn_with(config, transport, handle, transform)
}

fn spawn_with(
    config: RelayConfig,
    transport: MockTransport,
    handle: MockHandle,
    transform: Arc<dyn Transform>,
) -> RunningStage {
    let mut stage = RelayStage::new(&config, transport, transform).unwrap();
    let (shutdown, rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let result = stage.run(rx).await;
        (stage, result)
    });
    RunningStage {
        handle,
        shutdown,
        task,
    }
}

fn spawn_default() -> RunningStage {
    spawn_stage(fast_config(), Arc::new(PrefixTransform::default()))
}

#[tokio::test]
async fn test_hello_is_relayed_with_label() {
    let running = spawn_default();
    assert!(running.handle.wait_for_sessions(1, WAIT).await);

    running.handle.send_message(INPUT, "hello");
    let published = running.handle.wait_for_published(1, WAIT).await;

    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic(), OUTPUT);
    assert_eq!(published[0].payload(), b"IA_1 processou: hello");
    assert!(!published[0].is_retained());

    let (_, result) = running.stop().await;
    let stats = result.unwrap();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.published, 1);
}

#[tokio::test]
async fn test_messages_are_relayed_in_arrival_order() {
    let running = spawn_default();
    assert!(running.handle.wait_for_sessions(1, WAIT).await);

    for i in 0..50 {
        running.handle.send_message(INPUT, format!("msg-{i}"));
    }
    let published = running.handle.wait_for_published(50, WAIT).await;

    let payloads: Vec<String> = published
        .iter()
        .map(|m| String::from_utf8(m.payload().to_vec()).unwrap())
        .collect();
    let expected: Vec<String> = (0..50).map(|i| format!("IA_1 processou: msg-{i}")).collect();
    assert_eq!(payloads, expected);

    running.stop().await.1.unwrap();
}

#[tokio::test]
async fn test_empty_payload_publishes_label_only() {
    let running = spawn_default();
    assert!(running.handle.wait_for_sessions(1, WAIT).await);

    running.handle.send_message(INPUT, "");
    let published = running.handle.wait_for_published(1, WAIT).await;
    assert_eq!(published[0].payload(), b"IA_1 processou: ");

    running.stop().await.1.unwrap();
}

#[tokio::test]
async fn test_undecodable_payload_is_skipped_and_stage_continues() {
    let running = spawn_default();
    assert!(running.handle.wait_for_sessions(1, WAIT).await);

    running.handle.send_message(INPUT, vec![0xff, 0xfe, 0x00]);
    running.handle.send_message(INPUT, "ok");
    let published = running.handle.wait_for_published(1, WAIT).await;

    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload(), b"IA_1 processou: ok");

    let (stage, result) = running.stop().await;
    let stats = result.unwrap();
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.published, 1);
    assert!(stats.is_balanced());
    assert_eq!(stage.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_publish_failure_drops_only_that_message() {
    let running = spawn_default();
    assert!(running.handle.wait_for_sessions(1, WAIT).await);
    running.handle.fail_next_publishes(1);

    running.handle.send_message(INPUT, "lost");
    running.handle.send_message(INPUT, "kept");
    let published = running.handle.wait_for_published(1, WAIT).await;

    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload(), b"IA_1 processou: kept");

    let stats = running.stop().await.1.unwrap();
    assert_eq!(stats.publish_failures, 1);
    assert_eq!(stats.received, 2);
    assert!(stats.is_balanced());
}

#[tokio::test]
async fn test_lost_session_resubscribes_and_resumes() {
    let running = spawn_default();
    assert!(running.handle.wait_for_sessions(1, WAIT).await);

    running.handle.send_message(INPUT, "before");
    running.handle.wait_for_published(1, WAIT).await;

    running.handle.drop_connection("broker restart");
    assert!(running.handle.wait_for_sessions(2, WAIT).await);

    running.handle.send_message(INPUT, "after");
    let published = running.handle.wait_for_published(2, WAIT).await;
    assert_eq!(published[1].payload(), b"IA_1 processou: after");

    assert_eq!(
        running.handle.subscriptions(),
        vec![(1, INPUT.to_string()), (2, INPUT.to_string())]
    );

    let stats = running.stop().await.1.unwrap();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.sessions_established, 2);
}

#[tokio::test]
async fn test_shutdown_unsubscribes_and_disconnects() {
    let running = spawn_default();
    assert!(running.handle.wait_for_sessions(1, WAIT).await);
    let handle = running.handle.clone();

    let started = Instant::now();
    let (stage, result) = running.stop().await;

    assert!(started.elapsed() < SHUTDOWN_GRACE_PERIOD);
    assert!(result.is_ok());
    assert_eq!(handle.unsubscriptions(), vec![INPUT.to_string()]);
    assert_eq!(handle.disconnect_calls(), 1);
    assert_eq!(stage.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_shutdown_interrupts_reconnect_backoff() {
    let mut config = fast_config();
    config.reconnect.initial_delay_ms = 10_000;
    config.reconnect.max_delay_ms = 20_000;

    let (transport, handle) = MockTransport::new();
    handle.refuse_connections(true);
    let running = spawn_with(
        config,
        transport,
        handle.clone(),
        Arc::new(PrefixTransform::default()),
    );
    assert!(handle.wait_for_connect_attempts(1, WAIT).await);

    let (stage, result) = running.stop().await;
    let stats = result.unwrap();
    assert_eq!(stats.connection_failures, 1);
    assert_eq!(handle.connect_attempts().len(), 1);
    assert_eq!(stage.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_shutdown_requested_before_run_never_connects() {
    let (transport, handle) = MockTransport::new();
    let mut stage = RelayStage::new(
        &fast_config(),
        transport,
        Arc::new(PrefixTransform::default()),
    )
    .unwrap();
    let (_tx, rx) = watch::channel(true);

    let stats = stage.run(rx).await.unwrap();
    assert_eq!(stats, RelayStats::default());
    assert!(handle.connect_attempts().is_empty());
}

#[tokio::test]
async fn test_max_attempts_exhausted_returns_connection_error() {
    let mut config = fast_config();
    config.reconnect.max_attempts = Some(3);

    let (transport, handle) = MockTransport::new();
    handle.refuse_connections(true);
    let running = spawn_with(
        config,
        transport,
        handle.clone(),
        Arc::new(PrefixTransform::default()),
    );

    let (stage, result) = timeout(WAIT, running.task).await.unwrap().unwrap();
    let error = result.unwrap_err();

    assert_eq!(error.kind(), "connection");
    assert!(error.is_retryable());
    assert_eq!(handle.connect_attempts().len(), 3);
    assert!(matches!(
        stage.state(),
        ConnectionState::PermanentlyDisconnected(_)
    ));
    assert_eq!(stage.stats().connection_failures, 3);
}

#[tokio::test]
async fn test_unreachable_broker_retries_at_least_three_times_within_30s() {
    let (transport, handle) = MockTransport::new();
    handle.refuse_connections(true);
    let running = spawn_with(
        RelayConfig::default(),
        transport,
        handle.clone(),
        Arc::new(PrefixTransform::default()),
    );

    let started = Instant::now();
    assert!(
        handle
            .wait_for_connect_attempts(3, Duration::from_secs(30))
            .await
    );
    assert!(started.elapsed() < Duration::from_secs(30));

    let attempts = handle.connect_attempts();
    assert!(attempts[1] > attempts[0]);
    assert!(attempts[2].duration_since(attempts[1]) >= attempts[1].duration_since(attempts[0]));

    running.stop().await.1.unwrap();
}

#[tokio::test]
async fn test_broker_recovers_after_failed_connects() {
    let (transport, handle) = MockTransport::new();
    handle.fail_next_connects(2);
    let running = spawn_with(
        fast_config(),
        transport,
        handle.clone(),
        Arc::new(PrefixTransform::default()),
    );

    assert!(handle.wait_for_sessions(1, WAIT).await);
    handle.send_message(INPUT, "late");
    let published = handle.wait_for_published(1, WAIT).await;
    assert_eq!(published[0].payload(), b"IA_1 processou: late");

    let stats = running.stop().await.1.unwrap();
    assert_eq!(stats.connection_attempts, 3);
    assert_eq!(stats.connection_failures, 2);
    assert_eq!(stats.sessions_established, 1);
}

#[tokio::test]
async fn test_rejected_subscription_retries_with_new_session() {
    let (transport, handle) = MockTransport::new();
    handle.reject_next_subscriptions(1);
    let running = spawn_with(
        fast_config(),
        transport,
        handle.clone(),
        Arc::new(PrefixTransform::default()),
    );

    assert!(handle.wait_for_sessions(1, WAIT).await);
    assert_eq!(handle.subscriptions(), vec![(2, INPUT.to_string())]);
    assert_eq!(handle.disconnect_calls(), 1);

    let stats = running.stop().await.1.unwrap();
    assert_eq!(stats.connection_failures, 1);
    assert_eq!(stats.sessions_established, 1);
}

#[tokio::test]
async fn test_retained_messages_relayed_by_default() {
    let running = spawn_default();
    assert!(running.handle.wait_for_sessions(1, WAIT).await);

    running.handle.send_retained(INPUT, "stale");
    let published = running.handle.wait_for_published(1, WAIT).await;
    assert_eq!(published[0].payload(), b"IA_1 processou: stale");
    assert!(!published[0].is_retained());

    running.stop().await.1.unwrap();
}

#[tokio::test]
async fn test_retained_messages_skipped_when_configured() {
    let mut config = fast_config();
    config.relay.skip_retained = true;
    let running = spawn_stage(config, Arc::new(PrefixTransform::default()));
    assert!(running.handle.wait_for_sessions(1, WAIT).await);

    running.handle.send_retained(INPUT, "stale");
    running.handle.send_message(INPUT, "fresh");
    let published = running.handle.wait_for_published(1, WAIT).await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].payload(), b"IA_1 processou: fresh");

    let stats = running.stop().await.1.unwrap();
    assert_eq!(stats.skipped, 1);
}

#[tokio::test]
async fn test_injected_transform_replaces_prefix() {
    let upper = FnTransform::new("upper", |payload: &[u8]| {
        std::str::from_utf8(payload)
            .map(|text| text.to_uppercase().into_bytes())
            .map_err(|e| DecodeError::InvalidUtf8 {
                valid_up_to: e.valid_up_to(),
            })
    });
    let running = spawn_stage(fast_config(), Arc::new(upper));
    assert!(running.handle.wait_for_sessions(1, WAIT).await);

    running.handle.send_message(INPUT, "shout");
    let published = running.handle.wait_for_published(1, WAIT).await;
    assert_eq!(published[0].payload(), b"SHOUT");

    running.stop().await.1.unwrap();
}

#[tokio::test]
async fn test_state_receiver_observes_connected_then_stopped() {
    let (transport, handle) = MockTransport::new();
    let mut stage = RelayStage::new(
        &fast_config(),
        transport,
        Arc::new(PrefixTransform::default()),
    )
    .unwrap();
    let mut states = stage.state_receiver();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { stage.run(rx).await });

    timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    assert!(handle.wait_for_sessions(1, WAIT).await);

    tx.send(true).unwrap();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(*states.borrow(), ConnectionState::Stopped);
}
