//! The relay stage: connection state machine plus the message loop
//!
//! One `RelayStage` owns one transport session at a time. `run` alternates
//! between establishing a session (connect, subscribe) and consuming it until
//! the session is lost or shutdown is requested. Messages are handled one at a
//! time in arrival order; a publish is never interrupted by shutdown.

use super::stats::{MessageOutcome, RelayStats};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::message::{ChannelName, Message};
use crate::observability::metrics::metrics;
use crate::transform::Transform;
use crate::transport::mqtt::{
    ConnectionEvent, ConnectionState, HealthMonitor, MessageHandler, ReconnectConfig,
    ReconnectionDecision,
};
use crate::transport::{Transport, TransportEvent};
use crate::{lifecycle_span, mqtt_span, relay_span};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// Upper bound for unsubscribe + disconnect on shutdown
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// How a consumed session ended
#[derive(Debug)]
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Reconnecting subscribe-transform-publish stage
pub struct RelayStage<T: Transport> {
    transport: T,
    transform: Arc<dyn Transform>,
    input: ChannelName,
    output: ChannelName,
    skip_retained: bool,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    stats: RelayStats,
}

impl<T: Transport> RelayStage<T> {
    /// Build a stage over any transport. Fails only on invalid channels.
    pub fn new(
        config: &RelayConfig,
        transport: T,
        transform: Arc<dyn Transform>,
    ) -> Result<Self, RelayError> {
        let input = config.input_channel()?;
        let output = config.output_channel()?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        if input.matches(output.as_str()) {
            warn!(
                input = %input,
                output = %output,
                "Input channel also matches the output topic; relayed messages may loop back"
            );
        }

        Ok(Self {
            transport,
            transform,
            input,
            output,
            skip_retained: config.relay.skip_retained,
            reconnect: ReconnectConfig::from(&config.reconnect),
            state_tx,
            state_rx,
            stats: RelayStats::default(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Watch connection state changes, e.g. for readiness probes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn transition(&self, event: ConnectionEvent) {
        let new_state = HealthMonitor::determine_next_state(event);
        let old_state = self.state_rx.borrow().clone();
        if old_state == new_state {
            return;
        }
        HealthMonitor::log_state_transition(&old_state, &new_state);
        metrics().set_relay_state(new_state.label());
        let _ = self.state_tx.send(new_state);
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    ///
    /// Returns the run's counters on a clean stop, or the last connection
    /// error once a configured `max_attempts` is exhausted.
    pub async fn run(
        &mut self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<RelayStats, RelayError> {
        let span = lifecycle_span!(
            stage = "relay",
            input = %self.input,
            output = %self.output,
            transform = self.transform.name()
        );
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<RelayStats, RelayError> {
        info!(
            max_attempts = ?self.reconnect.max_attempts,
            skip_retained = self.skip_retained,
            "Relay stage starting"
        );

        let mut failed_attempts: u32 = 0;
        let mut last_error: Option<RelayError>;

        loop {
            if is_shutdown(&shutdown) {
                break;
            }

            let attempt = failed_attempts + 1;
            self.transition(ConnectionEvent::ConnectStarted(attempt));
            self.stats.connection_attempts += 1;
            metrics().mqtt_connection_attempt();

            let opened = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => None,
                result = self
                    .open_session()
                    .instrument(mqtt_span!(operation = "connect", attempt)) => Some(result),
            };

            match opened {
                None => break,
                Some(Ok(())) => {
                    failed_attempts = 0;
                    last_error = None;
                    self.stats.sessions_established += 1;
                    metrics().mqtt_connection_established();
                    self.transition(ConnectionEvent::SessionEstablished);

                    match self.consume(&mut shutdown).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            self.stats.reconnects += 1;
                            metrics().mqtt_connection_lost();
                            self.transition(ConnectionEvent::SessionLost(reason));
                        }
                    }
                }
                Some(Err(error)) => {
                    failed_attempts += 1;
                    self.stats.connection_failures += 1;
                    metrics().mqtt_connection_failed();
                    warn!(
                        attempt,
                        kind = error.kind(),
                        error = %error.report(),
                        "Failed to establish MQTT session"
                    );
                    self.transition(ConnectionEvent::ConnectFailed(error.report()));
                    last_error = Some(error);
                }
            }

            match HealthMonitor::should_attempt_reconnection(
                failed_attempts,
                &self.reconnect,
                is_shutdown(&shutdown),
            ) {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    let max_display = self
                        .reconnect
                        .max_attempts
                        .map_or("∞".to_string(), |max| max.to_string());
                    info!(
                        "Attempting connection {}/{} after {}ms delay",
                        attempt, max_display, delay_ms
                    );
                    if !interruptible_sleep(&mut shutdown, delay_ms).await {
                        break;
                    }
                }
                ReconnectionDecision::AbortShutdownRequested => break,
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!("Max connection attempts ({failed_attempts}) exceeded");
                    self.transition(ConnectionEvent::PermanentFailure(reason.clone()));
                    let error = last_error.unwrap_or_else(|| RelayError::connection(reason));
                    error!(error = %error.report(), "Giving up on the broker");
                    return Err(error);
                }
            }
        }

        self.stop().await;
        info!(
            received = self.stats.received,
            published = self.stats.published,
            "Relay stage stopped"
        );
        Ok(self.stats.clone())
    }

    /// Connect and subscribe; a session without its subscription is closed
    async fn open_session(&mut self) -> Result<(), RelayError> {
        self.transport
            .connect()
            .await
            .map_err(|e| RelayError::connection(e.to_string()))?;

        if let Err(e) = self.transport.subscribe(&self.input).await {
            let error = RelayError::subscription(self.input.as_str(), e.to_string());
            if let Err(e) = self.transport.disconnect().await {
                debug!("Disconnect after failed subscribe: {}", e);
            }
            return Err(error);
        }

        info!(input = %self.input, "Subscribed to input channel");
        Ok(())
    }

    async fn consume(&mut self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = wait_for_shutdown(shutdown) => return SessionEnd::Shutdown,
                event = self.transport.next_event() => event,
            };

            match event {
                TransportEvent::Message(message) => {
                    self.handle_message(message).await;
                }
                TransportEvent::Disconnected(reason) => return SessionEnd::Lost(reason),
            }
        }
    }

    /// Transform one inbound message and publish the result
    pub async fn handle_message(&mut self, message: Message) -> MessageOutcome {
        let span = relay_span!(topic = %message.topic(), bytes = message.len());
        let outcome = self.relay_one(message).instrument(span).await;
        self.stats.record(outcome);
        outcome
    }

    async fn relay_one(&mut self, message: Message) -> MessageOutcome {
        let started = Instant::now();
        metrics().message_received();

        if !MessageHandler::should_process_message(
            message.topic(),
            message.is_retained(),
            self.input.as_str(),
            self.skip_retained,
        ) {
            metrics().message_skipped();
            return MessageOutcome::Skipped;
        }

        let payload = match self.transform.apply(message.payload()) {
            Ok(payload) => payload,
            Err(e) => {
                let error = RelayError::from(e);
                warn!(
                    transform = self.transform.name(),
                    error = %error.report(),
                    "Skipping message the transform could not decode"
                );
                metrics().decode_failed();
                return MessageOutcome::DecodeFailed;
            }
        };

        let outbound = message.derive(&self.output, payload);
        match self.transport.publish(outbound).await {
            Ok(()) => {
                metrics().message_relayed(started.elapsed());
                debug!(output = %self.output, "Message relayed");
                MessageOutcome::Relayed
            }
            Err(e) => {
                let error = RelayError::publish(self.output.as_str(), e.to_string());
                error!(error = %error.report(), "Dropping message after publish failure");
                metrics().publish_failed();
                MessageOutcome::Dropped
            }
        }
    }

    /// Best-effort unsubscribe and disconnect, bounded by the grace period
    async fn stop(&mut self) {
        info!("Shutdown requested, closing MQTT session");

        let transport = &mut self.transport;
        let input = &self.input;
        let closed = tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, async {
            if transport.is_connected() {
                if let Err(e) = transport.unsubscribe(input).await {
                    debug!("Unsubscribe on shutdown failed: {}", e);
                }
            }
            transport.disconnect().await
        })
        .await;

        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Disconnect on shutdown failed: {}", e),
            Err(_) => warn!(
                "Disconnect did not finish within {:?}, abandoning session",
                SHUTDOWN_GRACE_PERIOD
            ),
        }

        self.transition(ConnectionEvent::ShutdownCompleted);
    }
}

/// True once shutdown was requested or the signal's sender is gone
fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolve when shutdown is requested; cancel-safe
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let requested = *shutdown.borrow_and_update();
        if requested {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleep for `delay_ms` unless shutdown comes first.
/// Returns true if the sleep completed.
async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay_ms: u64) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown) => {
            info!("Shutdown signal received during reconnection delay, stopping");
            false
        }
        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
    }
}
