//! Impure I/O operations for the MQTT client
//!
//! This module owns the `rumqttc` client and event loop. Each `connect` builds
//! a fresh client and spawns a driver task that polls the event loop and
//! forwards routed events over an unbounded channel, so publishing from the
//! consumer side never waits on the poller.

use super::connection::{configure_mqtt_options, subscription_filter, ConnectionState};
use super::health_monitor::HealthMonitor;
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::{ConfigError, RelayConfig};
use crate::message::{ChannelName, Message};
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the request channel between `AsyncClient` and `EventLoop`
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long to wait for the SubAck of a subscribe request
const SUBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `disconnect` waits for the event loop task to finish
const DRIVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connection refused by broker: {0}")]
    ConnectionRefused(String),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Subscription to {topic} failed: {message}")]
    SubscriptionFailed { topic: String, message: String },
    #[error("Publishing to {topic} failed: {message}")]
    PublishFailed { topic: String, message: String },
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// MQTT transport client for the relay stage
pub struct MqttClient {
    config: RelayConfig,
    client: Option<AsyncClient>,
    events_rx: Option<mpsc::UnboundedReceiver<EventRoute>>,
    event_loop_handle: Option<JoinHandle<()>>,
    // Events read while waiting for ConnAck/SubAck, replayed by next_event
    pending: VecDeque<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    session_id: Option<Uuid>,
    connect_attempts: u32,
}

impl MqttClient {
    pub fn new(config: RelayConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        Self {
            config,
            client: None,
            events_rx: None,
            event_loop_handle: None,
            pending: VecDeque::new(),
            state_tx,
            state_rx,
            session_id: None,
            connect_attempts: 0,
        }
    }

    /// Subscribe to connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Identifier of the current session, for log correlation
    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.state_rx.borrow().clone();
        if old_state != new_state {
            debug!(target: "mqtt_transport", "Transport state: {} -> {}", old_state, new_state);
        }
        let _ = self.state_tx.send(new_state);
    }

    /// Check connection state before operations
    fn check_connection_state(&self) -> Result<&AsyncClient, MqttError> {
        let current_state = self.state_rx.borrow().clone();
        if !HealthMonitor::can_publish(&current_state) {
            return Err(MqttError::NotConnected {
                state: current_state,
            });
        }
        self.client.as_ref().ok_or(MqttError::NotConnected {
            state: current_state,
        })
    }

    /// Spawn the task polling the event loop for one session.
    /// The task ends on the first connection error or DISCONNECT, which keeps
    /// reconnect policy in the relay stage instead of inside `rumqttc`.
    fn spawn_event_loop(
        mut event_loop: EventLoop,
        events_tx: mpsc::UnboundedSender<EventRoute>,
        session_id: Uuid,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(target: "mqtt_transport", %session_id, "MQTT event loop started");
            loop {
                match event_loop.poll().await {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        let session_over = matches!(
                            route,
                            EventRoute::Disconnected(_) | EventRoute::ConnectionRefused(_)
                        );
                        match route {
                            EventRoute::InfrastructureEvent(event_str) => {
                                tracing::trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                            }
                            EventRoute::OutgoingEvent => {}
                            route => {
                                if events_tx.send(route).is_err() {
                                    break;
                                }
                            }
                        }
                        if session_over {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = events_tx.send(EventRoute::Disconnected(e.to_string()));
                        break;
                    }
                }
            }
            debug!(target: "mqtt_transport", %session_id, "MQTT event loop stopped");
        })
    }

    /// Drop the current session without talking to the broker
    fn teardown_session(&mut self) {
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
        self.client = None;
        self.events_rx = None;
        self.pending.clear();
    }

    /// Wait for ConnAck on the freshly spawned session
    async fn wait_for_connection_confirmation(&mut self) -> Result<(), MqttError> {
        let events_rx = self
            .events_rx
            .as_mut()
            .ok_or_else(|| MqttError::ConnectionFailed("event channel missing".to_string()))?;

        loop {
            match events_rx.recv().await {
                Some(EventRoute::ConnectionAcknowledged) => return Ok(()),
                Some(EventRoute::ConnectionRefused(code)) => {
                    return Err(MqttError::ConnectionRefused(code))
                }
                Some(EventRoute::Disconnected(reason)) => {
                    return Err(MqttError::ConnectionFailed(reason))
                }
                Some(EventRoute::MessageReceived {
                    topic,
                    payload,
                    retain,
                }) => self.pending.push_back(TransportEvent::Message(Message::received(
                    topic, payload, retain,
                ))),
                Some(_) => continue,
                None => {
                    return Err(MqttError::ConnectionFailed(
                        "event loop stopped before ConnAck".to_string(),
                    ))
                }
            }
        }
    }

    /// Wait for the SubAck of a subscribe request, buffering deliveries
    async fn wait_for_subscription_confirmation(&mut self, topic: &str) -> Result<(), MqttError> {
        let events_rx = self.events_rx.as_mut().ok_or_else(|| MqttError::NotConnected {
            state: self.state_rx.borrow().clone(),
        })?;

        loop {
            match events_rx.recv().await {
                Some(EventRoute::SubscriptionConfirmed { packet_id, result }) => {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                    return result.map_err(|message| MqttError::SubscriptionFailed {
                        topic: topic.to_string(),
                        message,
                    });
                }
                Some(EventRoute::MessageReceived {
                    topic,
                    payload,
                    retain,
                }) => self.pending.push_back(TransportEvent::Message(Message::received(
                    topic, payload, retain,
                ))),
                Some(EventRoute::Disconnected(reason))
                | Some(EventRoute::ConnectionRefused(reason)) => {
                    self.pending
                        .push_back(TransportEvent::Disconnected(reason.clone()));
                    return Err(MqttError::SubscriptionFailed {
                        topic: topic.to_string(),
                        message: format!("session lost before SubAck: {reason}"),
                    });
                }
                Some(_) => continue,
                None => {
                    return Err(MqttError::SubscriptionFailed {
                        topic: topic.to_string(),
                        message: "event loop stopped before SubAck".to_string(),
                    })
                }
            }
        }
    }

    /// Open a new session and wait for ConnAck
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        self.teardown_session();

        let mqtt_options = configure_mqtt_options(&self.config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();

        self.connect_attempts += 1;
        self.set_state(ConnectionState::Connecting(self.connect_attempts));
        self.event_loop_handle = Some(Self::spawn_event_loop(event_loop, events_tx, session_id));
        self.client = Some(client);
        self.events_rx = Some(events_rx);
        self.session_id = Some(session_id);

        info!(
            target: "mqtt_transport",
            %session_id,
            broker = %format!("{}:{}", self.config.broker.host, self.config.broker.port),
            client_id = %self.config.broker.client_id,
            "Connecting to MQTT broker"
        );

        let timeout = Duration::from_secs(self.config.broker.connect_timeout_secs);
        let result = match tokio::time::timeout(timeout, self.wait_for_connection_confirmation())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(MqttError::Timeout("ConnAck")),
        };

        match result {
            Ok(()) => {
                self.connect_attempts = 0;
                self.set_state(ConnectionState::Connected);
                info!(target: "mqtt_transport", %session_id, "Connected to MQTT broker");
                Ok(())
            }
            Err(e) => {
                self.teardown_session();
                self.set_state(ConnectionState::Disconnected(e.to_string()));
                Err(e)
            }
        }
    }

    /// Subscribe with QoS 1 and verify the SubAck
    pub async fn subscribe(&mut self, channel: &ChannelName) -> Result<(), MqttError> {
        let topic = channel.as_str();
        {
            let client = self.check_connection_state()?;
            info!(target: "mqtt_transport", "Subscribing to input topic: {}", topic);
            let filter = subscription_filter(channel, &self.config.topics.output);
            client
                .subscribe_many([filter])
                .await
                .map_err(|e| MqttError::SubscriptionFailed {
                    topic: topic.to_string(),
                    message: e.to_string(),
                })?;
        }

        match tokio::time::timeout(SUBACK_TIMEOUT, self.wait_for_subscription_confirmation(topic))
            .await
        {
            Ok(Ok(())) => {
                info!(target: "mqtt_transport", "Successfully subscribed to: {}", topic);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::Timeout("SubAck")),
        }
    }

    pub async fn unsubscribe(&mut self, channel: &ChannelName) -> Result<(), MqttError> {
        let client = self.check_connection_state()?;
        client
            .unsubscribe(channel.as_str())
            .await
            .map_err(|e| MqttError::SubscriptionFailed {
                topic: channel.as_str().to_string(),
                message: e.to_string(),
            })?;
        debug!(target: "mqtt_transport", "Unsubscribed from: {}", channel);
        Ok(())
    }

    /// Publish with QoS 1, never retained.
    /// Returns once the request is handed to the event loop, which owns the
    /// PubAck handshake.
    pub async fn publish(&mut self, message: Message) -> Result<(), MqttError> {
        let client = self.check_connection_state()?;
        client
            .publish(
                message.topic(),
                QoS::AtLeastOnce,
                false,
                message.payload_bytes(),
            )
            .await
            .map_err(|e| MqttError::PublishFailed {
                topic: message.topic().to_string(),
                message: e.to_string(),
            })?;

        debug!(
            target: "mqtt_transport",
            topic = %message.topic(),
            bytes = message.len(),
            "Published message"
        );
        Ok(())
    }

    /// Next event of the current session; cancel-safe
    pub async fn next_event(&mut self) -> TransportEvent {
        if let Some(event) = self.pending.pop_front() {
            if let TransportEvent::Disconnected(reason) = &event {
                self.set_state(ConnectionState::Disconnected(reason.clone()));
            }
            return event;
        }

        let Some(events_rx) = self.events_rx.as_mut() else {
            return TransportEvent::Disconnected("no active session".to_string());
        };

        loop {
            match events_rx.recv().await {
                Some(EventRoute::MessageReceived {
                    topic,
                    payload,
                    retain,
                }) => {
                    return TransportEvent::Message(Message::received(topic, payload, retain));
                }
                Some(EventRoute::Disconnected(reason))
                | Some(EventRoute::ConnectionRefused(reason)) => {
                    warn!(target: "mqtt_transport", reason = %reason, "MQTT session ended");
                    let _ = self
                        .state_tx
                        .send(ConnectionState::Disconnected(reason.clone()));
                    return TransportEvent::Disconnected(reason);
                }
                Some(other) => {
                    debug!(target: "mqtt_transport", "Ignoring event: {:?}", other);
                }
                None => {
                    let reason = "event loop stopped".to_string();
                    let _ = self
                        .state_tx
                        .send(ConnectionState::Disconnected(reason.clone()));
                    return TransportEvent::Disconnected(reason);
                }
            }
        }
    }

    /// Send DISCONNECT and stop the event loop task
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!(target: "mqtt_transport", "DISCONNECT not sent: {}", e);
            }
        }

        if let Some(mut handle) = self.event_loop_handle.take() {
            match tokio::time::timeout(DRIVER_SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => {
                    debug!(target: "mqtt_transport", "Event loop task shut down gracefully");
                }
                Ok(Err(e)) if !e.is_cancelled() => {
                    error!("Event loop task ended with error: {}", e);
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!("Event loop task didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }

        self.teardown_session();
        self.set_state(ConnectionState::Disconnected(
            "Client disconnected".to_string(),
        ));
        info!(target: "mqtt_transport", "MQTT client disconnected");
        Ok(())
    }
}

/// Implementation of Transport trait for MqttClient
#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn subscribe(&mut self, channel: &ChannelName) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, channel).await
    }

    async fn unsubscribe(&mut self, channel: &ChannelName) -> Result<(), Self::Error> {
        MqttClient::unsubscribe(self, channel).await
    }

    async fn publish(&mut self, message: Message) -> Result<(), Self::Error> {
        MqttClient::publish(self, message).await
    }

    async fn next_event(&mut self) -> TransportEvent {
        MqttClient::next_event(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        // No async in Drop; callers should disconnect() for a clean DISCONNECT
        if let Some(handle) = self.event_loop_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn unreachable_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.broker.host = "127.0.0.1".to_string();
        config.broker.port = closed_port();
        config.broker.connect_timeout_secs = 2;
        config
    }

    #[test]
    fn test_new_client_is_disconnected() {
        let client = MqttClient::new(RelayConfig::default());
        assert_eq!(
            Transport::connection_state(&client),
            ConnectionState::Disconnected("not started".to_string())
        );
        assert!(!Transport::is_connected(&client));
        assert!(client.session_id().is_none());
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let mut client = MqttClient::new(RelayConfig::default());
        let result = client.publish(Message::new("out", "payload")).await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let mut client = MqttClient::new(RelayConfig::default());
        let channel = ChannelName::input("in").unwrap();
        let result = client.subscribe(&channel).await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_next_event_without_session() {
        let mut client = MqttClient::new(RelayConfig::default());
        assert!(matches!(
            client.next_event().await,
            TransportEvent::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_fails() {
        let mut client = MqttClient::new(unreachable_config());
        let result = client.connect().await;
        assert!(result.is_err());
        assert!(matches!(
            Transport::connection_state(&client),
            ConnectionState::Disconnected(_)
        ));
        assert!(client.event_loop_handle.is_none());
    }

    #[tokio::test]
    async fn test_connect_with_invalid_host_is_config_error() {
        let mut config = RelayConfig::default();
        config.broker.host = "bad host".to_string();
        let mut client = MqttClient::new(config);
        assert!(matches!(
            client.connect().await,
            Err(MqttError::Config(ConfigError::InvalidBrokerUrl(_)))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_ok() {
        let mut client = MqttClient::new(RelayConfig::default());
        assert!(client.disconnect().await.is_ok());
        assert_eq!(
            Transport::connection_state(&client),
            ConnectionState::Disconnected("Client disconnected".to_string())
        );
    }
}
