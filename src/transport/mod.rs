//! Transport layer for the relay stage
//!
//! This module provides the pub/sub transport abstraction and its MQTT
//! implementation. The relay stage only talks to [`Transport`], which keeps
//! the reconnection and forwarding logic testable without a broker.

use crate::message::{ChannelName, Message};
use crate::transport::mqtt::ConnectionState;

pub mod mqtt;

/// Event surfaced by a transport while a session is live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Message delivered on a subscribed channel
    Message(Message),
    /// Session ended; the caller decides whether to reconnect
    Disconnected(String),
}

/// Transport trait for the relay stage
///
/// This trait provides an abstraction over pub/sub transports (primarily
/// MQTT) to enable dependency injection and testing. One `connect` call opens
/// one session; subscriptions do not outlive it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a new session, discarding any previous one
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Subscribe to `channel` and wait for the broker to confirm it
    async fn subscribe(&mut self, channel: &ChannelName) -> Result<(), Self::Error>;

    /// Best-effort unsubscribe
    async fn unsubscribe(&mut self, channel: &ChannelName) -> Result<(), Self::Error>;

    /// Publish with at-least-once delivery
    async fn publish(&mut self, message: Message) -> Result<(), Self::Error>;

    /// Wait for the next event of the current session.
    /// Must be cancel-safe: dropping the future loses no message.
    async fn next_event(&mut self) -> TransportEvent;

    /// Close the session
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Get current connection state
    fn connection_state(&self) -> ConnectionState;

    /// Check if transport is currently connected
    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), ConnectionState::Connected)
    }
}

/// Type alias for MQTT transport
pub type MqttTransport = mqtt::MqttClient;
