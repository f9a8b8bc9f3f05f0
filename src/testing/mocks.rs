//! Mock transport for testing
//!
//! [`MockTransport`] implements [`Transport`] without a broker. A cloned
//! [`MockHandle`] lets a test inject deliveries and disconnects and script
//! connect, subscribe and publish failures while the relay runs.

use crate::message::{ChannelName, Message};
use crate::transport::{mqtt::ConnectionState, Transport, TransportEvent};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockError {
    #[error("Mock connection failure")]
    ConnectFailed,
    #[error("Mock subscription rejected for {0}")]
    SubscriptionRejected(String),
    #[error("Mock publish failure")]
    PublishFailed,
    #[error("Mock transport not connected")]
    NotConnected,
}

#[derive(Debug)]
enum MockEvent {
    Deliver(Message),
    Drop(String),
}

#[derive(Debug, Default)]
struct MockState {
    state: ConnectionState,
    refuse_connections: bool,
    connect_failures: u32,
    subscription_rejections: u32,
    publish_failures: u32,
    connect_attempts: Vec<Instant>,
    sessions: u32,
    subscriptions: Vec<(u32, String)>,
    unsubscriptions: Vec<String>,
    published: Vec<Message>,
    disconnect_calls: u32,
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    // A panicking test thread must not hide the recorded history
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    events_rx: mpsc::UnboundedReceiver<MockEvent>,
}

/// Test-side control of a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    events_tx: mpsc::UnboundedSender<MockEvent>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                state: state.clone(),
                events_rx,
            },
            MockHandle { state, events_tx },
        )
    }
}

impl MockHandle {
    /// Deliver a message on the next `next_event`
    pub fn send_message(&self, topic: &str, payload: impl Into<bytes::Bytes>) {
        let _ = self
            .events_tx
            .send(MockEvent::Deliver(Message::received(topic, payload, false)));
    }

    pub fn send_retained(&self, topic: &str, payload: impl Into<bytes::Bytes>) {
        let _ = self
            .events_tx
            .send(MockEvent::Deliver(Message::received(topic, payload, true)));
    }

    /// Simulate the broker closing the session
    pub fn drop_connection(&self, reason: &str) {
        let _ = self.events_tx.send(MockEvent::Drop(reason.to_string()));
    }

    /// Refuse every connect until called again with `false`
    pub fn refuse_connections(&self, refuse: bool) {
        lock(&self.state).refuse_connections = refuse;
    }

    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.state).connect_failures = count;
    }

    pub fn reject_next_subscriptions(&self, count: u32) {
        lock(&self.state).subscription_rejections = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        lock(&self.state).publish_failures = count;
    }

    pub fn published(&self) -> Vec<Message> {
        lock(&self.state).published.clone()
    }

    /// Subscribed topics, tagged with the session they were made in
    pub fn subscriptions(&self) -> Vec<(u32, String)> {
        lock(&self.state).subscriptions.clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        lock(&self.state).unsubscriptions.clone()
    }

    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.state).connect_attempts.clone()
    }

    pub fn sessions(&self) -> u32 {
        lock(&self.state).sessions
    }

    pub fn disconnect_calls(&self) -> u32 {
        lock(&self.state).disconnect_calls
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.state).state.clone()
    }

    /// Poll until `count` messages were published or `timeout` elapsed
    pub async fn wait_for_published(&self, count: usize, timeout: Duration) -> Vec<Message> {
        self.wait_until(timeout, |s| s.published.len() >= count).await;
        self.published()
    }

    /// Poll until `count` sessions were established or `timeout` elapsed
    pub async fn wait_for_sessions(&self, count: u32, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.sessions >= count && s.subscriptions.len() >= count as usize)
            .await
    }

    /// Poll until at least `count` connect attempts were made
    pub async fn wait_for_connect_attempts(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.connect_attempts.len() >= count)
            .await
    }

    async fn wait_until<F>(&self, timeout: Duration, condition: F) -> bool
    where
        F: Fn(&MockState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let satisfied = condition(&lock(&self.state));
            if satisfied {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        let mut state = lock(&self.state);
        state.connect_attempts.push(Instant::now());

        if state.refuse_connections || state.connect_failures > 0 {
            state.connect_failures = state.connect_failures.saturating_sub(1);
            state.state = ConnectionState::Disconnected("Mock connection failure".to_string());
            return Err(MockError::ConnectFailed);
        }

        state.sessions += 1;
        state.state = ConnectionState::Connected;
        Ok(())
    }

    async fn subscribe(&mut self, channel: &ChannelName) -> Result<(), Self::Error> {
        let mut state = lock(&self.state);
        if state.state != ConnectionState::Connected {
            return Err(MockError::NotConnected);
        }
        if state.subscription_rejections > 0 {
            state.subscription_rejections -= 1;
            return Err(MockError::SubscriptionRejected(channel.to_string()));
        }
        let session = state.sessions;
        state.subscriptions.push((session, channel.to_string()));
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &ChannelName) -> Result<(), Self::Error> {
        lock(&self.state).unsubscriptions.push(channel.to_string());
        Ok(())
    }

    async fn publish(&mut self, message: Message) -> Result<(), Self::Error> {
        let mut state = lock(&self.state);
        if state.state != ConnectionState::Connected {
            return Err(MockError::NotConnected);
        }
        if state.publish_failures > 0 {
            state.publish_failures -= 1;
            return Err(MockError::PublishFailed);
        }
        state.published.push(message);
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        match self.events_rx.recv().await {
            Some(MockEvent::Deliver(message)) => TransportEvent::Message(message),
            Some(MockEvent::Drop(reason)) => {
                lock(&self.state).state = ConnectionState::Disconnected(reason.clone());
                TransportEvent::Disconnected(reason)
            }
            // Every handle is gone; nothing will ever arrive
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        let mut state = lock(&self.state);
        state.disconnect_calls += 1;
        state.state = ConnectionState::Disconnected("Client disconnected".to_string());
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).state.clone()
    }
}
