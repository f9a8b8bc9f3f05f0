//! Pure health monitoring and reconnection logic
//!
//! Reconnection decisions and state transitions are pure functions so the
//! relay's state machine can be tested without a broker.

use super::connection::{ConnectionState, ReconnectConfig};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what follows `failed_attempts` consecutive failures.
    /// `failed_attempts == 0` means a live session was just lost.
    pub fn should_attempt_reconnection(
        failed_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if failed_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        ReconnectionDecision::Proceed {
            attempt: failed_attempts + 1,
            delay_ms: config.calculate_backoff_delay(failed_attempts.max(1)),
        }
    }

    /// Determine next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted(attempt) => ConnectionState::Connecting(attempt),
            ConnectionEvent::SessionEstablished => ConnectionState::Connected,
            ConnectionEvent::SessionLost(reason) => ConnectionState::Disconnected(reason),
            ConnectionEvent::ConnectFailed(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
            ConnectionEvent::ShutdownCompleted => ConnectionState::Stopped,
        }
    }

    /// Check if connection state allows publishing
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting(attempt), ConnectionState::Connected) if *attempt > 1 => {
                info!(attempt, "Reconnection successful");
            }
            (ConnectionState::Connecting(_), ConnectionState::Connected) => {
                info!("MQTT session established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT session lost");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                info!("MQTT connection state: {} -> {}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay_ms` then start connect attempt `attempt`
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectStarted(u32),
    /// Connected and subscribed
    SessionEstablished,
    /// A live session ended
    SessionLost(String),
    /// Connect or subscribe failed
    ConnectFailed(String),
    PermanentFailure(String),
    ShutdownCompleted,
}
