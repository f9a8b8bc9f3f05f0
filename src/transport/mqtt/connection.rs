//! Pure connection state management for the MQTT transport
//!
//! This module contains pure functions for connection state, reconnect
//! backoff and building `rumqttc` options from the relay configuration.

use crate::config::{ConfigError, ReconnectSection, RelayConfig};
use crate::message::ChannelName;
use rumqttc::v5::mqttbytes::v5::Filter;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use std::time::Duration;
use url::Host;

/// Lifecycle of the relay's connection session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session; carries the reason the last one ended
    Disconnected(String),
    /// Session being established (attempt number since last success)
    Connecting(u32),
    /// Session established and subscribed
    Connected,
    /// Configured maximum of connect attempts exhausted
    PermanentlyDisconnected(String),
    /// Explicit shutdown completed; terminal
    Stopped,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "disconnected",
            ConnectionState::Connecting(_) => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::PermanentlyDisconnected(_) => "permanently_disconnected",
            ConnectionState::Stopped => "stopped",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected("not started".to_string())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
            ConnectionState::Connecting(attempt) => write!(f, "connecting (attempt {attempt})"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::PermanentlyDisconnected(reason) => {
                write!(f, "permanently disconnected ({reason})")
            }
            ConnectionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Bounded exponential backoff between connect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor applied per attempt
    pub multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            initial_delay_ms: section.initial_delay_ms,
            max_delay_ms: section.max_delay_ms,
            multiplier: section.multiplier,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based):
    /// `initial * multiplier^(attempt-1)`, capped at `max_delay_ms`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let factor = (self.multiplier as u64).checked_pow(exponent);
        factor
            .and_then(|f| self.initial_delay_ms.checked_mul(f))
            .map_or(self.max_delay_ms, |delay| delay.min(self.max_delay_ms))
    }
}

/// Pure function building MQTT options from the relay configuration
pub fn configure_mqtt_options(config: &RelayConfig) -> Result<MqttOptions, ConfigError> {
    let url = config.broker_url()?;
    let host = match url.host() {
        Some(Host::Ipv6(addr)) => addr.to_string(),
        Some(host) => host.to_string(),
        None => return Err(ConfigError::InvalidBrokerUrl(url.to_string())),
    };
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(config.broker.client_id.clone(), host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Credentials are resolved at connect time so rotated secrets are picked up
    if let Some(username) = config.mqtt_username() {
        let password = config.mqtt_password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.broker.keep_alive_secs));

    // Subscriptions never survive a session reset; the relay resubscribes
    mqtt_options.set_clean_start(true);

    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}

/// Subscription for the input channel. When the input also matches the
/// output topic, `no_local` keeps the relay from consuming its own publishes.
/// Shared subscriptions may not set `no_local`.
pub fn subscription_filter(input: &ChannelName, output_topic: &str) -> Filter {
    let mut filter = Filter::new(input.as_str(), QoS::AtLeastOnce);
    filter.nolocal = !input.is_shared() && input.matches(output_topic);
    filter
}
