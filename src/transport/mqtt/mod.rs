//! MQTT transport for the relay stage
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - connection state, backoff and `rumqttc` options
//! - [`message_handler`] - routing of polled MQTT events
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the impure client driving the `rumqttc` event loop
//!
//! # Usage
//!
//! ```rust,no_run
//! use pipeline_relay::config::RelayConfig;
//! use pipeline_relay::transport::mqtt::MqttClient;
//! use pipeline_relay::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let config = RelayConfig::default();
//! let input = config.input_channel()?;
//!
//! let mut client = MqttClient::new(config);
//! client.connect().await?;
//! client.subscribe(&input).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{MqttClient, MqttError};
pub use connection::{
    configure_mqtt_options, subscription_filter, ConnectionState, ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
