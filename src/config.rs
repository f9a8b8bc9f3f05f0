//! Relay configuration
//!
//! Configuration is resolved in three layers: built-in defaults, an optional
//! TOML file, then environment variables. Any invalid value is a
//! [`ConfigError`], which the process treats as fatal.

use crate::message::{ChannelName, TopicError};
use crate::transform::{PayloadEncoding, DEFAULT_LABEL};
use serde::{Deserialize, Serialize};
use std::net::Ipv6Addr;
use std::path::Path;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BROKER_HOST: &str = "localhost";
pub const DEFAULT_BROKER_PORT: u16 = 1883;
pub const DEFAULT_INPUT_TOPIC: &str = "pipeline/default_input";
pub const DEFAULT_OUTPUT_TOPIC: &str = "pipeline/default_output";
pub const DEFAULT_CLIENT_ID: &str = "ia_processamento_1_client";

/// Complete relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Use `mqtts://` with the platform root certificates
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Time allowed for a single connect attempt to receive ConnAck
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Environment variable containing username
    #[serde(default = "default_username_env")]
    pub username_env: Option<String>,
    /// Environment variable containing password
    #[serde(default = "default_password_env")]
    pub password_env: Option<String>,
}

/// Input and output channels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    #[serde(default = "default_input_topic")]
    pub input: String,
    #[serde(default = "default_output_topic")]
    pub output: String,
}

/// Message handling settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    /// Label prepended by the default transform
    #[serde(default = "default_label")]
    pub label: String,
    #[serde(default)]
    pub encoding: PayloadEncoding,
    /// Ignore messages the broker delivers with the retain flag set
    #[serde(default)]
    pub skip_retained: bool,
    /// Port for the health/metrics HTTP server (disabled when unset)
    #[serde(default)]
    pub health_port: Option<u16>,
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Maximum consecutive failed attempts (None = unlimited)
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_host() -> String {
    DEFAULT_BROKER_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_BROKER_PORT
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_username_env() -> Option<String> {
    Some("MQTT_USERNAME".to_string())
}

fn default_password_env() -> Option<String> {
    Some("MQTT_PASSWORD".to_string())
}

fn default_input_topic() -> String {
    DEFAULT_INPUT_TOPIC.to_string()
}

fn default_output_topic() -> String {
    DEFAULT_OUTPUT_TOPIC.to_string()
}

fn default_label() -> String {
    DEFAULT_LABEL.to_string()
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_multiplier() -> u32 {
    2
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            tls: false,
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            username_env: default_username_env(),
            password_env: default_password_env(),
        }
    }
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            input: default_input_topic(),
            output: default_output_topic(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            label: default_label(),
            encoding: PayloadEncoding::default(),
            skip_retained: false,
            health_port: None,
        }
    }
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker port: '{0}'")]
    InvalidPort(String),
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: String, value: String },
    #[error("The {0} topic cannot be empty")]
    EmptyTopic(&'static str),
    #[error("Invalid {direction} topic '{topic}': {source}")]
    InvalidTopic {
        direction: &'static str,
        topic: String,
        #[source]
        source: TopicError,
    },
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RelayConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load an optional TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::parse_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file without environment overrides
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// `BROKER_HOST`/`BROKER_PORT` take precedence over the legacy
    /// `MQTT_BROKER_HOST`/`MQTT_BROKER_PORT` names.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |names: &[&str]| names.iter().find_map(|name| lookup(name));

        if let Some(host) = first(&["BROKER_HOST", "MQTT_BROKER_HOST"]) {
            self.broker.host = host;
        }
        if let Some(port) = first(&["BROKER_PORT", "MQTT_BROKER_PORT"]) {
            self.broker.port = parse_port(&port)?;
        }
        if let Some(tls) = lookup("BROKER_TLS") {
            self.broker.tls = parse_bool("BROKER_TLS", &tls)?;
        }
        if let Some(client_id) = lookup("RELAY_CLIENT_ID") {
            self.broker.client_id = client_id;
        }
        if let Some(input) = lookup("INPUT_TOPIC") {
            self.topics.input = input;
        }
        if let Some(output) = lookup("OUTPUT_TOPIC") {
            self.topics.output = output;
        }
        if let Some(label) = lookup("RELAY_LABEL") {
            self.relay.label = label;
        }
        if let Some(encoding) = lookup("RELAY_PAYLOAD_ENCODING") {
            self.relay.encoding =
                PayloadEncoding::parse(&encoding).ok_or_else(|| ConfigError::InvalidValue {
                    name: "RELAY_PAYLOAD_ENCODING".to_string(),
                    value: encoding.clone(),
                })?;
        }
        if let Some(skip) = lookup("RELAY_SKIP_RETAINED") {
            self.relay.skip_retained = parse_bool("RELAY_SKIP_RETAINED", &skip)?;
        }
        if let Some(port) = lookup("HEALTH_PORT") {
            self.relay.health_port = Some(parse_port(&port)?);
        }
        if let Some(attempts) = lookup("RELAY_MAX_CONNECT_ATTEMPTS") {
            let attempts: u32 =
                attempts
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        name: "RELAY_MAX_CONNECT_ATTEMPTS".to_string(),
                        value: attempts.clone(),
                    })?;
            // 0 means unlimited
            self.reconnect.max_attempts = (attempts > 0).then_some(attempts);
        }

        Ok(())
    }

    /// Validate every field; any failure is fatal at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker host cannot be empty".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::InvalidPort("0".to_string()));
        }
        if self.broker.client_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client id cannot be empty".to_string(),
            ));
        }
        if self.broker.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be greater than 0".to_string(),
            ));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.input_channel()?;
        self.output_channel()?;
        self.broker_url()?;

        if self.reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "max_delay_ms must be at least initial_delay_ms".to_string(),
            ));
        }
        if self.reconnect.multiplier == 0 {
            return Err(ConfigError::InvalidConfig(
                "multiplier must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_attempts must be greater than 0 or unset for unlimited".to_string(),
            ));
        }

        Ok(())
    }

    /// Validated subscription channel
    pub fn input_channel(&self) -> Result<ChannelName, ConfigError> {
        if self.topics.input.is_empty() {
            return Err(ConfigError::EmptyTopic("input"));
        }
        ChannelName::input(self.topics.input.clone()).map_err(|source| {
            ConfigError::InvalidTopic {
                direction: "input",
                topic: self.topics.input.clone(),
                source,
            }
        })
    }

    /// Validated publish channel
    pub fn output_channel(&self) -> Result<ChannelName, ConfigError> {
        if self.topics.output.is_empty() {
            return Err(ConfigError::EmptyTopic("output"));
        }
        ChannelName::output(self.topics.output.clone()).map_err(|source| {
            ConfigError::InvalidTopic {
                direction: "output",
                topic: self.topics.output.clone(),
                source,
            }
        })
    }

    /// Broker address as a URL: `mqtt://host:port` or `mqtts://host:port`
    pub fn broker_url(&self) -> Result<Url, ConfigError> {
        let scheme = if self.broker.tls { "mqtts" } else { "mqtt" };
        // IPv6 literals need brackets inside a URL authority
        let host = match self.broker.host.parse::<Ipv6Addr>() {
            Ok(addr) => format!("[{addr}]"),
            Err(_) => self.broker.host.clone(),
        };
        let raw = format!("{scheme}://{host}:{}", self.broker.port);
        let url = Url::parse(&raw).map_err(|_| ConfigError::InvalidBrokerUrl(raw.clone()))?;
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidBrokerUrl(raw));
        }
        Ok(url)
    }

    /// Get MQTT username from environment variable
    pub fn mqtt_username(&self) -> Option<String> {
        self.broker
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT password from environment variable
    pub fn mqtt_password(&self) -> Option<String> {
        self.broker
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(value.to_string())),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.topics.input, "pipeline/default_input");
        assert_eq!(config.topics.output, "pipeline/default_output");
        assert_eq!(config.relay.label, "IA_1 processou: ");
        assert_eq!(config.broker.keep_alive_secs, 60);
        assert_eq!(config.reconnect.max_attempts, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RelayConfig::default();
        config
            .apply_env(lookup_from(&[
                ("BROKER_HOST", "mosquitto"),
                ("BROKER_PORT", "1884"),
                ("INPUT_TOPIC", "stage/in"),
                ("OUTPUT_TOPIC", "stage/out"),
                ("RELAY_MAX_CONNECT_ATTEMPTS", "5"),
            ]))
            .unwrap();

        assert_eq!(config.broker.host, "mosquitto");
        assert_eq!(config.broker.port, 1884);
        assert_eq!(config.topics.input, "stage/in");
        assert_eq!(config.topics.output, "stage/out");
        assert_eq!(config.reconnect.max_attempts, Some(5));
    }

    #[test]
    fn test_legacy_env_names_are_fallbacks() {
        let mut config = RelayConfig::default();
        config
            .apply_env(lookup_from(&[
                ("MQTT_BROKER_HOST", "legacy-host"),
                ("MQTT_BROKER_PORT", "2883"),
            ]))
            .unwrap();
        assert_eq!(config.broker.host, "legacy-host");
        assert_eq!(config.broker.port, 2883);

        let mut config = RelayConfig::default();
        config
            .apply_env(lookup_from(&[
                ("BROKER_HOST", "new-host"),
                ("MQTT_BROKER_HOST", "legacy-host"),
            ]))
            .unwrap();
        assert_eq!(config.broker.host, "new-host");
    }

    #[test]
    fn test_invalid_port_is_fatal() {
        let mut config = RelayConfig::default();
        let result = config.apply_env(lookup_from(&[("BROKER_PORT", "not-a-port")]));
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));

        let result = config.apply_env(lookup_from(&[("BROKER_PORT", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));

        let result = config.apply_env(lookup_from(&[("BROKER_PORT", "70000")]));
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));
    }

    #[test]
    fn test_zero_max_attempts_means_unlimited() {
        let mut config = RelayConfig::default();
        config.reconnect.max_attempts = Some(3);
        config
            .apply_env(lookup_from(&[("RELAY_MAX_CONNECT_ATTEMPTS", "0")]))
            .unwrap();
        assert_eq!(config.reconnect.max_attempts, None);
    }

    #[test]
    fn test_invalid_bool_and_encoding() {
        let mut config = RelayConfig::default();
        assert!(matches!(
            config.apply_env(lookup_from(&[("BROKER_TLS", "maybe")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.apply_env(lookup_from(&[("RELAY_PAYLOAD_ENCODING", "xml")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_output_topic_with_wildcard_is_invalid() {
        let mut config = RelayConfig::default();
        config.topics.output = "pipeline/#".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTopic {
                direction: "output",
                ..
            })
        ));
    }

    #[test]
    fn test_empty_topics_are_invalid() {
        let mut config = RelayConfig::default();
        config.topics.input = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyTopic("input"))));
    }

    #[test]
    fn test_broker_url() {
        let mut config = RelayConfig::default();
        assert_eq!(
            config.broker_url().unwrap().as_str(),
            "mqtt://localhost:1883"
        );
        config.broker.tls = true;
        config.broker.port = 8883;
        assert_eq!(
            config.broker_url().unwrap().as_str(),
            "mqtts://localhost:8883"
        );

        config.broker.host = "bad host".to_string();
        assert!(matches!(
            config.broker_url(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_ipv6_broker_host_is_bracketed() {
        let mut config = RelayConfig::default();
        config.broker.host = "::1".to_string();
        config.validate().unwrap();
        assert_eq!(config.broker_url().unwrap().as_str(), "mqtt://[::1]:1883");

        config.broker.host = "[fd00::17]".to_string();
        assert_eq!(
            config.broker_url().unwrap().as_str(),
            "mqtt://[fd00::17]:1883"
        );
    }

    #[test]
    fn test_reconnect_validation() {
        let mut config = RelayConfig::default();
        config.reconnect.max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.reconnect.max_attempts = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: RelayConfig = toml::from_str(
            r#"
[broker]
host = "mqtt.internal"

[topics]
input = "sensors/+/raw"

[relay]
encoding = "binary"
skip_retained = true

[reconnect]
max_attempts = 10
"#,
        )
        .unwrap();

        assert_eq!(config.broker.host, "mqtt.internal");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.topics.input, "sensors/+/raw");
        assert_eq!(config.topics.output, "pipeline/default_output");
        assert_eq!(config.relay.encoding, PayloadEncoding::Binary);
        assert!(config.relay.skip_retained);
        assert_eq!(config.reconnect.max_attempts, Some(10));
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert!(config.validate().is_ok());
    }
}
