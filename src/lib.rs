//! Pipeline Relay
//!
//! A single processing stage of an MQTT message pipeline: it subscribes to an
//! input topic, prefixes every payload with a stage label and republishes the
//! result to an output topic.
//!
//! # Overview
//!
//! - Channel names and topic validation ([`message`])
//! - The payload transform, `"IA_1 processou: "` by default ([`transform`])
//! - MQTT transport with connection supervision ([`transport`])
//! - The reconnecting relay stage itself ([`relay`])
//! - Logging, metrics and health endpoints ([`observability`])
//!
//! # Quick Start
//!
//! ```rust
//! use pipeline_relay::transform::{PrefixTransform, Transform};
//!
//! let transform = PrefixTransform::default();
//! let out = transform.apply(b"hello").unwrap();
//! assert_eq!(out, b"IA_1 processou: hello");
//! ```

pub mod config;
pub mod error;
pub mod message;
pub mod observability;
pub mod relay;
pub mod testing;
pub mod transform;
pub mod transport;

pub use config::{ConfigError, RelayConfig};
pub use error::{DecodeError, RelayError};
pub use message::{ChannelName, Message};
pub use relay::{MessageOutcome, RelayStage, RelayStats};
pub use transform::{PayloadEncoding, PrefixTransform, Transform};
pub use transport::mqtt::MqttClient;
pub use transport::{Transport, TransportEvent};
