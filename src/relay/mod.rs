//! Relay stage: subscribe to one channel, transform, republish to another
//!
//! [`RelayStage`] is generic over the [`Transport`](crate::transport::Transport)
//! so the state machine runs the same against a broker or a mock.
//!
//! ```rust,no_run
//! use pipeline_relay::config::RelayConfig;
//! use pipeline_relay::relay;
//! use pipeline_relay::transform::PrefixTransform;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # tokio_test::block_on(async {
//! let (_stop_tx, stop_rx) = watch::channel(false);
//! let stats = relay::start(RelayConfig::from_env()?, Arc::new(PrefixTransform::default()), stop_rx).await?;
//! println!("relayed {} messages", stats.published);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod stage;
pub mod stats;

pub use stage::{RelayStage, SHUTDOWN_GRACE_PERIOD};
pub use stats::{MessageOutcome, RelayStats};

use crate::config::RelayConfig;
use crate::error::RelayResult;
use crate::transform::{PrefixTransform, Transform};
use crate::transport::MqttTransport;
use std::sync::Arc;
use tokio::sync::watch;

/// The configured default transform: prefix `relay.label`
pub fn default_transform(config: &RelayConfig) -> Arc<dyn Transform> {
    Arc::new(PrefixTransform::new(
        config.relay.label.clone(),
        config.relay.encoding,
    ))
}

/// Validate `config` and build a stage over the MQTT transport
pub fn mqtt_stage(
    config: &RelayConfig,
    transform: Arc<dyn Transform>,
) -> RelayResult<RelayStage<MqttTransport>> {
    config.validate()?;
    RelayStage::new(config, MqttTransport::new(config.clone()), transform)
}

/// Connect to the configured broker and relay until `shutdown` fires
pub async fn start(
    config: RelayConfig,
    transform: Arc<dyn Transform>,
    shutdown: watch::Receiver<bool>,
) -> RelayResult<RelayStats> {
    let mut stage = mqtt_stage(&config, transform)?;
    stage.run(shutdown).await
}
