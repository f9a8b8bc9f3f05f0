//! Testing utilities and mock implementations
//!
//! Lets the relay stage be exercised without an MQTT broker.

pub mod mocks;

pub use mocks::*;
