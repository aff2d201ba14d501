//! Bridges a single MQTT switch device to any number of real-time listeners.
//!
//! [`Bridge`] is the entry point: it owns the broker session, keeps the last
//! known device state plus a bounded activity history, fans every change out to
//! registered subscribers and forwards commands back to the device.

pub mod bridge;
pub mod config;
pub mod mqtt;

pub use bridge::{Bridge, BridgeError, StatusReport};
pub use config::BridgeConfig;
