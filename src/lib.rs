//! Persistent ADB control channels for home-automation hosts.
//!
//! One session per configured Android device keeps a channel open over USB
//! or TCP, drives the USB→WiFi handoff (`tcpip` + address discovery +
//! reconnect) with bounded retries, and publishes reachability and network
//! identity so the host can render sensors and buttons. The low-level ADB
//! wire protocol lives behind the [`transport::TransportFactory`] seam; the
//! bundled implementation talks through the host `adb` server.

pub mod bridge;
pub mod cache;
pub mod error;
pub mod logging;
pub mod models;
pub mod resolver;
mod session;
pub mod transport;

pub use bridge::BridgeHandler;
pub use error::CommandError;
pub use models::{
    ConnectionState, DeviceConfig, DeviceRecord, FailureReason, StateChange, TransportKind,
    Tunables,
};
pub use transport::{
    ServerTransportFactory, Transport, TransportError, TransportFactory, TransportTarget,
};
