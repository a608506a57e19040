use std::{
    fmt::{self, Debug, Display},
    net::SocketAddrV4,
    path::Path,
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::TransportKind;

#[cfg(test)]
pub(crate) mod mock;
pub mod server;

pub use server::ServerTransportFactory;

/// Where to open a channel: a USB-attached serial or a TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportTarget {
    Usb { serial: String },
    Tcp { addr: SocketAddrV4 },
}

impl TransportTarget {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportTarget::Usb { .. } => TransportKind::Usb,
            TransportTarget::Tcp { .. } => TransportKind::Wifi,
        }
    }
}

impl Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportTarget::Usb { serial } => write!(f, "usb:{serial}"),
            TransportTarget::Tcp { addr } => write!(f, "tcp:{addr}"),
        }
    }
}

/// Errors from the underlying ADB channel.
///
/// `AuthRequired` is kept separate from `Unavailable` so callers can tell the
/// user "check your device screen" instead of "device not found".
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device or port unreachable: {0}")]
    Unavailable(String),
    #[error("device has not authorized this host")]
    AuthRequired,
    #[error("link dropped")]
    Disconnected,
    #[error("adb error: {0}")]
    Protocol(String),
}

/// One open channel to a device. Exclusively owned by the device session;
/// replaced (old one closed) on every transport switch.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    fn kind(&self) -> TransportKind;

    /// Runs a shell command, returning captured output. Fails with
    /// [`TransportError::Disconnected`] if the link drops mid-call.
    async fn shell(&self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    /// Transfers a local file to the given device path.
    async fn push(&self, local: &Path, remote: &str) -> Result<(), TransportError>;

    /// Idempotent; safe to call after any failure.
    async fn close(&self);
}

/// Opens transports and answers cheap presence probes. The production
/// implementation talks to the host ADB server; tests script one.
#[async_trait]
pub trait TransportFactory: Send + Sync + Debug {
    /// Opens a channel to `target` within `timeout`. Surfaces
    /// [`TransportError::AuthRequired`] when the device is enumerated but has
    /// not accepted this host's key.
    async fn open(
        &self,
        target: &TransportTarget,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError>;

    /// Whether the serial is currently visible on USB, without opening it.
    async fn usb_present(&self, serial: &str) -> Result<bool, TransportError>;
}
