use thiserror::Error;

use crate::models::ConnectionState;

/// Errors returned by the bridge facade to the host platform.
///
/// The distinctions matter to the caller: `TransferFailed` points at the
/// network leg of an install while `InstallFailed` points at the device's
/// package manager, and `AlreadyInProgress` means a WiFi-enable sequence is
/// running rather than that the request was invalid.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("no device configured with id '{0}'")]
    UnknownDevice(String),
    #[error("device is not connected")]
    NotConnected,
    #[error("command not valid while {0}")]
    InvalidState(ConnectionState),
    #[error("wifi enable sequence already in progress")]
    AlreadyInProgress,
    #[error("device session is busy")]
    Busy,
    #[error("shell command failed: {0}")]
    CommandFailed(String),
    #[error("file transfer failed: {0}")]
    TransferFailed(String),
    #[error("package install failed: {0}")]
    InstallFailed(String),
    #[error("device session closed")]
    SessionClosed,
}
