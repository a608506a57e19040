use std::fmt::{self, Display};

use serde::Serialize;

/// Which physical channel carries the ADB session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportKind {
    Usb,
    Wifi,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "usb"),
            TransportKind::Wifi => write!(f, "wifi"),
        }
    }
}

/// Terminal failure causes. A device stays in `Failed` until a manual reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// The on-screen authorization prompt was not accepted in time.
    AuthTimeout,
    /// The device never re-enumerated over USB after the adbd restart.
    WifiEnableLostDevice,
    /// No WiFi interface produced an IPv4 address within the retry bound.
    NoWifiAddress,
    /// The TCP endpoint stayed unreachable for every connect attempt.
    TcpReconnectFailed,
}

impl Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AuthTimeout => write!(f, "auth timeout"),
            FailureReason::WifiEnableLostDevice => write!(f, "wifi enable lost device"),
            FailureReason::NoWifiAddress => write!(f, "no wifi address"),
            FailureReason::TcpReconnectFailed => write!(f, "tcp reconnect failed"),
        }
    }
}

/// Connection lifecycle of a single device.
///
/// Transitions are owned by the device session task; everything else only
/// observes snapshots through the record watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    ConnectingUsb,
    /// The device is enumerated but has not accepted this host's key yet.
    AuthPending,
    Connected(TransportKind),
    EnablingWifi,
    ResolvingAddress,
    ReconnectingWifi,
    Failed(FailureReason),
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    /// True while the USB→WiFi handoff sequence is running.
    pub fn wifi_switch_in_progress(&self) -> bool {
        matches!(
            self,
            ConnectionState::EnablingWifi
                | ConnectionState::ResolvingAddress
                | ConnectionState::ReconnectingWifi
        )
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::ConnectingUsb => write!(f, "connecting (usb)"),
            ConnectionState::AuthPending => write!(f, "authorization pending"),
            ConnectionState::Connected(kind) => write!(f, "connected ({kind})"),
            ConnectionState::EnablingWifi => write!(f, "enabling wifi adb"),
            ConnectionState::ResolvingAddress => write!(f, "resolving wifi address"),
            ConnectionState::ReconnectingWifi => write!(f, "reconnecting (wifi)"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_display_strings() {
        assert_eq!(FailureReason::AuthTimeout.to_string(), "auth timeout");
        assert_eq!(FailureReason::WifiEnableLostDevice.to_string(), "wifi enable lost device");
        assert_eq!(FailureReason::NoWifiAddress.to_string(), "no wifi address");
        assert_eq!(FailureReason::TcpReconnectFailed.to_string(), "tcp reconnect failed");
    }

    #[test]
    fn state_predicates() {
        assert!(ConnectionState::Connected(TransportKind::Usb).is_connected());
        assert!(ConnectionState::Connected(TransportKind::Wifi).is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::EnablingWifi.wifi_switch_in_progress());
        assert!(ConnectionState::ResolvingAddress.wifi_switch_in_progress());
        assert!(ConnectionState::ReconnectingWifi.wifi_switch_in_progress());
        assert!(!ConnectionState::Connected(TransportKind::Usb).wifi_switch_in_progress());
    }

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
