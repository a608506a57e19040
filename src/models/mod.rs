use std::{net::Ipv4Addr, time::Duration};

use serde::{Deserialize, Serialize};

mod events;
mod state;

pub use events::StateChange;
pub use state::{ConnectionState, FailureReason, TransportKind};

pub const DEFAULT_ADB_PORT: u16 = 5555;

/// Static configuration for one managed device, supplied by the host platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable identifier the host uses to address this device.
    pub id: String,
    /// Display name. When omitted it is filled from the device's
    /// manufacturer/model properties after the first connect.
    #[serde(default)]
    pub name: Option<String>,
    /// USB serial as reported by `adb devices` / `ro.serialno`.
    pub serial: String,
    /// Port the device listens on after switching to TCP mode.
    #[serde(default = "default_adb_port")]
    pub adb_port: u16,
    #[serde(default)]
    pub tunables: Tunables,
}

fn default_adb_port() -> u16 {
    DEFAULT_ADB_PORT
}

/// Retry bounds, timeouts and intervals for the connection state machine.
///
/// The defaults are deliberate (and pinned by tests); none of them are fixed
/// by the ADB protocol, so embedders may tune them per device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Cadence of the liveness/presence poller.
    pub poll_interval: Duration,
    /// Bound on any single transport open, USB or TCP.
    pub open_timeout: Duration,
    /// Bound on ordinary shell commands.
    pub shell_timeout: Duration,
    /// Bound on the liveness probe; shorter than `shell_timeout` so a wedged
    /// link is detected within one poll tick.
    pub liveness_timeout: Duration,
    /// Bound on `pm install`, which legitimately runs for minutes.
    pub install_timeout: Duration,
    /// Total time the on-screen authorization prompt may stay unanswered.
    pub auth_timeout: Duration,
    /// Cadence of re-attempted opens while waiting for authorization.
    pub auth_poll_interval: Duration,
    /// Settle time after `tcpip` before the first USB reopen attempt; the
    /// adbd restart always drops the link.
    pub tcpip_grace: Duration,
    /// USB reopen attempts after the adbd restart.
    pub usb_reopen_attempts: u32,
    /// Initial backoff for USB reopens; doubles per attempt, 1s→16s.
    pub usb_reopen_backoff: Duration,
    /// WiFi address resolution attempts.
    pub resolve_attempts: u32,
    /// Fixed delay between resolution attempts.
    pub resolve_interval: Duration,
    /// TCP connect attempts during the handoff.
    pub tcp_connect_attempts: u32,
    /// Initial backoff for TCP connects; doubles per attempt, 1s→16s.
    pub tcp_connect_backoff: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            open_timeout: Duration::from_secs(10),
            shell_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(5),
            install_timeout: Duration::from_secs(120),
            auth_timeout: Duration::from_secs(30),
            auth_poll_interval: Duration::from_secs(2),
            tcpip_grace: Duration::from_secs(3),
            usb_reopen_attempts: 5,
            usb_reopen_backoff: Duration::from_secs(1),
            resolve_attempts: 10,
            resolve_interval: Duration::from_secs(2),
            tcp_connect_attempts: 5,
            tcp_connect_backoff: Duration::from_secs(1),
        }
    }
}

impl Tunables {
    /// Delay before retrying USB reopen attempt `attempt` (1-based).
    pub fn usb_reopen_delay(&self, attempt: u32) -> Duration {
        exponential_delay(self.usb_reopen_backoff, attempt)
    }

    /// Delay before retrying TCP connect attempt `attempt` (1-based).
    pub fn tcp_connect_delay(&self, attempt: u32) -> Duration {
        exponential_delay(self.tcp_connect_backoff, attempt)
    }
}

// Doubling ladder capped at 16x the initial delay.
fn exponential_delay(initial: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(4);
    initial.saturating_mul(1 << shift)
}

/// Live view of one managed device. Mutated only by its session task and
/// published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub serial: String,
    /// Present after the first successful address resolution.
    pub wifi_ip: Option<Ipv4Addr>,
    pub adb_port: u16,
    pub state: ConnectionState,
    pub last_error: Option<String>,
}

impl DeviceRecord {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.serial.clone()),
            serial: config.serial.clone(),
            wifi_ip: None,
            adb_port: config.adb_port,
            state: ConnectionState::default(),
            last_error: None,
        }
    }
}
