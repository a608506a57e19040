//! Queries device-side identity: the WiFi IPv4 address used to re-target the
//! channel over TCP, the true serial, and display-name properties.

use std::{net::Ipv4Addr, time::Duration};

use lazy_regex::{Lazy, Regex, lazy_regex};
use thiserror::Error;
use tracing::{instrument, trace};

use crate::transport::{Transport, TransportError};

/// Interface names tried in order. Vendors rename the WLAN interface freely;
/// eth0 last covers set-top boxes where "WiFi" is really wired.
pub const WIFI_INTERFACE_CANDIDATES: &[&str] = &["wlan0", "wlan1", "wifi0", "eth0"];

static INET_REGEX: Lazy<Regex> = lazy_regex!(r"inet ((?:\d{1,3}\.){3}\d{1,3})/\d+");
/// Extracts the source address from `ip route` output
static ROUTE_SRC_REGEX: Lazy<Regex> = lazy_regex!(r"src ((?:\d{1,3}\.){3}\d{1,3})");

#[derive(Debug, Error)]
pub enum ResolveError {
    /// No interface currently holds a usable address (WiFi off, not yet
    /// associated). Recoverable; callers retry within their bound.
    #[error("no wifi interface has an address")]
    NotFound,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Finds the device's IPv4 address by walking the candidate interfaces, with
/// a route-table fallback for nonstandard interface names.
#[instrument(level = "debug", skip(transport), err)]
pub async fn resolve_wifi_address(
    transport: &dyn Transport,
    shell_timeout: Duration,
) -> Result<Ipv4Addr, ResolveError> {
    for iface in WIFI_INTERFACE_CANDIDATES {
        let output = transport
            .shell(&format!("ip addr show {iface} 2>/dev/null"), shell_timeout)
            .await?;
        if let Some(ip) = first_usable_ipv4(&output, &INET_REGEX) {
            trace!(iface, %ip, "resolved wifi address");
            return Ok(ip);
        }
    }

    let output = transport.shell("ip route 2>/dev/null", shell_timeout).await?;
    if let Some(ip) = first_usable_ipv4(&output, &ROUTE_SRC_REGEX) {
        trace!(%ip, "resolved wifi address from route table");
        return Ok(ip);
    }

    Err(ResolveError::NotFound)
}

/// Reads the device-reported serial (`ro.serialno`), used to verify that a
/// cached TCP endpoint still points at the configured device.
pub async fn resolve_serial(
    transport: &dyn Transport,
    shell_timeout: Duration,
) -> Result<String, TransportError> {
    Ok(transport.shell("getprop ro.serialno", shell_timeout).await?.trim().to_string())
}

/// Builds a display name from manufacturer + model, falling back to just the
/// model. Returns `None` when the device reports neither.
pub async fn query_display_name(
    transport: &dyn Transport,
    shell_timeout: Duration,
) -> Result<Option<String>, TransportError> {
    let manufacturer = transport
        .shell("getprop ro.product.manufacturer", shell_timeout)
        .await?
        .trim()
        .to_string();
    let model =
        transport.shell("getprop ro.product.model", shell_timeout).await?.trim().to_string();
    Ok(if !manufacturer.is_empty() && !model.is_empty() {
        Some(format!("{manufacturer} {model}"))
    } else if !model.is_empty() {
        Some(model)
    } else {
        None
    })
}

/// Reads the port adbd currently listens on over TCP, if any. Checks the
/// runtime property first, then the persisted one some vendors use.
pub async fn wifi_adb_port(
    transport: &dyn Transport,
    shell_timeout: Duration,
) -> Result<Option<u16>, TransportError> {
    for prop in ["service.adb.tcp.port", "persist.adb.tcp.port"] {
        let value =
            transport.shell(&format!("getprop {prop}"), shell_timeout).await?.trim().to_string();
        if !value.is_empty() && value != "0" && value != "-1" {
            return Ok(value.parse().ok());
        }
    }
    Ok(None)
}

fn first_usable_ipv4(output: &str, regex: &Regex) -> Option<Ipv4Addr> {
    regex
        .captures_iter(output)
        .filter_map(|caps| caps[1].parse::<Ipv4Addr>().ok())
        .find(|ip| !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified())
}
