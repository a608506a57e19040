use std::{
    error::Error,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use forensic_adb::{Device, DeviceState, Host, UnixPath};
use tokio::{fs::File, io::BufReader, process::Command, sync::Mutex, time::timeout};
use tracing::{debug, info, instrument, trace, warn};

use super::{Transport, TransportError, TransportFactory, TransportTarget};
use crate::models::TransportKind;

const SERVER_CHECK_TIMEOUT: Duration = Duration::from_millis(1000);
const SERVER_START_TIMEOUT: Duration = Duration::from_millis(10000);

/// Transport factory backed by the host `adb` server via forensic-adb.
///
/// Opening a USB target resolves it against the server's device list so that
/// an unauthorized device is reported as [`TransportError::AuthRequired`]
/// rather than as absent. TCP targets are registered with `adb connect`
/// first, then resolved the same way.
#[derive(Debug)]
pub struct ServerTransportFactory {
    adb_host: Host,
    /// Explicit `adb` binary path; falls back to `$PATH` lookup.
    adb_path: Option<PathBuf>,
    /// Serializes server checks/starts.
    server_mutex: Mutex<()>,
}

impl ServerTransportFactory {
    pub fn new(adb_path: Option<PathBuf>) -> Arc<Self> {
        let adb_host = if cfg!(target_os = "windows") {
            // Connecting on a Windows host fails without an explicit loopback address
            Host { host: Some("127.0.0.1".to_string()), port: Some(5037) }
        } else {
            Host::default()
        };
        Arc::new(Self { adb_host, adb_path, server_mutex: Mutex::new(()) })
    }

    /// Ensures the ADB server is running, starting it if necessary
    #[instrument(skip(self), err)]
    async fn ensure_server_running(&self) -> Result<()> {
        let _guard = self.server_mutex.lock().await;
        if self.is_server_running().await {
            return Ok(());
        }

        let adb_path_buf = resolve_adb_binary(self.adb_path.as_deref())?;
        info!(path = %adb_path_buf.display(), "ADB server not running, starting it");

        let output = timeout(SERVER_START_TIMEOUT, {
            let mut command = Command::new(&adb_path_buf);
            command.arg("start-server");
            #[cfg(target_os = "windows")]
            // CREATE_NO_WINDOW
            command.creation_flags(0x08000000);
            command.output()
        })
        .await
        .map_err(|_| anyhow!("Timed out while starting ADB server"))?
        .context("Failed to start ADB server")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to start ADB server: {}", stderr);
        }
        info!("ADB server started successfully");
        Ok(())
    }

    async fn is_server_running(&self) -> bool {
        match timeout(SERVER_CHECK_TIMEOUT, self.adb_host.check_host_running()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = &e as &dyn Error, "Failed to check ADB server status");
                false
            }
            Err(_) => {
                debug!("Timed out while checking ADB server status (likely not running)");
                false
            }
        }
    }

    /// Looks up `serial` in the server's device list and opens it, mapping
    /// the enumeration state onto the transport error taxonomy.
    async fn open_listed(
        &self,
        serial: &str,
        kind: TransportKind,
        open_timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let devices = self
            .adb_host
            .devices::<Vec<_>>()
            .await
            .map_err(|e| TransportError::Unavailable(format!("device listing failed: {e}")))?;

        let listed = devices
            .into_iter()
            .find(|d| d.serial == serial)
            .ok_or_else(|| TransportError::Unavailable(format!("{serial} not enumerated")))?;

        match listed.state {
            DeviceState::Device => {}
            DeviceState::Unauthorized => return Err(TransportError::AuthRequired),
            other => {
                return Err(TransportError::Unavailable(format!(
                    "{serial} is in state {other:?}"
                )));
            }
        }

        let device = timeout(
            open_timeout,
            Device::new(self.adb_host.clone(), listed.serial.clone(), listed.info.clone()),
        )
        .await
        .map_err(|_| TransportError::Unavailable(format!("opening {serial} timed out")))?
        .map_err(|e| TransportError::Unavailable(format!("opening {serial} failed: {e}")))?;

        trace!(%serial, ?kind, "transport opened");
        Ok(Box::new(ServerTransport {
            device,
            serial: serial.to_string(),
            kind,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl TransportFactory for ServerTransportFactory {
    #[instrument(skip(self), fields(target = %target), err)]
    async fn open(
        &self,
        target: &TransportTarget,
        open_timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.ensure_server_running()
            .await
            .map_err(|e| TransportError::Unavailable(format!("{e:#}")))?;

        match target {
            TransportTarget::Usb { serial } => {
                self.open_listed(serial, TransportKind::Usb, open_timeout).await
            }
            TransportTarget::Tcp { addr } => {
                let serial = addr.to_string();
                timeout(open_timeout, self.adb_host.connect_device(&serial))
                    .await
                    .map_err(|_| {
                        TransportError::Unavailable(format!("adb connect to {serial} timed out"))
                    })?
                    .map_err(|e| {
                        TransportError::Unavailable(format!("adb connect to {serial} failed: {e}"))
                    })?;
                self.open_listed(&serial, TransportKind::Wifi, open_timeout).await
            }
        }
    }

    async fn usb_present(&self, serial: &str) -> Result<bool, TransportError> {
        self.ensure_server_running()
            .await
            .map_err(|e| TransportError::Unavailable(format!("{e:#}")))?;
        let devices = self
            .adb_host
            .devices::<Vec<_>>()
            .await
            .map_err(|e| TransportError::Unavailable(format!("device listing failed: {e}")))?;
        // Unauthorized still counts as present; open() reports it distinctly.
        Ok(devices
            .iter()
            .any(|d| d.serial == serial && d.state != DeviceState::Offline))
    }
}

/// An open channel through the host ADB server.
#[derive(derive_more::Debug)]
struct ServerTransport {
    #[debug(skip)]
    device: Device,
    serial: String,
    kind: TransportKind,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for ServerTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    #[instrument(level = "debug", skip(self), fields(serial = %self.serial), err)]
    async fn shell(&self, command: &str, shell_timeout: Duration) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        match timeout(shell_timeout, self.device.execute_host_shell_command(command)).await {
            Ok(Ok(output)) => {
                trace!(output = ?output, "shell command executed");
                Ok(output)
            }
            Ok(Err(e)) => {
                // Errors at this layer are link problems; device-side command
                // failures come back through the captured output.
                debug!(error = %e, "shell command transport error");
                Err(TransportError::Disconnected)
            }
            Err(_) => {
                warn!(command, "shell command timed out");
                Err(TransportError::Disconnected)
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(serial = %self.serial), err)]
    async fn push(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let file = File::open(local)
            .await
            .map_err(|e| TransportError::Protocol(format!("cannot read {}: {e}", local.display())))?;
        let mut reader = BufReader::new(file);
        self.device
            .push(&mut reader, UnixPath::new(remote), 0o777)
            .await
            .map_err(|e| TransportError::Protocol(format!("push to {remote} failed: {e}")))
    }

    async fn close(&self) {
        // forensic-adb opens a server connection per command, so there is no
        // socket of ours to tear down; marking the handle closed is what
        // keeps later calls from resurrecting it.
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(serial = %self.serial, kind = %self.kind, "transport closed");
        }
    }
}

/// Resolves the `adb` binary, preferring an explicit override.
fn resolve_adb_binary(override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        anyhow::ensure!(path.is_file(), "ADB binary not found at {}", path.display());
        return Ok(path.to_path_buf());
    }
    which::which("adb").context("ADB binary not found in PATH")
}
