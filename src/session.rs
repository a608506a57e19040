//! Per-device connection session.
//!
//! Each configured device gets one actor task that exclusively owns its
//! transport handle and connection state. Commands arrive over an mpsc
//! channel and are executed in order; the liveness/presence poller is an
//! interval inside the same loop, so every transition and every piece of
//! transport I/O for a device is serialized. Devices never share state, so
//! a wedged link on one never stalls another.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use time::OffsetDateTime;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

use crate::{
    cache::{CacheStore, CachedEndpoint},
    error::CommandError,
    models::{
        ConnectionState, DeviceConfig, DeviceRecord, FailureReason, StateChange, TransportKind,
    },
    resolver::{self, ResolveError},
    transport::{Transport, TransportError, TransportFactory, TransportTarget},
};

pub(crate) const LIVENESS_COMMAND: &str = "echo ok";
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Commands accepted by a session actor. Shell and install requests carry a
/// responder; the rest are observed through the record/event channels.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    EnableWifi,
    ForceReconnect,
    RunShell { command: String, respond: oneshot::Sender<Result<String, CommandError>> },
    InstallPackage { path: PathBuf, respond: oneshot::Sender<Result<(), CommandError>> },
}

/// Cheaply cloneable handle the bridge keeps per device.
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub(crate) commands: mpsc::Sender<SessionCommand>,
    pub(crate) record: watch::Receiver<DeviceRecord>,
    /// Set by the facade before enqueueing an enable command, cleared by the
    /// actor when the sequence ends; guarantees exactly one sequence even
    /// when two calls race ahead of the actor.
    pub(crate) enable_in_flight: Arc<AtomicBool>,
    pub(crate) cancel: CancellationToken,
}

#[derive(derive_more::Debug)]
pub(crate) struct DeviceSession {
    config: DeviceConfig,
    #[debug(skip)]
    factory: Arc<dyn TransportFactory>,
    #[debug(skip)]
    cache: Arc<CacheStore>,
    #[debug(skip)]
    transport: Option<Box<dyn Transport>>,
    #[debug(skip)]
    record_tx: watch::Sender<DeviceRecord>,
    #[debug(skip)]
    events: broadcast::Sender<StateChange>,
    #[debug(skip)]
    enable_in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl DeviceSession {
    pub(crate) fn spawn(
        config: DeviceConfig,
        factory: Arc<dyn TransportFactory>,
        cache: Arc<CacheStore>,
        events: broadcast::Sender<StateChange>,
    ) -> SessionHandle {
        let (record_tx, record_rx) = watch::channel(DeviceRecord::new(&config));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        let enable_in_flight = Arc::new(AtomicBool::new(false));

        let span = info_span!("device_session", id = %config.id);
        let session = DeviceSession {
            config,
            factory,
            cache,
            transport: None,
            record_tx,
            events,
            enable_in_flight: enable_in_flight.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(session.run(command_rx).instrument(span));

        SessionHandle { commands: command_tx, record: record_rx, enable_in_flight, cancel }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut poll = interval(self.config.tunables.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();
        info!(serial = %self.config.serial, "device session started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => self.poll_tick().await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        // Teardown always releases the handle, even mid-retry.
        self.close_transport_now().await;
        self.enable_in_flight.store(false, Ordering::SeqCst);
        debug!("device session stopped");
    }

    fn state(&self) -> ConnectionState {
        self.record_tx.borrow().state
    }

    async fn poll_tick(&mut self) {
        match self.state() {
            ConnectionState::Connected(_) => self.check_liveness().await,
            ConnectionState::Disconnected => self.try_connect().await,
            // Failed is terminal until a manual reconnect; transitional
            // states only exist inside a running sequence, never at tick
            // time.
            _ => {}
        }
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::EnableWifi => {
                self.run_enable_sequence().await;
                self.enable_in_flight.store(false, Ordering::SeqCst);
            }
            SessionCommand::ForceReconnect => {
                info!("manual reconnect requested");
                self.close_transport_now().await;
                self.enable_in_flight.store(false, Ordering::SeqCst);
                self.set_state(ConnectionState::Disconnected, None);
                self.try_connect().await;
            }
            SessionCommand::RunShell { command, respond } => {
                let _ = respond.send(self.execute_shell(&command).await);
            }
            SessionCommand::InstallPackage { path, respond } => {
                let _ = respond.send(self.install_package(&path).await);
            }
        }
    }

    /// Disconnected tick: USB first, then the cached WiFi endpoint if the
    /// host remembered one from a previous run.
    async fn try_connect(&mut self) {
        match self.factory.usb_present(&self.config.serial).await {
            Ok(true) => {
                self.connect_usb().await;
                return;
            }
            Ok(false) => trace!("usb device not present"),
            Err(e) => debug!(error = %e, "usb presence probe failed"),
        }

        if let Some(endpoint) = self.cache.get(&self.config.id).await {
            self.try_cached_endpoint(endpoint).await;
        }
    }

    /// Opens the USB transport, waiting out the on-device authorization
    /// prompt up to the configured bound. ADB never signals when the user
    /// answers the prompt, so this is a timeout-bounded re-open loop.
    #[instrument(skip(self))]
    async fn connect_usb(&mut self) {
        let target = TransportTarget::Usb { serial: self.config.serial.clone() };
        self.set_state(ConnectionState::ConnectingUsb, None);
        let auth_deadline = Instant::now() + self.config.tunables.auth_timeout;

        loop {
            match self.factory.open(&target, self.config.tunables.open_timeout).await {
                Ok(transport) => {
                    self.adopt_transport(transport);
                    self.refresh_identity().await;
                    self.set_state(ConnectionState::Connected(TransportKind::Usb), None);
                    info!("device connected over usb");
                    return;
                }
                Err(TransportError::AuthRequired) => {
                    if self.state() != ConnectionState::AuthPending {
                        info!("device is waiting for authorization, check the device screen");
                        self.set_state(ConnectionState::AuthPending, None);
                    }
                    if Instant::now() >= auth_deadline {
                        self.set_state(
                            ConnectionState::Failed(FailureReason::AuthTimeout),
                            Some("authorization prompt was not accepted in time".to_string()),
                        );
                        return;
                    }
                    if !self.sleep_cancellable(self.config.tunables.auth_poll_interval).await {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "usb open failed");
                    self.set_state(
                        ConnectionState::Disconnected,
                        Some(format!("usb open failed: {e}")),
                    );
                    return;
                }
            }
        }
    }

    /// One bounded attempt against the remembered endpoint. The cache is a
    /// hint: the open must succeed *and* the device must report the
    /// configured serial before the connection is trusted.
    #[instrument(skip(self), fields(ip = %endpoint.ip, port = endpoint.port))]
    async fn try_cached_endpoint(&mut self, endpoint: CachedEndpoint) {
        let tunables = self.config.tunables.clone();
        let addr = SocketAddrV4::new(endpoint.ip, endpoint.port);
        debug!("trying cached wifi endpoint");
        self.set_state(ConnectionState::ReconnectingWifi, None);

        let transport = match self.factory.open(&TransportTarget::Tcp { addr }, tunables.open_timeout).await
        {
            Ok(transport) => transport,
            Err(e) => {
                trace!(error = %e, "cached endpoint unreachable");
                self.set_state(ConnectionState::Disconnected, None);
                return;
            }
        };

        match resolver::resolve_serial(transport.as_ref(), tunables.shell_timeout).await {
            Ok(serial) if serial == self.config.serial => {
                self.adopt_transport(transport);
                self.set_connected_wifi(endpoint.ip, endpoint.port).await;
                info!("reconnected over cached wifi endpoint");
            }
            Ok(other) => {
                warn!(reported = %other, "cached endpoint now serves a different device, forgetting it");
                transport.close().await;
                if let Err(e) = self.cache.forget(&self.config.id).await {
                    warn!(error = e.as_ref() as &dyn std::error::Error, "failed to drop stale endpoint");
                }
                self.set_state(
                    ConnectionState::Disconnected,
                    Some("cached endpoint pointed at a different device".to_string()),
                );
            }
            Err(e) => {
                transport.close().await;
                self.set_state(
                    ConnectionState::Disconnected,
                    Some(format!("cached endpoint not verifiable: {e}")),
                );
            }
        }
    }

    /// The USB→WiFi handoff. `tcpip` restarts adbd, which *always* drops the
    /// USB link; that drop is expected and must not be mistaken for the
    /// device going away, hence the grace period and the bounded reopen
    /// ladder before anything is declared lost.
    #[instrument(skip(self))]
    async fn run_enable_sequence(&mut self) {
        if self.state() != ConnectionState::Connected(TransportKind::Usb) {
            debug!(state = %self.state(), "enable wifi ignored, device no longer on usb");
            return;
        }
        let tunables = self.config.tunables.clone();
        let port = self.config.adb_port;

        self.set_state(ConnectionState::EnablingWifi, None);
        info!(port, "switching adbd to tcp mode");
        let tcpip_result = match self.transport.as_deref() {
            Some(transport) => transport.shell(&format!("tcpip {port}"), tunables.shell_timeout).await,
            None => {
                self.set_state(ConnectionState::Disconnected, Some("transport missing".to_string()));
                return;
            }
        };
        if let Err(e) = tcpip_result {
            warn!(error = %e, "tcpip command failed");
            self.set_state(
                ConnectionState::Connected(TransportKind::Usb),
                Some(format!("tcpip command failed: {e}")),
            );
            return;
        }

        // adbd is restarting; the old handle is dead by contract.
        self.close_transport_now().await;
        if !self.sleep_cancellable(tunables.tcpip_grace).await {
            return;
        }

        let target = TransportTarget::Usb { serial: self.config.serial.clone() };
        let mut reopened = None;
        for attempt in 1..=tunables.usb_reopen_attempts {
            match self.factory.open(&target, tunables.open_timeout).await {
                Ok(transport) => {
                    reopened = Some(transport);
                    break;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "usb reopen failed after tcpip");
                    if attempt < tunables.usb_reopen_attempts
                        && !self.sleep_cancellable(tunables.usb_reopen_delay(attempt)).await
                    {
                        return;
                    }
                }
            }
        }
        let Some(transport) = reopened else {
            self.set_state(
                ConnectionState::Failed(FailureReason::WifiEnableLostDevice),
                Some("device did not re-enumerate after tcpip".to_string()),
            );
            return;
        };
        self.adopt_transport(transport);

        self.set_state(ConnectionState::ResolvingAddress, None);
        let mut address = None;
        for attempt in 1..=tunables.resolve_attempts {
            let result = match self.transport.as_deref() {
                Some(transport) => {
                    resolver::resolve_wifi_address(transport, tunables.shell_timeout).await
                }
                None => break,
            };
            match result {
                Ok(ip) => {
                    address = Some(ip);
                    break;
                }
                Err(ResolveError::NotFound) => trace!(attempt, "no wifi address yet"),
                Err(ResolveError::Transport(e)) => {
                    debug!(attempt, error = %e, "resolver transport error")
                }
            }
            if attempt < tunables.resolve_attempts
                && !self.sleep_cancellable(tunables.resolve_interval).await
            {
                return;
            }
        }
        let Some(ip) = address else {
            self.close_transport_now().await;
            self.set_state(
                ConnectionState::Failed(FailureReason::NoWifiAddress),
                Some("no wifi interface produced a usable address".to_string()),
            );
            return;
        };

        // Hand off: release USB, reach the device over the network.
        self.close_transport_now().await;
        self.set_state(ConnectionState::ReconnectingWifi, None);
        let addr = SocketAddrV4::new(ip, port);
        for attempt in 1..=tunables.tcp_connect_attempts {
            match self.factory.open(&TransportTarget::Tcp { addr }, tunables.open_timeout).await {
                Ok(transport) => {
                    self.adopt_transport(transport);
                    self.set_connected_wifi(ip, port).await;
                    info!(%addr, "wifi handoff complete");
                    return;
                }
                Err(e) => {
                    debug!(attempt, error = %e, "tcp connect failed");
                    if attempt < tunables.tcp_connect_attempts
                        && !self.sleep_cancellable(tunables.tcp_connect_delay(attempt)).await
                    {
                        return;
                    }
                }
            }
        }
        self.set_state(
            ConnectionState::Failed(FailureReason::TcpReconnectFailed),
            Some(format!("could not reach {addr}")),
        );
    }

    async fn check_liveness(&mut self) {
        let result = match self.transport.as_deref() {
            Some(transport) => {
                transport.shell(LIVENESS_COMMAND, self.config.tunables.liveness_timeout).await
            }
            None => Err(TransportError::Disconnected),
        };
        match result {
            Ok(_) => {
                trace!("liveness ok");
                self.refresh_port_hint().await;
            }
            Err(e) => {
                warn!(error = %e, "liveness check failed, dropping link");
                self.close_transport_now().await;
                self.set_state(ConnectionState::Disconnected, Some(format!("link lost: {e}")));
            }
        }
    }

    async fn execute_shell(&mut self, command: &str) -> Result<String, CommandError> {
        if !self.state().is_connected() {
            return Err(CommandError::NotConnected);
        }
        let result = match self.transport.as_deref() {
            Some(transport) => transport.shell(command, self.config.tunables.shell_timeout).await,
            None => return Err(CommandError::NotConnected),
        };
        match result {
            Ok(output) => Ok(output),
            Err(TransportError::Disconnected) => {
                self.close_transport_now().await;
                self.set_state(
                    ConnectionState::Disconnected,
                    Some("link lost during shell command".to_string()),
                );
                Err(CommandError::CommandFailed("link dropped".to_string()))
            }
            Err(e) => Err(CommandError::CommandFailed(e.to_string())),
        }
    }

    /// Push + `pm install -r` + cleanup. Transfer and package-manager
    /// failures stay distinct so the caller can tell network problems from
    /// rejected packages.
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn install_package(&mut self, path: &Path) -> Result<(), CommandError> {
        if !self.state().is_connected() {
            return Err(CommandError::NotConnected);
        }
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("bridge-install.apk");
        let remote = format!("/data/local/tmp/{file_name}");

        let push_result = match self.transport.as_deref() {
            Some(transport) => transport.push(path, &remote).await,
            None => return Err(CommandError::NotConnected),
        };
        if let Err(e) = push_result {
            if matches!(e, TransportError::Disconnected) {
                self.close_transport_now().await;
                self.set_state(
                    ConnectionState::Disconnected,
                    Some("link lost during file transfer".to_string()),
                );
            }
            return Err(CommandError::TransferFailed(e.to_string()));
        }

        let install_result = match self.transport.as_deref() {
            Some(transport) => {
                transport
                    .shell(&format!("pm install -r {remote}"), self.config.tunables.install_timeout)
                    .await
            }
            None => return Err(CommandError::NotConnected),
        };
        let output = match install_result {
            Ok(output) => output,
            Err(e) => {
                if matches!(e, TransportError::Disconnected) {
                    self.close_transport_now().await;
                    self.set_state(
                        ConnectionState::Disconnected,
                        Some("link lost during install".to_string()),
                    );
                }
                return Err(CommandError::TransferFailed(format!("install interrupted: {e}")));
            }
        };

        if let Some(transport) = self.transport.as_deref() {
            let _ = transport
                .shell(&format!("rm -f {remote}"), self.config.tunables.shell_timeout)
                .await;
        }

        if output.contains("Success") {
            info!(%remote, "package installed");
            Ok(())
        } else {
            Err(CommandError::InstallFailed(output.trim().to_string()))
        }
    }

    /// Replaces the current transport, closing the old one first; a device
    /// never holds two open handles.
    fn adopt_transport(&mut self, transport: Box<dyn Transport>) {
        debug_assert!(self.transport.is_none(), "transport replaced without close");
        self.transport = Some(transport);
    }

    async fn close_transport_now(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }

    /// Fills in display name and informational network identity after a USB
    /// connect. Best-effort; the connection stands either way.
    async fn refresh_identity(&mut self) {
        let shell_timeout = self.config.tunables.shell_timeout;
        let Some(transport) = self.transport.as_deref() else { return };

        if self.config.name.is_none()
            && let Ok(Some(name)) = resolver::query_display_name(transport, shell_timeout).await
        {
            self.record_tx.send_if_modified(|record| {
                if record.name != name {
                    record.name = name.clone();
                    true
                } else {
                    false
                }
            });
        }

        if let Ok(ip) = resolver::resolve_wifi_address(transport, shell_timeout).await {
            self.record_tx.send_if_modified(|record| {
                if record.wifi_ip != Some(ip) {
                    record.wifi_ip = Some(ip);
                    true
                } else {
                    false
                }
            });
        }

        self.refresh_port_hint_inner(shell_timeout).await;
    }

    async fn refresh_port_hint(&mut self) {
        self.refresh_port_hint_inner(self.config.tunables.shell_timeout).await;
    }

    // Some vendors move the TCP port; mirror what adbd actually listens on.
    async fn refresh_port_hint_inner(&mut self, shell_timeout: Duration) {
        let Some(transport) = self.transport.as_deref() else { return };
        if let Ok(Some(port)) = resolver::wifi_adb_port(transport, shell_timeout).await {
            self.record_tx.send_if_modified(|record| {
                if record.adb_port != port {
                    record.adb_port = port;
                    true
                } else {
                    false
                }
            });
        }
    }

    fn set_state(&self, new_state: ConnectionState, detail: Option<String>) {
        let mut old_state = None;
        self.record_tx.send_if_modified(|record| {
            if record.state == new_state {
                if record.last_error != detail {
                    record.last_error = detail.clone();
                    return true;
                }
                return false;
            }
            old_state = Some(record.state);
            record.state = new_state;
            record.last_error = detail.clone();
            true
        });
        if let Some(old_state) = old_state {
            debug!(%old_state, %new_state, detail = ?detail, "state changed");
            self.publish_event(old_state, new_state, detail);
        }
    }

    /// Single-update transition into `Connected(Wifi)` so the record never
    /// shows that state without its address.
    async fn set_connected_wifi(&self, ip: Ipv4Addr, port: u16) {
        let new_state = ConnectionState::Connected(TransportKind::Wifi);
        let mut old_state = None;
        self.record_tx.send_if_modified(|record| {
            old_state = Some(record.state);
            record.wifi_ip = Some(ip);
            record.adb_port = port;
            record.state = new_state;
            record.last_error = None;
            true
        });
        if let Some(old_state) = old_state
            && old_state != new_state
        {
            debug!(%old_state, %new_state, "state changed");
            self.publish_event(old_state, new_state, None);
        }
        if let Err(e) = self.cache.record(&self.config.id, CachedEndpoint { ip, port }).await {
            warn!(error = e.as_ref() as &dyn std::error::Error, "failed to persist wifi endpoint");
        }
    }

    fn publish_event(
        &self,
        old_state: ConnectionState,
        new_state: ConnectionState,
        detail: Option<String>,
    ) {
        let _ = self.events.send(StateChange {
            device_id: self.config.id.clone(),
            old_state,
            new_state,
            at: OffsetDateTime::now_utc(),
            detail,
        });
    }

    /// Returns false when the session was cancelled mid-wait.
    async fn sleep_cancellable(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(duration) => true,
        }
    }
}
