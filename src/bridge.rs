//! The external face of the crate: device lifecycle, manual commands and
//! the state-change subscription the host platform renders as sensors.

use std::{collections::HashMap, path::PathBuf, sync::Arc, sync::atomic::Ordering};

use anyhow::{Context, Result, ensure};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot, watch};
use tracing::{info, instrument};

use crate::{
    cache::CacheStore,
    error::CommandError,
    models::{ConnectionState, DeviceConfig, DeviceRecord, StateChange, TransportKind},
    session::{DeviceSession, SessionCommand, SessionHandle},
    transport::TransportFactory,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Manages one independent connection session per configured device.
///
/// Commands on different devices run fully in parallel; within one device
/// everything is serialized by its session task. `run_shell` and
/// `install_package` queue in order; a duplicate `enable_wifi_adb` while the
/// handoff is running is rejected with [`CommandError::AlreadyInProgress`].
#[derive(derive_more::Debug)]
pub struct BridgeHandler {
    #[debug(skip)]
    factory: Arc<dyn TransportFactory>,
    #[debug(skip)]
    cache: Arc<CacheStore>,
    #[debug(skip)]
    events: broadcast::Sender<StateChange>,
    #[debug(skip)]
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl BridgeHandler {
    pub async fn new(factory: Arc<dyn TransportFactory>, cache_path: PathBuf) -> Arc<Self> {
        let cache = Arc::new(CacheStore::load(cache_path).await);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self { factory, cache, events, sessions: RwLock::new(HashMap::new()) })
    }

    /// Starts managing a device. Its session begins polling immediately.
    #[instrument(skip(self, config), fields(id = %config.id), err)]
    pub async fn add_device(&self, config: DeviceConfig) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        ensure!(
            !sessions.contains_key(&config.id),
            "Device '{}' is already configured",
            config.id
        );
        let id = config.id.clone();
        let handle = DeviceSession::spawn(
            config,
            self.factory.clone(),
            self.cache.clone(),
            self.events.clone(),
        );
        sessions.insert(id.clone(), handle);
        info!(%id, "device added");
        Ok(())
    }

    /// Stops managing a device: cancels its session (which closes any open
    /// transport and abandons pending retries) and drops its cached endpoint.
    #[instrument(skip(self), err)]
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(device_id)
            .with_context(|| format!("No device configured with id '{device_id}'"))?;
        handle.cancel.cancel();
        self.cache.forget(device_id).await?;
        info!(device_id, "device removed");
        Ok(())
    }

    /// Watch channel with the device's live record; the current value is
    /// available immediately.
    pub async fn record(&self, device_id: &str) -> Result<watch::Receiver<DeviceRecord>, CommandError> {
        Ok(self.handle(device_id).await?.record)
    }

    /// Stream of state transitions across all devices.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Kicks off the USB→WiFi handoff. Returns as soon as the sequence is
    /// accepted; progress is observable through records and events.
    pub async fn enable_wifi_adb(&self, device_id: &str) -> Result<(), CommandError> {
        let handle = self.handle(device_id).await?;
        let state = handle.record.borrow().state;
        if state.wifi_switch_in_progress() {
            return Err(CommandError::AlreadyInProgress);
        }
        if state != ConnectionState::Connected(TransportKind::Usb) {
            return Err(CommandError::InvalidState(state));
        }
        // Claim the in-flight slot before enqueueing so two racing calls can
        // never start two sequences.
        if handle
            .enable_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CommandError::AlreadyInProgress);
        }
        if let Err(e) = handle.commands.try_send(SessionCommand::EnableWifi) {
            handle.enable_in_flight.store(false, Ordering::SeqCst);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => CommandError::Busy,
                mpsc::error::TrySendError::Closed(_) => CommandError::SessionClosed,
            });
        }
        Ok(())
    }

    /// Tears the connection down and restarts the connect sequence. Valid
    /// from any state, including `Failed`.
    pub async fn force_reconnect(&self, device_id: &str) -> Result<(), CommandError> {
        let handle = self.handle(device_id).await?;
        handle.commands.try_send(SessionCommand::ForceReconnect).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CommandError::Busy,
            mpsc::error::TrySendError::Closed(_) => CommandError::SessionClosed,
        })
    }

    /// Runs a shell command on a connected device, returning its output.
    /// Requests queue FIFO behind whatever the session is doing.
    pub async fn run_shell(&self, device_id: &str, command: &str) -> Result<String, CommandError> {
        let handle = self.handle(device_id).await?;
        if !handle.record.borrow().state.is_connected() {
            return Err(CommandError::NotConnected);
        }
        let (respond, response) = oneshot::channel();
        handle
            .commands
            .send(SessionCommand::RunShell { command: command.to_string(), respond })
            .await
            .map_err(|_| CommandError::SessionClosed)?;
        response.await.map_err(|_| CommandError::SessionClosed)?
    }

    /// Pushes an APK and installs it via the device's package manager.
    pub async fn install_package(
        &self,
        device_id: &str,
        path: PathBuf,
    ) -> Result<(), CommandError> {
        let handle = self.handle(device_id).await?;
        if !handle.record.borrow().state.is_connected() {
            return Err(CommandError::NotConnected);
        }
        let (respond, response) = oneshot::channel();
        handle
            .commands
            .send(SessionCommand::InstallPackage { path, respond })
            .await
            .map_err(|_| CommandError::SessionClosed)?;
        response.await.map_err(|_| CommandError::SessionClosed)?
    }

    async fn handle(&self, device_id: &str) -> Result<SessionHandle, CommandError> {
        self.sessions
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| CommandError::UnknownDevice(device_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddrV4},
        sync::Mutex as StdMutex,
        time::Duration,
    };

    use tempfile::TempDir;
    use tokio::time::sleep;

    use super::*;
    use crate::{
        models::Tunables,
        transport::mock::{MockState, mock_factory},
    };

    const SERIAL: &str = "1WMHH000M12345";
    const WIFI_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

    struct Harness {
        state: Arc<StdMutex<MockState>>,
        bridge: Arc<BridgeHandler>,
        _dir: TempDir,
    }

    async fn harness(setup: impl FnOnce(&mut MockState)) -> Harness {
        let (state, factory) = mock_factory();
        setup(&mut state.lock().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let bridge = BridgeHandler::new(factory, dir.path().join("endpoints.json")).await;
        Harness { state, bridge, _dir: dir }
    }

    fn device_config(id: &str) -> DeviceConfig {
        DeviceConfig {
            id: id.to_string(),
            name: None,
            serial: SERIAL.to_string(),
            adb_port: 5555,
            tunables: Tunables::default(),
        }
    }

    async fn wait_for_state(harness: &Harness, id: &str, target: ConnectionState) -> DeviceRecord {
        let mut record = harness.bridge.record(id).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(600),
            record.wait_for(|record| record.state == target),
        )
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .unwrap()
        .clone()
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_device_id_rejected() {
        let harness = harness(|_| {}).await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        let err = harness.bridge.add_device(device_config("dev1")).await.unwrap_err();
        assert!(err.to_string().contains("already configured"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_is_rejected() {
        let harness = harness(|_| {}).await;
        assert!(matches!(
            harness.bridge.run_shell("ghost", "echo hi").await,
            Err(CommandError::UnknownDevice(id)) if id == "ghost"
        ));
        assert!(matches!(
            harness.bridge.enable_wifi_adb("ghost").await,
            Err(CommandError::UnknownDevice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_usb_then_wifi_handoff() {
        let harness = harness(|state| {
            state.usb_present = true;
            state.wifi_ip = Some(WIFI_IP);
        })
        .await;
        let mut events = harness.bridge.subscribe();

        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;

        harness.bridge.enable_wifi_adb("dev1").await.unwrap();
        let record =
            wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Wifi))
                .await;
        assert_eq!(record.wifi_ip, Some(WIFI_IP));
        assert_eq!(record.adb_port, 5555);

        // The subscription saw the whole ordered handoff
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.device_id, "dev1");
            seen.push(event.new_state);
        }
        let handoff: Vec<_> =
            seen.iter().skip_while(|s| **s != ConnectionState::EnablingWifi).collect();
        assert_eq!(handoff, vec![
            &ConnectionState::EnablingWifi,
            &ConnectionState::ResolvingAddress,
            &ConnectionState::ReconnectingWifi,
            &ConnectionState::Connected(TransportKind::Wifi),
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn enable_wifi_twice_runs_one_sequence() {
        let harness = harness(|state| {
            state.usb_present = true;
            state.wifi_ip = Some(WIFI_IP);
        })
        .await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;
        harness.state.lock().unwrap().shell_calls.clear();

        // Second call races the first before the session even starts it
        harness.bridge.enable_wifi_adb("dev1").await.unwrap();
        assert!(matches!(
            harness.bridge.enable_wifi_adb("dev1").await,
            Err(CommandError::AlreadyInProgress)
        ));

        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Wifi)).await;
        assert_eq!(harness.state.lock().unwrap().shell_count("tcpip"), 1);

        // Once connected over wifi the command is invalid, not in-progress
        assert!(matches!(
            harness.bridge.enable_wifi_adb("dev1").await,
            Err(CommandError::InvalidState(ConnectionState::Connected(TransportKind::Wifi)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn enable_wifi_requires_usb_connection() {
        let harness = harness(|_| {}).await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        assert!(matches!(
            harness.bridge.enable_wifi_adb("dev1").await,
            Err(CommandError::InvalidState(ConnectionState::Disconnected))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_shell_while_disconnected_opens_nothing() {
        let harness = harness(|_| {}).await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();

        assert!(matches!(
            harness.bridge.run_shell("dev1", "echo hi").await,
            Err(CommandError::NotConnected)
        ));

        let state = harness.state.lock().unwrap();
        assert_eq!(state.usb_open_calls, 0);
        assert_eq!(state.max_open_handles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_shell_returns_device_output() {
        let harness = harness(|state| state.usb_present = true).await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;

        let output = harness.bridge.run_shell("dev1", "getprop ro.serialno").await.unwrap();
        assert_eq!(output.trim(), SERIAL);
    }

    #[tokio::test(start_paused = true)]
    async fn install_package_distinguishes_failure_classes() {
        let harness = harness(|state| state.usb_present = true).await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;
        let apk = PathBuf::from("/tmp/launcher.apk");

        // Happy path: push, pm install, temp cleanup
        harness.bridge.install_package("dev1", apk.clone()).await.unwrap();
        {
            let state = harness.state.lock().unwrap();
            assert_eq!(state.shell_count("pm install -r /data/local/tmp/launcher.apk"), 1);
            assert_eq!(state.shell_count("rm -f /data/local/tmp/launcher.apk"), 1);
        }

        // Network leg fails
        harness.state.lock().unwrap().push_ok = false;
        assert!(matches!(
            harness.bridge.install_package("dev1", apk.clone()).await,
            Err(CommandError::TransferFailed(_))
        ));

        // Package manager rejects
        {
            let mut state = harness.state.lock().unwrap();
            state.push_ok = true;
            state.install_output = "Failure [INSTALL_FAILED_OLDER_SDK]".to_string();
        }
        assert!(matches!(
            harness.bridge.install_package("dev1", apk).await,
            Err(CommandError::InstallFailed(message)) if message.contains("INSTALL_FAILED_OLDER_SDK")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn install_while_disconnected_is_rejected() {
        let harness = harness(|_| {}).await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        assert!(matches!(
            harness.bridge.install_package("dev1", PathBuf::from("/tmp/a.apk")).await,
            Err(CommandError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn force_reconnect_resets_failed_device() {
        let harness = harness(|state| state.usb_present = true).await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;

        // No wifi address available: the handoff must dead-end
        harness.bridge.enable_wifi_adb("dev1").await.unwrap();
        wait_for_state(
            &harness,
            "dev1",
            ConnectionState::Failed(crate::models::FailureReason::NoWifiAddress),
        )
        .await;

        harness.bridge.force_reconnect("dev1").await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn remove_device_closes_transport_and_forgets_cache() {
        let harness = harness(|state| {
            state.usb_present = true;
            state.wifi_ip = Some(WIFI_IP);
        })
        .await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;
        harness.bridge.enable_wifi_adb("dev1").await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Wifi)).await;

        harness.bridge.remove_device("dev1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                if harness.state.lock().unwrap().open_handles == 0 {
                    return;
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("transport not released on remove");

        assert!(matches!(
            harness.bridge.run_shell("dev1", "echo hi").await,
            Err(CommandError::UnknownDevice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn devices_are_independent() {
        let harness = harness(|state| state.usb_present = true).await;
        harness.bridge.add_device(device_config("dev1")).await.unwrap();
        harness.bridge.add_device(device_config("dev2")).await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;
        wait_for_state(&harness, "dev2", ConnectionState::Connected(TransportKind::Usb)).await;

        // Tearing one down leaves the other connected
        harness.bridge.remove_device("dev2").await.unwrap();
        let output = harness.bridge.run_shell("dev1", "getprop ro.serialno").await.unwrap();
        assert_eq!(output.trim(), SERIAL);
    }

    #[tokio::test(start_paused = true)]
    async fn wifi_handoff_hits_configured_endpoint() {
        let harness = harness(|state| {
            state.usb_present = true;
            state.wifi_ip = Some(WIFI_IP);
        })
        .await;
        let mut config = device_config("dev1");
        config.adb_port = 5556;
        harness.bridge.add_device(config).await.unwrap();
        wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Usb)).await;

        harness.bridge.enable_wifi_adb("dev1").await.unwrap();
        let record =
            wait_for_state(&harness, "dev1", ConnectionState::Connected(TransportKind::Wifi))
                .await;
        assert_eq!(record.adb_port, 5556);
        let state = harness.state.lock().unwrap();
        assert_eq!(state.shell_count("tcpip 5556"), 1);
        assert_eq!(*state.tcp_open_calls.last().unwrap(), SocketAddrV4::new(WIFI_IP, 5556));
    }
}
