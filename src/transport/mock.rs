//! Scripted stand-in for the ADB seam, shared by session and bridge tests.

use std::{
    collections::VecDeque,
    net::{Ipv4Addr, SocketAddrV4},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use super::{Transport, TransportError, TransportFactory, TransportTarget};
use crate::models::TransportKind;

#[derive(Debug, Clone, Copy)]
pub(crate) enum OpenOutcome {
    Succeed,
    Unavailable,
    AuthRequired,
}

/// Behavior knobs plus a full call log. Tests flip the knobs mid-run to
/// simulate drops, missing addresses and unauthorized devices.
#[derive(Debug)]
pub(crate) struct MockState {
    pub usb_present: bool,
    pub serial: String,
    /// Address the fake device reports on wlan0; `None` resolves to nothing.
    pub wifi_ip: Option<Ipv4Addr>,
    pub tcpip_ok: bool,
    pub liveness_ok: bool,
    pub push_ok: bool,
    pub install_output: String,
    /// Outcomes consumed front-first by USB opens; empty means succeed.
    pub usb_open_script: VecDeque<OpenOutcome>,
    /// Outcomes consumed front-first by TCP opens; empty means succeed.
    pub tcp_open_script: VecDeque<OpenOutcome>,

    pub usb_open_calls: u32,
    pub tcp_open_calls: Vec<SocketAddrV4>,
    pub shell_calls: Vec<String>,
    pub open_handles: u32,
    pub max_open_handles: u32,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            usb_present: false,
            serial: "1WMHH000M12345".to_string(),
            wifi_ip: None,
            tcpip_ok: true,
            liveness_ok: true,
            push_ok: true,
            install_output: "Success".to_string(),
            usb_open_script: VecDeque::new(),
            tcp_open_script: VecDeque::new(),
            usb_open_calls: 0,
            tcp_open_calls: Vec::new(),
            shell_calls: Vec::new(),
            open_handles: 0,
            max_open_handles: 0,
        }
    }
}

impl MockState {
    pub fn shell_count(&self, prefix: &str) -> usize {
        self.shell_calls.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

#[derive(Debug)]
pub(crate) struct MockFactory {
    state: Arc<Mutex<MockState>>,
}

pub(crate) fn mock_factory() -> (Arc<Mutex<MockState>>, Arc<MockFactory>) {
    let state = Arc::new(Mutex::new(MockState::default()));
    let factory = Arc::new(MockFactory { state: state.clone() });
    (state, factory)
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn open(
        &self,
        target: &TransportTarget,
        _timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut state = self.state.lock().unwrap();
        let outcome = match target {
            TransportTarget::Usb { .. } => {
                state.usb_open_calls += 1;
                state.usb_open_script.pop_front().unwrap_or(OpenOutcome::Succeed)
            }
            TransportTarget::Tcp { addr } => {
                state.tcp_open_calls.push(*addr);
                state.tcp_open_script.pop_front().unwrap_or(OpenOutcome::Succeed)
            }
        };
        match outcome {
            OpenOutcome::Succeed => {
                state.open_handles += 1;
                state.max_open_handles = state.max_open_handles.max(state.open_handles);
                Ok(Box::new(MockTransport {
                    kind: target.kind(),
                    state: self.state.clone(),
                    closed: AtomicBool::new(false),
                }))
            }
            OpenOutcome::Unavailable => {
                Err(TransportError::Unavailable("scripted open failure".to_string()))
            }
            OpenOutcome::AuthRequired => Err(TransportError::AuthRequired),
        }
    }

    async fn usb_present(&self, _serial: &str) -> Result<bool, TransportError> {
        Ok(self.state.lock().unwrap().usb_present)
    }
}

#[derive(Debug)]
struct MockTransport {
    kind: TransportKind,
    state: Arc<Mutex<MockState>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn shell(&self, command: &str, _timeout: Duration) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let mut state = self.state.lock().unwrap();
        state.shell_calls.push(command.to_string());

        if command.starts_with("echo") {
            return if state.liveness_ok {
                Ok("ok\n".to_string())
            } else {
                Err(TransportError::Disconnected)
            };
        }
        if command.starts_with("tcpip") {
            return if state.tcpip_ok {
                Ok("restarting in TCP mode\n".to_string())
            } else {
                Err(TransportError::Protocol("tcpip refused".to_string()))
            };
        }
        if command.starts_with("ip addr show wlan0") {
            return Ok(state
                .wifi_ip
                .map(|ip| format!("    inet {ip}/24 brd 192.168.1.255 scope global wlan0\n"))
                .unwrap_or_default());
        }
        if command.starts_with("ip addr show") || command.starts_with("ip route") {
            return Ok(String::new());
        }
        if command.starts_with("getprop ro.serialno") {
            return Ok(format!("{}\n", state.serial));
        }
        if command.starts_with("getprop ro.product.manufacturer") {
            return Ok("Acme\n".to_string());
        }
        if command.starts_with("getprop ro.product.model") {
            return Ok("Handset 3\n".to_string());
        }
        if command.starts_with("pm install") {
            return Ok(format!("{}\n", state.install_output));
        }
        Ok(String::new())
    }

    async fn push(&self, _local: &Path, _remote: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        if self.state.lock().unwrap().push_ok {
            Ok(())
        } else {
            Err(TransportError::Protocol("scripted push failure".to_string()))
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.lock().unwrap().open_handles -= 1;
        }
    }
}
