mod control_loop;
pub mod error;
pub mod managed_process;
pub mod process;
pub mod state_machine;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::SupervisorConfig;
use crate::plugin::{ContentManagerWrapper, Stracker};
use crate::protocol::{ForwardTarget, RelayError, UdpCallback, UdpMessage, UdpRelay};
use crate::store::Store;
use control_loop::{ControlLoop, Request};
use managed_process::LogBuffer;
use process::ChildProcesses;

pub use error::SupervisorError;
pub use state_machine::State;

/// What the server should run. The supervisor only stores it, logs its
/// description and hands it to collaborators.
pub trait RaceEvent: Send + Sync + fmt::Debug {
    fn describe(&self) -> String;
}

/// UDP plugin addressing for one session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpAddressing {
    /// `host:port` the server listens on for plugin messages
    pub plugin_address: String,
    /// Local port the relay binds for server events
    pub local_port: u16,
    /// Empty when forwarding is disabled
    pub forward_address: String,
    /// Zero when forwarding is disabled
    pub forward_listen_port: u16,
}

impl UdpAddressing {
    pub fn new(plugin_address: impl Into<String>, local_port: u16) -> Self {
        Self {
            plugin_address: plugin_address.into(),
            local_port,
            ..Self::default()
        }
    }

    pub fn with_forwarding(mut self, forward_address: impl Into<String>, forward_listen_port: u16) -> Self {
        self.forward_address = forward_address.into();
        self.forward_listen_port = forward_listen_port;
        self
    }

    pub fn forward_target(&self) -> Option<ForwardTarget> {
        ForwardTarget::from_parts(&self.forward_address, self.forward_listen_port)
    }
}

/// External services the supervisor calls into while launching and tearing down.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub content_manager_wrapper: Option<Arc<dyn ContentManagerWrapper>>,
    pub stracker: Option<Arc<dyn Stracker>>,
}

impl Collaborators {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            content_manager_wrapper: None,
            stracker: None,
        }
    }

    pub fn with_content_manager_wrapper(mut self, wrapper: Arc<dyn ContentManagerWrapper>) -> Self {
        self.content_manager_wrapper = Some(wrapper);
        self
    }

    pub fn with_stracker(mut self, stracker: Arc<dyn Stracker>) -> Self {
        self.stracker = Some(stracker);
        self
    }
}

/// State shared between the control loop and callers. Guarded by one mutex.
#[derive(Default)]
pub(crate) struct Shared {
    pub(crate) event: Option<Arc<dyn RaceEvent>>,
    /// Most recently launched event, kept after teardown for `restart`
    pub(crate) last_event: Option<Arc<dyn RaceEvent>>,
    pub(crate) addressing: UdpAddressing,
    pub(crate) relay: Option<Arc<UdpRelay>>,
    pub(crate) children: ChildProcesses,
    pub(crate) done_waiters: Vec<mpsc::Sender<()>>,
}

pub(crate) fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| {
        tracing::error!("Supervisor state lock poisoned: {}", e);
        e.into_inner()
    })
}

struct Inner {
    shared: Arc<Mutex<Shared>>,
    log_buffer: Arc<LogBuffer>,
    requests: mpsc::Sender<Request>,
    state_rx: watch::Receiver<State>,
}

/// Handle to the supervised race server. Cheap to clone; the control loop
/// stops (and stops the server) once every handle is dropped.
#[derive(Clone)]
pub struct ServerProcess {
    inner: Arc<Inner>,
}

impl ServerProcess {
    /// Create the supervisor and spawn its control loop on the current tokio runtime.
    pub fn new(config: SupervisorConfig, collaborators: Collaborators, callback: UdpCallback) -> Self {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let log_buffer = Arc::new(LogBuffer::new(config.log_buffer_size));
        let (request_tx, request_rx) = mpsc::channel::<Request>(32);
        let (state_tx, state_rx) = watch::channel(State::Idle);

        let control = ControlLoop::new(
            Arc::new(config),
            collaborators,
            shared.clone(),
            log_buffer.clone(),
            callback,
            request_rx,
            state_tx,
        );
        tokio::spawn(control.run());

        Self {
            inner: Arc::new(Inner {
                shared,
                log_buffer,
                requests: request_tx,
                state_rx,
            }),
        }
    }

    /// Launch `event`, stopping the current session first if there is one.
    ///
    /// Returns once the server, the UDP relay and every auxiliary process
    /// have been started. Auxiliary failures are only logged.
    pub async fn start(&self, event: Arc<dyn RaceEvent>, addressing: UdpAddressing) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Start { event, addressing, reply }, rx).await
    }

    /// Cancel the running session and wait for teardown.
    ///
    /// The server is force-killed once the grace period (10s by default)
    /// passes. [`SupervisorError::StopTimeout`] after the hard timeout (20s)
    /// means the stop was accepted but has not finished; teardown continues
    /// in the background. Returns immediately when nothing is running.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Stop { reply }, rx).await
    }

    /// Stop and start again with the same event and addressing. With no
    /// session running, the most recently launched event is started.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let running = self.is_running();
        let (event, addressing) = {
            let shared = lock_shared(&self.inner.shared);
            (
                shared.event.clone().or_else(|| shared.last_event.clone()),
                shared.addressing.clone(),
            )
        };
        let event = event.ok_or(SupervisorError::NothingToRestart)?;

        if running {
            self.stop().await?;
        }

        self.start(event, addressing).await
    }

    pub fn is_running(&self) -> bool {
        lock_shared(&self.inner.shared).event.is_some()
    }

    pub fn event(&self) -> Option<Arc<dyn RaceEvent>> {
        lock_shared(&self.inner.shared).event.clone()
    }

    /// Addressing of the current (or last attempted) session
    pub fn addressing(&self) -> UdpAddressing {
        lock_shared(&self.inner.shared).addressing.clone()
    }

    /// Signal `waiter` on every teardown. Delivery is best-effort: a full or
    /// closed channel is skipped.
    pub fn notify_done(&self, waiter: mpsc::Sender<()>) {
        lock_shared(&self.inner.shared).done_waiters.push(waiter);
    }

    /// Console output of the server, across sessions, as lossy UTF-8.
    pub fn logs(&self) -> String {
        self.inner.log_buffer.snapshot()
    }

    /// Console output exactly as the server wrote it (the retained tail).
    pub fn log_bytes(&self) -> Vec<u8> {
        self.inner.log_buffer.snapshot_bytes()
    }

    pub async fn send_udp_message(&self, message: &UdpMessage) -> Result<(), SupervisorError> {
        let relay = lock_shared(&self.inner.shared)
            .relay
            .clone()
            .ok_or(SupervisorError::NoOpenUdpConnection)?;

        relay.send_message(message).await.map_err(|e| match e {
            RelayError::NotOpen => SupervisorError::NoOpenUdpConnection,
            other => other.into(),
        })
    }

    /// Local address of the open UDP relay
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        lock_shared(&self.inner.shared).relay.as_ref().map(|r| r.local_addr())
    }

    /// Number of plugins and legacy commands started for the current session
    pub fn child_process_count(&self) -> usize {
        lock_shared(&self.inner.shared).children.len()
    }

    pub fn state(&self) -> State {
        *self.inner.state_rx.borrow()
    }

    /// Wait until no session is active. Useful after a
    /// [`SupervisorError::StopTimeout`], when teardown finishes in the background.
    pub async fn wait_idle(&self) -> Result<(), SupervisorError> {
        let mut rx = self.inner.state_rx.clone();
        rx.wait_for(|state| *state == State::Idle)
            .await
            .map(|_| ())
            .map_err(|_| SupervisorError::ControlLoopClosed)
    }

    async fn request(
        &self,
        request: Request,
        rx: oneshot::Receiver<Result<(), SupervisorError>>,
    ) -> Result<(), SupervisorError> {
        self.inner
            .requests
            .send(request)
            .await
            .map_err(|_| SupervisorError::ControlLoopClosed)?;
        rx.await.map_err(|_| SupervisorError::ControlLoopClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StaticStore;

    #[derive(Debug)]
    struct Practice;

    impl RaceEvent for Practice {
        fn describe(&self) -> String {
            "practice".to_string()
        }
    }

    fn supervisor() -> ServerProcess {
        let collaborators = Collaborators::new(Arc::new(StaticStore::default()));
        ServerProcess::new(
            SupervisorConfig::new(std::env::temp_dir(), "/nonexistent/acServer"),
            collaborators,
            Arc::new(|_: UdpMessage| {}),
        )
    }

    #[test]
    fn test_udp_addressing_forwarding() {
        let plain = UdpAddressing::new("127.0.0.1:9000", 9001);
        assert!(plain.forward_target().is_none());

        let forwarded = plain.clone().with_forwarding("127.0.0.1:9100", 9101);
        let target = forwarded.forward_target().unwrap();
        assert_eq!(target.address, "127.0.0.1:9100");
        assert_eq!(target.listen_port, 9101);
    }

    #[tokio::test]
    async fn test_new_supervisor_is_idle() {
        let sp = supervisor();
        assert!(!sp.is_running());
        assert!(sp.event().is_none());
        assert_eq!(sp.state(), State::Idle);
        assert!(sp.logs().is_empty());
        assert!(sp.udp_local_addr().is_none());
    }

    #[tokio::test]
    async fn test_send_without_relay() {
        let sp = supervisor();
        let err = sp.send_udp_message(&UdpMessage::new(vec![1u8])).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoOpenUdpConnection));
    }

    #[tokio::test]
    async fn test_restart_without_history() {
        let sp = supervisor();
        assert!(matches!(sp.restart().await, Err(SupervisorError::NothingToRestart)));
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_immediate() {
        let sp = supervisor();
        tokio::time::timeout(std::time::Duration::from_millis(500), sp.stop())
            .await
            .expect("stop on idle supervisor should not wait")
            .unwrap();
        sp.wait_idle().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_launch_leaves_supervisor_idle() {
        let sp = supervisor();
        let port = crate::protocol::free_udp_port().unwrap();
        let err = sp
            .start(Arc::new(Practice), UdpAddressing::new(format!("127.0.0.1:{}", port), 0))
            .await
            .unwrap_err();
        // 실행 파일이 없으므로 spawn 단계에서 실패
        assert!(matches!(err, SupervisorError::Process(_)));
        assert!(!sp.is_running());
        assert_eq!(sp.state(), State::Idle);
        assert!(sp.udp_local_addr().is_none());
    }
}
