//! Control loop: the only task that changes supervisor state.
//!
//! Start/stop requests and server exit events all arrive here and are
//! handled one at a time, so a new launch never overlaps the teardown of the
//! previous session and teardown runs at most once per session.

use std::path::Path;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::managed_process::{LaunchSpec, LogBuffer, ManagedProcess};
use super::process::force_kill_pid;
use super::state_machine::{State, StateMachine};
use super::{lock_shared, Collaborators, RaceEvent, Shared, SupervisorError, UdpAddressing};
use crate::config::SupervisorConfig;
use crate::plugin::prepare_stracker;
use crate::protocol::{UdpCallback, UdpRelay};
use crate::store::ServerOptions;

pub(crate) enum Request {
    Start {
        event: Arc<dyn RaceEvent>,
        addressing: UdpAddressing,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
}

/// Server process exit, tagged with the session it belongs to
struct ExitEvent {
    generation: u64,
    result: std::io::Result<ExitStatus>,
}

/// The running session as seen by the loop
struct Session {
    generation: u64,
    cancel: CancellationToken,
    pid: u32,
}

pub(crate) struct ControlLoop {
    config: Arc<SupervisorConfig>,
    collaborators: Collaborators,
    shared: Arc<Mutex<Shared>>,
    log_buffer: Arc<LogBuffer>,
    callback: UdpCallback,
    requests: mpsc::Receiver<Request>,
    exit_tx: mpsc::UnboundedSender<ExitEvent>,
    exit_rx: mpsc::UnboundedReceiver<ExitEvent>,
    state_tx: watch::Sender<State>,
    machine: StateMachine,
    session: Option<Session>,
    next_generation: u64,
}

impl ControlLoop {
    pub(crate) fn new(
        config: Arc<SupervisorConfig>,
        collaborators: Collaborators,
        shared: Arc<Mutex<Shared>>,
        log_buffer: Arc<LogBuffer>,
        callback: UdpCallback,
        requests: mpsc::Receiver<Request>,
        state_tx: watch::Sender<State>,
    ) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            config,
            collaborators,
            shared,
            log_buffer,
            callback,
            requests,
            exit_tx,
            exit_rx,
            state_tx,
            machine: StateMachine::new(),
            session: None,
            next_generation: 1,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(exit) = self.exit_rx.recv() => self.on_exit(exit),
                request = self.requests.recv() => match request {
                    Some(Request::Start { event, addressing, reply }) => {
                        let result = self.handle_start(event, addressing).await;
                        let _ = reply.send(result);
                    }
                    Some(Request::Stop { reply }) => {
                        let result = self.stop_session().await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
            }
        }

        // 모든 핸들이 drop됨. 실행 중인 서버 정리
        if self.session.is_some() {
            tracing::info!("Supervisor dropped, stopping server process");
            if let Err(e) = self.stop_session().await {
                tracing::warn!("Server process did not stop cleanly: {}", e);
            }
        }
        tracing::debug!("Supervisor control loop finished");
    }

    async fn handle_start(&mut self, event: Arc<dyn RaceEvent>, addressing: UdpAddressing) -> Result<(), SupervisorError> {
        if self.session.is_some() {
            self.stop_session().await?;
        }

        self.set_state(State::Launching);
        match self.launch(event, addressing).await {
            Ok(()) => {
                self.set_state(State::Active);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Could not start server process: {}", e);
                self.set_state(State::Idle);
                Err(e)
            }
        }
    }

    async fn launch(&mut self, event: Arc<dyn RaceEvent>, addressing: UdpAddressing) -> Result<(), SupervisorError> {
        tracing::info!("Starting server process with event: {}", event.describe());

        let spec = LaunchSpec {
            executable: self.config.resolve_executable(),
            args: self.config.executable_args.clone(),
            working_dir: self.config.server_install_path.clone(),
            env: self.config.environment.clone(),
        };
        let wd = std::env::current_dir()?;
        let server_options = self
            .collaborators
            .store
            .load_server_options()
            .map_err(SupervisorError::Store)?;

        lock_shared(&self.shared).addressing = addressing.clone();

        let relay = Arc::new(
            UdpRelay::open(
                &addressing.plugin_address,
                addressing.local_port,
                addressing.forward_target(),
                self.callback.clone(),
            )
            .await?,
        );

        let generation = self.next_generation;
        self.next_generation += 1;
        let cancel = CancellationToken::new();
        let exit_tx = self.exit_tx.clone();

        let process = match ManagedProcess::spawn(&spec, self.log_buffer.clone(), cancel.clone(), move |result| {
            let _ = exit_tx.send(ExitEvent { generation, result });
        }) {
            Ok(process) => process,
            Err(e) => {
                let _ = relay.close();
                return Err(e.into());
            }
        };

        {
            let mut shared = lock_shared(&self.shared);
            shared.event = Some(event.clone());
            shared.last_event = Some(event.clone());
            shared.relay = Some(relay);
        }
        self.session = Some(Session {
            generation,
            cancel,
            pid: process.pid,
        });

        // 이하 보조 프로세스는 best-effort. 실패해도 Start는 성공
        self.start_content_manager_wrapper(&server_options, &event);
        self.start_stracker(&server_options, &wd);
        self.start_plugins(&wd);

        Ok(())
    }

    /// Cancel the session and wait for its exit, escalating to a forced kill
    /// after the grace period and giving up at the hard timeout.
    async fn stop_session(&mut self) -> Result<(), SupervisorError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let generation = session.generation;
        let pid = session.pid;
        session.cancel.cancel();

        if self.machine.state == State::Active {
            self.set_state(State::Stopping);
        }

        let grace_period = self.config.stop_grace();
        let grace = tokio::time::sleep(grace_period);
        let hard = tokio::time::sleep(self.config.stop_timeout());
        tokio::pin!(grace, hard);
        let mut killed = false;

        loop {
            // 이미 도착한 exit 이벤트가 kill보다 우선 (회수된 PID를 죽이지 않도록)
            tokio::select! {
                biased;

                Some(exit) = self.exit_rx.recv() => {
                    let finished = exit.generation == generation;
                    self.on_exit(exit);
                    if finished {
                        return Ok(());
                    }
                }
                _ = &mut grace, if !killed => {
                    killed = true;
                    tracing::debug!(
                        "Server process did not naturally stop after {:?}. Attempting manual kill.",
                        grace_period
                    );
                    if pid != 0 {
                        if let Err(e) = force_kill_pid(pid) {
                            tracing::error!("Could not forcibly kill server process: {}", e);
                        }
                    }
                }
                _ = &mut hard => {
                    let err = SupervisorError::StopTimeout;
                    tracing::error!("{}", err);
                    return Err(err);
                }
            }
        }
    }

    fn on_exit(&mut self, exit: ExitEvent) {
        match &exit.result {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!(
                "Server process ended with {}. If everything seems fine, you can safely ignore this error.",
                status
            ),
            Err(e) => tracing::warn!(
                "Server process ended with error: {}. If everything seems fine, you can safely ignore this error.",
                e
            ),
        }

        match &self.session {
            Some(session) if session.generation == exit.generation => self.teardown(),
            _ => tracing::debug!("Ignoring exit of stale server process (session {})", exit.generation),
        }
    }

    /// Clear the session, close the relay, kill auxiliary processes and
    /// signal done-waiters.
    fn teardown(&mut self) {
        self.set_state(State::TearingDown);
        tracing::debug!("Server stopped. Stopping UDP listener and child processes.");

        let relay = {
            let mut shared = lock_shared(&self.shared);
            shared.event = None;
            shared.relay.take()
        };
        if let Some(relay) = relay {
            if let Err(e) = relay.close() {
                tracing::error!("Could not close UDP relay: {}", e);
            }
        }

        // collaborator code runs without the shared lock
        if let Some(wrapper) = &self.collaborators.content_manager_wrapper {
            wrapper.stop();
        }

        {
            let mut shared = lock_shared(&self.shared);
            shared.children.kill_all();

            shared.done_waiters.retain(|waiter| !waiter.is_closed());
            for waiter in &shared.done_waiters {
                let _ = waiter.try_send(());
            }
        }

        self.session = None;
        self.set_state(State::Idle);
        tracing::info!("Server process stopped");
    }

    fn start_content_manager_wrapper(&self, options: &ServerOptions, event: &Arc<dyn RaceEvent>) {
        let Some(wrapper) = self.collaborators.content_manager_wrapper.clone() else {
            return;
        };
        if !options.enable_content_manager_wrapper || options.content_manager_wrapper_port == 0 {
            return;
        }

        let port = options.content_manager_wrapper_port;
        let event = event.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = wrapper.start(port, event) {
                tracing::error!("Could not start Content Manager wrapper server: {}", e);
            }
        });
    }

    fn start_stracker(&self, server_options: &ServerOptions, wd: &Path) {
        let Some(stracker) = &self.collaborators.stracker else {
            return;
        };
        let options = match self.collaborators.store.load_stracker_options() {
            Ok(options) => options,
            Err(e) => {
                tracing::debug!("sTracker options unavailable: {}", e);
                return;
            }
        };
        if !options.enable_stracker || !stracker.is_installed() {
            return;
        }

        let listening_port = options.listening_port;
        let plugin = match prepare_stracker(stracker.as_ref(), server_options, options) {
            Ok(plugin) => plugin,
            Err(e) => {
                tracing::error!("{}. Please check your server configuration", e);
                return;
            }
        };

        match lock_shared(&self.shared).children.start_plugin(&plugin, wd) {
            Ok(_) => tracing::info!(
                "Started sTracker. Listening for pTracker connections on port {}",
                listening_port
            ),
            Err(e) => tracing::error!("Could not start sTracker: {}", e),
        }
    }

    fn start_plugins(&self, wd: &Path) {
        let mut shared = lock_shared(&self.shared);

        for plugin in &self.config.plugins {
            if let Err(e) = shared.children.start_plugin(plugin, wd) {
                tracing::error!("Could not run extra command: {}: {}", plugin, e);
            }
        }

        if !self.config.run_on_start.is_empty() {
            tracing::warn!("Use of run_on_start is deprecated. Please use 'plugins' instead");

            for command in &self.config.run_on_start {
                if let Err(e) = shared.children.start_legacy_command(command, wd) {
                    tracing::error!("Could not run extra command: {}: {}", command, e);
                }
            }
        }
    }

    fn set_state(&mut self, to: State) {
        if let Err(e) = self.machine.transition(to) {
            tracing::error!("{}", e);
            self.machine.state = to;
        }
        self.state_tx.send_replace(to);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::UdpMessage;
    use crate::store::StaticStore;
    use std::os::unix::process::ExitStatusExt;

    fn control_loop(config: SupervisorConfig) -> ControlLoop {
        let (_request_tx, request_rx) = mpsc::channel(1);
        let (state_tx, _state_rx) = watch::channel(State::Idle);
        ControlLoop::new(
            Arc::new(config),
            Collaborators::new(Arc::new(StaticStore::default())),
            Arc::new(Mutex::new(Shared::default())),
            Arc::new(LogBuffer::new(1024)),
            Arc::new(|_: UdpMessage| {}),
            request_rx,
            state_tx,
        )
    }

    /// Active session `generation` whose exit event is already queued
    fn arm_exited_session(control: &mut ControlLoop, generation: u64, pid: u32) {
        control.session = Some(Session {
            generation,
            cancel: CancellationToken::new(),
            pid,
        });
        control.machine.state = State::Active;
        control
            .exit_tx
            .send(ExitEvent {
                generation,
                result: Ok(ExitStatus::from_raw(0)),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_queued_exit_wins_over_elapsed_grace() {
        let mut config = SupervisorConfig::new(std::env::temp_dir(), "/bin/sh");
        config.stop_grace_ms = 0;
        config.stop_timeout_ms = 5_000;
        let mut control = control_loop(config);

        // PID가 재사용된 상황: 세션 PID가 무관한 살아있는 프로세스를 가리킴
        let mut bystander = tokio::process::Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = bystander.id().unwrap();

        for generation in 1..=20 {
            arm_exited_session(&mut control, generation, pid);
            control.stop_session().await.unwrap();
            assert!(control.session.is_none());
            assert_eq!(control.machine.state, State::Idle);
            assert!(bystander.try_wait().unwrap().is_none(), "pid of an exited session was killed");
        }

        bystander.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_exit_is_ignored() {
        let mut control = control_loop(SupervisorConfig::default());
        control.session = Some(Session {
            generation: 2,
            cancel: CancellationToken::new(),
            pid: 0,
        });
        control.machine.state = State::Active;

        control.on_exit(ExitEvent {
            generation: 1,
            result: Ok(ExitStatus::from_raw(0)),
        });
        assert!(control.session.is_some());
        assert_eq!(control.machine.state, State::Active);

        control.on_exit(ExitEvent {
            generation: 2,
            result: Ok(ExitStatus::from_raw(0)),
        });
        assert!(control.session.is_none());
        assert_eq!(control.machine.state, State::Idle);
    }
}
