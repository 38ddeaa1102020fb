use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use crate::plugin::{parse_legacy_command, CommandPlugin};
use crate::utils::{absolutize, apply_creation_flags};

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("could not resolve executable '{path}': {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to terminate process {pid}: {reason}")]
    TerminationFailed { pid: u32, reason: String },
}

/// Force-kill a process by PID. Cross-platform helper.
pub fn force_kill_pid(pid: u32) -> Result<(), ProcessError> {
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        let output = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output()
            .map_err(|e| ProcessError::TerminationFailed {
                pid,
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ProcessError::TerminationFailed {
                pid,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
    }
    #[cfg(not(target_os = "windows"))]
    {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)?;
    }
    Ok(())
}

/// Ask a child to shut down. SIGTERM on Unix; Windows has no graceful
/// equivalent for console-less servers, so the child is killed.
pub fn request_termination(child: &mut Child) {
    #[cfg(not(target_os = "windows"))]
    {
        if let Some(pid) = child.id() {
            if let Err(e) = send_signal(pid, nix::sys::signal::Signal::SIGTERM) {
                tracing::warn!("{}", e);
            }
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Err(e) = child.start_kill() {
            tracing::warn!("Failed to terminate server process: {}", e);
        }
    }
}

#[cfg(not(target_os = "windows"))]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), ProcessError> {
    use nix::unistd::Pid;

    nix::sys::signal::kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
        ProcessError::TerminationFailed {
            pid,
            reason: format!("failed to send {}: {}", signal.as_str(), e),
        }
    })
}

/// An auxiliary process started for the current session
struct TrackedChild {
    name: String,
    pid: u32,
    child: Child,
}

/// Plugins and legacy commands belonging to the running session.
/// Emptied as a whole on every teardown.
#[derive(Default)]
pub struct ChildProcesses {
    children: Vec<TrackedChild>,
}

impl ChildProcesses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Start `plugin` in its own directory and track it.
    ///
    /// Output goes to the shared plugin log (`plugin_output` target), not to
    /// the server console buffer.
    pub fn start_plugin(&mut self, plugin: &CommandPlugin, fallback_dir: &Path) -> Result<u32, ProcessError> {
        let executable = absolutize(&plugin.executable).map_err(|source| ProcessError::Resolve {
            path: plugin.executable.clone(),
            source,
        })?;

        let working_dir = match executable.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => {
                tracing::warn!(
                    "Could not determine plugin directory. Setting working dir to: {}",
                    fallback_dir.display()
                );
                fallback_dir.to_path_buf()
            }
        };

        let mut cmd = Command::new(&executable);
        cmd.args(&plugin.arguments)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: executable.display().to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);
        let name = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.display().to_string());

        if let Some(stdout) = child.stdout.take() {
            forward_plugin_output(name.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_plugin_output(name.clone(), stderr);
        }

        tracing::info!("Started plugin '{}' (pid {})", plugin, pid);
        self.children.push(TrackedChild { name, pid, child });
        Ok(pid)
    }

    /// Deprecated `run_on_start` form. See [`parse_legacy_command`] for the
    /// splitting rules. An empty command is skipped.
    pub fn start_legacy_command(&mut self, command: &str, fallback_dir: &Path) -> Result<Option<u32>, ProcessError> {
        match parse_legacy_command(command) {
            Some(plugin) => self.start_plugin(&plugin, fallback_dir).map(Some),
            None => Ok(None),
        }
    }

    /// Force-kill every tracked process and forget them all. A failed kill is
    /// logged and does not stop the others.
    pub fn kill_all(&mut self) {
        for mut tracked in self.children.drain(..) {
            if let Err(e) = tracked.child.start_kill() {
                tracing::error!("Can't kill process '{}' (pid {}): {}", tracked.name, tracked.pid, e);
                continue;
            }
            // 이미 종료된 경우 즉시 회수, 아니면 tokio가 백그라운드에서 회수
            let _ = tracked.child.try_wait();
        }
    }
}

fn forward_plugin_output<R>(name: String, pipe: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "plugin_output", "[{}] {}", name, line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn is_alive(pid: u32) -> bool {
        // signal 0: existence check only
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
    }

    async fn wait_until_dead(pid: u32) -> bool {
        for _ in 0..50 {
            if !is_alive(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_and_kill_plugins() {
        let mut children = ChildProcesses::new();
        let cwd = std::env::current_dir().unwrap();

        let pid = children
            .start_plugin(&CommandPlugin::new("/bin/sleep", vec!["30".into()]), &cwd)
            .unwrap();
        let legacy = children.start_legacy_command("/bin/sleep 30", &cwd).unwrap();

        assert_eq!(children.len(), 2);
        assert!(legacy.is_some());
        assert!(pid > 0);

        children.kill_all();
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_not_tracked() {
        let mut children = ChildProcesses::new();
        let cwd = std::env::current_dir().unwrap();

        let err = children
            .start_plugin(&CommandPlugin::new("/nonexistent/plugin", vec![]), &cwd)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn test_empty_legacy_command_is_skipped() {
        let mut children = ChildProcesses::new();
        let cwd = std::env::current_dir().unwrap();
        assert!(children.start_legacy_command("", &cwd).unwrap().is_none());
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn test_force_kill_pid() {
        let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();

        force_kill_pid(pid).unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        assert!(wait_until_dead(pid).await);
    }

    #[tokio::test]
    async fn test_request_termination() {
        let mut child = Command::new("/bin/sleep").arg("30").spawn().unwrap();
        request_termination(&mut child);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
