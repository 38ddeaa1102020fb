//! Managed Process - the race server itself
//!
//! - Combined stdout/stderr capture into a bounded [`LogBuffer`]
//! - Cancellation wired to a graceful termination request
//! - Exit status handed to a caller-supplied callback from a background waiter

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command as TokioCommand;
use tokio_util::sync::CancellationToken;

use super::process::{request_termination, ProcessError};
use crate::utils::apply_creation_flags;

// ─── Log Buffer ──────────────────────────────────────────────

/// Byte buffer holding the server's console output.
///
/// Once the content grows past `max_size`, the next write first drops the
/// oldest bytes down to `max_size` and then appends in full. A single large
/// write is never cut, so the buffer can exceed `max_size` until the
/// following write.
pub struct LogBuffer {
    buf: Mutex<Vec<u8>>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Mutex::new(Vec::new()),
            max_size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Append `data`, evicting from the front first if over capacity.
    /// Returns the number of bytes written, always `data.len()`.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut buf = self.lock();
        if buf.len() > self.max_size {
            let excess = buf.len() - self.max_size;
            buf.drain(..excess);
        }
        buf.extend_from_slice(data);
        data.len()
    }

    /// Current contents as text. Invalid UTF-8 (e.g. a character cut by
    /// eviction) is replaced, so this is not always a byte suffix of the
    /// output. Use [`LogBuffer::snapshot_bytes`] for the exact bytes.
    pub fn snapshot(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Current contents, byte for byte.
    pub fn snapshot_bytes(&self) -> Vec<u8> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::io::Write for &LogBuffer {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        Ok(LogBuffer::write(*self, data))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ─── Managed Process ─────────────────────────────────────────

/// How to launch the server
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>, working_dir: impl AsRef<Path>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: working_dir.as_ref().to_path_buf(),
            env: BTreeMap::new(),
        }
    }
}

/// A running server process. The child itself is owned by the waiter task.
#[derive(Debug)]
pub struct ManagedProcess {
    pub pid: u32,
}

impl ManagedProcess {
    /// Spawn the server with both output streams feeding `log_buffer`.
    ///
    /// Cancelling `cancel` sends a termination request; `on_exit` receives the
    /// final wait result exactly once. The child is killed if the waiter task
    /// is dropped (runtime shutdown).
    pub fn spawn<F>(
        spec: &LaunchSpec,
        log_buffer: Arc<LogBuffer>,
        cancel: CancellationToken,
        on_exit: F,
    ) -> Result<Self, ProcessError>
    where
        F: FnOnce(std::io::Result<ExitStatus>) + Send + 'static,
    {
        let mut cmd = TokioCommand::new(&spec.executable);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Windows: hide console window
        apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.executable.display().to_string(),
            source,
        })?;

        let pid = child.id().unwrap_or(0);

        // ── stdout / stderr → log buffer ─────────────────────
        if let Some(stdout) = child.stdout.take() {
            pump_output(stdout, log_buffer.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_output(stderr, log_buffer);
        }

        // ── process waiter ───────────────────────────────────
        tokio::spawn(async move {
            let result = tokio::select! {
                status = child.wait() => status,
                _ = cancel.cancelled() => {
                    tracing::debug!("Server process {} cancelled, requesting termination", pid);
                    request_termination(&mut child);
                    child.wait().await
                }
            };
            on_exit(result);
        });

        tracing::info!("Server process started with PID {}", pid);
        Ok(Self { pid })
    }
}

fn pump_output<R>(mut pipe: R, sink: Arc<LogBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    sink.write(&chunk[..n]);
                }
            }
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────
