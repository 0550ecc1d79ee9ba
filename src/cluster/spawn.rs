//! Worker subprocess spawning.
//!
//! Each worker is this same executable re-invoked as `worker --worker-id N`,
//! with stdin and stdout piped for IPC and stderr inherited for logs.

use super::ipc::{Channel, spawn_reader, spawn_writer};
use super::signals::{TerminationReason, analyze_exit_status};
use super::supervisor::{ClusterEvent, SpawnedWorker, WorkerSpawner};
use crate::error::{ClusterError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long to wait for a dead worker's remaining output.
const READER_GRACE: Duration = Duration::from_secs(1);

/// Spawns workers as child processes of the current executable.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    exe: PathBuf,
    args: Vec<OsString>,
}

impl ProcessSpawner {
    /// Spawn `exe` with `args` followed by `worker --worker-id N`.
    pub fn new(exe: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            exe: exe.into(),
            args,
        }
    }

    /// Spawn the running executable. `args` are global flags passed before
    /// the `worker` subcommand (verbosity, log format).
    pub fn current_exe(args: Vec<OsString>) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| ClusterError::Spawn(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(exe, args))
    }

    fn command(&self, id: usize) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.args(&self.args);
        cmd.arg("worker");
        cmd.arg("--worker-id");
        cmd.arg(id.to_string());

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &mut self,
        id: usize,
        events: &mpsc::UnboundedSender<ClusterEvent>,
    ) -> Result<SpawnedWorker> {
        let mut child = self
            .command(id)
            .spawn()
            .map_err(|e| ClusterError::Spawn(format!("worker {}: {}", id, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| ClusterError::Spawn(format!("worker {} exited during spawn", id)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClusterError::Spawn("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterError::Spawn("Failed to capture stdout".into()))?;

        let (channel, outbound) = Channel::pair(format!("worker {} (pid {})", id, pid));
        spawn_writer(stdin, outbound);

        let forward = events.clone();
        let reader = spawn_reader(stdout, move |message| {
            forward.send(ClusterEvent::Message { pid, message }).is_ok()
        });

        let events = events.clone();
        tokio::spawn(async move {
            let reason = match child.wait().await {
                Ok(status) => analyze_exit_status(status),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait on worker");
                    TerminationReason::Unknown
                }
            };
            // Deliver whatever the worker wrote before it died ahead of its exit.
            match tokio::time::timeout(READER_GRACE, reader).await {
                Ok(Ok(Err(e))) => {
                    let _ = events.send(ClusterEvent::TransportError {
                        pid: Some(pid),
                        error: e.to_string(),
                    });
                }
                Ok(_) => {}
                Err(_) => debug!(pid, "Worker output still open after exit"),
            }
            let _ = events.send(ClusterEvent::Exited { pid, reason });
        });

        Ok(SpawnedWorker { pid, channel })
    }

    fn kill(&mut self, pid: u32) -> Result<()> {
        let raw = i32::try_from(pid).map_err(|_| ClusterError::Spawn(format!("invalid pid {}", pid)))?;
        match kill(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(ClusterError::Io(std::io::Error::from(e))),
        }
    }
}
