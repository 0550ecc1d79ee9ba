//! Primary-side worker lifecycle: fork, track, replace.
//!
//! All state here is mutated from the primary's event loop only.

use super::ipc::Channel;
use super::protocol::Message;
use super::router::PeerDirectory;
use super::shutdown::ShutdownState;
use super::signals::{TerminationReason, WorkerExit};
use crate::error::Result;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Lifecycle of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Forked, has not announced `boot_complete` yet.
    Starting,
    /// Announced `boot_complete`.
    Running,
}

/// Primary's view of one live worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: usize,
    pub pid: u32,
    pub state: WorkerState,
    pub channel: Channel,
}

/// Something that happened to the cluster, delivered to the primary's loop in
/// order of arrival.
#[derive(Debug)]
pub enum ClusterEvent {
    /// A worker sent a message.
    Message { pid: u32, message: Message },
    /// A worker process is gone.
    Exited { pid: u32, reason: TerminationReason },
    /// The transport failed outside of any single worker's exit.
    TransportError { pid: Option<u32>, error: String },
    /// Pre-flight checks for a replacement worker passed.
    ReplacementBooted,
    /// Pre-flight checks for a replacement worker failed.
    ReplacementFailed { error: String },
}

/// A freshly started worker.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub pid: u32,
    pub channel: Channel,
}

/// Starts and kills workers.
///
/// Implementations deliver everything a worker does (messages, exit) to
/// `events` as [`ClusterEvent`]s.
pub trait WorkerSpawner: Send {
    fn spawn(
        &mut self,
        id: usize,
        events: &mpsc::UnboundedSender<ClusterEvent>,
    ) -> Result<SpawnedWorker>;

    /// Forcefully terminate a worker.
    fn kill(&mut self, pid: u32) -> Result<()>;
}

/// What the supervisor made of a worker's `boot_complete`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootProgress {
    /// This worker was asked to generate the manifest.
    pub manifest_requested: bool,
    /// This was the announcement that brought the cluster fully online.
    pub all_online: bool,
}

/// What to do about a worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// The pid was not a tracked worker.
    Unknown,
    /// Shutdown is in progress; nothing is replaced.
    ShuttingDown,
    /// Fork a replacement once pre-flight checks pass.
    Replace,
}

/// Tracks live workers and keeps their number at the target.
pub struct Supervisor {
    spawner: Box<dyn WorkerSpawner>,
    events: mpsc::UnboundedSender<ClusterEvent>,
    workers: BTreeMap<u32, WorkerHandle>,
    target: usize,
    online: usize,
    next_id: usize,
    manifest_requested: bool,
    initialized: bool,
    state: ShutdownState,
}

impl Supervisor {
    pub fn new(
        spawner: Box<dyn WorkerSpawner>,
        events: mpsc::UnboundedSender<ClusterEvent>,
        target: usize,
        state: ShutdownState,
    ) -> Self {
        Self {
            spawner,
            events,
            workers: BTreeMap::new(),
            target,
            online: 0,
            next_id: 0,
            manifest_requested: false,
            initialized: false,
            state,
        }
    }

    /// Start one worker.
    pub fn fork(&mut self) -> Result<u32> {
        self.next_id += 1;
        let id = self.next_id;
        let SpawnedWorker { pid, channel } = self.spawner.spawn(id, &self.events)?;
        debug!(worker_id = id, pid, "Forked worker");
        self.workers.insert(
            pid,
            WorkerHandle {
                id,
                pid,
                state: WorkerState::Starting,
                channel,
            },
        );
        Ok(pid)
    }

    /// Start the initial set of workers.
    pub fn fork_all(&mut self) -> Result<()> {
        for _ in 0..self.target {
            self.fork()?;
        }
        Ok(())
    }

    /// Record a worker's `boot_complete`.
    ///
    /// The first worker ever to announce is asked for the manifest. The
    /// announcement that brings the online count to the target reports
    /// `all_online`, once per supervisor.
    pub fn on_boot_complete(&mut self, pid: u32) -> BootProgress {
        let shutting_down = self.state.is_shutting_down();
        let Some(handle) = self.workers.get_mut(&pid) else {
            warn!(pid, "boot_complete from untracked worker");
            return BootProgress::default();
        };
        if handle.state == WorkerState::Running {
            debug!(pid, "Duplicate boot_complete ignored");
            return BootProgress::default();
        }
        handle.state = WorkerState::Running;
        self.online += 1;
        info!(worker_id = handle.id, pid, online = self.online, "Worker booted");

        let mut progress = BootProgress::default();
        if !self.manifest_requested {
            self.manifest_requested = true;
            progress.manifest_requested = true;
            if let Err(e) = handle
                .channel
                .send_lenient(Message::GenerateManifest, shutting_down)
            {
                error!(pid, error = %e, "Failed to request manifest generation");
            }
        }
        if !self.initialized && self.online >= self.target {
            self.initialized = true;
            progress.all_online = true;
        }
        progress
    }

    /// Record a worker exit and decide whether it gets replaced.
    pub fn on_exit(&mut self, pid: u32, reason: TerminationReason) -> ExitDecision {
        let Some(handle) = self.workers.remove(&pid) else {
            debug!(pid, %reason, "Exit of untracked process");
            return ExitDecision::Unknown;
        };
        let exit = WorkerExit {
            id: handle.id,
            pid,
            reason,
        };

        if self.state.is_shutting_down() {
            info!(
                worker_id = handle.id,
                pid,
                remaining = self.workers.len(),
                operation = "SHUTDOWN",
                index_prefix = "SYSTEM",
                "{}",
                exit
            );
            return ExitDecision::ShuttingDown;
        }

        if handle.state == WorkerState::Running {
            self.online = self.online.saturating_sub(1);
        }
        error!(
            worker_id = handle.id,
            pid,
            code = ?reason.code(),
            signal = ?reason.signal().map(|s| s.as_str()),
            operation = "WORKER_EXIT",
            index_prefix = "SYSTEM",
            "{}, forking replacement",
            exit
        );
        ExitDecision::Replace
    }

    /// Fork a replacement unless shutdown began in the meantime.
    pub fn replace(&mut self) -> Result<Option<u32>> {
        if self.state.is_shutting_down() {
            info!("Shutdown began before replacement could fork; skipping");
            return Ok(None);
        }
        self.fork().map(Some)
    }

    /// Ask every live worker to shut down. Closed pipes are ignored.
    pub fn broadcast_shutdown(&self) {
        for handle in self.workers.values() {
            if let Err(e) = handle.channel.send_lenient(Message::Shutdown, true) {
                warn!(pid = handle.pid, error = %e, "Failed to send shutdown");
            }
        }
    }

    /// Force-kill every worker still tracked. Returns the pids signalled.
    pub fn kill_all(&mut self) -> Vec<u32> {
        let pids: Vec<u32> = self.workers.keys().copied().collect();
        for pid in &pids {
            warn!(pid, operation = "SHUTDOWN", index_prefix = "SYSTEM", "Force-killing worker");
            if let Err(e) = self.spawner.kill(*pid) {
                error!(pid, error = %e, "Failed to kill worker");
            }
        }
        pids
    }

    pub fn channel(&self, pid: u32) -> Option<&Channel> {
        self.workers.get(&pid).map(|h| &h.channel)
    }

    pub fn worker(&self, pid: u32) -> Option<&WorkerHandle> {
        self.workers.get(&pid)
    }

    pub fn live_count(&self) -> usize {
        self.workers.len()
    }

    pub fn online_count(&self) -> usize {
        self.online
    }

    pub fn target(&self) -> usize {
        self.target
    }
}

impl PeerDirectory for Supervisor {
    fn live_peers(&self, except: u32) -> Vec<(u32, Channel)> {
        self.workers
            .values()
            .filter(|h| h.pid != except)
            .map(|h| (h.pid, h.channel.clone()))
            .collect()
    }

    fn lookup(&self, pid: u32) -> Option<Channel> {
        self.channel(pid).cloned()
    }
}
