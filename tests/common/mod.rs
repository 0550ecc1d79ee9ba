//! In-process cluster harness.
//!
//! Workers run as tasks on the test runtime instead of child processes. Each
//! one is a real `WorkerRuntime` (or a deliberately stuck stand-in) wired to
//! the primary through in-memory channels.

#![allow(dead_code)]

use async_trait::async_trait;
use clusterbus::cluster::signals::TerminationReason;
use clusterbus::cluster::{
    ClusterEvent, Message, MessageBus, ProcessRole, Request, ShutdownCoordinator, SpawnedWorker,
    WorkerIdentity, WorkerRuntime, WorkerSpawner,
};
use clusterbus::cluster::ipc::Channel;
use clusterbus::{ClusterConfig, ClusterError, Result, ServiceHooks};
use futures::future::BoxFuture;
use nix::sys::signal::Signal;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Shared tallies of hook invocations.
#[derive(Default)]
pub struct Counters {
    pub primary_boots: AtomicUsize,
    pub worker_boots: AtomicUsize,
    pub manifests: AtomicUsize,
    pub archives: AtomicUsize,
    pub stops: AtomicUsize,
    pub drains: AtomicUsize,
    pub buses: Mutex<Vec<MessageBus>>,
}

pub fn count(counter: &AtomicUsize) -> usize {
    counter.load(Ordering::SeqCst)
}

impl Counters {
    /// Bus of the worker with ordinal `id`, once it has started serving.
    pub fn bus(&self, id: usize) -> Option<MessageBus> {
        self.buses
            .lock()
            .unwrap()
            .iter()
            .find(|bus| bus.identity().map(|w| w.id) == Some(id))
            .cloned()
    }

    pub fn started(&self) -> usize {
        self.buses.lock().unwrap().len()
    }
}

/// Hooks whose timing and failures are scripted by the test.
#[derive(Clone, Default)]
pub struct TestHooks {
    pub counters: Arc<Counters>,
    /// Delay inside `start_server`, per worker ordinal.
    pub boot_delay: Option<Arc<dyn Fn(usize) -> Duration + Send + Sync>>,
    /// Delay inside `stop_server`.
    pub stop_delay: Duration,
    /// Never answer sibling requests.
    pub silent: bool,
    /// Fail `boot(Worker)`.
    pub fail_worker_boot: bool,
}

impl TestHooks {
    pub fn new(counters: Arc<Counters>) -> Self {
        Self {
            counters,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ServiceHooks for TestHooks {
    async fn boot(&self, role: ProcessRole) -> Result<()> {
        match role {
            ProcessRole::Primary => self.counters.primary_boots.fetch_add(1, Ordering::SeqCst),
            ProcessRole::Worker => self.counters.worker_boots.fetch_add(1, Ordering::SeqCst),
        };
        if role == ProcessRole::Worker && self.fail_worker_boot {
            return Err(ClusterError::Boot("scripted failure".into()));
        }
        Ok(())
    }

    async fn start_server(&self, bus: MessageBus) -> Result<()> {
        if let (Some(delay), Some(identity)) = (&self.boot_delay, bus.identity()) {
            tokio::time::sleep(delay(identity.id)).await;
        }
        self.counters.buses.lock().unwrap().push(bus);
        Ok(())
    }

    async fn stop_server(&self) -> Result<()> {
        tokio::time::sleep(self.stop_delay).await;
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        self.counters.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn generate_manifest(&self) -> Result<()> {
        self.counters.manifests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn archive_logs(&self) -> Result<()> {
        self.counters.archives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn handle_request(&self, request: &Request) -> Value {
        if self.silent {
            std::future::pending::<()>().await;
        }
        json!({ "topic": request.topic, "echo": request.payload })
    }
}

/// What a spawned worker does.
pub enum Behavior {
    /// A real worker runtime with these hooks.
    Runtime(TestHooks),
    /// Announces boot, then ignores everything and never exits on its own.
    Stuck,
}

/// Record of what the spawner did.
#[derive(Default)]
pub struct SpawnLog {
    /// `(worker id, pid)` in spawn order.
    pub spawned: Vec<(usize, u32)>,
    /// Pids the primary force-killed.
    pub killed: Vec<u32>,
    /// Messages the primary sent to each worker.
    pub received: HashMap<u32, Vec<Message>>,
    next_pid: u32,
    exits: HashMap<u32, oneshot::Sender<TerminationReason>>,
}

type Factory = Arc<dyn Fn(usize) -> Behavior + Send + Sync>;

/// `WorkerSpawner` whose workers are tasks on the current runtime.
#[derive(Clone)]
pub struct InProcessSpawner {
    pub log: Arc<Mutex<SpawnLog>>,
    factory: Factory,
    config: ClusterConfig,
}

impl InProcessSpawner {
    pub fn new(config: ClusterConfig, factory: impl Fn(usize) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            log: Arc::default(),
            factory: Arc::new(factory),
            config,
        }
    }

    /// Make a worker exit as if it crashed.
    pub fn crash(&self, pid: u32) {
        if let Some(exit) = self.log.lock().unwrap().exits.remove(&pid) {
            let _ = exit.send(TerminationReason::Exited(1));
        }
    }

    pub fn spawned(&self) -> Vec<(usize, u32)> {
        self.log.lock().unwrap().spawned.clone()
    }

    pub fn pid_of(&self, id: usize) -> Option<u32> {
        self.spawned().into_iter().find(|(i, _)| *i == id).map(|(_, pid)| pid)
    }

    pub fn killed(&self) -> Vec<u32> {
        self.log.lock().unwrap().killed.clone()
    }

    pub fn received(&self, pid: u32) -> Vec<Message> {
        self.log
            .lock()
            .unwrap()
            .received
            .get(&pid)
            .cloned()
            .unwrap_or_default()
    }
}

impl WorkerSpawner for InProcessSpawner {
    fn spawn(&mut self, id: usize, events: &mpsc::UnboundedSender<ClusterEvent>) -> Result<SpawnedWorker> {
        let (exit_tx, mut exit_rx) = oneshot::channel();
        let pid = {
            let mut log = self.log.lock().unwrap();
            log.next_pid += 1;
            let pid = 1000 + log.next_pid;
            log.spawned.push((id, pid));
            log.exits.insert(pid, exit_tx);
            pid
        };

        let (channel, mut to_worker) = Channel::pair(format!("worker {}", id));
        let (primary, mut from_worker) = Channel::pair("primary");
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let mut body: BoxFuture<'static, i32> = match (self.factory)(id) {
            Behavior::Runtime(hooks) => {
                let runtime = WorkerRuntime::new(
                    WorkerIdentity { id, pid },
                    &self.config,
                    Arc::new(hooks),
                    primary,
                    inbound,
                    ShutdownCoordinator::new(),
                );
                Box::pin(async move { runtime.run().await.exit_code() })
            }
            Behavior::Stuck => {
                let _ = primary.send(Message::BootComplete);
                Box::pin(async move {
                    let _keep = (primary, inbound);
                    std::future::pending::<i32>().await
                })
            }
        };

        let events = events.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    biased;
                    Ok(reason) = &mut exit_rx => break reason,
                    Some(message) = to_worker.recv() => {
                        log.lock().unwrap().received.entry(pid).or_default().push(message.clone());
                        let _ = inbound_tx.send(message);
                    }
                    Some(message) = from_worker.recv() => {
                        let _ = events.send(ClusterEvent::Message { pid, message });
                    }
                    code = &mut body => break TerminationReason::Exited(code),
                }
            };
            drop(body);
            while let Ok(message) = from_worker.try_recv() {
                let _ = events.send(ClusterEvent::Message { pid, message });
            }
            let _ = events.send(ClusterEvent::Exited { pid, reason });
        });

        Ok(SpawnedWorker { pid, channel })
    }

    fn kill(&mut self, pid: u32) -> Result<()> {
        let mut log = self.log.lock().unwrap();
        log.killed.push(pid);
        if let Some(exit) = log.exits.remove(&pid) {
            let _ = exit.send(TerminationReason::Signaled(Signal::SIGKILL));
        }
        Ok(())
    }
}

/// Poll `cond` every 10ms (virtual time) until it holds, up to `limit`.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
