//! The primary process: forks workers, relays their requests, and runs the
//! cluster-wide shutdown sequence.
//!
//! Everything happens on one event loop fed by a single
//! [`ClusterEvent`] receiver, so supervisor and router state is only ever
//! touched from here.

use super::ProcessRole;
use super::bus::MessageBus;
use super::protocol::Message;
use super::router::Router;
use super::shutdown::{self, ShutdownCoordinator, ShutdownHandle, ShutdownReport, ShutdownTrigger};
use super::supervisor::{ClusterEvent, ExitDecision, Supervisor, WorkerSpawner};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::hooks::ServiceHooks;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Primary-side cluster runtime.
pub struct Primary {
    config: ClusterConfig,
    hooks: Arc<dyn ServiceHooks>,
    coordinator: ShutdownCoordinator,
    supervisor: Supervisor,
    router: Router,
    events: mpsc::UnboundedReceiver<ClusterEvent>,
    events_tx: mpsc::UnboundedSender<ClusterEvent>,
}

impl Primary {
    pub fn new(
        config: ClusterConfig,
        hooks: Arc<dyn ServiceHooks>,
        spawner: Box<dyn WorkerSpawner>,
        coordinator: ShutdownCoordinator,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        let state = coordinator.state();
        let supervisor = Supervisor::new(spawner, events_tx.clone(), config.workers, state.clone());
        let router = Router::new(std::process::id(), state).with_relay_timeout(config.relay_timeout);
        Self {
            config,
            hooks,
            coordinator,
            supervisor,
            router,
            events,
            events_tx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.coordinator.handle()
    }

    /// A bus for code running in the primary. Every request fails at once.
    pub fn bus(&self) -> MessageBus {
        MessageBus::detached(ProcessRole::Primary)
    }

    /// Boot, fork the workers, supervise until a shutdown trigger, then run
    /// the shutdown sequence.
    ///
    /// Fails only if the primary's own boot checks fail.
    pub async fn run(mut self) -> Result<ShutdownReport> {
        self.hooks
            .boot(ProcessRole::Primary)
            .await
            .map_err(|e| ClusterError::Boot(e.to_string()))?;

        let port = self
            .config
            .port
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        info!(
            port = ?self.config.port,
            pid = std::process::id(),
            cores = self.config.workers,
            operation = "BOOT",
            index_prefix = "SYSTEM",
            "Server is running on {}/{} on {} cores",
            port,
            std::process::id(),
            self.config.workers
        );

        if let Err(e) = self.supervisor.fork_all() {
            error!(error = %e, operation = "BOOT", index_prefix = "SYSTEM", "Failed to fork workers");
            self.coordinator
                .handle()
                .trigger(ShutdownTrigger::Fatal(e.to_string()));
        }

        let trigger = loop {
            tokio::select! {
                biased;
                trigger = self.coordinator.next_trigger() => break trigger,
                Some(event) = self.events.recv() => self.on_event(event),
            }
        };

        Ok(self.shut_down(trigger).await)
    }

    fn on_event(&mut self, event: ClusterEvent) {
        match event {
            ClusterEvent::Message { pid, message } => self.on_message(pid, message),
            ClusterEvent::Exited { pid, reason } => {
                if self.supervisor.on_exit(pid, reason) == ExitDecision::Replace {
                    self.boot_replacement();
                }
            }
            ClusterEvent::TransportError { pid, error } => {
                error!(?pid, %error, operation = "CLUSTER", index_prefix = "SYSTEM", "Cluster transport error");
            }
            ClusterEvent::ReplacementBooted => match self.supervisor.replace() {
                Ok(Some(pid)) => info!(pid, operation = "CLUSTER", index_prefix = "SYSTEM", "Replacement worker forked"),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, operation = "CLUSTER", index_prefix = "SYSTEM", "Failed to fork replacement worker");
                }
            },
            ClusterEvent::ReplacementFailed { error } => {
                error!(
                    %error,
                    operation = "CLUSTER",
                    index_prefix = "SYSTEM",
                    "Boot checks failed for replacement worker; slot will not be refilled"
                );
            }
        }
    }

    fn on_message(&mut self, pid: u32, message: Message) {
        match message {
            Message::BootComplete => {
                let progress = self.supervisor.on_boot_complete(pid);
                if progress.all_online {
                    self.on_all_online();
                }
            }
            Message::Request(request) => {
                let Some(origin) = self.supervisor.channel(pid).cloned() else {
                    warn!(pid, id = %request.id, "Request from untracked worker dropped");
                    return;
                };
                self.router.dispatch(pid, origin, request, &self.supervisor);
            }
            Message::Response { id, message, .. } => {
                if !self.router.settle(pid, &id, message) {
                    debug!(pid, %id, "Late or unknown response discarded");
                }
            }
            Message::Error { id, message, .. } => {
                let pending = self.router.ignore_error(pid, &id);
                warn!(pid, %id, pending, error = %message, "Error from worker ignored; relays settle on responses only");
            }
            other => warn!(pid, kind = other.kind(), "Unexpected message from worker"),
        }
    }

    /// Post-boot tasks, once per primary lifetime.
    fn on_all_online(&self) {
        if self.config.log_archival {
            let hooks = self.hooks.clone();
            tokio::spawn(async move {
                if let Err(e) = hooks.archive_logs().await {
                    error!(error = %e, operation = "BOOT", index_prefix = "SYSTEM", "Log archival failed");
                }
            });
        }
        info!(
            workers = self.supervisor.online_count(),
            cores = self.config.workers,
            operation = "BOOT",
            index_prefix = "SYSTEM",
            "Server initialized successfully with {} Workers on {} cores",
            self.supervisor.online_count(),
            self.config.workers
        );
    }

    /// Run boot checks for a replacement off the event loop; the outcome comes
    /// back as an event.
    fn boot_replacement(&self) {
        let hooks = self.hooks.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match hooks.boot(ProcessRole::Worker).await {
                Ok(()) => ClusterEvent::ReplacementBooted,
                Err(e) => ClusterEvent::ReplacementFailed {
                    error: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
    }

    /// Notify, wait up to the shutdown budget, force-kill stragglers, drain.
    async fn shut_down(mut self, trigger: ShutdownTrigger) -> ShutdownReport {
        let deadline = Instant::now() + self.config.primary_shutdown_timeout;
        info!(
            workers = self.supervisor.live_count(),
            operation = "SHUTDOWN",
            index_prefix = "SYSTEM",
            "Notifying workers"
        );
        self.supervisor.broadcast_shutdown();

        let mut forced = false;
        while self.supervisor.live_count() > 0 {
            tokio::select! {
                Some(event) = self.events.recv() => self.on_event(event),
                _ = tokio::time::sleep_until(deadline) => {
                    let killed = self.supervisor.kill_all();
                    warn!(
                        killed = killed.len(),
                        operation = "SHUTDOWN",
                        index_prefix = "SYSTEM",
                        "Could not close connections in time, forcefully shutting down"
                    );
                    forced = true;
                    break;
                }
            }
        }

        let drained = match tokio::time::timeout(
            self.config.primary_shutdown_timeout,
            shutdown::drain(&*self.hooks),
        )
        .await
        {
            Ok(drained) => drained,
            Err(_) => {
                error!(operation = "SHUTDOWN", index_prefix = "SYSTEM", "Timed out draining shared resources");
                false
            }
        };

        let report = ShutdownReport {
            trigger,
            forced,
            drained,
        };
        info!(
            exit_code = report.exit_code(),
            forced,
            drained,
            operation = "SHUTDOWN",
            index_prefix = "SYSTEM",
            "Primary shutdown complete"
        );
        report
    }
}
