//! Worker process main entry point.
//!
//! This module runs when `clusterbus worker --worker-id N` is invoked by the
//! primary. stdin carries messages from the primary and stdout carries
//! messages back; logs go to stderr.

use super::ProcessRole;
use super::bus::{MessageBus, WorkerIdentity};
use super::ipc::{Channel, spawn_reader, spawn_writer};
use super::protocol::{Message, Request};
use super::registry::CorrelationRegistry;
use super::shutdown::{
    ShutdownCoordinator, ShutdownHandle, ShutdownReport, ShutdownState, ShutdownTrigger,
    install_panic_hook, listen_for_signals, wind_down,
};
use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::hooks::ServiceHooks;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error, info, warn};

/// Everything one worker needs to serve its part of the bus.
pub struct WorkerRuntime {
    identity: WorkerIdentity,
    hooks: Arc<dyn ServiceHooks>,
    primary: Channel,
    inbound: mpsc::UnboundedReceiver<Message>,
    coordinator: ShutdownCoordinator,
    pending: CorrelationRegistry<String, Value>,
    bus: MessageBus,
    shutdown_timeout: Duration,
}

impl WorkerRuntime {
    pub fn new(
        identity: WorkerIdentity,
        config: &ClusterConfig,
        hooks: Arc<dyn ServiceHooks>,
        primary: Channel,
        inbound: mpsc::UnboundedReceiver<Message>,
        coordinator: ShutdownCoordinator,
    ) -> Self {
        let pending = CorrelationRegistry::new();
        let bus = MessageBus::worker(identity, primary.clone(), pending.clone(), coordinator.state())
            .with_timeout(config.request_timeout);
        Self {
            identity,
            hooks,
            primary,
            inbound,
            coordinator,
            pending,
            bus,
            shutdown_timeout: config.worker_shutdown_timeout,
        }
    }

    /// The bus application code in this worker uses.
    pub fn bus(&self) -> MessageBus {
        self.bus.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.coordinator.handle()
    }

    /// Boot, serve messages until a shutdown trigger, then wind down.
    pub async fn run(self) -> ShutdownReport {
        let Self {
            identity,
            hooks,
            primary,
            mut inbound,
            mut coordinator,
            pending,
            bus,
            shutdown_timeout,
        } = self;
        let handle = coordinator.handle();
        let state = coordinator.state();

        let boot = tokio::spawn(boot_worker(
            hooks.clone(),
            bus,
            primary.clone(),
            state.clone(),
        ));

        let dispatcher = Dispatcher {
            pid: identity.pid,
            hooks: hooks.clone(),
            primary,
            pending,
            state,
            handle: handle.clone(),
        };

        let mut connected = true;
        let trigger = loop {
            tokio::select! {
                biased;
                trigger = coordinator.next_trigger() => break trigger,
                message = inbound.recv(), if connected => match message {
                    Some(message) => dispatcher.dispatch(message),
                    None => {
                        connected = false;
                        handle.trigger(ShutdownTrigger::Fatal("lost connection to primary".into()));
                    }
                },
            }
        };
        boot.abort();

        info!(%trigger, operation = "SHUTDOWN", index_prefix = "SYSTEM", "Worker shutting down");
        let drained = wind_down(&*hooks, shutdown_timeout).await;
        ShutdownReport {
            trigger,
            forced: drained.is_none(),
            drained: drained.unwrap_or(false),
        }
    }
}

/// Boot checks, server start, then `boot_complete`.
async fn boot_worker(
    hooks: Arc<dyn ServiceHooks>,
    bus: MessageBus,
    primary: Channel,
    state: ShutdownState,
) {
    let started = async {
        hooks.boot(ProcessRole::Worker).await?;
        hooks.start_server(bus).await
    };
    if let Err(e) = started.await {
        error!(error = %e, operation = "BOOT", index_prefix = "SYSTEM", "Worker failed to start");
        return;
    }
    if state.is_shutting_down() {
        debug!("Shutdown began during boot; not announcing");
        return;
    }
    if let Err(e) = primary.send_lenient(Message::BootComplete, state.is_shutting_down()) {
        error!(error = %e, "Failed to announce boot_complete");
    }
}

/// Handles one inbound message at a time, in receipt order.
struct Dispatcher {
    pid: u32,
    hooks: Arc<dyn ServiceHooks>,
    primary: Channel,
    pending: CorrelationRegistry<String, Value>,
    state: ShutdownState,
    handle: ShutdownHandle,
}

impl Dispatcher {
    fn dispatch(&self, message: Message) {
        match message {
            Message::Request(request) => self.answer(request),
            Message::Response { id, message, .. } => {
                if !self.pending.resolve(&id, message) {
                    debug!(%id, "Late or unknown response discarded");
                }
            }
            Message::Error { id, message, .. } => {
                if !self.pending.reject(&id, ClusterError::from_wire(message)) {
                    debug!(%id, "Late or unknown error discarded");
                }
            }
            Message::GenerateManifest => {
                let hooks = self.hooks.clone();
                tokio::spawn(async move {
                    if let Err(e) = hooks.generate_manifest().await {
                        error!(error = %e, operation = "BOOT", index_prefix = "SYSTEM", "Manifest generation failed");
                    }
                });
            }
            Message::Shutdown => self.handle.trigger(ShutdownTrigger::Requested),
            Message::BootComplete => warn!("Unexpected boot_complete from primary"),
        }
    }

    /// Answer a sibling's request on a separate task.
    fn answer(&self, request: Request) {
        let hooks = self.hooks.clone();
        let primary = self.primary.clone();
        let state = self.state.clone();
        let pid = self.pid;
        tokio::spawn(async move {
            let body = hooks.handle_request(&request).await;
            let reply = Message::response(request.id, pid, body);
            if let Err(e) = primary.send_lenient(reply, state.is_shutting_down()) {
                warn!(error = %e, "Failed to answer sibling request");
            }
        });
    }
}

/// Run the worker process. Returns the exit code.
pub async fn run_worker_main(
    config: ClusterConfig,
    hooks: Arc<dyn ServiceHooks>,
    worker_id: usize,
) -> i32 {
    let identity = WorkerIdentity {
        id: worker_id,
        pid: std::process::id(),
    };
    let span = tracing::info_span!("worker", id = identity.id, pid = identity.pid);

    async move {
        let coordinator = ShutdownCoordinator::new();
        let handle = coordinator.handle();
        if let Err(e) = listen_for_signals(handle.clone()) {
            warn!(error = %e, "Failed to install signal handlers");
        }
        install_panic_hook(handle);

        let (primary, outbound) = Channel::pair("primary");
        let writer = spawn_writer(tokio::io::stdout(), outbound);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let reader = spawn_reader(tokio::io::stdin(), move |message| inbound_tx.send(message).is_ok());

        let runtime = WorkerRuntime::new(identity, &config, hooks, primary, inbound, coordinator);
        let report = runtime.run().await;
        reader.abort();

        // Let queued answers reach the primary before exiting.
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;

        info!(
            exit_code = report.exit_code(),
            forced = report.forced,
            operation = "SHUTDOWN",
            index_prefix = "SYSTEM",
            "Worker exiting"
        );
        report.exit_code()
    }
    .instrument(span)
    .await
}
