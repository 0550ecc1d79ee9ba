//! Graceful shutdown coordination.
//!
//! Every trigger (signal, panic, fatal error, or a `shutdown` message from the
//! primary) is funnelled into one [`ShutdownCoordinator`] per process. The
//! first trigger flips the process-wide [`ShutdownState`]; the rest are
//! ignored.

use crate::hooks::ServiceHooks;
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Primary's bound on waiting for workers to exit.
pub const PRIMARY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(31);

/// Worker's own force-exit bound. Shorter than the primary's so a worker gets
/// to exit on its own before being killed.
pub const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Set once, never reset.
#[derive(Debug, Clone, Default)]
pub struct ShutdownState(Arc<AtomicBool>);

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Flip the flag. Returns `true` only for the call that flipped it.
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// What started a shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownTrigger {
    /// SIGINT or SIGTERM.
    Signal(Signal),
    /// A `shutdown` message from the primary.
    Requested,
    /// A panic anywhere in the process.
    Panic(String),
    /// Any other unrecoverable condition.
    Fatal(String),
}

impl ShutdownTrigger {
    /// Voluntary shutdowns exit 0 when they complete without force.
    pub fn is_voluntary(&self) -> bool {
        matches!(self, Self::Signal(_) | Self::Requested)
    }
}

impl std::fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signal(sig) => write!(f, "received {}", sig.as_str()),
            Self::Requested => f.write_str("shutdown requested by primary"),
            Self::Panic(msg) => write!(f, "panic: {}", msg),
            Self::Fatal(msg) => write!(f, "fatal error: {}", msg),
        }
    }
}

/// Cloneable handle used to request a shutdown from anywhere in the process.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    state: ShutdownState,
    tx: mpsc::UnboundedSender<ShutdownTrigger>,
}

impl ShutdownHandle {
    pub fn trigger(&self, trigger: ShutdownTrigger) {
        if self.state.is_shutting_down() {
            tracing::debug!(%trigger, "Shutdown already in progress");
        }
        // The coordinator owns a sender too, so this only fails after it is gone.
        let _ = self.tx.send(trigger);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.is_shutting_down()
    }
}

/// Process-scoped shutdown state plus the queue of triggers.
pub struct ShutdownCoordinator {
    state: ShutdownState,
    tx: mpsc::UnboundedSender<ShutdownTrigger>,
    rx: mpsc::UnboundedReceiver<ShutdownTrigger>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: ShutdownState::new(),
            tx,
            rx,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state.clone()
    }

    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            state: self.state.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Wait for the first trigger that starts a shutdown and flip the state.
    ///
    /// Triggers arriving after the state is already set are skipped.
    pub async fn next_trigger(&mut self) -> ShutdownTrigger {
        loop {
            let trigger = match self.rx.recv().await {
                Some(trigger) => trigger,
                // Unreachable while `self.tx` is alive.
                None => ShutdownTrigger::Fatal("shutdown channel closed".into()),
            };
            if self.state.begin() {
                tracing::info!(%trigger, operation = "SHUTDOWN", index_prefix = "SYSTEM", "Shutting down");
                return trigger;
            }
        }
    }
}

/// Forward SIGINT and SIGTERM into `handle` for the life of the process.
pub fn listen_for_signals(handle: ShutdownHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                Some(()) = interrupt.recv() => Signal::SIGINT,
                Some(()) = terminate.recv() => Signal::SIGTERM,
                else => break,
            };
            handle.trigger(ShutdownTrigger::Signal(sig));
        }
    }))
}

/// Route panics into the shutdown sequence, keeping the previous hook's output.
pub fn install_panic_hook(handle: ShutdownHandle) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        handle.trigger(ShutdownTrigger::Panic(info.to_string()));
    }));
}

/// Stop serving and drain shared resources, bounded by `timeout`.
///
/// Returns whether the drain succeeded, or `None` if the bound elapsed first.
pub async fn wind_down(hooks: &dyn ServiceHooks, timeout: Duration) -> Option<bool> {
    let sequence = async {
        if let Err(e) = hooks.stop_server().await {
            tracing::warn!(error = %e, operation = "SHUTDOWN", index_prefix = "SYSTEM", "Failed to stop server");
        }
        drain(hooks).await
    };
    match tokio::time::timeout(timeout, sequence).await {
        Ok(drained) => Some(drained),
        Err(_) => {
            tracing::error!(
                timeout_secs = timeout.as_secs(),
                operation = "SHUTDOWN",
                index_prefix = "SYSTEM",
                "Could not close connections in time, forcefully shutting down"
            );
            None
        }
    }
}

/// Run the drain hook, logging failure.
pub async fn drain(hooks: &dyn ServiceHooks) -> bool {
    match hooks.drain().await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, operation = "SHUTDOWN", index_prefix = "SYSTEM", "Failed to drain shared resources");
            false
        }
    }
}

/// How a shutdown went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub trigger: ShutdownTrigger,
    /// The bound elapsed and stragglers were killed (primary) or the process
    /// gave up waiting on its own wind-down (worker).
    pub forced: bool,
    /// Shared resources were drained without error.
    pub drained: bool,
}

impl ShutdownReport {
    /// 0 for a voluntary shutdown that finished in time, 1 otherwise.
    ///
    /// A failed drain is logged but does not change the code.
    pub fn exit_code(&self) -> i32 {
        if self.forced || !self.trigger.is_voluntary() {
            1
        } else {
            0
        }
    }
}
