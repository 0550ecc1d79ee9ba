//! Primary/worker process cluster with a request/response bus.
//!
//! One primary process forks a worker per CPU core, replaces workers that
//! die, and relays requests between them. Workers never talk to each other
//! directly; everything goes through the primary.
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────────┐
//!                     │       Primary        │
//!                     │ Supervisor + Router  │
//!                     └──────────┬───────────┘
//!                                │  JSON lines over stdin/stdout
//!               ┌────────────────┼────────────────┐
//!               │                │                │
//!         ┌─────▼─────┐    ┌─────▼─────┐    ┌─────▼─────┐
//!         │ Worker 1  │    │ Worker 2  │    │ Worker N  │
//!         │ MessageBus│    │ MessageBus│    │ MessageBus│
//!         └───────────┘    └───────────┘    └───────────┘
//! ```
//!
//! # Features
//!
//! - **Broadcast and unicast requests** correlated by id, with per-sibling timeouts
//! - **Crash recovery**: a worker that exits outside of shutdown is replaced
//! - **Graceful shutdown**: notify, wait, force-kill, drain, exit

pub mod bus;
pub mod ipc;
pub mod primary;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod shutdown;
pub mod signals;
pub mod spawn;
pub mod standalone;
pub mod supervisor;
pub mod worker_main;

pub use bus::{MessageBus, WorkerIdentity};
pub use primary::Primary;
pub use protocol::{Message, Outcome, Request};
pub use shutdown::{ShutdownCoordinator, ShutdownHandle, ShutdownReport, ShutdownState, ShutdownTrigger};
pub use spawn::ProcessSpawner;
pub use standalone::run_standalone;
pub use supervisor::{ClusterEvent, SpawnedWorker, WorkerSpawner};
pub use worker_main::{WorkerRuntime, run_worker_main};

/// Which side of the cluster a process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Primary,
    Worker,
}

impl ProcessRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
