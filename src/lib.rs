//! clusterbus - primary/worker process supervisor with a request/response bus.
//!
//! A primary process keeps one worker per CPU core alive, relays requests
//! between workers by correlation id, and coordinates a bounded graceful
//! shutdown. Applications plug in through [`hooks::ServiceHooks`].

pub mod cluster;
pub mod config;
pub mod error;
pub mod hooks;
pub mod logging;

pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use hooks::ServiceHooks;
