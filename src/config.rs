//! Cluster configuration.
//!
//! # Environment Variables
//!
//! - `PORT` - Advisory port, reported in boot logs only
//! - `LOG_FILE_TRANSPORT` - `true` enables log archival once all workers are online
//! - `CLUSTER_MODE` - `cluster` (default) or `standalone`

use crate::cluster::registry::{RELAY_TIMEOUT, REQUEST_TIMEOUT};
use crate::cluster::shutdown::{PRIMARY_SHUTDOWN_TIMEOUT, WORKER_SHUTDOWN_TIMEOUT};
use crate::error::{ClusterError, Result};
use std::str::FromStr;
use std::time::Duration;

/// How the service runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClusterMode {
    /// One primary supervising one worker per core.
    #[default]
    Cluster,
    /// A single process with no workers and no bus.
    Standalone,
}

impl FromStr for ClusterMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cluster" | "production" => Ok(Self::Cluster),
            "standalone" | "single" => Ok(Self::Standalone),
            _ => Err(format!(
                "Unknown cluster mode: '{}'. Valid options: cluster, standalone",
                s
            )),
        }
    }
}

impl std::fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Standalone => write!(f, "standalone"),
        }
    }
}

/// Number of CPU cores, falling back to 1 if it cannot be probed.
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Settings shared by the primary and its workers.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Workers to keep alive (default: CPU count)
    pub workers: usize,
    /// Advisory port (default: unset)
    pub port: Option<u16>,
    /// Archive logs once every worker is online (default: false)
    pub log_archival: bool,
    /// Cluster or standalone (default: cluster)
    pub mode: ClusterMode,
    /// Primary's budget per sibling relay (default: 60s)
    pub relay_timeout: Duration,
    /// Worker's budget per request (default: 65s)
    pub request_timeout: Duration,
    /// Primary's wait for workers to exit (default: 31s)
    pub primary_shutdown_timeout: Duration,
    /// Worker's own force-exit bound (default: 30s)
    pub worker_shutdown_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: cpu_count(),
            port: None,
            log_archival: false,
            mode: ClusterMode::Cluster,
            relay_timeout: RELAY_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            primary_shutdown_timeout: PRIMARY_SHUTDOWN_TIMEOUT,
            worker_shutdown_timeout: WORKER_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_log_archival(mut self, enabled: bool) -> Self {
        self.log_archival = enabled;
        self
    }

    pub fn with_mode(mut self, mode: ClusterMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeouts(mut self, primary: Duration, worker: Duration) -> Self {
        self.primary_shutdown_timeout = primary;
        self.worker_shutdown_timeout = worker;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads `PORT`, `LOG_FILE_TRANSPORT` and `CLUSTER_MODE`. Values that do
    /// not parse are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup, for tests.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.port = Some(port),
                Err(_) => tracing::warn!(%port, "Ignoring invalid PORT"),
            }
        }

        if let Some(flag) = lookup("LOG_FILE_TRANSPORT") {
            self.log_archival = flag.eq_ignore_ascii_case("true");
        }

        if let Some(mode) = lookup("CLUSTER_MODE") {
            match mode.parse::<ClusterMode>() {
                Ok(mode) => self.mode = mode,
                Err(_) => tracing::warn!(%mode, "Ignoring invalid CLUSTER_MODE"),
            }
        }

        self
    }

    /// Check that the timeout budgets are ordered and there is work to do.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ClusterError::Config("worker count must be at least 1".into()));
        }
        if self.request_timeout <= self.relay_timeout {
            return Err(ClusterError::Config(format!(
                "request timeout ({:?}) must exceed relay timeout ({:?})",
                self.request_timeout, self.relay_timeout
            )));
        }
        if self.primary_shutdown_timeout <= self.worker_shutdown_timeout {
            return Err(ClusterError::Config(format!(
                "primary shutdown timeout ({:?}) must exceed worker shutdown timeout ({:?})",
                self.primary_shutdown_timeout, self.worker_shutdown_timeout
            )));
        }
        Ok(())
    }
}
