//! Seams to the application the cluster hosts.
//!
//! The supervisor and the workers never serve HTTP, talk to caches or build
//! manifests themselves; they call into a [`ServiceHooks`] implementation at
//! fixed points of the lifecycle.

use crate::cluster::ProcessRole;
use crate::cluster::bus::MessageBus;
use crate::cluster::protocol::Request;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Value, json};

/// Lifecycle callbacks invoked by the primary and the workers.
///
/// Every method has a no-op default so implementors only override what they
/// host. Implementations must tolerate `drain` being called more than once.
#[async_trait]
pub trait ServiceHooks: Send + Sync + 'static {
    /// Pre-flight checks before a process starts (or forks) workers.
    async fn boot(&self, _role: ProcessRole) -> Result<()> {
        Ok(())
    }

    /// Start accepting inbound work. `bus` is the handle application code
    /// uses to query sibling workers.
    async fn start_server(&self, _bus: MessageBus) -> Result<()> {
        Ok(())
    }

    /// Stop accepting inbound work and close listeners.
    async fn stop_server(&self) -> Result<()> {
        Ok(())
    }

    /// Release shared external resources (cache pools, telemetry buffers).
    async fn drain(&self) -> Result<()> {
        Ok(())
    }

    /// Produce the route manifest. Called on exactly one worker per cluster.
    async fn generate_manifest(&self) -> Result<()> {
        Ok(())
    }

    /// Post-boot log archival, run by the primary once every worker is online.
    async fn archive_logs(&self) -> Result<()> {
        Ok(())
    }

    /// Answer a request sent by a sibling worker.
    async fn handle_request(&self, _request: &Request) -> Value {
        json!({ "status": "failed" })
    }
}

/// Hooks used by the `clusterbus` binary: every callback is logged and
/// `ping` requests are answered with `pong`.
#[derive(Debug, Clone, Default)]
pub struct LoggingHooks {
    /// Advisory port, only reported in logs.
    pub port: Option<u16>,
}

impl LoggingHooks {
    pub fn new(port: Option<u16>) -> Self {
        Self { port }
    }
}

#[async_trait]
impl ServiceHooks for LoggingHooks {
    async fn boot(&self, role: ProcessRole) -> Result<()> {
        tracing::debug!(%role, operation = "BOOT", index_prefix = "SYSTEM", "Boot checks passed");
        Ok(())
    }

    async fn start_server(&self, bus: MessageBus) -> Result<()> {
        tracing::info!(
            port = ?self.port,
            role = %bus.role(),
            pid = std::process::id(),
            operation = "BOOT",
            index_prefix = "SYSTEM",
            "Server is running"
        );
        Ok(())
    }

    async fn stop_server(&self) -> Result<()> {
        tracing::info!(operation = "SHUTDOWN", index_prefix = "SYSTEM", "Server stopped accepting work");
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        tracing::debug!(operation = "SHUTDOWN", index_prefix = "SYSTEM", "Shared resources drained");
        Ok(())
    }

    async fn generate_manifest(&self) -> Result<()> {
        tracing::info!(operation = "BOOT", index_prefix = "SYSTEM", "Route manifest generated");
        Ok(())
    }

    async fn archive_logs(&self) -> Result<()> {
        tracing::info!(operation = "BOOT", index_prefix = "SYSTEM", "Log archival scheduled");
        Ok(())
    }

    async fn handle_request(&self, request: &Request) -> Value {
        match request.topic.as_str() {
            "ping" => json!({ "status": "ok", "pong": std::process::id() }),
            _ => json!({ "status": "ok", "echo": request.payload }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    impl ServiceHooks for Bare {}

    fn request(topic: &str) -> Request {
        Request {
            id: "1-0-x".into(),
            sender_pid: 1,
            receiver_pid: None,
            topic: topic.into(),
            payload: json!({ "q": 1 }),
        }
    }

    #[tokio::test]
    async fn test_default_hooks_are_noops() {
        let hooks = Bare;
        assert!(hooks.boot(ProcessRole::Primary).await.is_ok());
        assert!(hooks.drain().await.is_ok());
        assert!(hooks.drain().await.is_ok());
        assert_eq!(
            hooks.handle_request(&request("websocket")).await,
            json!({ "status": "failed" })
        );
    }

    #[tokio::test]
    async fn test_logging_hooks_answer_ping() {
        let hooks = LoggingHooks::new(Some(3001));
        let pong = hooks.handle_request(&request("ping")).await;
        assert_eq!(pong["status"], "ok");
        assert_eq!(pong["pong"], std::process::id());

        let echo = hooks.handle_request(&request("anything")).await;
        assert_eq!(echo["echo"], json!({ "q": 1 }));
    }
}
