//! Single-process mode: no workers, no relay.

use super::ProcessRole;
use super::bus::MessageBus;
use super::shutdown::{ShutdownCoordinator, ShutdownReport, wind_down};
use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};
use crate::hooks::ServiceHooks;
use std::sync::Arc;
use tracing::info;

/// Boot, serve until a shutdown trigger, then stop and drain.
///
/// The bus handed to `start_server` refuses every request, as there are no
/// siblings to ask.
pub async fn run_standalone(
    config: &ClusterConfig,
    hooks: Arc<dyn ServiceHooks>,
    mut coordinator: ShutdownCoordinator,
) -> Result<ShutdownReport> {
    hooks
        .boot(ProcessRole::Primary)
        .await
        .map_err(|e| ClusterError::Boot(e.to_string()))?;
    hooks
        .start_server(MessageBus::detached(ProcessRole::Primary))
        .await?;
    info!(
        port = ?config.port,
        pid = std::process::id(),
        operation = "BOOT",
        index_prefix = "SYSTEM",
        "Server is running in standalone mode"
    );

    let trigger = coordinator.next_trigger().await;
    let drained = wind_down(&*hooks, config.worker_shutdown_timeout).await;
    Ok(ShutdownReport {
        trigger,
        forced: drained.is_none(),
        drained: drained.unwrap_or(false),
    })
}
