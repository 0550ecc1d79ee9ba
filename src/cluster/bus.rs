//! Worker-side request helpers.
//!
//! Application code running in a worker uses a [`MessageBus`] to ask its
//! siblings questions. Each call registers a correlation id, sends one
//! `request` to the primary and suspends until the matching answer, an
//! `error`, or the request timeout.

use super::ProcessRole;
use super::ipc::Channel;
use super::protocol::{DEFAULT_TOPIC, Message, Outcome, Request, generate_message_id};
use super::registry::{CorrelationRegistry, REQUEST_TIMEOUT};
use super::shutdown::ShutdownState;
use crate::error::{ClusterError, NO_RESPONSE_REASON, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Identity of the worker process a bus belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// Ordinal assigned by the primary, starting at 1.
    pub id: usize,
    /// OS process id.
    pub pid: u32,
}

struct WorkerLink {
    identity: WorkerIdentity,
    primary: Channel,
    pending: CorrelationRegistry<String, Value>,
    state: ShutdownState,
}

/// Handle for issuing requests to sibling workers.
///
/// Cheap to clone. A bus created outside a worker ([`MessageBus::detached`])
/// refuses every request immediately.
#[derive(Clone)]
pub struct MessageBus {
    role: ProcessRole,
    timeout: Duration,
    link: Option<Arc<WorkerLink>>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("role", &self.role)
            .field("worker", &self.link.as_ref().map(|l| l.identity))
            .finish()
    }
}

impl MessageBus {
    /// Bus for a worker talking to the primary over `primary`.
    pub fn worker(
        identity: WorkerIdentity,
        primary: Channel,
        pending: CorrelationRegistry<String, Value>,
        state: ShutdownState,
    ) -> Self {
        Self {
            role: ProcessRole::Worker,
            timeout: REQUEST_TIMEOUT,
            link: Some(Arc::new(WorkerLink {
                identity,
                primary,
                pending,
                state,
            })),
        }
    }

    /// Bus for a process that has no primary to talk to.
    pub fn detached(role: ProcessRole) -> Self {
        Self {
            role,
            timeout: REQUEST_TIMEOUT,
            link: None,
        }
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// The owning worker's identity, `None` outside a worker.
    pub fn identity(&self) -> Option<WorkerIdentity> {
        self.link.as_ref().map(|l| l.identity)
    }

    /// Ask every other live worker and collect one [`Outcome`] per sibling.
    ///
    /// Siblings that did not answer within the relay budget appear as
    /// rejected outcomes; the call itself only fails if the primary could
    /// not run the fan-out at all.
    pub async fn send_and_await_all(&self, topic: Option<&str>, payload: Value) -> Result<Vec<Outcome>> {
        let answer = self.roundtrip(topic, payload, None).await?;
        Ok(serde_json::from_value(answer)?)
    }

    /// Ask the worker with `target_pid` and return its answer.
    pub async fn send_and_await_one(
        &self,
        topic: Option<&str>,
        payload: Value,
        target_pid: u32,
    ) -> Result<Value> {
        let answer = self.roundtrip(topic, payload, Some(target_pid)).await?;
        match serde_json::from_value::<Outcome>(answer)? {
            Outcome::Fulfilled { message, .. } => Ok(message),
            Outcome::Rejected { reason, .. } if reason == NO_RESPONSE_REASON => {
                Err(ClusterError::NoResponse)
            }
            Outcome::Rejected { reason, .. } => Err(ClusterError::Remote(Value::String(reason))),
        }
    }

    async fn roundtrip(&self, topic: Option<&str>, payload: Value, receiver_pid: Option<u32>) -> Result<Value> {
        let Some(link) = &self.link else {
            return Err(ClusterError::NotAWorker {
                role: self.role.as_str(),
            });
        };

        let id = generate_message_id(link.identity.id);
        let pending = link.pending.register(id.clone(), self.timeout)?;
        let request = Request {
            id: id.clone(),
            sender_pid: link.identity.pid,
            receiver_pid,
            topic: topic.unwrap_or(DEFAULT_TOPIC).to_string(),
            payload,
        };
        link.primary
            .send_lenient(Message::Request(request), link.state.is_shutting_down())?;
        tracing::trace!(%id, ?receiver_pid, "Request sent to primary");

        pending.wait().await
    }
}
