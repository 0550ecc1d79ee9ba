//! Primary-side relay of worker requests to their siblings.
//!
//! A request without `receiverPID` fans out to every other live worker and
//! the origin gets back one `response` listing an [`Outcome`] per sibling. A
//! request with `receiverPID` goes to that worker only and the origin gets
//! back a `response` carrying that single [`Outcome`], or an `error` if the
//! target is not live.

use super::ipc::Channel;
use super::protocol::{Message, Outcome, Request};
use super::registry::{CorrelationRegistry, PendingResponse, RELAY_TIMEOUT};
use super::shutdown::ShutdownState;
use crate::error::{ClusterError, Result};
use futures::future::join_all;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Relay entries are keyed per sibling so one broadcast id can be pending at
/// several siblings at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelayKey {
    pub id: String,
    pub pid: u32,
}

/// Lookup of live workers, implemented by the supervisor.
pub trait PeerDirectory {
    /// Every live worker except `except`, in a stable order.
    fn live_peers(&self, except: u32) -> Vec<(u32, Channel)>;

    /// The channel of the live worker with `pid`.
    fn lookup(&self, pid: u32) -> Option<Channel>;
}

/// Relay table owned by the primary.
pub struct Router {
    registry: CorrelationRegistry<RelayKey, Value>,
    primary_pid: u32,
    relay_timeout: Duration,
    state: ShutdownState,
}

impl Router {
    pub fn new(primary_pid: u32, state: ShutdownState) -> Self {
        Self {
            registry: CorrelationRegistry::new(),
            primary_pid,
            relay_timeout: RELAY_TIMEOUT,
            state,
        }
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }

    /// Number of sibling answers still outstanding.
    pub fn pending(&self) -> usize {
        self.registry.len()
    }

    /// Relay `request`, which arrived on `origin` from the worker `origin_pid`.
    ///
    /// Returns once every fan-out message is queued; collection happens on a
    /// spawned task so the caller's message loop keeps running.
    #[instrument(level = "debug", skip_all, fields(id = %request.id, origin = origin_pid))]
    pub fn dispatch(&self, origin_pid: u32, origin: Channel, request: Request, peers: &dyn PeerDirectory) {
        if request.sender_pid != origin_pid {
            debug!(claimed = request.sender_pid, origin_pid, "senderPID differs from the origin channel");
        }
        match request.receiver_pid {
            None => self.broadcast(origin_pid, origin, request, peers),
            Some(target) => self.unicast(origin, request, target, peers),
        }
    }

    fn broadcast(&self, origin_pid: u32, origin: Channel, request: Request, peers: &dyn PeerDirectory) {
        let id = request.id.clone();
        let waits = match self.fan_out(origin_pid, &request, peers) {
            Ok(waits) => waits,
            Err(e) => {
                warn!(%id, error = %e, "Broadcast fan-out failed");
                self.reply(&origin, Message::error(id, self.primary_pid, e.to_wire()));
                return;
            }
        };
        debug!(%id, siblings = waits.len(), "Broadcast fanned out");

        let primary_pid = self.primary_pid;
        let state = self.state.clone();
        tokio::spawn(async move {
            let outcomes = join_all(waits.into_iter().map(|(pid, pending)| collect(pid, pending))).await;
            let reply = match serde_json::to_value(&outcomes) {
                Ok(message) => Message::response(id, primary_pid, message),
                Err(e) => Message::error(id, primary_pid, ClusterError::from(e).to_wire()),
            };
            send_reply(&origin, reply, &state);
        });
    }

    /// Register and send one relay per sibling of `origin_pid`. A sibling
    /// whose send fails is settled right away with the transport error.
    fn fan_out(
        &self,
        origin_pid: u32,
        request: &Request,
        peers: &dyn PeerDirectory,
    ) -> Result<Vec<(u32, PendingResponse<RelayKey, Value>)>> {
        let siblings = peers.live_peers(origin_pid);
        let mut waits = Vec::with_capacity(siblings.len());
        for (pid, channel) in siblings {
            let key = RelayKey {
                id: request.id.clone(),
                pid,
            };
            let pending = self.registry.register(key, self.relay_timeout)?;
            if let Err(e) = channel.send(Message::Request(request.clone())) {
                warn!(pid, error = %e, "Failed to relay request to sibling");
                self.registry.reject(pending.key(), e);
            }
            waits.push((pid, pending));
        }
        Ok(waits)
    }

    fn unicast(&self, origin: Channel, request: Request, target: u32, peers: &dyn PeerDirectory) {
        let id = request.id.clone();
        let Some(channel) = peers.lookup(target) else {
            debug!(%id, target, "Unicast target is not live");
            self.reply(
                &origin,
                Message::error(id, self.primary_pid, ClusterError::Unavailable.to_wire()),
            );
            return;
        };

        let key = RelayKey {
            id: id.clone(),
            pid: target,
        };
        let pending = match self.registry.register(key, self.relay_timeout) {
            Ok(pending) => pending,
            Err(e) => {
                self.reply(&origin, Message::error(id, self.primary_pid, e.to_wire()));
                return;
            }
        };
        if let Err(e) = channel.send(Message::Request(request)) {
            warn!(%id, target, error = %e, "Failed to relay request to target");
            drop(pending);
            self.reply(&origin, Message::error(id, self.primary_pid, e.to_wire()));
            return;
        }

        let primary_pid = self.primary_pid;
        let state = self.state.clone();
        tokio::spawn(async move {
            let outcome = collect(target, pending).await;
            let reply = match serde_json::to_value(&outcome) {
                Ok(message) => Message::response(id, primary_pid, message),
                Err(e) => Message::error(id, primary_pid, ClusterError::from(e).to_wire()),
            };
            send_reply(&origin, reply, &state);
        });
    }

    /// A sibling answered. Returns `false` if nothing was waiting on it.
    pub fn settle(&self, pid: u32, id: &str, message: Value) -> bool {
        self.registry.resolve(
            &RelayKey {
                id: id.to_string(),
                pid,
            },
            message,
        )
    }

    /// A sibling sent an `error` message. Relays only settle on a `response`,
    /// so the entry stays pending until an answer or its timeout.
    ///
    /// Returns whether a relay towards `pid` is still waiting on `id`.
    pub fn ignore_error(&self, pid: u32, id: &str) -> bool {
        self.registry.contains(&RelayKey {
            id: id.to_string(),
            pid,
        })
    }

    fn reply(&self, origin: &Channel, message: Message) {
        send_reply(origin, message, &self.state);
    }
}

async fn collect(pid: u32, pending: PendingResponse<RelayKey, Value>) -> Outcome {
    match pending.wait().await {
        Ok(message) => Outcome::Fulfilled { pid, message },
        Err(e) => Outcome::Rejected {
            pid,
            reason: e.to_string(),
        },
    }
}

fn send_reply(origin: &Channel, message: Message, state: &ShutdownState) {
    if let Err(e) = origin.send_lenient(message, state.is_shutting_down()) {
        warn!(peer = origin.label(), error = %e, "Failed to relay answer to origin");
    }
}
