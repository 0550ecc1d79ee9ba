//! Wire protocol exchanged between the primary and its workers.
//!
//! Messages are JSON-serialized and newline-delimited, tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic used when the caller does not name one.
pub const DEFAULT_TOPIC: &str = "websocket";

/// A request travelling worker → primary → sibling(s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, see [`generate_message_id`].
    pub id: String,
    /// Pid of the worker that issued the request.
    #[serde(rename = "senderPID")]
    pub sender_pid: u32,
    /// Target worker pid; `None` broadcasts to every other worker.
    #[serde(rename = "receiverPID", default)]
    pub receiver_pid: Option<u32>,
    /// Application-level routing key.
    pub topic: String,
    /// Opaque request body.
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    /// Whether this request fans out to all siblings.
    pub fn is_broadcast(&self) -> bool {
        self.receiver_pid.is_none()
    }
}

/// Unit of IPC between the primary and a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "request")]
    Request(Request),

    /// Successful answer. `pid` is the process that produced it: the answering
    /// sibling on the way in, the primary when relayed back to the origin.
    #[serde(rename = "response")]
    Response {
        id: String,
        pid: u32,
        #[serde(default)]
        message: Value,
    },

    /// Failed relay, carrying the failure body.
    #[serde(rename = "error")]
    Error {
        id: String,
        pid: u32,
        #[serde(default)]
        message: Value,
    },

    /// Worker finished booting and is serving.
    #[serde(rename = "boot_complete")]
    BootComplete,

    /// Primary asks exactly one worker to produce the route manifest.
    #[serde(rename = "generateManifest")]
    GenerateManifest,

    /// Primary asks a worker to shut down.
    #[serde(rename = "shutdown")]
    Shutdown,
}

impl Message {
    /// Build a response envelope.
    pub fn response(id: impl Into<String>, pid: u32, message: Value) -> Self {
        Self::Response {
            id: id.into(),
            pid,
            message,
        }
    }

    /// Build an error envelope.
    pub fn error(id: impl Into<String>, pid: u32, message: Value) -> Self {
        Self::Error {
            id: id.into(),
            pid,
            message,
        }
    }

    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::BootComplete => "boot_complete",
            Self::GenerateManifest => "generateManifest",
            Self::Shutdown => "shutdown",
        }
    }

    /// Correlation id, for the variants that carry one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response { id, .. } | Self::Error { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

/// One sibling's contribution to a broadcast.
///
/// The aggregated broadcast answer is a list of these, one per sibling that was
/// live when the request fanned out, each tagged with the sibling's pid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Fulfilled {
        pid: u32,
        #[serde(default)]
        message: Value,
    },
    Rejected {
        pid: u32,
        reason: String,
    },
}

impl Outcome {
    /// Pid of the sibling this outcome belongs to.
    pub fn pid(&self) -> u32 {
        match self {
            Self::Fulfilled { pid, .. } | Self::Rejected { pid, .. } => *pid,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled { .. })
    }
}

/// Generate a correlation id of the form `{workerId}-{unixMillis}-{uuid}`.
pub fn generate_message_id(worker_id: usize) -> String {
    let timestamp = chrono::Utc::now().timestamp_millis();
    format!("{}-{}-{}", worker_id, timestamp, uuid::Uuid::new_v4())
}
