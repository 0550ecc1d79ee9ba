//! Error types for clusterbus.

use thiserror::Error;

/// Reason attached to every correlation timeout.
pub const NO_RESPONSE_REASON: &str = "No response was received!";

/// Message relayed when a unicast target has no live worker.
pub const UNAVAILABLE_REASON: &str = "The requested process is unavailable";

/// Main error type for clusterbus.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Invalid worker, message tried to be sent through the {role} process.")]
    NotAWorker { role: &'static str },

    #[error("{}", NO_RESPONSE_REASON)]
    NoResponse,

    #[error("{}", UNAVAILABLE_REASON)]
    Unavailable,

    #[error("Remote error: {0}")]
    Remote(serde_json::Value),

    #[error("Correlation id {0} is already pending")]
    DuplicateCorrelation(String),

    #[error("Channel to {0} is closed")]
    ChannelClosed(String),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Boot failed: {0}")]
    Boot(String),

    #[error("{operation} failed: {message}")]
    Hook {
        operation: &'static str,
        message: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClusterError {
    /// Create a hook failure.
    pub fn hook(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Hook {
            operation,
            message: message.into(),
        }
    }

    /// Whether this error came from writing to a pipe whose reader is gone.
    ///
    /// These are expected while shutting down and are swallowed there.
    pub fn is_closed_pipe(&self) -> bool {
        match self {
            Self::ChannelClosed(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::BrokenPipe,
            _ => false,
        }
    }

    /// Whether this is a correlation timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::NoResponse)
    }

    /// Render the error as the JSON body carried by an `error` message.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Self::Remote(value) => value.clone(),
            Self::NoResponse => serde_json::json!({ "reason": NO_RESPONSE_REASON }),
            other => serde_json::Value::String(other.to_string()),
        }
    }

    /// Rebuild an error from the body of an `error` message.
    pub fn from_wire(body: serde_json::Value) -> Self {
        match body.as_str() {
            Some(UNAVAILABLE_REASON) => Self::Unavailable,
            Some(NO_RESPONSE_REASON) => Self::NoResponse,
            _ if body.get("reason").and_then(|r| r.as_str()) == Some(NO_RESPONSE_REASON) => {
                Self::NoResponse
            }
            _ => Self::Remote(body),
        }
    }
}

/// Result type alias for clusterbus operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
