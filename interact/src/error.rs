//! Error types surfaced by handlers, clients and the actor.

use std::time::Duration;

use crate::broker::BrokerError;
use crate::envelope::FieldError;

/// Error type returned by application callbacks.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Why an actor refused to start under its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartConflict {
    /// A fully running peer answered the self-probe.
    Running,
    /// Another instance was launching under the same id during the race window.
    Launching,
}

impl std::fmt::Display for StartConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartConflict::Running => write!(f, "an actor with the same id is already running"),
            StartConflict::Launching => {
                write!(f, "another actor with the same id is launching")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InteractError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to subscribe: {0}")]
    Subscription(#[source] BrokerError),

    #[error("Failed to send message: {0}")]
    Send(String),

    #[error("Message to queue '{queue}' could not be routed")]
    Routing { queue: String },

    #[error("Message to queue '{queue}' was rejected by the broker")]
    Nack { queue: String },

    #[error("No reply from '{target}' within {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Remote handler failed: {0}")]
    Handling(String),

    #[error("Validation failed: {0}")]
    Validation(FieldError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Actor '{id}' already started: {conflict}")]
    AlreadyStarted { id: String, conflict: StartConflict },

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

impl InteractError {
    /// Maps a transport failure during publishing. A lost connection keeps its own kind.
    pub(crate) fn sending(err: BrokerError) -> Self {
        match err {
            BrokerError::ConnectionClosed(reason) => InteractError::ConnectionClosed(reason),
            other => InteractError::Send(other.to_string()),
        }
    }
}
