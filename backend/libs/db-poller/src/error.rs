//! Error types for the database poller library.

use thiserror::Error;

/// Result type alias for poller operations.
pub type PollerResult<T> = Result<T, PollerError>;

/// Delivery failure codes meaning the message can never fit on the stream.
pub const OVERSIZED_CODES: [&str; 2] = ["msg_size_too_large", "invalid_msg_size"];

/// One message the stream refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailure {
    /// Position of the message in the published page
    pub index: usize,
    /// Transport cause code, e.g. `msg_size_too_large`
    pub code: String,
    pub reason: String,
}

/// Failure to hand a page of messages to the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Some messages were not delivered
    #[error("{} of the page's messages failed to publish", failures.len())]
    Partial { failures: Vec<PublishFailure> },

    /// The transport could not be used at all
    #[error("Transport error: {0}")]
    Transport(String),
}

impl PublishError {
    /// Whether any message failed because of its size.
    pub fn is_oversized(&self) -> bool {
        match self {
            PublishError::Partial { failures } => failures
                .iter()
                .any(|f| OVERSIZED_CODES.contains(&f.code.as_str())),
            PublishError::Transport(_) => false,
        }
    }
}

/// Errors that can occur while polling and republishing rows.
#[derive(Error, Debug)]
pub enum PollerError {
    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Publishing a page failed
    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    /// A row could not be turned into a message
    #[error("Encode error: {0}")]
    Encode(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic error with context
    #[error("Poller error: {0}")]
    Other(#[from] anyhow::Error),
}

impl PollerError {
    pub fn is_oversized(&self) -> bool {
        matches!(self, PollerError::Publish(e) if e.is_oversized())
    }
}
