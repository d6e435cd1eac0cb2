//! Error types for the batch consumer library.

use thiserror::Error;

/// Result type alias for batch consumption operations.
pub type BatchResult<T> = Result<T, BatchError>;

/// SQLSTATE for serialization_failure. Only a new transaction can get past it.
const SERIALIZATION_FAILURE: &str = "40001";

/// PostgreSQL SQLSTATE codes treated as transient lock contention.
///
/// - `40P01`: deadlock_detected
/// - `55P03`: lock_not_available
const LOCK_CONFLICT_SQLSTATES: [&str; 2] = ["40P01", "55P03"];

/// Failure to turn raw bytes into a key or payload value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to decode {part} at offset {offset:?}: {reason}")]
pub struct DecodeError {
    /// Which part of the message failed ("key" or "payload")
    pub part: &'static str,
    /// Offset of the message in its partition, when known
    pub offset: Option<i64>,
    /// Decoder-specific description
    pub reason: String,
}

impl DecodeError {
    pub fn new(part: &'static str, reason: impl Into<String>) -> Self {
        Self {
            part,
            offset: None,
            reason: reason.into(),
        }
    }

    pub fn at_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Errors that can occur while consuming and persisting a batch.
#[derive(Error, Debug)]
pub enum BatchError {
    /// Malformed key or payload; fatal for the whole batch
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Transient lock contention (deadlock, lock timeout)
    #[error("Persistence conflict: {0}")]
    PersistenceConflict(String),

    /// Serialization failure; the whole transaction has to be retried
    #[error("Serialization failure: {0}")]
    SerializationFailure(String),

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Non-database store failure
    #[error("Store error: {0}")]
    Store(String),

    /// A record could not be mapped to table attributes
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The handler does not provide `consume_batch`
    #[error("consume_batch is not implemented for handler {0}")]
    NotImplemented(String),

    /// Kafka client failure
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl BatchError {
    /// Check if the error is transient contention that a fresh transaction may resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BatchError::PersistenceConflict(_) | BatchError::SerializationFailure(_)
        )
    }

    /// Check if the conflict can be retried from a savepoint inside the same transaction.
    pub fn is_savepoint_retryable(&self) -> bool {
        matches!(self, BatchError::PersistenceConflict(_))
    }

    /// Short label used as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::Decode(_) => "decode",
            BatchError::PersistenceConflict(_) => "conflict",
            BatchError::SerializationFailure(_) => "serialization",
            BatchError::Database(_) => "database",
            BatchError::Store(_) => "store",
            BatchError::InvalidRecord(_) => "invalid_record",
            BatchError::Config(_) => "config",
            BatchError::NotImplemented(_) => "not_implemented",
            BatchError::Kafka(_) => "kafka",
            BatchError::Other(_) => "other",
        }
    }
}

impl From<sqlx::Error> for BatchError {
    fn from(err: sqlx::Error) -> Self {
        let code = err
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .map(|code| code.into_owned());

        match code.as_deref() {
            Some(SERIALIZATION_FAILURE) => BatchError::SerializationFailure(err.to_string()),
            Some(code) if LOCK_CONFLICT_SQLSTATES.contains(&code) => {
                BatchError::PersistenceConflict(err.to_string())
            }
            _ => BatchError::Database(err),
        }
    }
}
