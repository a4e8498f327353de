//! Error types for faultline-aggregator.

use faultline_state::{KvError, LockError, QueueError, StateError};

/// Result type alias using [`AggregatorError`].
pub type Result<T, E = AggregatorError> = std::result::Result<T, E>;

/// Errors raised while ingesting, aggregating or reading error reports.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    /// A report failed validation and will never succeed as-is.
    #[error("invalid report: {0}")]
    InvalidReport(String),

    /// Aggregate not found.
    #[error("aggregate not found: {0}")]
    AggregateNotFound(String),

    /// Keyed cache error.
    #[error("cache error: {0}")]
    Cache(#[from] KvError),

    /// Work queue error.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Advisory lock error.
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// State backend wiring error.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Database error.
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AggregatorError {
    /// Create an invalid report error.
    #[must_use]
    pub fn invalid_report(msg: impl Into<String>) -> Self {
        Self::InvalidReport(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same input could succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidReport(_))
    }
}

impl From<serde_json::Error> for AggregatorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialisation(e.to_string())
    }
}

impl From<figment::Error> for AggregatorError {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}
