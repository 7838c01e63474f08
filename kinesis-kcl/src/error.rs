//! Error types shared by the checkpointer, the consumers and the worker.

use thiserror::Error;

/// Result type for lease coordination and consumption.
pub type Result<T> = std::result::Result<T, KclError>;

/// Errors raised while coordinating leases or consuming shards.
#[derive(Debug, Error)]
pub enum KclError {
    /// A conditional lease write lost against another writer, or the
    /// lease is held by a different worker.
    #[error("lease lost for shard {shard_id}")]
    LeaseLost { shard_id: String },

    /// The shard iterator used for a read is no longer valid.
    #[error("shard iterator expired: {message}")]
    ExpiredIterator { message: String },

    /// Any other failure talking to the stream service.
    #[error("stream service error during {operation}: {message}")]
    Stream {
        operation: &'static str,
        message: String,
    },

    /// The lease store failed or is unavailable.
    #[error("lease store error during {operation}: {message}")]
    Store {
        operation: &'static str,
        message: String,
    },

    /// A checkpoint was refused.
    #[error("checkpoint rejected for shard {shard_id}: {reason}")]
    InvalidCheckpoint {
        shard_id: String,
        reason: String,
    },

    /// The application's record processor returned an error.
    #[error("record processor failed for shard {shard_id}")]
    Processor {
        shard_id: String,
        source: anyhow::Error,
    },

    /// A consumer task panicked.
    #[error("consumer task aborted: {message}")]
    TaskAborted { message: String },

    /// Configuration is unusable.
    #[error("invalid configuration: {message}")]
    Config { message: String },
}

impl KclError {
    pub(crate) fn lease_lost(shard_id: impl Into<String>) -> Self {
        Self::LeaseLost {
            shard_id: shard_id.into(),
        }
    }

    pub(crate) fn store(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Store {
            operation,
            message: err.to_string(),
        }
    }

    pub(crate) fn stream(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Stream {
            operation,
            message: err.to_string(),
        }
    }

    /// Returns true for errors that mean this worker no longer owns the shard.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, Self::LeaseLost { .. })
    }

    /// Returns true for an expired shard iterator.
    pub fn is_expired_iterator(&self) -> bool {
        matches!(self, Self::ExpiredIterator { .. })
    }
}
