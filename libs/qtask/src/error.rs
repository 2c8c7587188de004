//! Error types for the queue runtime.
//!
//! `QTaskError` covers the four propagation classes the runtime
//! distinguishes: configuration errors (fatal at construction or
//! registration), connectivity errors (logged and retried with backoff),
//! protocol errors (trigger idempotent re-creation), and handler errors
//! (suppress the ack so the entry is reclaimed later).

use thiserror::Error;

/// Errors that can occur in the queue runtime.
#[derive(Error, Debug)]
pub enum QTaskError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration (total partitions, endpoint, assignment).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required argument was missing or empty.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted before `connect()` or after `stop()`.
    #[error("Not connected to the stream store")]
    NotConnected,

    /// Partition index outside `[0, total_partitions)`.
    #[error("Invalid partition index {index} for {total} partitions")]
    InvalidPartitionIndex { index: u32, total: u32 },

    /// Consumer group creation or lookup error.
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// A stream entry could not be reconstructed into a message.
    #[error("Message parsing error: {0}")]
    MessageParsing(String),

    /// Failure surfaced by a user handler.
    #[error("Handler error: {0}")]
    Handler(String),
}

impl QTaskError {
    /// Check if this is a connection-level error that should be retried
    /// with backoff rather than treated as fatal.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
                    return true;
                }
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
            }
            _ => false,
        }
    }

    /// Check if the consumer group or stream is missing (NOGROUP).
    pub fn is_nogroup_error(&self) -> bool {
        match self {
            Self::Redis(e) => e.to_string().contains("NOGROUP"),
            Self::ConsumerGroup(s) => s.contains("NOGROUP"),
            _ => false,
        }
    }

    /// Check if this is an XREADGROUP BLOCK timeout. The driver reports
    /// the elapsed block as a timeout even though it is the normal
    /// "no new entries" outcome.
    pub fn is_block_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                if e.is_timeout() {
                    return true;
                }
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timed out") && !err_str.contains("connection")
            }
            _ => false,
        }
    }

    /// Check if the store rejected this client's credentials.
    ///
    /// Connectivity errors heal with backoff and protocol errors heal
    /// with re-creation; a credential rejection heals with neither, so
    /// the read loop treats it as fatal.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Self::Redis(e) if e.kind() == redis::ErrorKind::AuthenticationFailed
        )
    }

    /// Check if the server rejected a command it does not know.
    /// XAUTOCLAIM only exists from the 6.2 server generation onward.
    pub fn is_unsupported_command(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("unknown command") || err_str.contains("err unknown")
            }
            _ => false,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, QTaskError>;
