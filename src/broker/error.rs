//! Error types for broker operations

use thiserror::Error;

/// Result type alias for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors that can occur while talking to the message broker
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    ConnectionFailed(String),

    /// The session was closed or lost; operations on it fail fast
    #[error("broker connection is closed")]
    ConnectionClosed,

    #[error("queue declaration failed: {0}")]
    DeclareFailed(String),

    #[error("failed to publish message: {0}")]
    PublishFailed(String),

    #[error("failed to subscribe to queue: {0}")]
    SubscribeFailed(String),

    #[error("failed to acknowledge message: {0}")]
    AckFailed(String),

    #[error("failed to serialize batch: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("gave up connecting to broker after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("broker operation cancelled by shutdown")]
    Cancelled,

    #[error("broker protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Whether the error means the session can no longer be used
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionClosed | BrokerError::Protocol(_)
        )
    }
}
