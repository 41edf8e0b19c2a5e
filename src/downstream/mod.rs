//! Downstream log contract
//!
//! The downstream broker is an external collaborator; only its publish
//! surface appears here. `publish` is the blocking equivalent of sending and
//! waiting on the acknowledgement future: it returns once the log has
//! acknowledged the record or the timeout elapses. The key→partition
//! mapping is stable, so records published under one key arrive in order.

pub mod memory;

use std::time::Duration;

use thiserror::Error;

pub use memory::InMemoryEventLog;

/// Failure modes of a publish, split along the line that matters: poison
/// errors will never succeed on retry, system errors might.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("serializer rejected record: {0}")]
    Serialization(String),
    #[error("record too large: {0} bytes")]
    RecordTooLarge(usize),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("acknowledgement timed out after {0:?}")]
    AckTimeout(Duration),
    #[error("broker unavailable: {0}")]
    Broker(String),
    #[error("publisher shut down")]
    Shutdown,
    #[error("downstream error: {0}")]
    Other(String),
}

impl PublishError {
    /// Poison means permanently rejected: retrying the same bytes can never
    /// succeed. Anything not enumerated here is treated as transient.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            Self::Serialization(_) | Self::RecordTooLarge(_) | Self::InvalidRecord(_)
        )
    }
}

/// Publish surface of the downstream log.
pub trait EventLog: Send + Sync {
    fn publish(&self, key: &str, payload: &[u8], timeout: Duration) -> Result<(), PublishError>;
}
