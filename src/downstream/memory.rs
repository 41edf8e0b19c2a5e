//! In-process downstream log
//!
//! Append-only partitions keyed by the publish key, acknowledging
//! synchronously. Backs the local harness and the test suite; the partition
//! contents let callers assert per-key receive order and byte equality.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::{EventLog, PublishError};

/// Upper bound on a single record, mirroring a broker-side limit
const MAX_RECORD_BYTES: usize = 1 << 20;

#[derive(Default)]
pub struct InMemoryEventLog {
    partitions: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    published: AtomicU64,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records published under `key`, in receive order.
    pub fn partition(&self, key: &str) -> Vec<Vec<u8>> {
        self.partitions
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl EventLog for InMemoryEventLog {
    fn publish(&self, key: &str, payload: &[u8], _timeout: Duration) -> Result<(), PublishError> {
        if key.is_empty() {
            return Err(PublishError::InvalidRecord("empty partition key".into()));
        }
        if payload.is_empty() {
            return Err(PublishError::InvalidRecord("empty payload".into()));
        }
        if payload.len() > MAX_RECORD_BYTES {
            return Err(PublishError::RecordTooLarge(payload.len()));
        }

        self.partitions
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(payload.to_vec());
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(key, bytes = payload.len(), "record acknowledged");
        Ok(())
    }
}
