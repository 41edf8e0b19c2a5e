//! Batch persister
//!
//! The layered write path between the buffer and the store: batch
//! transaction, then per-item fallback, then DLQ, then a hex dump to a local
//! file. Each layer keeps the stream moving when the layer above cannot.
//! Only after a message is durable somewhere does the stream cursor advance
//! past it.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::models::PendingMessage;
use crate::store::circuit::CircuitBreaker;
use crate::store::{SafeStore, StoreError};
use crate::stream::source::OffsetManager;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("database circuit open")]
    CircuitOpen,
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct BatchPersister {
    store: Arc<SafeStore>,
    breaker: Arc<CircuitBreaker>,
    offsets: Arc<OffsetManager>,
    fallback_log: PathBuf,
}

impl BatchPersister {
    pub fn new(
        store: Arc<SafeStore>,
        breaker: Arc<CircuitBreaker>,
        offsets: Arc<OffsetManager>,
        fallback_log: PathBuf,
    ) -> Self {
        Self {
            store,
            breaker,
            offsets,
            fallback_log,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Write the whole batch under one transaction.
    pub fn persist_batch(&self, batch: &[PendingMessage]) -> Result<(), PersistError> {
        if !self.breaker.try_acquire() {
            return Err(PersistError::CircuitOpen);
        }
        match self.store.insert_batch(batch) {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e.into())
            }
        }
    }

    /// Write one message in its own transaction.
    pub fn persist_single(&self, msg: &PendingMessage) -> Result<(), PersistError> {
        if !self.breaker.try_acquire() {
            return Err(PersistError::CircuitOpen);
        }
        match self.store.insert_single(msg) {
            Ok(()) => {
                self.breaker.record_success();
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e.into())
            }
        }
    }

    /// Route one message to the DLQ, its own transaction. A DLQ write that
    /// itself fails falls through to a hex dump on local disk and returns
    /// quietly; the cursor must still be able to advance past the message.
    pub fn save_to_dlq(&self, msg: &PendingMessage, reason: &str) {
        if let Err(e) = self.store.insert_dlq(&msg.raw, reason) {
            error!(error = %e, reason, "CRITICAL: DLQ write failed, dumping payload to fallback log");
            self.dump_to_fallback(&msg.raw, reason);
        }
    }

    /// The full layered write path for one batch. Returns `Err` only on a
    /// circuit-open, which the caller answers by pausing the stream and
    /// retrying the same batch; every other failure is resolved internally.
    pub fn persist_with_fallback(&self, batch: &[PendingMessage]) -> Result<(), PersistError> {
        if batch.is_empty() {
            return Ok(());
        }

        match self.persist_batch(batch) {
            Ok(()) => {
                self.commit_through(batch.iter().map(|m| m.offset).max());
                return Ok(());
            }
            Err(PersistError::CircuitOpen) => return Err(PersistError::CircuitOpen),
            Err(PersistError::Store(e)) => {
                warn!(error = %e, batch = batch.len(), "batch persist failed, falling back to per-item path");
            }
        }

        let mut last_completed: Option<i64> = None;
        for msg in batch {
            match self.persist_single(msg) {
                Ok(()) => {
                    last_completed = Self::later(last_completed, msg.offset);
                }
                Err(PersistError::CircuitOpen) => {
                    self.commit_through(last_completed);
                    return Err(PersistError::CircuitOpen);
                }
                Err(PersistError::Store(e)) if e.is_integrity() => {
                    self.save_to_dlq(msg, &format!("persist rejected: {e}"));
                    last_completed = Self::later(last_completed, msg.offset);
                }
                Err(PersistError::Store(e)) => {
                    error!(offset = msg.offset, error = %e, "transient failure in per-item path, leaving remainder for redelivery");
                    break;
                }
            }
        }

        self.commit_through(last_completed);
        Ok(())
    }

    /// Advance the cursor, skipping the replay sentinel.
    fn commit_through(&self, offset: Option<i64>) {
        if let Some(offset) = offset.filter(|&o| o >= 0) {
            self.offsets.commit(offset);
        }
    }

    fn later(current: Option<i64>, offset: i64) -> Option<i64> {
        if offset < 0 {
            return current;
        }
        Some(current.map_or(offset, |c| c.max(offset)))
    }

    fn dump_to_fallback(&self, raw: &[u8], reason: &str) {
        let line = format!(
            "{} {} {}\n",
            Utc::now().to_rfc3339(),
            reason.replace(char::is_whitespace, "_"),
            hex::encode(raw)
        );
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.fallback_log)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        match result {
            Ok(()) => debug!(path = %self.fallback_log.display(), "payload dumped to fallback log"),
            Err(e) => error!(error = %e, "LOST MESSAGE: fallback log write failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::models::{DecodedTrade, Side};
    use crate::stream::source::LoopbackFeed;
    use crate::stream::wire;
    use uuid::Uuid;

    fn persister_with_feed() -> (BatchPersister, Arc<LoopbackFeed>, Arc<SafeStore>) {
        let store = Arc::new(SafeStore::open_in_memory().unwrap());
        let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
        let offsets = Arc::new(OffsetManager::new());
        let feed = Arc::new(LoopbackFeed::new());
        offsets.register(feed.clone());
        let persister = BatchPersister::new(
            store.clone(),
            breaker,
            offsets,
            std::env::temp_dir().join("persister_test_fallback.log"),
        );
        (persister, feed, store)
    }

    fn valid_msg(offset: i64) -> PendingMessage {
        let trade = DecodedTrade {
            portfolio_id: Uuid::new_v4(),
            trade_id: Uuid::new_v4(),
            symbol: "AMZN".into(),
            side: Side::Sell,
            price_per_stock: 181.0,
            quantity: 7,
            event_timestamp: Utc::now(),
        };
        let raw = wire::encode(&trade).unwrap();
        PendingMessage::valid(trade, raw, offset)
    }

    #[test]
    fn success_advances_cursor_to_last_offset() {
        let (persister, feed, store) = persister_with_feed();
        let batch: Vec<_> = (10..13).map(valid_msg).collect();

        persister.persist_with_fallback(&batch).unwrap();

        assert_eq!(feed.committed(), Some(12));
        assert_eq!(store.snapshot().unwrap().outbox_pending, 3);
    }

    #[test]
    fn replay_sentinel_never_commits_the_cursor() {
        let (persister, feed, _store) = persister_with_feed();
        let batch = vec![valid_msg(crate::models::REPLAY_OFFSET)];

        persister.persist_with_fallback(&batch).unwrap();
        assert_eq!(feed.committed(), None);
    }

    #[test]
    fn circuit_open_propagates_without_touching_cursor() {
        let (persister, feed, store) = persister_with_feed();
        persister.breaker().trip();

        let batch = vec![valid_msg(5)];
        assert!(matches!(
            persister.persist_with_fallback(&batch),
            Err(PersistError::CircuitOpen)
        ));
        assert_eq!(feed.committed(), None);
        assert_eq!(store.snapshot().unwrap().audit_rows, 0);
    }

    #[test]
    fn duplicate_batch_is_an_idempotent_success() {
        let (persister, feed, store) = persister_with_feed();
        let batch: Vec<_> = (0..4).map(valid_msg).collect();

        persister.persist_with_fallback(&batch).unwrap();
        persister.persist_with_fallback(&batch).unwrap();

        assert_eq!(feed.committed(), Some(3));
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.audit_rows, 4);
        assert_eq!(snap.outbox_pending, 4);
    }

    #[test]
    fn invalid_messages_complete_via_audit_and_dlq() {
        let (persister, feed, store) = persister_with_feed();
        let batch = vec![
            valid_msg(0),
            PendingMessage::invalid("decode failed: checksum mismatch", vec![1, 2, 3], 1),
        ];

        persister.persist_with_fallback(&batch).unwrap();

        assert_eq!(feed.committed(), Some(1));
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.audit_rows, 2);
        assert_eq!(snap.audit_invalid, 1);
        assert_eq!(snap.dlq_rows, 1);
        assert_eq!(snap.outbox_pending, 1);
    }
}
