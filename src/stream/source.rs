//! Broker-facing contracts
//!
//! The stream broker itself lives outside this process; these traits are the
//! surface the pipeline consumes. `LoopbackFeed` is an in-process stand-in
//! with real offset/cursor semantics, used by the local harness and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

/// A named reader cursor on the upstream stream. Storing offset `o` means
/// the reader resumes after `o` on restart.
pub trait StreamCursor: Send + Sync {
    fn store_offset(&self, offset: i64) -> Result<()>;
}

/// Consumer-side flow control against the broker. Both calls are idempotent.
pub trait FlowControl: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// Holds the cursor once the broker connection is up and commits offsets on
/// behalf of the persister. A commit failure is logged, never thrown; the
/// worst case is a replay of the uncommitted tail, which the audit store
/// absorbs idempotently.
#[derive(Default)]
pub struct OffsetManager {
    cursor: RwLock<Option<Arc<dyn StreamCursor>>>,
}

impl OffsetManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cursor: Arc<dyn StreamCursor>) {
        *self.cursor.write() = Some(cursor);
    }

    pub fn commit(&self, offset: i64) {
        let guard = self.cursor.read();
        let Some(cursor) = guard.as_ref() else {
            warn!(offset, "cannot commit offset: no cursor registered");
            return;
        };
        match cursor.store_offset(offset) {
            Ok(()) => debug!(offset, "committed stream offset"),
            Err(e) => warn!(offset, error = %e, "failed to commit stream offset"),
        }
    }
}

struct FeedInner {
    log: Vec<Vec<u8>>,
    committed: Option<i64>,
    next_delivery: usize,
}

/// In-process append-only stream with offsets, a stored cursor and
/// pause/resume flow control.
pub struct LoopbackFeed {
    inner: Mutex<FeedInner>,
    paused: AtomicBool,
    pause_signals: AtomicU64,
    resume_signals: AtomicU64,
}

impl Default for LoopbackFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFeed {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FeedInner {
                log: Vec::new(),
                committed: None,
                next_delivery: 0,
            }),
            paused: AtomicBool::new(false),
            pause_signals: AtomicU64::new(0),
            resume_signals: AtomicU64::new(0),
        }
    }

    /// Append a message, returning its offset.
    pub fn append(&self, payload: Vec<u8>) -> i64 {
        let mut inner = self.inner.lock();
        inner.log.push(payload);
        (inner.log.len() - 1) as i64
    }

    /// Deliver undelivered messages to `handler` in offset order, stopping
    /// when the feed is paused or the log is exhausted.
    pub fn deliver_pending<F: FnMut(&[u8], i64)>(&self, mut handler: F) {
        loop {
            if self.paused.load(Ordering::SeqCst) {
                return;
            }
            let next = {
                let mut inner = self.inner.lock();
                if inner.next_delivery >= inner.log.len() {
                    return;
                }
                let idx = inner.next_delivery;
                inner.next_delivery += 1;
                (inner.log[idx].clone(), idx as i64)
            };
            handler(&next.0, next.1);
        }
    }

    /// Simulate a consumer restart: delivery resumes just past the stored
    /// cursor, replaying everything that was never committed.
    pub fn rewind_to_committed(&self) {
        let mut inner = self.inner.lock();
        inner.next_delivery = inner.committed.map(|o| o as usize + 1).unwrap_or(0);
    }

    pub fn committed(&self) -> Option<i64> {
        self.inner.lock().committed
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause_signals(&self) -> u64 {
        self.pause_signals.load(Ordering::Relaxed)
    }

    pub fn resume_signals(&self) -> u64 {
        self.resume_signals.load(Ordering::Relaxed)
    }
}

impl StreamCursor for LoopbackFeed {
    fn store_offset(&self, offset: i64) -> Result<()> {
        self.inner.lock().committed = Some(offset);
        Ok(())
    }
}

impl FlowControl for LoopbackFeed {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.pause_signals.fetch_add(1, Ordering::Relaxed);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_signals.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_delivers_in_offset_order() {
        let feed = LoopbackFeed::new();
        for i in 0u8..5 {
            feed.append(vec![i]);
        }

        let mut seen = Vec::new();
        feed.deliver_pending(|raw, offset| seen.push((raw[0], offset)));
        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)]);

        // Nothing is redelivered without a rewind
        let mut again = Vec::new();
        feed.deliver_pending(|raw, offset| again.push((raw[0], offset)));
        assert!(again.is_empty());
    }

    #[test]
    fn pause_halts_delivery_and_resume_continues() {
        let feed = LoopbackFeed::new();
        feed.append(vec![1]);
        feed.append(vec![2]);

        feed.pause();
        let mut seen = Vec::new();
        feed.deliver_pending(|raw, _| seen.push(raw[0]));
        assert!(seen.is_empty());

        feed.resume();
        feed.deliver_pending(|raw, _| seen.push(raw[0]));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn rewind_replays_everything_past_the_cursor() {
        let feed = LoopbackFeed::new();
        for i in 0u8..4 {
            feed.append(vec![i]);
        }
        feed.deliver_pending(|_, _| {});
        feed.store_offset(1).unwrap();

        feed.rewind_to_committed();
        let mut seen = Vec::new();
        feed.deliver_pending(|raw, _| seen.push(raw[0]));
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn offset_manager_tolerates_missing_cursor() {
        let manager = OffsetManager::new();
        // Must not panic or propagate
        manager.commit(42);

        let feed = Arc::new(LoopbackFeed::new());
        manager.register(feed.clone());
        manager.commit(7);
        assert_eq!(feed.committed(), Some(7));
    }
}
