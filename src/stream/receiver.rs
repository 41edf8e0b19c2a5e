//! Stream receiver
//!
//! Translates each broker delivery into exactly one `PendingMessage` and
//! hands it to the ingest buffer. Decode and validation failures are routed
//! through as invalid messages; nothing propagates back into the broker
//! callback, which would stall delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::ingest::buffer::IngestBuffer;
use crate::models::{PendingMessage, REPLAY_OFFSET};
use crate::stream::wire;

/// Delivery counters, surfaced on the admin stats route
#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub received: AtomicU64,
    pub valid: AtomicU64,
    pub invalid: AtomicU64,
    pub replayed: AtomicU64,
}

pub struct TradeReceiver {
    buffer: Arc<IngestBuffer>,
    stats: ReceiverStats,
}

impl TradeReceiver {
    pub fn new(buffer: Arc<IngestBuffer>) -> Self {
        Self {
            buffer,
            stats: ReceiverStats::default(),
        }
    }

    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Broker delivery callback. May block inside `IngestBuffer::add` while
    /// backpressure is active; that is the only permitted blocking here.
    pub fn on_delivery(&self, raw: &[u8], offset: i64) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let msg = self.classify(raw, offset);
        if msg.is_valid() {
            self.stats.valid.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.invalid.fetch_add(1, Ordering::Relaxed);
        }
        self.buffer.add(msg);
    }

    /// Admin replay entry: same path as a live delivery but with the replay
    /// sentinel offset, so the cursor is never advanced for it.
    pub fn on_replay(&self, raw: &[u8]) {
        self.stats.replayed.fetch_add(1, Ordering::Relaxed);
        self.on_delivery(raw, REPLAY_OFFSET);
    }

    fn classify(&self, raw: &[u8], offset: i64) -> PendingMessage {
        match wire::decode(raw) {
            Ok(trade) if trade.is_well_formed() => {
                trace!(
                    offset,
                    portfolio = %trade.portfolio_id,
                    trade = %trade.trade_id,
                    "accepted trade event"
                );
                PendingMessage::valid(trade, raw.to_vec(), offset)
            }
            Ok(_) => {
                warn!(offset, "trade event missing portfolio or trade id");
                PendingMessage::invalid(
                    "missing required fields: portfolio_id or trade_id",
                    raw.to_vec(),
                    offset,
                )
            }
            Err(e) => {
                warn!(offset, error = %e, "malformed trade message");
                PendingMessage::invalid(format!("decode failed: {e}"), raw.to_vec(), offset)
            }
        }
    }
}
