//! Domain types shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel offset for admin-replayed messages; never committed to the broker.
pub const REPLAY_OFFSET: i64 = -1;

/// Trade side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Buy),
            1 => Some(Self::Sell),
            _ => None,
        }
    }
}

/// A fully decoded trade message
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTrade {
    pub portfolio_id: Uuid,
    pub trade_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub price_per_stock: f64,
    pub quantity: i64,
    pub event_timestamp: DateTime<Utc>,
}

impl DecodedTrade {
    /// Business validity: both identifiers must be present.
    pub fn is_well_formed(&self) -> bool {
        !self.portfolio_id.is_nil() && !self.trade_id.is_nil()
    }
}

/// Payload of a pending message: either a decoded trade or the reason it
/// could not become one.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Valid(DecodedTrade),
    Invalid { reason: String },
}

/// A message received from the stream but not yet persisted, paired with the
/// offset that may be committed once it is durable.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub body: MessageBody,
    /// Original stream bytes; the outbox payload for valid trades and the
    /// audit/DLQ payload for invalid ones.
    pub raw: Vec<u8>,
    /// Stream offset, or [`REPLAY_OFFSET`] for admin-injected messages.
    pub offset: i64,
}

impl PendingMessage {
    pub fn valid(trade: DecodedTrade, raw: Vec<u8>, offset: i64) -> Self {
        Self {
            body: MessageBody::Valid(trade),
            raw,
            offset,
        }
    }

    pub fn invalid(reason: impl Into<String>, raw: Vec<u8>, offset: i64) -> Self {
        Self {
            body: MessageBody::Invalid {
                reason: reason.into(),
            },
            raw,
            offset,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.body, MessageBody::Valid(_))
    }

    pub fn trade(&self) -> Option<&DecodedTrade> {
        match &self.body {
            MessageBody::Valid(t) => Some(t),
            MessageBody::Invalid { .. } => None,
        }
    }
}

/// Outbox row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Sent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
        }
    }
}

/// One pending outbox row as fetched by the dispatcher
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub created_at: i64,
    pub portfolio_id: Uuid,
    pub trade_id: Uuid,
    pub payload: Vec<u8>,
}

/// Result of dispatching one portfolio group: the successful prefix, an
/// optional poison pill, and whether a transient downstream failure stopped
/// the group.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub successful_ids: Vec<i64>,
    pub poison: Option<PoisonPill>,
    pub system_failure: bool,
}

/// A permanently undeliverable event
#[derive(Debug, Clone)]
pub struct PoisonPill {
    pub event_id: i64,
    pub reason: String,
}

impl BatchOutcome {
    pub fn success(successful_ids: Vec<i64>) -> Self {
        Self {
            successful_ids,
            poison: None,
            system_failure: false,
        }
    }

    pub fn poisoned(successful_ids: Vec<i64>, event_id: i64, reason: impl Into<String>) -> Self {
        Self {
            successful_ids,
            poison: Some(PoisonPill {
                event_id,
                reason: reason.into(),
            }),
            system_failure: false,
        }
    }

    pub fn system_failure(successful_ids: Vec<i64>) -> Self {
        Self {
            successful_ids,
            poison: None,
            system_failure: true,
        }
    }
}
