//! Durable store: audit log, transactional outbox, DLQ and portfolio leases
//!
//! All tables live in one SQLite database behind a single connection. The
//! audit insert gates the outbox insert, which is what makes stream replay
//! idempotent: a duplicate trade id re-inserts neither row.

pub mod circuit;
pub mod lease;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, Transaction};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{MessageBody, OutboxRow, PendingMessage};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Constraint(e.to_string())
            }
            _ => Self::Sqlite(e),
        }
    }
}

impl StoreError {
    /// Permanent data problem, resolved by routing the message to the DLQ.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// Row counts surfaced on the admin stats route
#[derive(Debug, Clone, Serialize)]
pub struct StoreSnapshot {
    pub audit_rows: i64,
    pub audit_invalid: i64,
    pub outbox_pending: i64,
    pub outbox_sent: i64,
    pub dlq_rows: i64,
}

/// One outbox row with its lifecycle fields, for inspection
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: i64,
    pub trade_id: Uuid,
    pub status: String,
    pub created_at: i64,
    pub sent_at: Option<i64>,
}

#[derive(Clone)]
pub struct SafeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SafeStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_trade (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                received_at INTEGER NOT NULL,
                portfolio_id TEXT,
                trade_id TEXT UNIQUE,
                symbol TEXT,
                side TEXT,
                price_per_stock REAL,
                quantity INTEGER,
                event_timestamp INTEGER,
                valid INTEGER NOT NULL,
                raw_message BLOB
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS outbox_event (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                portfolio_id TEXT NOT NULL,
                trade_id TEXT NOT NULL,
                payload BLOB NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                attempts INTEGER NOT NULL DEFAULT 0,
                sent_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outbox_pending
             ON outbox_event(status, created_at, id)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS dlq_entry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                failed_at INTEGER NOT NULL,
                raw_message BLOB NOT NULL,
                error_detail TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS portfolio_lease (
                lease_key INTEGER PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    /// Run `f` inside one transaction, committing on `Ok`.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Persist a whole batch atomically: audit + outbox for valid messages,
    /// audit + DLQ for invalid ones.
    pub fn insert_batch(&self, batch: &[PendingMessage]) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            for msg in batch {
                Self::insert_message_tx(tx, msg)?;
            }
            Ok(())
        })
    }

    /// Persist one message in its own transaction (safe-path fallback).
    pub fn insert_single(&self, msg: &PendingMessage) -> Result<(), StoreError> {
        self.with_tx(|tx| Self::insert_message_tx(tx, msg))
    }

    fn insert_message_tx(tx: &Transaction<'_>, msg: &PendingMessage) -> Result<(), StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        match &msg.body {
            MessageBody::Valid(trade) => {
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO audit_trade
                     (received_at, portfolio_id, trade_id, symbol, side,
                      price_per_stock, quantity, event_timestamp, valid, raw_message)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, NULL)",
                    params![
                        now_ms,
                        trade.portfolio_id.to_string(),
                        trade.trade_id.to_string(),
                        trade.symbol,
                        trade.side.as_str(),
                        trade.price_per_stock,
                        trade.quantity,
                        trade.event_timestamp.timestamp_millis(),
                    ],
                )?;
                if inserted == 1 {
                    tx.execute(
                        "INSERT INTO outbox_event
                         (created_at, portfolio_id, trade_id, payload, status, attempts)
                         VALUES (?1, ?2, ?3, ?4, 'PENDING', 0)",
                        params![
                            now_ms,
                            trade.portfolio_id.to_string(),
                            trade.trade_id.to_string(),
                            msg.raw,
                        ],
                    )?;
                } else {
                    debug!(trade = %trade.trade_id, "duplicate trade id, replay tolerated");
                }
            }
            MessageBody::Invalid { reason } => {
                tx.execute(
                    "INSERT INTO audit_trade (received_at, valid, raw_message)
                     VALUES (?1, 0, ?2)",
                    params![now_ms, msg.raw],
                )?;
                tx.execute(
                    "INSERT INTO dlq_entry (failed_at, raw_message, error_detail)
                     VALUES (?1, ?2, ?3)",
                    params![now_ms, msg.raw, reason],
                )?;
            }
        }
        Ok(())
    }

    /// Write one DLQ row in its own transaction.
    pub fn insert_dlq(&self, raw: &[u8], reason: &str) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO dlq_entry (failed_at, raw_message, error_detail)
                 VALUES (?1, ?2, ?3)",
                params![Utc::now().timestamp_millis(), raw, reason],
            )?;
            Ok(())
        })
    }

    /// Fetch up to `limit` pending rows in `(created_at, id)` order,
    /// restricted to portfolios this owner can lease right now. Rows of
    /// portfolios leased elsewhere are invisible for this pass.
    pub fn fetch_pending_leased(
        &self,
        owner: &str,
        limit: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<OutboxRow>, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = lease_ttl.as_millis() as i64;

        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT id, created_at, portfolio_id, trade_id, payload
                 FROM outbox_event
                 WHERE status = 'PENDING'
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?1",
            )?;
            let candidates = stmt
                .query_map(params![limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut decisions: HashMap<Uuid, bool> = HashMap::new();
            let mut out = Vec::with_capacity(candidates.len());

            for (id, created_at, portfolio_str, trade_str, payload) in candidates {
                let (Ok(portfolio_id), Ok(trade_id)) =
                    (Uuid::parse_str(&portfolio_str), Uuid::parse_str(&trade_str))
                else {
                    warn!(id, "outbox row with unparseable ids, skipping");
                    continue;
                };

                let leased = match decisions.get(&portfolio_id) {
                    Some(&d) => d,
                    None => {
                        let got = lease::try_acquire(
                            tx,
                            lease::lease_key(&portfolio_id),
                            owner,
                            now_ms,
                            ttl_ms,
                        )?;
                        decisions.insert(portfolio_id, got);
                        got
                    }
                };
                if leased {
                    out.push(OutboxRow {
                        id,
                        created_at,
                        portfolio_id,
                        trade_id,
                        payload,
                    });
                }
            }
            Ok(out)
        })
    }

    /// Commit the outcome of one portfolio group in a single transaction:
    /// mark the successful prefix SENT and, if a poison pill was reported,
    /// copy it to the DLQ and delete it from the outbox.
    pub fn resolve_group(
        &self,
        sent_ids: &[i64],
        poison: Option<(&OutboxRow, &str)>,
    ) -> Result<(), StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        self.with_tx(|tx| {
            if !sent_ids.is_empty() {
                let placeholders = (2..sent_ids.len() + 2)
                    .map(|i| format!("?{i}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE outbox_event SET status = 'SENT', sent_at = ?1
                     WHERE id IN ({placeholders})"
                );
                let mut bind: Vec<i64> = Vec::with_capacity(sent_ids.len() + 1);
                bind.push(now_ms);
                bind.extend_from_slice(sent_ids);
                tx.execute(&sql, rusqlite::params_from_iter(bind))?;
            }
            if let Some((row, reason)) = poison {
                tx.execute(
                    "INSERT INTO dlq_entry (failed_at, raw_message, error_detail)
                     VALUES (?1, ?2, ?3)",
                    params![now_ms, row.payload, reason],
                )?;
                tx.execute("DELETE FROM outbox_event WHERE id = ?1", params![row.id])?;
            }
            Ok(())
        })
    }

    pub fn release_leases(&self, owner: &str) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        Ok(lease::release_all(&conn, owner)?)
    }

    pub fn snapshot(&self) -> Result<StoreSnapshot, StoreError> {
        let conn = self.conn.lock();
        let one = |sql: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(sql, [], |row| row.get(0))
        };
        Ok(StoreSnapshot {
            audit_rows: one("SELECT COUNT(*) FROM audit_trade")?,
            audit_invalid: one("SELECT COUNT(*) FROM audit_trade WHERE valid = 0")?,
            outbox_pending: one("SELECT COUNT(*) FROM outbox_event WHERE status = 'PENDING'")?,
            outbox_sent: one("SELECT COUNT(*) FROM outbox_event WHERE status = 'SENT'")?,
            dlq_rows: one("SELECT COUNT(*) FROM dlq_entry")?,
        })
    }

    /// Full outbox history for one portfolio in `(created_at, id)` order.
    pub fn outbox_records(&self, portfolio_id: &Uuid) -> Result<Vec<OutboxRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, trade_id, status, created_at, sent_at
             FROM outbox_event
             WHERE portfolio_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![portfolio_id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, trade, status, created_at, sent_at)| {
                Uuid::parse_str(&trade).ok().map(|trade_id| OutboxRecord {
                    id,
                    trade_id,
                    status,
                    created_at,
                    sent_at,
                })
            })
            .collect())
    }

    /// First pending row id for a portfolio, the anchor of the no-skip
    /// invariant.
    pub fn first_pending_id(&self, portfolio_id: &Uuid) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM outbox_event
             WHERE portfolio_id = ?1 AND status = 'PENDING'
             ORDER BY created_at ASC, id ASC
             LIMIT 1",
        )?;
        let mut rows = stmt.query(params![portfolio_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DecodedTrade, Side};
    use crate::stream::wire;
    use chrono::Utc;

    fn valid_msg(portfolio: Uuid, trade: Uuid, offset: i64) -> PendingMessage {
        let decoded = DecodedTrade {
            portfolio_id: portfolio,
            trade_id: trade,
            symbol: "NVDA".into(),
            side: Side::Buy,
            price_per_stock: 120.5,
            quantity: 3,
            event_timestamp: Utc::now(),
        };
        let raw = wire::encode(&decoded).unwrap();
        PendingMessage::valid(decoded, raw, offset)
    }

    #[test]
    fn open_creates_schema_on_disk_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.db");

        {
            let store = SafeStore::open(&path).unwrap();
            store
                .insert_single(&valid_msg(Uuid::new_v4(), Uuid::new_v4(), 0))
                .unwrap();
        }

        let reopened = SafeStore::open(&path).unwrap();
        assert_eq!(reopened.snapshot().unwrap().audit_rows, 1);
    }

    #[test]
    fn batch_insert_writes_audit_and_outbox_together() {
        let store = SafeStore::open_in_memory().unwrap();
        let portfolio = Uuid::new_v4();
        let batch: Vec<_> = (0..3)
            .map(|i| valid_msg(portfolio, Uuid::new_v4(), i))
            .collect();

        store.insert_batch(&batch).unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.audit_rows, 3);
        assert_eq!(snap.outbox_pending, 3);
        assert_eq!(snap.dlq_rows, 0);
    }

    #[test]
    fn replaying_a_batch_is_idempotent() {
        let store = SafeStore::open_in_memory().unwrap();
        let portfolio = Uuid::new_v4();
        let batch: Vec<_> = (0..5)
            .map(|i| valid_msg(portfolio, Uuid::new_v4(), i))
            .collect();

        store.insert_batch(&batch).unwrap();
        store.insert_batch(&batch).unwrap();

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.audit_rows, 5);
        assert_eq!(snap.outbox_pending, 5, "at most one outbox row per trade id");
    }

    #[test]
    fn invalid_message_lands_in_audit_and_dlq_only() {
        let store = SafeStore::open_in_memory().unwrap();
        let msg = PendingMessage::invalid("decode failed: bad magic", vec![0xDE, 0xAD], 9);

        store.insert_single(&msg).unwrap();
        let snap = store.snapshot().unwrap();
        assert_eq!(snap.audit_rows, 1);
        assert_eq!(snap.audit_invalid, 1);
        assert_eq!(snap.outbox_pending, 0);
        assert_eq!(snap.dlq_rows, 1);
    }

    #[test]
    fn fetch_skips_portfolios_leased_by_another_owner() {
        let store = SafeStore::open_in_memory().unwrap();
        let pa = Uuid::new_v4();
        let pb = Uuid::new_v4();
        for i in 0..2 {
            store.insert_single(&valid_msg(pa, Uuid::new_v4(), i)).unwrap();
            store.insert_single(&valid_msg(pb, Uuid::new_v4(), i + 10)).unwrap();
        }

        let first = store
            .fetch_pending_leased("pod-a", 10, Duration::from_secs(30))
            .unwrap();
        assert_eq!(first.len(), 4);

        // pod-a still holds both leases; pod-b sees nothing
        let second = store
            .fetch_pending_leased("pod-b", 10, Duration::from_secs(30))
            .unwrap();
        assert!(second.is_empty());

        store.release_leases("pod-a").unwrap();
        let third = store
            .fetch_pending_leased("pod-b", 10, Duration::from_secs(30))
            .unwrap();
        assert_eq!(third.len(), 4);
    }

    #[test]
    fn fetch_returns_rows_in_created_at_id_order() {
        let store = SafeStore::open_in_memory().unwrap();
        let portfolio = Uuid::new_v4();
        for i in 0..4 {
            store
                .insert_single(&valid_msg(portfolio, Uuid::new_v4(), i))
                .unwrap();
        }

        let rows = store
            .fetch_pending_leased("pod-a", 10, Duration::from_secs(30))
            .unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn resolve_group_marks_prefix_and_moves_poison() {
        let store = SafeStore::open_in_memory().unwrap();
        let portfolio = Uuid::new_v4();
        for i in 0..3 {
            store
                .insert_single(&valid_msg(portfolio, Uuid::new_v4(), i))
                .unwrap();
        }
        let rows = store
            .fetch_pending_leased("pod-a", 10, Duration::from_secs(30))
            .unwrap();

        store
            .resolve_group(
                &[rows[0].id],
                Some((&rows[1], "Poison Pill: invalid payload")),
            )
            .unwrap();

        let snap = store.snapshot().unwrap();
        assert_eq!(snap.outbox_sent, 1);
        assert_eq!(snap.outbox_pending, 1);
        assert_eq!(snap.dlq_rows, 1);
        assert_eq!(store.first_pending_id(&portfolio).unwrap(), Some(rows[2].id));
    }
}
