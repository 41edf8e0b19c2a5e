//! Cooperative portfolio leases
//!
//! Partitions portfolios across dispatcher instances without a coordination
//! service. A lease is acquired in non-blocking try mode inside the fetch
//! transaction and carries a TTL so a crashed owner's portfolios become
//! available again. Prefix-safe commit keeps ordering correct even if a
//! lease expires mid-iteration: the next lease holder starts at the same
//! first-PENDING row.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rusqlite::{params, Connection, Transaction};
use uuid::Uuid;

/// Derive the stable 64-bit lease key for a portfolio.
///
/// Deterministic hashing: the same portfolio always maps to the same key on
/// every instance of this binary.
pub fn lease_key(portfolio_id: &Uuid) -> i64 {
    let mut hasher = DefaultHasher::new();
    portfolio_id.hash(&mut hasher);
    hasher.finish() as i64
}

/// Try to acquire (or refresh) the lease for `key` within `tx`.
///
/// Returns immediately: `true` when this owner now holds the lease, `false`
/// when a live lease belongs to someone else. Expired leases are stolen.
pub fn try_acquire(
    tx: &Transaction<'_>,
    key: i64,
    owner: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> rusqlite::Result<bool> {
    let changed = tx.execute(
        "INSERT INTO portfolio_lease (lease_key, owner, expires_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(lease_key) DO UPDATE SET
            owner = excluded.owner,
            expires_at = excluded.expires_at
         WHERE portfolio_lease.owner = excluded.owner
            OR portfolio_lease.expires_at < ?4",
        params![key, owner, now_ms + ttl_ms, now_ms],
    )?;
    Ok(changed == 1)
}

/// Release every lease held by `owner`. Called at the end of a dispatch
/// iteration; missing rows are fine.
pub fn release_all(conn: &Connection, owner: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM portfolio_lease WHERE owner = ?1", params![owner])
}
