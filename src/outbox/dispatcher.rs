//! Outbox dispatcher
//!
//! One worker thread per process, draining pending outbox rows into the
//! downstream log while preserving strict per-portfolio ordering across a
//! fleet of instances. Each iteration leases a set of portfolios, dispatches
//! their groups sequentially, commits the successful prefix of each group in
//! a single transaction, and backs off exponentially on system failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::models::{BatchOutcome, OutboxRow};
use crate::outbox::sizer::AdaptiveBatchSizer;
use crate::outbox::worker::DispatchWorker;
use crate::store::SafeStore;

/// Exponential escalation: base on the first failure, then doubling up to
/// the ceiling.
pub(crate) fn next_backoff(current: Duration, base: Duration, max: Duration) -> Duration {
    if current.is_zero() {
        base
    } else {
        (current * 2).min(max)
    }
}

pub struct OutboxDispatcher {
    store: Arc<SafeStore>,
    worker: Arc<DispatchWorker>,
    sizer: Arc<AdaptiveBatchSizer>,
    cfg: OutboxConfig,
    /// Lease owner identity of this process instance
    owner: String,
    running: AtomicBool,
    backoff_ms: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<SafeStore>,
        worker: Arc<DispatchWorker>,
        sizer: Arc<AdaptiveBatchSizer>,
        cfg: OutboxConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            worker,
            sizer,
            cfg,
            owner: owner.into(),
            running: AtomicBool::new(false),
            backoff_ms: AtomicU64::new(0),
            handle: Mutex::new(None),
        }
    }

    /// Current backoff, observable for diagnostics.
    pub fn current_backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms.load(Ordering::Relaxed))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            warn!("outbox dispatcher already running");
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let dispatcher = self.clone();
        let thread = thread::Builder::new()
            .name("outbox-dispatcher".to_string())
            .spawn(move || dispatcher.dispatch_loop())
            .expect("failed to spawn outbox dispatcher thread");

        *handle = Some(thread);
        info!(owner = %self.owner, "outbox dispatcher started");
    }

    /// Request a stop and wait for the loop to finish its current group.
    /// The stop flag is checked between batches, never mid-transaction.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        info!(owner = %self.owner, "outbox dispatcher stopped");
    }

    fn dispatch_loop(&self) {
        let mut backoff = Duration::ZERO;

        while self.running.load(Ordering::SeqCst) {
            if !backoff.is_zero() {
                warn!(backoff_ms = backoff.as_millis() as u64, "system failure backoff active");
                self.sleep_interruptibly(backoff);
            }

            match self.run_iteration(backoff) {
                Ok(next) => backoff = next,
                Err(e) => {
                    error!(error = %e, "unexpected error in dispatch loop");
                    backoff = next_backoff(
                        backoff,
                        self.cfg.system_failure_backoff,
                        self.cfg.max_backoff,
                    );
                }
            }
            self.backoff_ms
                .store(backoff.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// One lease-fetch-dispatch-commit pass. Returns the backoff to apply
    /// before the next iteration.
    fn run_iteration(&self, backoff: Duration) -> anyhow::Result<Duration> {
        let start = Instant::now();

        let limit = self.sizer.current();
        let batch = self
            .store
            .fetch_pending_leased(&self.owner, limit, self.cfg.lease_ttl)?;

        if batch.is_empty() {
            self.store.release_leases(&self.owner)?;
            self.sizer.reset();
            self.sleep_interruptibly(self.cfg.idle_sleep);
            return Ok(Duration::ZERO);
        }

        let fetched = batch.len();
        let groups = group_by_portfolio(batch);

        let mut system_failure = false;
        for (portfolio_id, events) in groups {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let outcome = self.worker.process_batch(&events);
            if let Err(e) = self.commit_outcome(&portfolio_id, &events, &outcome) {
                error!(portfolio = %portfolio_id, error = %e, "failed to commit group outcome");
                system_failure = true;
                break;
            }

            if outcome.system_failure {
                error!(
                    portfolio = %portfolio_id,
                    sent = outcome.successful_ids.len(),
                    "system failure, aborting remaining groups this iteration"
                );
                system_failure = true;
                break;
            }
        }

        self.store.release_leases(&self.owner)?;

        if system_failure {
            Ok(next_backoff(
                backoff,
                self.cfg.system_failure_backoff,
                self.cfg.max_backoff,
            ))
        } else {
            self.sizer.adjust(start.elapsed(), fetched);
            Ok(Duration::ZERO)
        }
    }

    /// Single transaction per group: mark the successful prefix SENT and
    /// move a reported poison pill to the DLQ.
    fn commit_outcome(
        &self,
        portfolio_id: &Uuid,
        events: &[OutboxRow],
        outcome: &BatchOutcome,
    ) -> anyhow::Result<()> {
        let poison = outcome.poison.as_ref().and_then(|p| {
            let row = events.iter().find(|e| e.id == p.event_id);
            if row.is_none() {
                error!(event_id = p.event_id, "poison pill not found in its own batch");
            }
            row.map(|r| (r, p))
        });

        let reason = poison.map(|(_, p)| format!("Poison Pill: {}", p.reason));
        self.store.resolve_group(
            &outcome.successful_ids,
            poison.map(|(row, _)| (row, reason.as_deref().unwrap_or("Poison Pill"))),
        )?;

        if !outcome.successful_ids.is_empty() {
            info!(
                portfolio = %portfolio_id,
                sent = outcome.successful_ids.len(),
                "marked events as SENT"
            );
        }
        if let Some((row, p)) = poison {
            warn!(portfolio = %portfolio_id, event_id = row.id, reason = %p.reason, "routed poison pill to DLQ");
        }
        Ok(())
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let step = Duration::from_millis(10);
        let deadline = Instant::now() + total;
        while self.running.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(step.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}

/// Partition rows by portfolio, preserving first-seen order of portfolios
/// and row order within each group.
fn group_by_portfolio(batch: Vec<OutboxRow>) -> Vec<(Uuid, Vec<OutboxRow>)> {
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut groups: Vec<(Uuid, Vec<OutboxRow>)> = Vec::new();

    for row in batch {
        match index.get(&row.portfolio_id) {
            Some(&i) => groups[i].1.push(row),
            None => {
                index.insert(row.portfolio_id, groups.len());
                groups.push((row.portfolio_id, vec![row]));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_escalates_from_base_and_caps_at_max() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_millis(30_000);

        let mut backoff = Duration::ZERO;
        let mut observed = Vec::new();
        for _ in 0..7 {
            backoff = next_backoff(backoff, base, max);
            observed.push(backoff.as_millis() as u64);
        }
        assert_eq!(
            observed,
            vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
    }

    #[test]
    fn grouping_preserves_first_seen_and_internal_order() {
        let pa = Uuid::new_v4();
        let pb = Uuid::new_v4();
        let row = |id: i64, p: Uuid| OutboxRow {
            id,
            created_at: id,
            portfolio_id: p,
            trade_id: Uuid::new_v4(),
            payload: vec![1],
        };

        let groups = group_by_portfolio(vec![
            row(1, pa),
            row(2, pb),
            row(3, pa),
            row(4, pb),
            row(5, pa),
        ]);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, pa);
        assert_eq!(
            groups[0].1.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 3, 5]
        );
        assert_eq!(groups[1].0, pb);
        assert_eq!(
            groups[1].1.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![2, 4]
        );
    }
}
