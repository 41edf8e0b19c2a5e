//! Dispatch worker
//!
//! Sends one portfolio group to the downstream log, event by event, in
//! order. Halts on the first failure and reports the successful prefix plus
//! the failure class, so the dispatcher can commit exactly what went out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::downstream::EventLog;
use crate::models::{BatchOutcome, OutboxRow};
use crate::stream::wire;

pub struct DispatchWorker {
    log: Arc<dyn EventLog>,
    send_timeout: Duration,
}

impl DispatchWorker {
    pub fn new(log: Arc<dyn EventLog>, send_timeout: Duration) -> Self {
        Self { log, send_timeout }
    }

    /// Process one ordered group of events for a single portfolio.
    ///
    /// A payload that no longer decodes is a poison pill and is reported
    /// without contacting the log. A publish error is classified: poison
    /// stops the group and names the offender; anything transient stops the
    /// group with the system-failure flag so nothing past the prefix is
    /// committed.
    pub fn process_batch(&self, events: &[OutboxRow]) -> BatchOutcome {
        let mut successful_ids = Vec::with_capacity(events.len());

        for event in events {
            if let Err(e) = wire::decode(&event.payload) {
                error!(event_id = event.id, error = %e, "poison pill: stored payload no longer decodes");
                return BatchOutcome::poisoned(
                    successful_ids,
                    event.id,
                    format!("invalid payload: {e}"),
                );
            }

            let key = event.portfolio_id.to_string();
            match self.log.publish(&key, &event.payload, self.send_timeout) {
                Ok(()) => {
                    debug!(event_id = event.id, portfolio = %event.portfolio_id, "event acknowledged");
                    successful_ids.push(event.id);
                }
                Err(e) if e.is_poison() => {
                    error!(event_id = event.id, error = %e, "poison pill rejected by downstream");
                    return BatchOutcome::poisoned(successful_ids, event.id, e.to_string());
                }
                Err(e) => {
                    error!(event_id = event.id, error = %e, "system failure, stopping group to preserve ordering");
                    return BatchOutcome::system_failure(successful_ids);
                }
            }
        }

        BatchOutcome::success(successful_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downstream::{InMemoryEventLog, PublishError};
    use crate::models::{DecodedTrade, Side};
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use uuid::Uuid;

    /// Downstream double that replays scripted failures before delegating
    /// to the in-memory log.
    struct ScriptedLog {
        inner: InMemoryEventLog,
        faults: Mutex<VecDeque<PublishError>>,
    }

    impl ScriptedLog {
        fn new(faults: Vec<PublishError>) -> Self {
            Self {
                inner: InMemoryEventLog::new(),
                faults: Mutex::new(faults.into()),
            }
        }
    }

    impl EventLog for ScriptedLog {
        fn publish(
            &self,
            key: &str,
            payload: &[u8],
            timeout: Duration,
        ) -> Result<(), PublishError> {
            if let Some(fault) = self.faults.lock().pop_front() {
                return Err(fault);
            }
            self.inner.publish(key, payload, timeout)
        }
    }

    fn event(id: i64, portfolio: Uuid) -> OutboxRow {
        let trade = DecodedTrade {
            portfolio_id: portfolio,
            trade_id: Uuid::new_v4(),
            symbol: "META".into(),
            side: Side::Buy,
            price_per_stock: 500.25,
            quantity: 2,
            event_timestamp: Utc::now(),
        };
        OutboxRow {
            id,
            created_at: id,
            portfolio_id: portfolio,
            trade_id: trade.trade_id,
            payload: wire::encode(&trade).unwrap(),
        }
    }

    fn corrupt_event(id: i64, portfolio: Uuid) -> OutboxRow {
        let mut e = event(id, portfolio);
        e.payload[5] ^= 0xFF;
        e
    }

    #[test]
    fn all_acknowledged_returns_full_prefix() {
        let portfolio = Uuid::new_v4();
        let log = Arc::new(InMemoryEventLog::new());
        let worker = DispatchWorker::new(log.clone(), Duration::from_secs(1));

        let events = vec![event(1, portfolio), event(2, portfolio)];
        let outcome = worker.process_batch(&events);

        assert_eq!(outcome.successful_ids, vec![1, 2]);
        assert!(outcome.poison.is_none());
        assert!(!outcome.system_failure);
        assert_eq!(log.partition(&portfolio.to_string()).len(), 2);
    }

    #[test]
    fn payload_bytes_reach_the_log_verbatim() {
        let portfolio = Uuid::new_v4();
        let log = Arc::new(InMemoryEventLog::new());
        let worker = DispatchWorker::new(log.clone(), Duration::from_secs(1));

        let e = event(1, portfolio);
        let original = e.payload.clone();
        worker.process_batch(&[e]);

        assert_eq!(log.partition(&portfolio.to_string()), vec![original]);
    }

    #[test]
    fn corrupt_payload_is_poison_without_a_publish() {
        let portfolio = Uuid::new_v4();
        let log = Arc::new(InMemoryEventLog::new());
        let worker = DispatchWorker::new(log.clone(), Duration::from_secs(1));

        let events = vec![event(1, portfolio), corrupt_event(2, portfolio)];
        let outcome = worker.process_batch(&events);

        assert_eq!(outcome.successful_ids, vec![1]);
        let poison = outcome.poison.unwrap();
        assert_eq!(poison.event_id, 2);
        assert!(!outcome.system_failure);
        assert_eq!(log.total_published(), 1);
    }

    #[test]
    fn timeout_is_a_system_failure_preserving_the_prefix() {
        let portfolio = Uuid::new_v4();
        let log = Arc::new(ScriptedLog::new(vec![PublishError::AckTimeout(
            Duration::from_secs(5),
        )]));
        let worker = DispatchWorker::new(log, Duration::from_secs(1));

        let events = vec![event(1, portfolio), event(2, portfolio)];
        let outcome = worker.process_batch(&events);

        assert!(outcome.successful_ids.is_empty());
        assert!(outcome.poison.is_none());
        assert!(outcome.system_failure);
    }

    #[test]
    fn downstream_poison_halts_with_named_offender() {
        let portfolio = Uuid::new_v4();
        let log = Arc::new(ScriptedLog::new(vec![PublishError::Serialization(
            "schema registry rejected record".into(),
        )]));
        let worker = DispatchWorker::new(log, Duration::from_secs(1));

        let events = vec![event(7, portfolio), event(8, portfolio)];
        let outcome = worker.process_batch(&events);

        assert!(outcome.successful_ids.is_empty());
        assert_eq!(outcome.poison.unwrap().event_id, 7);
        assert!(!outcome.system_failure);
    }

    #[test]
    fn unrecognized_errors_fail_safe_as_system() {
        let portfolio = Uuid::new_v4();
        let log = Arc::new(ScriptedLog::new(vec![PublishError::Other(
            "never seen before".into(),
        )]));
        let worker = DispatchWorker::new(log, Duration::from_secs(1));

        let outcome = worker.process_batch(&[event(1, portfolio)]);
        assert!(outcome.system_failure);
        assert!(outcome.poison.is_none());
    }
}
