//! Ingest buffer
//!
//! Bounded, strictly ordered staging area between the receiver and the
//! persister. Flushes on size and on time, applies consumer-side
//! backpressure against the broker when full, and never drops or reorders a
//! message. The queue lock is held only for the drain; the database call
//! runs outside it, serialized by a dedicated flush lock so batches leave in
//! offset order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::ingest::persister::{BatchPersister, PersistError};
use crate::models::PendingMessage;
use crate::stream::source::FlowControl;

#[derive(Debug, Clone, Copy)]
pub enum FlushTrigger {
    SizeThreshold,
    TimeThreshold,
    ShutdownDrain,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            Self::SizeThreshold => "size-threshold",
            Self::TimeThreshold => "time-threshold",
            Self::ShutdownDrain => "shutdown-drain",
        }
    }
}

pub struct IngestBuffer {
    cfg: IngestConfig,
    persister: Arc<BatchPersister>,
    flow: Arc<dyn FlowControl>,
    queue: Mutex<VecDeque<PendingMessage>>,
    space: Condvar,
    /// Serializes the persist calls of concurrent flushers (timer thread vs
    /// size-triggered receiver thread) so batches reach the store in order.
    flush_serial: Mutex<()>,
    shutdown: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl IngestBuffer {
    pub fn new(
        cfg: IngestConfig,
        persister: Arc<BatchPersister>,
        flow: Arc<dyn FlowControl>,
    ) -> Self {
        Self {
            cfg,
            persister,
            flow,
            queue: Mutex::new(VecDeque::new()),
            space: Condvar::new(),
            flush_serial: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            flusher: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Append one message. Fast path when under capacity; when full, pauses
    /// the broker and blocks until a flush makes room or shutdown begins.
    pub fn add(&self, msg: PendingMessage) {
        let mut q = self.queue.lock();
        if q.len() >= self.cfg.buffer_capacity {
            warn!(len = q.len(), "ingest buffer full, pausing stream delivery");
            self.flow.pause();
            while q.len() >= self.cfg.buffer_capacity && !self.shutdown.load(Ordering::SeqCst) {
                self.space.wait(&mut q);
            }
        }
        q.push_back(msg);
        let should_flush = q.len() >= self.cfg.max_batch_size;
        drop(q);

        if should_flush {
            self.try_flush(FlushTrigger::SizeThreshold);
        }
    }

    /// Drain up to `max_batch_size` messages in offset order and push them
    /// through the persister, retrying the same batch for as long as the
    /// database circuit is open. Data is never dropped here; under a
    /// database outage this blocks, with the broker paused.
    pub fn flush(&self, trigger: FlushTrigger) {
        let _serial = self.flush_serial.lock();
        self.drain_and_persist(trigger);
    }

    /// Size-triggered variant: if a flush is already in progress the add
    /// fast path stays non-blocking and the timer picks the batch up.
    fn try_flush(&self, trigger: FlushTrigger) {
        if let Some(_serial) = self.flush_serial.try_lock() {
            self.drain_and_persist(trigger);
        }
    }

    fn drain_and_persist(&self, trigger: FlushTrigger) {
        let batch: Vec<PendingMessage> = {
            let mut q = self.queue.lock();
            let n = q.len().min(self.cfg.max_batch_size);
            q.drain(..n).collect()
        };
        if batch.is_empty() {
            return;
        }
        self.space.notify_all();
        debug!(count = batch.len(), trigger = trigger.as_str(), "flushing batch");

        loop {
            match self.persister.persist_with_fallback(&batch) {
                Ok(()) => break,
                Err(PersistError::CircuitOpen) => {
                    warn!(
                        retry_ms = self.cfg.db_retry_backoff.as_millis() as u64,
                        "database unavailable, stream paused, will retry the same batch"
                    );
                    self.flow.pause();
                    thread::sleep(self.cfg.db_retry_backoff);
                }
                Err(e) => {
                    error!(error = %e, "unexpected persist failure, retrying batch");
                    thread::sleep(self.cfg.db_retry_backoff);
                }
            }
        }

        if self.queue.lock().len() < self.cfg.resume_threshold {
            self.flow.resume();
        }
    }

    /// Spawn the periodic flush thread. The watchdog fires at half the
    /// configured interval so a quiet buffer still meets the flush cadence.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.flusher.lock();
        if handle.is_some() {
            warn!("flush thread already running");
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);

        let tick = (self.cfg.flush_interval / 2).max(Duration::from_millis(1));
        let buffer = self.clone();
        let thread = thread::Builder::new()
            .name("ingest-flusher".to_string())
            .spawn(move || {
                while !buffer.shutdown.load(Ordering::SeqCst) {
                    thread::sleep(tick);
                    buffer.flush(FlushTrigger::TimeThreshold);
                }
            })
            .expect("failed to spawn ingest flush thread");

        *handle = Some(thread);
        info!(
            flush_interval_ms = self.cfg.flush_interval.as_millis() as u64,
            capacity = self.cfg.buffer_capacity,
            "ingest buffer started"
        );
    }

    /// Stop the timer thread, wake any producer blocked on backpressure,
    /// then run a final drain so nothing is lost in memory.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.space.notify_all();
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        while !self.is_empty() {
            self.flush(FlushTrigger::ShutdownDrain);
        }
        info!("ingest buffer stopped and drained");
    }

    #[cfg(test)]
    pub(crate) fn drain_for_test(&self) -> Vec<PendingMessage> {
        self.queue.lock().drain(..).collect()
    }
}
