//! Capture runtime
//!
//! Owns every pipeline component and threads them together at construction,
//! replacing any notion of global executors or shared singletons. Start and
//! stop follow the shutdown contract: the stream is the first thing to go
//! quiet and the dispatcher is the last thing to finish.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::downstream::EventLog;
use crate::ingest::buffer::IngestBuffer;
use crate::ingest::persister::BatchPersister;
use crate::outbox::dispatcher::OutboxDispatcher;
use crate::outbox::sizer::AdaptiveBatchSizer;
use crate::outbox::worker::DispatchWorker;
use crate::store::circuit::CircuitBreaker;
use crate::store::SafeStore;
use crate::stream::receiver::TradeReceiver;
use crate::stream::source::{FlowControl, OffsetManager};

pub struct CaptureRuntime {
    pub store: Arc<SafeStore>,
    pub breaker: Arc<CircuitBreaker>,
    pub offsets: Arc<OffsetManager>,
    pub buffer: Arc<IngestBuffer>,
    pub receiver: Arc<TradeReceiver>,
    pub sizer: Arc<AdaptiveBatchSizer>,
    pub dispatcher: Arc<OutboxDispatcher>,
}

impl CaptureRuntime {
    /// Wire the full pipeline against a store, a downstream log and the
    /// broker's flow-control handle. The stream cursor is registered
    /// separately once the broker connection exists.
    pub fn build(
        cfg: &AppConfig,
        store: Arc<SafeStore>,
        downstream: Arc<dyn EventLog>,
        flow: Arc<dyn FlowControl>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(cfg.circuit.clone()));
        let offsets = Arc::new(OffsetManager::new());
        let persister = Arc::new(BatchPersister::new(
            store.clone(),
            breaker.clone(),
            offsets.clone(),
            cfg.dlq_fallback_log.clone().into(),
        ));
        let buffer = Arc::new(IngestBuffer::new(cfg.ingest.clone(), persister, flow));
        let receiver = Arc::new(TradeReceiver::new(buffer.clone()));

        let sizer = Arc::new(AdaptiveBatchSizer::new(
            cfg.outbox.min_batch,
            cfg.outbox.max_batch,
            cfg.outbox.target_latency,
        ));
        let worker = Arc::new(DispatchWorker::new(downstream, cfg.outbox.send_timeout));
        let owner = format!("capture-{}", Uuid::new_v4());
        let dispatcher = Arc::new(OutboxDispatcher::new(
            store.clone(),
            worker,
            sizer.clone(),
            cfg.outbox.clone(),
            owner,
        ));

        Self {
            store,
            breaker,
            offsets,
            buffer,
            receiver,
            sizer,
            dispatcher,
        }
    }

    pub fn start(&self) {
        self.buffer.start();
        self.dispatcher.start();
        info!("capture runtime started");
    }

    /// Shutdown order: the caller stops stream delivery first, then this
    /// drains the buffer through the persister one last time, then stops
    /// the dispatcher after its current group has committed or rolled back.
    pub fn stop(&self) {
        self.buffer.stop();
        self.dispatcher.stop();
        info!("capture runtime stopped");
    }
}
