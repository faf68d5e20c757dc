// src/broker.rs
//! Work broker: interactive + background lanes drained by one consumer.
//!
//! Scheduling is strict priority: whenever both lanes hold items the
//! interactive one is served first. A steady stream of interactive items can
//! therefore starve the background lane; interactive traffic is user-driven
//! and small, background traffic is bulk scraping that tolerates delay.
//!
//! Interactive results are correlated through a one-shot slot per request id.
//! A caller that times out leaves its slot in place, so the late result can
//! still be collected by another `await_result` within `slot_ttl`; after that
//! the slot is swept. Late results are never persisted.

use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::inference::InferenceResult;
use crate::metrics::{BROKER_ITEMS, BROKER_ITEM_ERRORS};
use crate::processor::RecordProcessor;
use crate::record::{Record, RequestId, ScoredRecord, WorkItem};

#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// How long a delivered but uncollected result is kept.
    pub slot_ttl: Duration,
    /// How long a slot nobody is awaiting may wait for a result at all.
    pub pending_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            slot_ttl: Duration::from_secs(60),
            pending_ttl: Duration::from_secs(600),
        }
    }
}

struct Slot {
    tx: Option<oneshot::Sender<InferenceResult>>,
    rx: Option<oneshot::Receiver<InferenceResult>>,
    created_at: Instant,
    delivered_at: Option<Instant>,
}

impl Slot {
    fn expired(&self, cfg: &BrokerConfig) -> bool {
        match self.delivered_at {
            Some(t) => t.elapsed() > cfg.slot_ttl,
            // a slot with an active waiter holds no receiver
            None => self.rx.is_some() && self.created_at.elapsed() > cfg.pending_ttl,
        }
    }
}

struct Lanes {
    interactive: mpsc::UnboundedReceiver<WorkItem>,
    background: mpsc::UnboundedReceiver<WorkItem>,
}

struct Inner {
    interactive_tx: mpsc::UnboundedSender<WorkItem>,
    background_tx: mpsc::UnboundedSender<WorkItem>,
    lanes: Mutex<Option<Lanes>>,
    queued_interactive: AtomicUsize,
    queued_background: AtomicUsize,
    slots: Mutex<HashMap<RequestId, Slot>>,
    processor: RecordProcessor,
    shutdown: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
    cfg: BrokerConfig,
}

/// Cloneable handle; all clones share the same lanes and slots.
#[derive(Clone)]
pub struct WorkBroker {
    inner: Arc<Inner>,
}

impl WorkBroker {
    pub fn new(processor: RecordProcessor, cfg: BrokerConfig) -> Self {
        crate::metrics::ensure_described();
        let (interactive_tx, interactive) = mpsc::unbounded_channel();
        let (background_tx, background) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                interactive_tx,
                background_tx,
                lanes: Mutex::new(Some(Lanes {
                    interactive,
                    background,
                })),
                queued_interactive: AtomicUsize::new(0),
                queued_background: AtomicUsize::new(0),
                slots: Mutex::new(HashMap::new()),
                processor,
                shutdown: CancellationToken::new(),
                consumer: Mutex::new(None),
                cfg,
            }),
        }
    }

    /// Spawn the consumer loop. Returns false if it was already started.
    pub fn start(&self) -> bool {
        let Some(lanes) = self.inner.lanes.lock().take() else {
            return false;
        };
        let inner = self.inner.clone();
        let handle = tokio::spawn(consume(inner, lanes));
        *self.inner.consumer.lock() = Some(handle);
        info!(target: "broker", "consumer started");
        true
    }

    pub fn processor(&self) -> &RecordProcessor {
        &self.inner.processor
    }

    /// Enqueue on the interactive lane and return the correlation id.
    pub fn submit_interactive(&self, record: Record) -> Result<RequestId> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::BrokerClosed);
        }
        record.validate()?;
        self.sweep_slots();

        let request_id = uuid::Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner.slots.lock().insert(
            request_id,
            Slot {
                tx: Some(tx),
                rx: Some(rx),
                created_at: Instant::now(),
                delivered_at: None,
            },
        );
        self.inner.queued_interactive.fetch_add(1, Ordering::Relaxed);
        if self
            .inner
            .interactive_tx
            .send(WorkItem::Interactive { request_id, record })
            .is_err()
        {
            self.inner.queued_interactive.fetch_sub(1, Ordering::Relaxed);
            self.inner.slots.lock().remove(&request_id);
            return Err(PipelineError::BrokerClosed);
        }
        debug!(target: "broker", %request_id, "interactive item queued");
        Ok(request_id)
    }

    /// Fire-and-forget enqueue on the background lane.
    pub fn submit_background(&self, record: Record) {
        if self.inner.shutdown.is_cancelled() {
            warn!(target: "broker", ticker = %record.ticker, "broker closed, dropping background record");
            return;
        }
        self.inner.queued_background.fetch_add(1, Ordering::Relaxed);
        if self
            .inner
            .background_tx
            .send(WorkItem::Background { record })
            .is_err()
        {
            self.inner.queued_background.fetch_sub(1, Ordering::Relaxed);
            warn!(target: "broker", "background lane closed");
        }
    }

    /// Wait up to `timeout` for the result of `request_id`.
    pub async fn await_result(
        &self,
        request_id: RequestId,
        timeout: Duration,
    ) -> Result<InferenceResult> {
        let mut rx = self
            .inner
            .slots
            .lock()
            .get_mut(&request_id)
            .and_then(|s| s.rx.take())
            .ok_or(PipelineError::UnknownRequest(request_id))?;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => {
                self.inner.slots.lock().remove(&request_id);
                Ok(result)
            }
            Ok(Err(_)) => {
                self.inner.slots.lock().remove(&request_id);
                Err(PipelineError::BrokerClosed)
            }
            Err(_) => {
                // keep the slot; the result may still arrive
                if let Some(slot) = self.inner.slots.lock().get_mut(&request_id) {
                    slot.rx = Some(rx);
                }
                debug!(target: "broker", %request_id, ?timeout, "await timed out");
                Err(PipelineError::TimedOut(timeout))
            }
        }
    }

    /// Items waiting in (interactive, background).
    pub fn queued(&self) -> (usize, usize) {
        (
            self.inner.queued_interactive.load(Ordering::Relaxed),
            self.inner.queued_background.load(Ordering::Relaxed),
        )
    }

    pub fn pending_slots(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Drop slots whose result was delivered longer than `slot_ttl` ago, and
    /// unawaited slots still without a result after `pending_ttl`.
    pub fn sweep_slots(&self) {
        let cfg = self.inner.cfg;
        let mut slots = self.inner.slots.lock();
        let before = slots.len();
        slots.retain(|_, s| !s.expired(&cfg));
        let swept = before - slots.len();
        if swept > 0 {
            debug!(target: "broker", swept, "expired result slots dropped");
        }
    }

    /// Stop the consumer and fail all waiting callers with `BrokerClosed`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self.inner.consumer.lock().take();
        if let Some(h) = handle {
            if let Err(e) = h.await {
                warn!(target: "broker", error = %e, "consumer task ended abnormally");
            }
        }
        for slot in self.inner.slots.lock().values_mut() {
            slot.tx.take();
        }
        info!(target: "broker", "consumer stopped");
    }
}

impl std::fmt::Debug for WorkBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (i, b) = self.queued();
        f.debug_struct("WorkBroker")
            .field("interactive", &i)
            .field("background", &b)
            .field("slots", &self.pending_slots())
            .finish()
    }
}

async fn consume(inner: Arc<Inner>, mut lanes: Lanes) {
    loop {
        let item = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            Some(item) = lanes.interactive.recv() => item,
            Some(item) = lanes.background.recv() => item,
            else => break,
        };
        inner.process(item).await;
    }
}

impl Inner {
    async fn process(&self, item: WorkItem) {
        let lane = item.lane();
        counter!(BROKER_ITEMS, "lane" => lane).increment(1);
        match item {
            WorkItem::Interactive { request_id, record } => {
                self.queued_interactive.fetch_sub(1, Ordering::Relaxed);
                let result = self.processor.score(&record);
                self.publish(request_id, result);
            }
            WorkItem::Background { record } => {
                self.queued_background.fetch_sub(1, Ordering::Relaxed);
                if let Err(e) = record.validate() {
                    warn!(target: "broker", error = %e, "skipping background item");
                    counter!(BROKER_ITEM_ERRORS).increment(1);
                    return;
                }
                let result = self.processor.score(&record);
                self.processor
                    .persist(&ScoredRecord { record, result })
                    .await;
            }
        }
    }

    fn publish(&self, request_id: RequestId, result: InferenceResult) {
        let tx = {
            let mut slots = self.slots.lock();
            slots.get_mut(&request_id).and_then(|s| {
                s.delivered_at = Some(Instant::now());
                s.tx.take()
            })
        };
        match tx {
            Some(tx) => {
                if tx.send(result).is_err() {
                    debug!(target: "broker", %request_id, "caller gone before result");
                }
            }
            None => debug!(target: "broker", %request_id, "no slot for result, dropping"),
        }
    }
}
