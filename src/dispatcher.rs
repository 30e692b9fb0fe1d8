//! Flush engine: drains the queues into batches and hands them to the
//! transport, one flush at a time.

use crate::buffer::{QueueSizes, QueueStore};
use crate::persistence::Persister;
use crate::telemetry::QueueKind;
use crate::transport::{DeliveryOutcome, Transport};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const BACKOFF_FLOOR: Duration = Duration::from_millis(500);
pub const BACKOFF_CEILING: Duration = Duration::from_secs(30);

/// Why the scheduler is being woken up outside its regular tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The combined queue length crossed the minimum batch size.
    Check,
    /// Flush right away.
    Flush,
    /// A flush failed; try again once the backoff has passed.
    Retry,
}

/// What a flush call achieved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Records accepted by the server.
    pub sent: usize,
    /// Records dropped after the server rejected their batch.
    pub dropped: usize,
    /// A batch failed and was put back; a retry is scheduled.
    pub failed: bool,
    /// Queue lengths once the flush ended.
    pub remaining: QueueSizes,
}

impl FlushOutcome {
    pub fn is_drained(&self) -> bool {
        !self.failed && self.remaining.total() == 0
    }
}

/// Exponential backoff between failed deliveries.
#[derive(Debug, Default)]
struct Backoff {
    current: Duration,
    until: Option<Instant>,
}

impl Backoff {
    fn fail(&mut self) -> Duration {
        self.current = if self.current.is_zero() {
            BACKOFF_FLOOR
        } else {
            (self.current * 2).min(BACKOFF_CEILING)
        };
        self.until = Some(Instant::now() + self.current);
        self.current
    }

    fn reset(&mut self) {
        self.current = Duration::ZERO;
        self.until = None;
    }
}

/// Shared handle to a running flush.
pub type FlushHandle = Shared<BoxFuture<'static, FlushOutcome>>;

pub struct Dispatcher {
    queue: Arc<Mutex<QueueStore>>,
    transport: Arc<dyn Transport>,
    persister: Option<Arc<Persister>>,
    triggers: mpsc::UnboundedSender<Trigger>,
    max_batch_size: usize,
    drop_rejected: bool,
    backoff: Mutex<Backoff>,
    in_flight: Mutex<Option<FlushHandle>>,
    shutdown: CancellationToken,
    runtime: Handle,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_batch_size", &self.max_batch_size)
            .field("drop_rejected", &self.drop_rejected)
            .field("backoff", &*self.backoff.lock())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

impl Dispatcher {
    /// Must be called from within a tokio runtime; flushes run on it even
    /// when started from other threads.
    pub fn new(
        queue: Arc<Mutex<QueueStore>>,
        transport: Arc<dyn Transport>,
        persister: Option<Arc<Persister>>,
        triggers: mpsc::UnboundedSender<Trigger>,
        max_batch_size: usize,
        drop_rejected: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            transport,
            persister,
            triggers,
            max_batch_size: max_batch_size.max(1),
            drop_rejected,
            backoff: Mutex::new(Backoff::default()),
            in_flight: Mutex::new(None),
            shutdown,
            runtime: Handle::current(),
        }
    }

    /// Start a flush, or join the one already running, without waiting for
    /// it. The flush runs to completion even if the handle is dropped.
    pub fn start(self: &Arc<Self>) -> FlushHandle {
        let mut slot = self.in_flight.lock();
        if let Some(running) = slot.as_ref() {
            return running.clone();
        }

        // The slot stays locked until the new flush is stored, so the task
        // cannot clear it before it is set.
        let this = Arc::clone(self);
        let handle = self.runtime.spawn(async move {
            let outcome = this.drain().await;
            this.in_flight.lock().take();
            if outcome.failed && !this.shutdown.is_cancelled() {
                let _ = this.triggers.send(Trigger::Retry);
            }
            outcome
        });

        let queue = Arc::clone(&self.queue);
        let flush = async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "Flush task failed");
                    FlushOutcome {
                        failed: true,
                        remaining: queue.lock().sizes(),
                        ..Default::default()
                    }
                }
            }
        }
        .boxed()
        .shared();

        *slot = Some(flush.clone());
        flush
    }

    /// Deliver everything queued. Concurrent callers share the flush that is
    /// already running and all see its outcome.
    pub async fn flush(self: &Arc<Self>) -> FlushOutcome {
        self.start().await
    }

    /// Wait for the flush that is currently running, if any.
    pub async fn wait_idle(&self) {
        let running = self.in_flight.lock().clone();
        if let Some(running) = running {
            running.await;
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Delay before the next attempt, zero when no backoff is pending.
    pub fn backoff_remaining(&self) -> Duration {
        self.backoff
            .lock()
            .until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    fn persist(&self) {
        if let Some(persister) = &self.persister {
            persister.schedule();
        }
    }

    async fn wait_out_backoff(&self) {
        let until = self.backoff.lock().until;
        let Some(until) = until else {
            return;
        };

        if until > Instant::now() {
            debug!(
                wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                "Waiting out backoff"
            );
            // Shutdown skips the wait so the final flush goes out right away.
            tokio::select! {
                _ = sleep_until(until) => {}
                _ = self.shutdown.cancelled() => {}
            }
        }
    }

    async fn drain(&self) -> FlushOutcome {
        self.wait_out_backoff().await;

        let mut outcome = FlushOutcome::default();

        'queues: for kind in [QueueKind::Track, QueueKind::Logs] {
            loop {
                let batch = self.queue.lock().take_batch(kind, self.max_batch_size);
                let Some(batch) = batch else {
                    break;
                };
                let count = batch.len();

                match self.transport.post(&batch).await {
                    DeliveryOutcome::Delivered => {
                        self.queue.lock().complete_batch(kind);
                        self.backoff.lock().reset();
                        outcome.sent += count;
                        debug!(%kind, count, "Batch delivered");
                        self.persist();
                    }
                    DeliveryOutcome::Rejected(status) if self.drop_rejected => {
                        self.queue.lock().complete_batch(kind);
                        self.backoff.lock().reset();
                        outcome.dropped += count;
                        error!(%kind, count, status, "Server rejected batch, dropping it");
                        self.persist();
                    }
                    delivery => {
                        let evicted = self.queue.lock().restore_batch(batch);
                        let delay = self.backoff.lock().fail();
                        outcome.failed = true;
                        outcome.dropped += evicted;
                        warn!(
                            %kind,
                            count,
                            ?delivery,
                            retry_in_ms = delay.as_millis() as u64,
                            "Batch delivery failed, re-queued"
                        );
                        self.persist();
                        break 'queues;
                    }
                }
            }
        }

        {
            let mut queue = self.queue.lock();
            if !outcome.failed && queue.clear_watermark_if_drained() {
                debug!("Queues drained");
            }
            outcome.remaining = queue.sizes();
        }

        if outcome.sent > 0 || outcome.dropped > 0 {
            info!(
                sent = outcome.sent,
                dropped = outcome.dropped,
                remaining = outcome.remaining.total(),
                "Flush finished"
            );
        }
        self.persist();

        outcome
    }
}
