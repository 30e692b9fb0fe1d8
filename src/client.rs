//! Client facade tying together payload building, queueing, scheduling and
//! delivery

use crate::buffer::{QueueSizes, QueueStore};
use crate::capture::{self, CaptureSink, ErrorSignalSource, PanicHookSource};
use crate::config::Config;
use crate::device::resolve_device_id;
use crate::dispatcher::{Dispatcher, FlushOutcome, Trigger};
use crate::errors::{LogtapError, Result};
use crate::payload::{Identity, LogOptions, PayloadBuilder, TrackOptions};
use crate::persistence::{DurableStore, FileStore, Persister};
use crate::telemetry::{current_timestamp_ms, Fields, Level, Record, TrackEvent, UserProfile};
use crate::transport::{
    compressor_for, Compressor, HttpTransport, MeteredTransport, Transport,
    TransportMetricsSnapshot,
};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::any::Any;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a failure captured on a possibly wedged thread waits for locks.
const CAPTURE_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Upper bound on the flush that follows a recovered panic.
const RECOVER_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Handle to a telemetry client. Cheap to clone; all clones share one set of
/// queues and background tasks.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<Inner>,
}

/// Non-owning handle used by background tasks and error sources.
#[derive(Clone, Debug)]
pub struct WeakClient {
    inner: Weak<Inner>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }
}

#[derive(Debug)]
struct Inner {
    client_id: String,
    config: Config,
    builder: PayloadBuilder,
    identity: RwLock<Identity>,
    immediate_events: HashSet<String>,
    queue: Arc<Mutex<QueueStore>>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<MeteredTransport>,
    persister: Option<Arc<Persister>>,
    triggers: mpsc::UnboundedSender<Trigger>,
    auto_flush_scheduled: AtomicBool,
    closing: AtomicBool,
    closed: OnceCell<FlushOutcome>,
    shutdown: CancellationToken,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Builder for clients with injected capabilities.
#[derive(Debug)]
pub struct ClientBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    compressor: Option<Arc<dyn Compressor>>,
    store: Option<Arc<dyn DurableStore>>,
    error_sources: Vec<Arc<dyn ErrorSignalSource>>,
}

impl ClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            compressor: None,
            store: None,
            error_sources: Vec::new(),
        }
    }

    /// Replace the HTTP transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the body compressor picked from `Config::gzip`.
    pub fn compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Persist the queues to this store; implies queue persistence.
    pub fn durable_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn error_source(mut self, source: Arc<dyn ErrorSignalSource>) -> Self {
        self.error_sources.push(source);
        self
    }

    /// Validate the configuration, restore persisted records and start the
    /// background tasks. Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<Client> {
        let ClientBuilder {
            config,
            transport,
            compressor,
            store,
            mut error_sources,
        } = self;

        config.validate().map_err(LogtapError::Config)?;

        let transport = match transport {
            Some(transport) => transport,
            None => {
                let compressor = compressor.unwrap_or_else(|| compressor_for(&config));
                Arc::new(HttpTransport::new(&config, compressor)?)
            }
        };
        let transport = Arc::new(MeteredTransport::new(transport));

        let store: Option<Arc<dyn DurableStore>> = match store {
            Some(store) => Some(store),
            None if config.persist_queue => {
                Some(Arc::new(FileStore::new(config.resolved_queue_file_path())))
            }
            None => None,
        };

        let queue = Arc::new(Mutex::new(QueueStore::new(config.max_queue_size)));

        let mut restored = 0;
        if let Some(store) = &store {
            match store.load().await {
                Ok(Some(state)) => {
                    restored = queue.lock().hydrate(state);
                    if restored > 0 {
                        info!(restored, "Restored persisted records");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to load persisted queue, starting empty"),
            }
        }

        let persister = store
            .map(|store| Arc::new(Persister::spawn(store, queue.clone(), config.persist_debounce)));

        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            transport.clone(),
            persister.clone(),
            triggers.clone(),
            config.max_batch_size,
            config.drop_rejected_batches,
            shutdown.clone(),
        ));

        let identity = Identity {
            device_id: Some(resolve_device_id(&config)),
            user: config.user.clone().and_then(UserProfile::normalized),
        };

        let immediate_events = config
            .immediate_events
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();

        if config.capture_panics {
            error_sources.push(Arc::new(PanicHookSource::new()));
        }

        let inner = Arc::new(Inner {
            client_id: Uuid::new_v4().to_string(),
            builder: PayloadBuilder::new(&config),
            identity: RwLock::new(identity),
            immediate_events,
            queue,
            dispatcher,
            transport,
            persister,
            triggers,
            auto_flush_scheduled: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed: OnceCell::new(),
            shutdown: shutdown.clone(),
            scheduler: Mutex::new(None),
            config,
        });

        let tick = (!inner.config.flush_interval.is_zero()).then(|| inner.config.tick_interval());
        let scheduler = tokio::spawn(run_scheduler(
            Arc::downgrade(&inner),
            trigger_rx,
            shutdown,
            tick,
        ));
        *inner.scheduler.lock() = Some(scheduler);

        let client = Client { inner };

        for source in error_sources {
            if let Err(e) = source.install(CaptureSink::new(client.downgrade())) {
                warn!(source = source.name(), error = %e, "Failed to install error source");
            }
        }

        if restored > 0 {
            let _ = client.inner.triggers.send(Trigger::Retry);
        }

        info!(
            client_id = %client.inner.client_id,
            project = %client.inner.config.project_id,
            "logtap client started"
        );

        Ok(client)
    }
}

impl Client {
    /// Create a client with the default HTTP transport.
    pub async fn new(config: Config) -> Result<Self> {
        ClientBuilder::new(config).build().await
    }

    pub fn builder(config: Config) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Queue a log record. Returns whether a record was queued.
    pub fn log(&self, level: Level, message: &str, fields: Option<Fields>) -> bool {
        self.log_with(level, message, fields, LogOptions::default())
    }

    pub fn log_with(
        &self,
        level: Level,
        message: &str,
        fields: Option<Fields>,
        options: LogOptions,
    ) -> bool {
        if self.is_closing() {
            debug!("Client closed, dropping log");
            return false;
        }

        let identity = self.inner.identity.read().clone();
        match self
            .inner
            .builder
            .build_log(level, message, fields, options, &identity, Utc::now())
        {
            Some(record) => {
                self.enqueue(Record::Log(record));
                true
            }
            None => false,
        }
    }

    pub fn debug(&self, message: &str, fields: Option<Fields>) -> bool {
        self.log(Level::Debug, message, fields)
    }

    pub fn info(&self, message: &str, fields: Option<Fields>) -> bool {
        self.log(Level::Info, message, fields)
    }

    pub fn warn(&self, message: &str, fields: Option<Fields>) -> bool {
        self.log(Level::Warn, message, fields)
    }

    pub fn error(&self, message: &str, fields: Option<Fields>) -> bool {
        self.log(Level::Error, message, fields)
    }

    pub fn fatal(&self, message: &str, fields: Option<Fields>) -> bool {
        self.log(Level::Fatal, message, fields)
    }

    /// Queue an analytics event. Returns whether an event was queued.
    pub fn track(&self, name: &str, properties: Option<Fields>) -> bool {
        self.track_with(name, properties, TrackOptions::default())
    }

    /// Queue an analytics event; immediate events start a flush right away.
    pub fn track_with(&self, name: &str, properties: Option<Fields>, options: TrackOptions) -> bool {
        if self.is_closing() {
            debug!("Client closed, dropping track event");
            return false;
        }

        let immediate = options.immediate;
        let identity = self.inner.identity.read().clone();
        let Some(event) = self
            .inner
            .builder
            .build_track(name, properties, options, &identity, Utc::now())
        else {
            return false;
        };

        let immediate = immediate || self.is_immediate_event(&event);
        self.enqueue(Record::Track(event));

        if immediate {
            debug!(name = name.trim(), "Immediate event, flushing");
            let _ = self.inner.dispatcher.start();
        }
        true
    }

    fn is_immediate_event(&self, event: &TrackEvent) -> bool {
        match &self.inner.config.immediate_event {
            Some(predicate) => {
                catch_unwind(AssertUnwindSafe(|| predicate.call(&event.name, event)))
                    .unwrap_or_else(|_| {
                        warn!(name = %event.name, "immediate_event predicate panicked");
                        false
                    })
            }
            None => self.inner.immediate_events.contains(&event.name),
        }
    }

    fn enqueue(&self, record: Record) {
        let total = {
            let mut queue = self.inner.queue.lock();
            queue.enqueue(record);
            queue.sizes().total()
        };
        self.after_enqueue(total);
    }

    fn after_enqueue(&self, total: usize) {
        if let Some(persister) = &self.inner.persister {
            persister.schedule();
        }

        let min = self.inner.config.effective_min_batch_size();
        if min > 1
            && total >= min
            && !self.inner.auto_flush_scheduled.swap(true, Ordering::AcqRel)
        {
            let _ = self.inner.triggers.send(Trigger::Check);
        }
    }

    /// Queue a record built from a host failure. Runs on whatever thread the
    /// failure happened on, possibly while it holds a client lock, so every
    /// lock is taken with a timeout and no user hook runs.
    pub(crate) fn capture(&self, level: Level, message: &str, fields: Fields) -> bool {
        if self.is_closing() {
            return false;
        }

        let Some(identity) = self.inner.identity.try_read_for(CAPTURE_LOCK_TIMEOUT) else {
            return false;
        };
        let identity = identity.clone();

        let Some(record) = self
            .inner
            .builder
            .build_captured_log(level, message, fields, &identity, Utc::now())
        else {
            return false;
        };

        let total = {
            let Some(mut queue) = self.inner.queue.try_lock_for(CAPTURE_LOCK_TIMEOUT) else {
                return false;
            };
            queue.enqueue(Record::Log(record));
            queue.sizes().total()
        };
        self.after_enqueue(total);

        if level == Level::Fatal {
            let _ = self.inner.triggers.send(Trigger::Flush);
        }
        true
    }

    /// Log an error together with its chain of sources.
    pub fn capture_error(&self, err: &(dyn std::error::Error + 'static)) -> bool {
        let message = err.to_string();
        let mut fields = Fields::new();
        fields.insert("kind".to_string(), Value::from("error"));
        fields.insert("error".to_string(), Value::from(message.clone()));

        let chain: Vec<Value> = std::iter::successors(err.source(), |e| e.source())
            .map(|e| Value::from(e.to_string()))
            .collect();
        if !chain.is_empty() {
            fields.insert("causes".to_string(), Value::Array(chain));
        }

        self.log(Level::Error, &message, Some(fields))
    }

    /// Report a caught panic as `fatal` and flush, waiting at most two
    /// seconds. Returns the flush outcome unless the wait timed out.
    pub async fn recover(&self, panic: &(dyn Any + Send)) -> Option<FlushOutcome> {
        let mut fields = Fields::new();
        fields.insert("kind".to_string(), Value::from("panic"));
        fields.insert("panic".to_string(), Value::from(capture::panic_message(panic)));
        fields.insert(
            "backtrace".to_string(),
            Value::from(std::backtrace::Backtrace::force_capture().to_string()),
        );
        self.log(Level::Fatal, "panic", Some(fields));

        timeout(RECOVER_FLUSH_TIMEOUT, self.inner.dispatcher.flush())
            .await
            .ok()
    }

    /// Replace the current user; a blank profile clears it.
    pub fn set_user(&self, user: UserProfile) {
        self.inner.identity.write().user = user.normalized();
    }

    /// Set the current user by id; a blank id is ignored.
    pub fn identify(&self, user_id: &str, traits: Option<Fields>) {
        let id = user_id.trim();
        if id.is_empty() {
            return;
        }
        let mut user = UserProfile::with_id(id);
        user.traits = traits;
        self.set_user(user);
    }

    pub fn clear_user(&self) {
        self.inner.identity.write().user = None;
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.inner.identity.read().user.clone()
    }

    /// Override the device id for subsequent records; a blank id is ignored.
    pub fn set_device_id(&self, device_id: &str) {
        let id = device_id.trim();
        if id.is_empty() {
            return;
        }
        self.inner.identity.write().device_id = Some(id.to_string());
    }

    pub fn device_id(&self) -> Option<String> {
        self.inner.identity.read().device_id.clone()
    }

    /// Deliver everything queued, then write the durable state without
    /// waiting for the debounce window. Never fails; the outcome says what
    /// happened.
    pub async fn flush(&self) -> FlushOutcome {
        let outcome = self.inner.dispatcher.flush().await;
        if let Some(persister) = &self.inner.persister {
            persister.flush().await;
        }
        outcome
    }

    /// Stop the timers, finish the running flush, make a final attempt and
    /// write the final state. Later calls return the first call's outcome.
    pub async fn close(&self) -> FlushOutcome {
        *self
            .inner
            .closed
            .get_or_init(|| async {
                info!(client_id = %self.inner.client_id, "Closing logtap client");
                self.inner.closing.store(true, Ordering::Release);
                self.inner.shutdown.cancel();

                self.inner.dispatcher.wait_idle().await;
                let outcome = self.inner.dispatcher.flush().await;

                if let Some(persister) = &self.inner.persister {
                    persister.shutdown().await;
                }

                let scheduler = self.inner.scheduler.lock().take();
                if let Some(scheduler) = scheduler {
                    let _ = scheduler.await;
                }

                let metrics = self.inner.transport.metrics();
                info!(
                    sent = outcome.sent,
                    remaining = outcome.remaining.total(),
                    success_rate = metrics.success_rate,
                    attempts = metrics.attempts,
                    avg_duration_ms = metrics.avg_duration_ms,
                    "logtap client closed"
                );

                outcome
            })
            .await
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn sizes(&self) -> QueueSizes {
        self.inner.queue.lock().sizes()
    }

    pub fn stats(&self) -> ClientStats {
        let (queued, watermark) = {
            let queue = self.inner.queue.lock();
            (queue.sizes(), queue.watermark())
        };

        ClientStats {
            client_id: self.inner.client_id.clone(),
            device_id: self.device_id(),
            queued,
            oldest_queued_age_ms: watermark.map(|ms| (current_timestamp_ms() - ms).max(0) as u64),
            flushing: self.inner.dispatcher.is_flushing(),
            backoff_ms: self.inner.dispatcher.backoff_remaining().as_millis() as u64,
            transport: self.inner.transport.metrics(),
        }
    }

    /// Flush when the oldest record is older than the interval or the queues
    /// hold at least the minimum batch size. Otherwise returns how long until
    /// the oldest record comes of age, if anything is queued.
    fn flush_if_due(&self) -> Option<Duration> {
        let (total, watermark) = {
            let queue = self.inner.queue.lock();
            (queue.sizes().total(), queue.watermark())
        };
        if total == 0 {
            return None;
        }

        let config = &self.inner.config;
        let min = config.effective_min_batch_size();
        let by_size = min > 1 && total >= min;

        let interval_ms = config.flush_interval.as_millis() as i64;
        let due_in = match watermark {
            Some(first) if interval_ms > 0 => {
                Some((first + interval_ms - current_timestamp_ms()).max(0))
            }
            _ => None,
        };
        let by_age = due_in == Some(0);

        if by_size || by_age {
            debug!(total, by_size, by_age, "Flush due");
            let _ = self.inner.dispatcher.start();
            return None;
        }

        due_in.map(|ms| Duration::from_millis(ms as u64))
    }
}

/// Client statistics
#[derive(Debug, Clone)]
pub struct ClientStats {
    pub client_id: String,
    pub device_id: Option<String>,
    pub queued: QueueSizes,
    pub oldest_queued_age_ms: Option<u64>,
    pub flushing: bool,
    pub backoff_ms: u64,
    pub transport: TransportMetricsSnapshot,
}

/// Owns every trigger: the recurring tick, the size threshold and retries.
async fn run_scheduler(
    client: Weak<Inner>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    shutdown: CancellationToken,
    tick: Option<Duration>,
) {
    let mut ticker = tick.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    });
    // One-shot wake-up for the moment the oldest record comes of age, so
    // interval flushes are not delayed by up to a whole tick.
    let mut wake: Option<Instant> = None;

    loop {
        let trigger = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = async {
                match ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => None,
            _ = async {
                match wake {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => None,
            trigger = triggers.recv() => match trigger {
                Some(trigger) => Some(trigger),
                None => break,
            },
        };

        let Some(inner) = client.upgrade() else {
            break;
        };
        let client = Client { inner };

        let due_in = match trigger {
            None => client.flush_if_due(),
            Some(Trigger::Check) => {
                client.inner.auto_flush_scheduled.store(false, Ordering::Release);
                client.flush_if_due()
            }
            Some(Trigger::Flush) | Some(Trigger::Retry) => {
                let _ = client.inner.dispatcher.start();
                None
            }
        };
        if ticker.is_some() {
            wake = due_in.map(|delay| Instant::now() + delay);
        }
    }

    debug!("Scheduler stopped");
}
