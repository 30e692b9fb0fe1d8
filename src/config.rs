//! Configuration for the logtap client

use crate::errors::LogtapError;
use crate::telemetry::{Fields, Record, Tags, TrackEvent, UserProfile};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Lower bound of the scheduler tick, whatever the flush interval.
pub const MIN_TICK: Duration = Duration::from_millis(50);
/// Upper bound of the scheduler tick, so long intervals still fire on time.
pub const MAX_TICK: Duration = Duration::from_millis(500);

type BeforeSendFn = dyn Fn(Record) -> Result<Option<Record>, LogtapError> + Send + Sync;
type ImmediateFn = dyn Fn(&str, &TrackEvent) -> bool + Send + Sync;

/// Transform hook applied to every record before it is queued.
///
/// `Ok(None)` discards the record. An error (or a panic) keeps the record
/// unchanged.
#[derive(Clone)]
pub struct BeforeSend(Arc<BeforeSendFn>);

impl BeforeSend {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Record) -> Result<Option<Record>, LogtapError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, record: Record) -> Result<Option<Record>, LogtapError> {
        (self.0)(record)
    }
}

impl fmt::Debug for BeforeSend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BeforeSend(..)")
    }
}

/// Predicate deciding whether a track event bypasses batching.
/// Overrides `Config::immediate_events` when set.
#[derive(Clone)]
pub struct ImmediatePredicate(Arc<ImmediateFn>);

impl ImmediatePredicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &TrackEvent) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, name: &str, event: &TrackEvent) -> bool {
        (self.0)(name, event)
    }
}

impl fmt::Debug for ImmediatePredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ImmediatePredicate(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the ingestion service, e.g. `http://localhost:8080`
    pub base_url: String,

    /// Project the records belong to
    pub project_id: String,

    /// Secret sent as `X-Project-Key`
    pub project_key: Option<String>,

    /// Age of the oldest queued record that triggers a flush; zero disables the timer
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,

    /// Combined queue length that triggers an immediate flush (only when > 1)
    pub min_batch_size: usize,

    /// Maximum records per request
    pub max_batch_size: usize,

    /// Maximum records kept per queue
    pub max_queue_size: usize,

    /// Per-request timeout
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Gzip request bodies
    pub gzip: bool,

    /// Keep queued records in a durable store across restarts
    pub persist_queue: bool,

    /// Queue file; defaults to `<cache dir>/logtap/queue_<project>.json`
    pub queue_file_path: Option<PathBuf>,

    /// Debounce window for persistence writes; zero writes immediately
    #[serde(with = "duration_ms")]
    pub persist_debounce: Duration,

    /// Explicit device identifier
    pub device_id: Option<String>,

    /// Store the generated device identifier so it survives restarts
    pub persist_device_id: bool,

    /// Device id file; defaults to `<data dir>/logtap/device_id`
    pub device_id_path: Option<PathBuf>,

    /// User attached to every record until changed
    pub user: Option<UserProfile>,

    pub global_fields: Fields,
    pub global_properties: Fields,
    pub global_tags: Tags,
    pub global_contexts: Fields,

    /// Track event names sent right away
    pub immediate_events: Vec<String>,

    /// Drop batches the server rejects with a non-retryable 4xx instead of
    /// retrying them forever
    pub drop_rejected_batches: bool,

    /// Install a process panic hook that reports panics as `fatal` logs
    pub capture_panics: bool,

    #[serde(skip)]
    pub before_send: Option<BeforeSend>,

    #[serde(skip)]
    pub immediate_event: Option<ImmediatePredicate>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            project_id: String::new(),
            project_key: None,
            flush_interval: Duration::from_secs(2),
            min_batch_size: 1,
            max_batch_size: 50,
            max_queue_size: 1000,
            timeout: Duration::from_secs(5),
            gzip: false,
            persist_queue: false,
            queue_file_path: None,
            persist_debounce: Duration::ZERO,
            device_id: None,
            persist_device_id: false,
            device_id_path: None,
            user: None,
            global_fields: Fields::new(),
            global_properties: Fields::new(),
            global_tags: Tags::new(),
            global_contexts: Fields::new(),
            immediate_events: Vec::new(),
            drop_rejected_batches: false,
            capture_panics: false,
            before_send: None,
            immediate_event: None,
        }
    }
}

impl Config {
    pub fn new(base_url: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    pub fn with_before_send<F>(mut self, f: F) -> Self
    where
        F: Fn(Record) -> Result<Option<Record>, LogtapError> + Send + Sync + 'static,
    {
        self.before_send = Some(BeforeSend::new(f));
        self
    }

    pub fn with_immediate_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &TrackEvent) -> bool + Send + Sync + 'static,
    {
        self.immediate_event = Some(ImmediatePredicate::new(f));
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(base_url) = env::var("LOGTAP_BASE_URL") {
            config.base_url = base_url;
        }

        if let Ok(project_id) = env::var("LOGTAP_PROJECT_ID") {
            config.project_id = project_id;
        }

        if let Ok(key) = env::var("LOGTAP_PROJECT_KEY") {
            config.project_key = Some(key);
        }

        if let Some(ms) = env_parse::<u64>("LOGTAP_FLUSH_INTERVAL_MS") {
            config.flush_interval = Duration::from_millis(ms);
        }

        if let Some(size) = env_parse("LOGTAP_MIN_BATCH_SIZE") {
            config.min_batch_size = size;
        }

        if let Some(size) = env_parse("LOGTAP_MAX_BATCH_SIZE") {
            config.max_batch_size = size;
        }

        if let Some(size) = env_parse("LOGTAP_MAX_QUEUE_SIZE") {
            config.max_queue_size = size;
        }

        if let Some(ms) = env_parse::<u64>("LOGTAP_TIMEOUT_MS") {
            config.timeout = Duration::from_millis(ms);
        }

        if let Ok(gzip) = env::var("LOGTAP_GZIP") {
            config.gzip = gzip.to_lowercase() == "true";
        }

        if let Ok(persist) = env::var("LOGTAP_PERSIST_QUEUE") {
            config.persist_queue = persist.to_lowercase() == "true";
        }

        if let Ok(path) = env::var("LOGTAP_QUEUE_FILE") {
            config.queue_file_path = Some(PathBuf::from(path));
        }

        if let Some(ms) = env_parse::<u64>("LOGTAP_PERSIST_DEBOUNCE_MS") {
            config.persist_debounce = Duration::from_millis(ms);
        }

        if let Ok(device_id) = env::var("LOGTAP_DEVICE_ID") {
            config.device_id = Some(device_id);
        }

        if let Ok(capture) = env::var("LOGTAP_CAPTURE_PANICS") {
            config.capture_panics = capture.to_lowercase() == "true";
        }

        if let Ok(names) = env::var("LOGTAP_IMMEDIATE_EVENTS") {
            config.immediate_events = names
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.normalized_base_url()?;

        let project_id = self.project_id.trim();
        if project_id.is_empty() {
            return Err("project_id cannot be empty".to_string());
        }

        if project_id.contains('/') {
            return Err("project_id cannot contain '/'".to_string());
        }

        if self.max_batch_size == 0 {
            return Err("max_batch_size must be greater than 0".to_string());
        }

        if self.max_queue_size == 0 {
            return Err("max_queue_size must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Base URL without surrounding whitespace or trailing slashes.
    pub fn normalized_base_url(&self) -> Result<String, String> {
        let base = self.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err("base_url cannot be empty".to_string());
        }

        let parsed = url::Url::parse(base).map_err(|e| format!("invalid base_url: {}", e))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(format!(
                "base_url must use http or https, got {}",
                parsed.scheme()
            ));
        }

        Ok(base.to_string())
    }

    /// Effective minimum batch size; values below one mean "one".
    pub fn effective_min_batch_size(&self) -> usize {
        self.min_batch_size.max(1)
    }

    /// Tick rate of the scheduler, bounded independently of the flush interval.
    pub fn tick_interval(&self) -> Duration {
        self.flush_interval.clamp(MIN_TICK, MAX_TICK)
    }

    pub fn resolved_queue_file_path(&self) -> PathBuf {
        self.queue_file_path
            .clone()
            .unwrap_or_else(|| default_queue_file_path(&self.project_id))
    }

    pub fn resolved_device_id_path(&self) -> PathBuf {
        self.device_id_path
            .clone()
            .unwrap_or_else(default_device_id_path)
    }
}

/// Default queue file inside the user's cache directory (temp dir fallback).
pub fn default_queue_file_path(project_id: &str) -> PathBuf {
    let project: String = project_id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    dirs::cache_dir()
        .unwrap_or_else(env::temp_dir)
        .join("logtap")
        .join(format!("queue_{}.json", project))
}

/// Default device id file inside the user's local data directory.
pub fn default_device_id_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(env::temp_dir)
        .join("logtap")
        .join("device_id")
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
