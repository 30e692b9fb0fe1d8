//! Durable side-channel for queued records
//!
//! Queue state is written as one versioned JSON document:
//!
//! ```json
//! { "v": 1, "firstQueuedAtMs": 1735689600000, "logs": [...], "track": [...] }
//! ```
//!
//! Writes go through a single writer task so they never interleave, and every
//! backend replaces the whole document atomically.

use crate::buffer::QueueStore;
use crate::errors::{LogtapError, Result};
use crate::telemetry::{LogRecord, TrackEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    pub v: u32,
    pub first_queued_at_ms: i64,
    pub logs: Vec<LogRecord>,
    pub track: Vec<TrackEvent>,
}

impl PersistedState {
    pub const VERSION: u32 = 1;

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty() && self.track.is_empty()
    }
}

/// Storage capability used to survive process restarts.
#[async_trait]
pub trait DurableStore: Send + Sync + fmt::Debug {
    /// Load the last saved state, `None` when nothing was saved.
    async fn load(&self) -> Result<Option<PersistedState>>;

    /// Replace the saved state.
    async fn save(&self, state: &PersistedState) -> Result<()>;

    /// Remove the saved state.
    async fn clear(&self) -> Result<()>;
}

fn decode_state(raw: &[u8]) -> Result<PersistedState> {
    let mut state: PersistedState = serde_json::from_slice(raw)?;
    if state.v == 0 {
        state.v = PersistedState::VERSION;
    }
    if state.v > PersistedState::VERSION {
        return Err(LogtapError::Persistence(format!(
            "unsupported queue state version {}",
            state.v
        )));
    }
    Ok(state)
}

/// JSON file written via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "queue.json".to_string());
        self.path
            .with_file_name(format!("{}.{}.tmp", file_name, Uuid::new_v4().simple()))
    }
}

#[async_trait]
impl DurableStore for FileStore {
    async fn load(&self) -> Result<Option<PersistedState>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => decode_state(&raw).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        if state.is_empty() {
            return self.clear().await;
        }

        let body = serde_json::to_vec(state)?;

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &body).await?;

        if tokio::fs::rename(&tmp, &self.path).await.is_err() {
            // Some platforms refuse to rename over an existing file.
            let _ = tokio::fs::remove_file(&self.path).await;
            if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e.into());
            }
        }

        debug!(
            path = %self.path.display(),
            logs = state.logs.len(),
            track = state.track.len(),
            "Persisted queue state"
        );
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Key-value style store holding the serialized document in memory. Clones
/// share the same slot, which makes it usable across client instances.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw JSON currently stored.
    pub fn raw(&self) -> Option<String> {
        self.slot.lock().clone()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn load(&self) -> Result<Option<PersistedState>> {
        let raw = self.slot.lock().clone();
        raw.map(|raw| decode_state(raw.as_bytes())).transpose()
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        if state.is_empty() {
            return self.clear().await;
        }
        let raw = serde_json::to_string(state)?;
        *self.slot.lock() = Some(raw);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.lock() = None;
        Ok(())
    }
}

enum PersistCommand {
    Dirty,
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the writer task that owns all writes to a durable store.
#[derive(Debug)]
pub struct Persister {
    tx: mpsc::UnboundedSender<PersistCommand>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    /// Spawn the writer task. A zero `debounce` writes after every change;
    /// otherwise a burst of changes is written once the window has passed
    /// without new ones.
    pub fn spawn(
        store: Arc<dyn DurableStore>,
        queue: Arc<Mutex<QueueStore>>,
        debounce: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = Writer {
            store,
            queue,
            debounce,
            rx,
        };
        let task = tokio::spawn(writer.run());

        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Request a write of the current state. Never blocks.
    pub fn schedule(&self) {
        let _ = self.tx.send(PersistCommand::Dirty);
    }

    /// Write the current state now and wait for the write to finish.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Write the final state and stop the writer task.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

struct Writer {
    store: Arc<dyn DurableStore>,
    queue: Arc<Mutex<QueueStore>>,
    debounce: Duration,
    rx: mpsc::UnboundedReceiver<PersistCommand>,
}

impl Writer {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            let follow_up = match cmd {
                PersistCommand::Dirty => {
                    if !self.debounce.is_zero() {
                        match self.wait_out_debounce().await {
                            Some(cmd) => Some(cmd),
                            None => {
                                self.write().await;
                                return;
                            }
                        }
                    } else {
                        self.coalesce()
                    }
                }
                other => Some(other),
            };

            match follow_up {
                Some(PersistCommand::Shutdown(ack)) => {
                    self.write().await;
                    let _ = ack.send(());
                    return;
                }
                Some(PersistCommand::Flush(ack)) => {
                    self.write().await;
                    let _ = ack.send(());
                }
                Some(PersistCommand::Dirty) | None => self.write().await,
            }
        }
    }

    /// Swallow queued change notifications; any other command is returned so
    /// it runs right after the coalesced write.
    fn coalesce(&mut self) -> Option<PersistCommand> {
        while let Ok(cmd) = self.rx.try_recv() {
            if !matches!(cmd, PersistCommand::Dirty) {
                return Some(cmd);
            }
        }
        None
    }

    /// Sleep until no change arrived for a whole debounce window. Returns the
    /// command that ended the wait early (or `Dirty` once the window passed),
    /// `None` when the handle is gone.
    async fn wait_out_debounce(&mut self) -> Option<PersistCommand> {
        let deadline = sleep(self.debounce);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Some(PersistCommand::Dirty),
                cmd = self.rx.recv() => match cmd {
                    Some(PersistCommand::Dirty) => {
                        deadline.as_mut().reset(Instant::now() + self.debounce);
                    }
                    Some(other) => return Some(other),
                    None => return None,
                },
            }
        }
    }

    async fn write(&self) {
        let snapshot = self.queue.lock().snapshot();

        let result = if snapshot.is_empty() {
            self.store.clear().await
        } else {
            self.store.save(&snapshot).await
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to persist queue state, continuing in memory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{Fields, Level, Record, Tags};

    fn log(message: &str) -> LogRecord {
        LogRecord {
            level: Level::Info,
            message: message.to_string(),
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
            device_id: Some("d_1".to_string()),
            trace_id: None,
            span_id: None,
            fields: Fields::new(),
            tags: Tags::new(),
            user: None,
            contexts: Fields::new(),
            extra: Fields::new(),
            sdk: None,
        }
    }

    fn state(messages: &[&str]) -> PersistedState {
        PersistedState {
            v: 1,
            first_queued_at_ms: 1_735_689_600_000,
            logs: messages.iter().map(|m| log(m)).collect(),
            track: vec![],
        }
    }

    #[test]
    fn test_state_uses_camel_case_keys() {
        let json = serde_json::to_value(state(&["a"])).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["firstQueuedAtMs"], 1_735_689_600_000i64);
        assert_eq!(json["logs"][0]["message"], "a");
        assert!(json["track"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_future_versions() {
        assert!(decode_state(br#"{"v":2,"logs":[]}"#).is_err());
        let state = decode_state(br#"{"logs":[]}"#).unwrap();
        assert_eq!(state.v, 1);
    }

    #[tokio::test]
    async fn test_file_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested").join("queue.json"));

        assert!(store.load().await.unwrap().is_none());

        store.save(&state(&["a", "b"])).await.unwrap();
        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded, state(&["a", "b"]));

        store.save(&state(&["c"])).await.unwrap();
        assert_eq!(store.load().await.unwrap().unwrap().logs.len(), 1);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        store.save(&PersistedState::default()).await.unwrap();
        assert!(!store.path().exists());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_reports_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, b"{not json").unwrap();

        let store = FileStore::new(path);
        assert!(store.load().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.save(&state(&["a"])).await.unwrap();

        let shared = store.clone();
        assert_eq!(shared.load().await.unwrap().unwrap().logs[0].message, "a");

        store.clear().await.unwrap();
        assert!(shared.raw().is_none());
    }

    #[tokio::test]
    async fn test_persister_writes_and_clears() {
        let store = MemoryStore::new();
        let queue = Arc::new(Mutex::new(QueueStore::new(10)));
        let persister = Persister::spawn(Arc::new(store.clone()), queue.clone(), Duration::ZERO);

        queue.lock().enqueue(Record::Log(log("a")));
        persister.schedule();
        persister.flush().await;
        assert_eq!(store.load().await.unwrap().unwrap().logs.len(), 1);

        queue.lock().remove_batch(crate::telemetry::QueueKind::Logs, 1);
        persister.schedule();
        persister.shutdown().await;
        assert!(store.raw().is_none());
    }

    #[tokio::test]
    async fn test_persister_debounces_writes() {
        let store = MemoryStore::new();
        let queue = Arc::new(Mutex::new(QueueStore::new(10)));
        let persister = Persister::spawn(
            Arc::new(store.clone()),
            queue.clone(),
            Duration::from_millis(100),
        );

        queue.lock().enqueue(Record::Log(log("a")));
        persister.schedule();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.raw().is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.raw().is_some());

        persister.shutdown().await;
    }
}
