//! Error capture: turns host-level failures into log records
//!
//! Sources are installed once per client and report through a
//! [`CaptureSink`], which only holds a weak reference to the client.

use crate::client::WeakClient;
use crate::errors::{LogtapError, Result};
use crate::payload::in_before_send;
use crate::telemetry::{Fields, Level};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    // Set by the panic hook when it queued a record for the panic that is
    // unwinding on this thread.
    static PANIC_REPORTED: Cell<bool> = const { Cell::new(false) };
}

/// Whether the panic hook already reported the last panic on this thread.
/// Clears the mark.
fn take_panic_reported() -> bool {
    PANIC_REPORTED.with(|flag| flag.replace(false))
}

/// Marks the current thread as capturing until dropped.
struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> Option<Self> {
        CAPTURING.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(ReentrancyGuard)
            }
        })
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        CAPTURING.with(|flag| flag.set(false));
    }
}

/// Where error sources deliver captured failures.
#[derive(Clone, Debug)]
pub struct CaptureSink {
    client: WeakClient,
}

impl CaptureSink {
    pub fn new(client: WeakClient) -> Self {
        Self { client }
    }

    /// Queue a record for a captured failure. Re-entrant calls on the same
    /// thread, calls after the client is gone and failures while capturing
    /// are all ignored. Returns whether a record was queued.
    pub fn report(&self, level: Level, message: &str, fields: Fields) -> bool {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return false;
        };
        let Some(client) = self.client.upgrade() else {
            return false;
        };

        panic::catch_unwind(AssertUnwindSafe(|| client.capture(level, message, fields)))
            .unwrap_or(false)
    }
}

/// A host facility that produces failure signals.
pub trait ErrorSignalSource: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Start forwarding failures to `sink`.
    fn install(&self, sink: CaptureSink) -> Result<()>;
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn panic_fields(info: &PanicHookInfo<'_>) -> Fields {
    let mut fields = Fields::new();
    fields.insert("kind".to_string(), Value::from("panic"));
    fields.insert("panic".to_string(), Value::from(panic_message(info.payload())));
    if let Some(location) = info.location() {
        fields.insert(
            "location".to_string(),
            Value::from(format!("{}:{}:{}", location.file(), location.line(), location.column())),
        );
    }
    if let Some(name) = std::thread::current().name() {
        fields.insert("thread".to_string(), Value::from(name));
    }
    fields.insert(
        "backtrace".to_string(),
        Value::from(std::backtrace::Backtrace::force_capture().to_string()),
    );
    fields
}

/// Reports every panic in the process as a `fatal` log, then hands it on to
/// the hook that was installed before.
#[derive(Debug, Default)]
pub struct PanicHookSource {
    installed: OnceLock<()>,
}

impl PanicHookSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ErrorSignalSource for PanicHookSource {
    fn name(&self) -> &'static str {
        "panic_hook"
    }

    fn install(&self, sink: CaptureSink) -> Result<()> {
        if self.installed.set(()).is_err() {
            return Err(LogtapError::hook("panic hook already installed"));
        }

        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            // before_send panics are caught by the builder and keep their record.
            if !in_before_send() && sink.report(Level::Fatal, "panic", panic_fields(info)) {
                PANIC_REPORTED.with(|flag| flag.set(true));
            }
            previous(info);
        }));

        debug!("Panic hook installed");
        Ok(())
    }
}

/// Spawns tasks whose errors and panics are reported to the client: an
/// `Err` result becomes an `error` log, a panic a `fatal` one. A panic the
/// panic hook already reported is not reported twice.
#[derive(Clone, Debug, Default)]
pub struct TaskMonitor {
    sink: Arc<OnceLock<CaptureSink>>,
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `future` on the current runtime. The handle yields the task's
    /// value, or `None` when it failed.
    pub fn spawn<F, T, E>(&self, name: impl Into<String>, future: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let name = name.into();
        let sink = self.sink.get().cloned();

        tokio::spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(e)) => {
                    warn!(task = %name, error = %e, "Monitored task failed");
                    if let Some(sink) = &sink {
                        let mut fields = Fields::new();
                        fields.insert("kind".to_string(), Value::from("task_error"));
                        fields.insert("task".to_string(), Value::from(name.clone()));
                        fields.insert("error".to_string(), Value::from(e.to_string()));
                        sink.report(Level::Error, &format!("task {} failed: {}", name, e), fields);
                    }
                    None
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(task = %name, panic = %message, "Monitored task panicked");
                    if take_panic_reported() {
                        return None;
                    }
                    if let Some(sink) = &sink {
                        let mut fields = Fields::new();
                        fields.insert("kind".to_string(), Value::from("task_panic"));
                        fields.insert("task".to_string(), Value::from(name.clone()));
                        fields.insert("panic".to_string(), Value::from(message.clone()));
                        sink.report(Level::Fatal, &format!("task {} panicked: {}", name, message), fields);
                    }
                    None
                }
            }
        })
    }
}

impl ErrorSignalSource for TaskMonitor {
    fn name(&self) -> &'static str {
        "task_monitor"
    }

    fn install(&self, sink: CaptureSink) -> Result<()> {
        self.sink
            .set(sink)
            .map_err(|_| LogtapError::hook("task monitor already installed"))
    }
}
