//! logtap client library
//!
//! Buffers structured logs and analytics events in memory, batches them and
//! posts them to a logtap ingestion endpoint, retrying with backoff and
//! optionally keeping undelivered records on disk across restarts.

pub mod buffer;
pub mod capture;
pub mod client;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod errors;
pub mod log_parser;
pub mod payload;
pub mod persistence;
pub mod telemetry;
pub mod transport;

pub use buffer::QueueSizes;
pub use capture::{CaptureSink, ErrorSignalSource, PanicHookSource, TaskMonitor};
pub use client::{Client, ClientBuilder, ClientStats, WeakClient};
pub use config::Config;
pub use dispatcher::FlushOutcome;
pub use errors::{LogtapError, Result};
pub use payload::{LogOptions, TrackOptions};
pub use persistence::{DurableStore, FileStore, MemoryStore, PersistedState};
pub use telemetry::{Fields, Level, LogRecord, Record, Tags, Timestamp, TrackEvent, UserProfile};
pub use transport::{
    Compressor, DeliveryOutcome, GzipCompressor, HttpTransport, IdentityCompressor, Transport,
    TransportMetricsSnapshot,
};
