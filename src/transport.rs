//! HTTP transport layer for sending batches to the ingestion API

use crate::config::Config;
use crate::errors::{LogtapError, Result};
use crate::telemetry::{Batch, SDK_NAME, SDK_VERSION};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Result of one transmission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The server accepted the batch (2xx).
    Delivered,
    /// Network failure, timeout, 408, 429, 5xx or anything unexpected.
    Retry,
    /// The server refused the batch with a 4xx that retrying will not fix.
    Rejected(u16),
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Classify an HTTP status into a delivery outcome
pub fn classify_status(status: StatusCode) -> DeliveryOutcome {
    match status.as_u16() {
        200..=299 => DeliveryOutcome::Delivered,
        408 | 429 => DeliveryOutcome::Retry,
        code @ 400..=499 => DeliveryOutcome::Rejected(code),
        _ => DeliveryOutcome::Retry,
    }
}

/// Request body compression.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Value for the `Content-Encoding` header, `None` for an untouched body.
    fn encoding(&self) -> Option<&'static str>;

    fn compress(&self, body: &[u8]) -> std::io::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor {
    level: Option<u32>,
}

impl GzipCompressor {
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Some(level.min(9)),
        }
    }
}

impl Compressor for GzipCompressor {
    fn encoding(&self) -> Option<&'static str> {
        Some("gzip")
    }

    fn compress(&self, body: &[u8]) -> std::io::Result<Vec<u8>> {
        let level = self.level.map(Compression::new).unwrap_or_default();
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), level);
        encoder.write_all(body)?;
        encoder.finish()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn encoding(&self) -> Option<&'static str> {
        None
    }

    fn compress(&self, body: &[u8]) -> std::io::Result<Vec<u8>> {
        Ok(body.to_vec())
    }
}

/// Compressor matching the `gzip` configuration flag
pub fn compressor_for(config: &Config) -> Arc<dyn Compressor> {
    if config.gzip {
        Arc::new(GzipCompressor::default())
    } else {
        Arc::new(IdentityCompressor)
    }
}

/// Anything that can deliver a batch to its queue's endpoint.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn post(&self, batch: &Batch) -> DeliveryOutcome;
}

/// HTTP transport for telemetry batches
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    project_key: Option<String>,
    compressor: Arc<dyn Compressor>,
}

impl HttpTransport {
    /// Create a new HTTP transport from a validated configuration
    pub fn new(config: &Config, compressor: Arc<dyn Compressor>) -> Result<Self> {
        let base_url = config.normalized_base_url().map_err(LogtapError::Config)?;

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("{}/{}", SDK_NAME, SDK_VERSION))
            .build()
            .map_err(LogtapError::Http)?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/{}", base_url, config.project_id.trim()),
            project_key: config
                .project_key
                .as_ref()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            compressor,
        })
    }

    /// Full URL a batch of the given kind is posted to
    pub fn url_for(&self, batch: &Batch) -> String {
        format!("{}{}", self.endpoint, batch.kind().path())
    }

    /// Compress the body, falling back to the raw bytes if that fails.
    fn encode_body(&self, body: Vec<u8>) -> (Vec<u8>, Option<&'static str>) {
        let Some(encoding) = self.compressor.encoding() else {
            return (body, None);
        };

        match self.compressor.compress(&body) {
            Ok(compressed) => (compressed, Some(encoding)),
            Err(e) => {
                warn!(error = %e, "Compression failed, sending uncompressed body");
                (body, None)
            }
        }
    }

    async fn handle_response(&self, response: Response, kind: &str, count: usize) -> DeliveryOutcome {
        let status = response.status();
        let outcome = classify_status(status);

        if outcome.is_delivered() {
            debug!(kind, count, %status, "Batch accepted by server");
            return outcome;
        }

        let error_body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        match status.as_u16() {
            400 => warn!(kind, count, body = %error_body, "Bad request for batch"),
            401 | 403 => warn!(kind, count, %status, body = %error_body, "Project key refused"),
            404 => warn!(kind, count, body = %error_body, "Ingestion endpoint not found"),
            413 => warn!(kind, count, body = %error_body, "Batch too large"),
            429 => warn!(kind, count, body = %error_body, "Rate limited"),
            500..=599 => warn!(kind, count, %status, body = %error_body, "Server error"),
            _ => warn!(kind, count, %status, body = %error_body, "Unexpected response"),
        }

        outcome
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, batch: &Batch) -> DeliveryOutcome {
        let kind = batch.kind().to_string();
        let url = self.url_for(batch);

        let body = match batch.to_json() {
            Ok(body) => body,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to serialize batch");
                return DeliveryOutcome::Retry;
            }
        };
        let (body, encoding) = self.encode_body(body);

        debug!(kind = %kind, count = batch.len(), bytes = body.len(), url = %url, "Sending batch");

        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(encoding) = encoding {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        if let Some(key) = &self.project_key {
            request = request.header("X-Project-Key", key);
        }

        match request.send().await {
            Ok(response) => self.handle_response(response, &kind, batch.len()).await,
            Err(e) => {
                if e.is_timeout() {
                    warn!(kind = %kind, url = %url, "Request timed out");
                } else {
                    warn!(kind = %kind, url = %url, error = %e, "Request failed");
                }
                DeliveryOutcome::Retry
            }
        }
    }
}

/// Transport wrapper that records delivery metrics
#[derive(Debug)]
pub struct MeteredTransport {
    inner: Arc<dyn Transport>,
    metrics: TransportMetrics,
}

impl MeteredTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            metrics: TransportMetrics::default(),
        }
    }

    pub fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[async_trait]
impl Transport for MeteredTransport {
    async fn post(&self, batch: &Batch) -> DeliveryOutcome {
        let start = Instant::now();
        let outcome = self.inner.post(batch).await;
        self.metrics.record(outcome, batch.len(), start.elapsed());
        outcome
    }
}

#[derive(Debug, Default)]
struct TransportMetrics {
    attempts: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    rejected: AtomicU64,
    records_sent: AtomicU64,
    total_duration_ms: AtomicU64,
    max_duration_ms: AtomicU64,
}

impl TransportMetrics {
    fn record(&self, outcome: DeliveryOutcome, count: usize, duration: Duration) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match outcome {
            DeliveryOutcome::Delivered => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                self.records_sent.fetch_add(count as u64, Ordering::Relaxed);
            }
            DeliveryOutcome::Retry => {
                self.retried.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::Rejected(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
            }
        }

        let ms = duration.as_millis() as u64;
        self.total_duration_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_duration_ms.fetch_max(ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportMetricsSnapshot {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let delivered = self.delivered.load(Ordering::Relaxed);
        let total = self.total_duration_ms.load(Ordering::Relaxed);

        TransportMetricsSnapshot {
            attempts,
            delivered,
            retried: self.retried.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            records_sent: self.records_sent.load(Ordering::Relaxed),
            success_rate: if attempts > 0 {
                (delivered as f64 / attempts as f64) * 100.0
            } else {
                0.0
            },
            avg_duration_ms: if attempts > 0 { total / attempts } else { 0 },
            max_duration_ms: self.max_duration_ms.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of transport metrics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportMetricsSnapshot {
    pub attempts: u64,
    pub delivered: u64,
    pub retried: u64,
    pub rejected: u64,
    pub records_sent: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub max_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[derive(Debug)]
    struct Fixed(DeliveryOutcome);

    #[async_trait]
    impl Transport for Fixed {
        async fn post(&self, _batch: &Batch) -> DeliveryOutcome {
            self.0
        }
    }

    #[derive(Debug)]
    struct Broken;

    impl Compressor for Broken {
        fn encoding(&self) -> Option<&'static str> {
            Some("gzip")
        }

        fn compress(&self, _body: &[u8]) -> std::io::Result<Vec<u8>> {
            Err(std::io::Error::other("no space"))
        }
    }

    fn config() -> Config {
        Config::new("https://ingest.example.com/", "proj")
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::OK), DeliveryOutcome::Delivered);
        assert_eq!(classify_status(StatusCode::ACCEPTED), DeliveryOutcome::Delivered);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), DeliveryOutcome::Retry);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), DeliveryOutcome::Retry);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), DeliveryOutcome::Retry);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), DeliveryOutcome::Rejected(400));
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), DeliveryOutcome::Rejected(401));
        assert_eq!(classify_status(StatusCode::MOVED_PERMANENTLY), DeliveryOutcome::Retry);
    }

    #[test]
    fn test_transport_creation() {
        let transport = HttpTransport::new(&config(), Arc::new(IdentityCompressor)).unwrap();
        assert_eq!(
            transport.url_for(&Batch::Logs(vec![])),
            "https://ingest.example.com/api/proj/logs/"
        );
        assert_eq!(
            transport.url_for(&Batch::Track(vec![])),
            "https://ingest.example.com/api/proj/track/"
        );
        assert!(transport.project_key.is_none());
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        let config = Config::new("ftp://nope", "proj");
        let err = HttpTransport::new(&config, Arc::new(IdentityCompressor)).unwrap_err();
        assert!(matches!(err, LogtapError::Config(_)));
    }

    #[test]
    fn test_gzip_compressor_round_trip() {
        let body = br#"[{"level":"info","message":"hello"}]"#.repeat(20);
        let compressed = GzipCompressor::default().compress(&body).unwrap();
        assert!(compressed.len() < body.len());

        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_compression_failure_falls_back_to_raw_body() {
        let transport = HttpTransport::new(&config(), Arc::new(Broken)).unwrap();
        let (body, encoding) = transport.encode_body(b"[]".to_vec());
        assert_eq!(body, b"[]");
        assert!(encoding.is_none());

        let gzip = HttpTransport::new(&config(), Arc::new(GzipCompressor::with_level(6))).unwrap();
        let (_, encoding) = gzip.encode_body(b"[]".to_vec());
        assert_eq!(encoding, Some("gzip"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_retryable() {
        let mut config = Config::new("http://127.0.0.1:9", "proj");
        config.timeout = Duration::from_millis(200);
        let transport = HttpTransport::new(&config, Arc::new(IdentityCompressor)).unwrap();

        let outcome = transport.post(&Batch::Logs(vec![])).await;
        assert_eq!(outcome, DeliveryOutcome::Retry);
    }

    #[tokio::test]
    async fn test_transport_metrics() {
        let delivered = MeteredTransport::new(Arc::new(Fixed(DeliveryOutcome::Delivered)));
        assert_eq!(delivered.metrics(), TransportMetricsSnapshot::default());

        delivered.post(&Batch::Logs(vec![])).await;
        delivered.post(&Batch::Track(vec![])).await;
        let metrics = delivered.metrics();
        assert_eq!(metrics.attempts, 2);
        assert_eq!(metrics.delivered, 2);
        assert_eq!(metrics.success_rate, 100.0);

        let rejected = MeteredTransport::new(Arc::new(Fixed(DeliveryOutcome::Rejected(400))));
        rejected.post(&Batch::Logs(vec![])).await;
        assert_eq!(rejected.metrics().rejected, 1);
        assert_eq!(rejected.metrics().success_rate, 0.0);
    }
}
