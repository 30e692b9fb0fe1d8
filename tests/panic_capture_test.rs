//! Installs a process-wide panic hook, so it lives in its own test binary.

use logtap::{Client, Config};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_thread_panic_is_sent_as_fatal_log() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/crashy/logs/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = Config::new(server.uri(), "crashy");
    config.flush_interval = Duration::ZERO;
    config.capture_panics = true;
    let client = Client::new(config).await.unwrap();

    let worker = std::thread::Builder::new()
        .name("worker".to_string())
        .spawn(|| panic!("boom"))
        .unwrap();
    assert!(worker.join().is_err());

    // Fatal records are flushed without waiting for a caller.
    let deadline = Instant::now() + Duration::from_secs(2);
    let received = loop {
        let received = server.received_requests().await.unwrap_or_default();
        if !received.is_empty() || Instant::now() >= deadline {
            break received;
        }
        sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(received.len(), 1);

    let body: Value = serde_json::from_slice(&received[0].body).unwrap();
    let record = &body[0];
    assert_eq!(record["level"], "fatal");
    assert_eq!(record["fields"]["kind"], "panic");
    assert_eq!(record["fields"]["panic"], "boom");
    assert_eq!(record["fields"]["thread"], "worker");
    assert!(record["fields"]["location"]
        .as_str()
        .unwrap()
        .contains("panic_capture_test.rs"));

    let outcome = client.close().await;
    assert!(outcome.is_drained());
}
