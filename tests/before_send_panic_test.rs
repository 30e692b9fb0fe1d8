//! Installs a process-wide panic hook, so it lives in its own test binary.

use logtap::{Client, Config};
use serde_json::Value;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_panicking_before_send_keeps_record_with_panic_capture() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/hooked/logs/"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config =
        Config::new(server.uri(), "hooked").with_before_send(|_| panic!("hook exploded"));
    config.flush_interval = Duration::ZERO;
    config.capture_panics = true;
    let client = Client::new(config).await.unwrap();

    assert!(client.info("hello", None));
    assert_eq!(client.sizes().logs, 1);

    let outcome = client.flush().await;
    assert_eq!(outcome.sent, 1);

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    let body: Value = serde_json::from_slice(&received[0].body).unwrap();
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["level"], "info");
    assert_eq!(records[0]["message"], "hello");

    assert!(client.close().await.is_drained());
}
