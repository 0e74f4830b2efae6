//! Integration tests for the idempotent producer: happy path, epoch
//! fencing with auto-claim, and ordered-acknowledgment under pipelining.

use durable_streams::Client;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> Client {
    Client::builder().base_url(server.uri()).build().unwrap()
}

#[tokio::test]
async fn producer_appends_are_acknowledged_via_flush() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/streams/p1"))
        .and(header("producer-id", "writer-1"))
        .respond_with(ResponseTemplate::new(200).insert_header("stream-next-offset", "o1"))
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/p1");
    let producer = stream
        .producer("writer-1")
        .linger(Duration::from_millis(1))
        .build()
        .unwrap();

    producer.append(b"one".to_vec());
    producer.append(b"two".to_vec());
    producer.flush().await.unwrap();

    assert!(producer.last_offset().is_some());
}

#[tokio::test]
async fn stale_epoch_without_auto_claim_reports_error() {
    let server = MockServer::start().await;
    let errors = Arc::new(std::sync::Mutex::new(Vec::new()));

    Mock::given(method("POST"))
        .and(path("/streams/p1"))
        .respond_with(ResponseTemplate::new(403).insert_header("producer-epoch", "7"))
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/p1");
    let errors_clone = errors.clone();
    let producer = stream
        .producer("writer-1")
        .epoch(1)
        .auto_claim(false)
        .linger(Duration::from_millis(1))
        .on_error(move |e| errors_clone.lock().unwrap().push(e.to_string()))
        .build()
        .unwrap();

    producer.append(b"one".to_vec());
    producer.flush().await.unwrap();

    let seen = errors.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("stale epoch"));
}

#[tokio::test]
async fn stale_epoch_with_auto_claim_retries_under_new_epoch() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicU64::new(0));
    let attempts_clone = attempts.clone();

    Mock::given(method("POST"))
        .and(path("/streams/p1"))
        .respond_with(move |_: &wiremock::Request| {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                ResponseTemplate::new(403).insert_header("producer-epoch", "5")
            } else {
                ResponseTemplate::new(200).insert_header("stream-next-offset", "o1")
            }
        })
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/p1");
    let producer = stream
        .producer("writer-1")
        .epoch(1)
        .auto_claim(true)
        .linger(Duration::from_millis(1))
        .build()
        .unwrap();

    producer.append(b"one".to_vec());
    producer.flush().await.unwrap();

    assert_eq!(producer.epoch(), 6);
    assert!(attempts.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn rate_limited_batch_retries_then_succeeds() {
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicU64::new(0));
    let attempts_clone = attempts.clone();

    Mock::given(method("POST"))
        .and(path("/streams/p1"))
        .respond_with(move |_: &wiremock::Request| {
            let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                ResponseTemplate::new(429)
            } else {
                ResponseTemplate::new(200).insert_header("stream-next-offset", "o1")
            }
        })
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/p1");
    let producer = stream
        .producer("writer-1")
        .linger(Duration::from_millis(1))
        .build()
        .unwrap();

    producer.append(b"one".to_vec());
    producer.flush().await.unwrap();

    assert!(producer.last_offset().is_some());
    assert!(attempts.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn builder_rejects_invalid_config() {
    let server = MockServer::start().await;
    let stream = client(&server).stream("/streams/p1");

    let err = stream.producer("").build().unwrap_err();
    assert!(matches!(
        err,
        durable_streams::ProducerError::InvalidConfig { .. }
    ));

    let err = stream.producer("ok").max_batch_bytes(0).build().unwrap_err();
    assert!(matches!(
        err,
        durable_streams::ProducerError::InvalidConfig { .. }
    ));
}
