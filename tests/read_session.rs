//! Integration tests for catch-up reads, long-poll tailing, and SSE framing
//! against a mock HTTP server.

use durable_streams::{Client, LiveMode, Offset};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> Client {
    Client::builder().base_url(server.uri()).build().unwrap()
}

#[tokio::test]
async fn catch_up_reads_until_up_to_date() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU64::new(0));
    let calls_clone = calls.clone();

    Mock::given(method("GET"))
        .and(path("/streams/s1"))
        .respond_with(move |_: &wiremock::Request| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                ResponseTemplate::new(200)
                    .insert_header("stream-next-offset", "o1")
                    .insert_header("stream-up-to-date", "false")
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(b"first".to_vec())
            } else {
                ResponseTemplate::new(200)
                    .insert_header("stream-next-offset", "o2")
                    .insert_header("stream-up-to-date", "true")
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(b"second".to_vec())
            }
        })
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    let mut reader = stream.read().offset(Offset::Beginning).build();

    let first = reader.next_chunk().await.unwrap().unwrap();
    assert_eq!(&first.data[..], b"first");
    assert!(!first.up_to_date);

    let second = reader.next_chunk().await.unwrap().unwrap();
    assert_eq!(&second.data[..], b"second");
    assert!(second.up_to_date);
}

#[tokio::test]
async fn not_found_stream_surfaces_as_not_found_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/streams/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/missing");
    let mut reader = stream.read().build();
    let err = reader.next_chunk().await.unwrap_err();
    assert!(matches!(err, durable_streams::StreamError::NotFound { .. }));
}

#[tokio::test]
async fn session_fan_out_delivers_to_multiple_subscribers() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicU64::new(0));
    let calls_clone = calls.clone();

    Mock::given(method("GET"))
        .and(path("/streams/s1"))
        .respond_with(move |_: &wiremock::Request| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            ResponseTemplate::new(200)
                .insert_header("stream-next-offset", format!("o{n}"))
                .insert_header("stream-up-to-date", "true")
                .insert_header("content-type", "application/octet-stream")
                .set_body_bytes(b"payload".to_vec())
        })
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    let session = stream.read().offset(Offset::Beginning).open().await.unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _unsub = session.subscribe_bytes(move |dispatch| {
        let seen = seen_clone.clone();
        async move {
            seen.lock().unwrap().push(dispatch.data.clone());
        }
    });

    let body = session.body().await.unwrap();
    assert_eq!(&body[..], b"payload");

    // Give the subscriber's background task a few turns to observe the
    // same dispatch the accumulator above consumed.
    for _ in 0..20 {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn sse_stream_delivers_data_and_closes_on_control_up_to_date() {
    let server = MockServer::start().await;

    let body = concat!(
        "data: hello\n\n",
        "event: control\n",
        "data: {\"streamNextOffset\":\"o2\",\"upToDate\":true}\n\n",
    );

    Mock::given(method("GET"))
        .and(path("/streams/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_bytes(body.as_bytes().to_vec()),
        )
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    let mut reader = stream
        .read()
        .offset(Offset::Beginning)
        .live(LiveMode::Sse)
        .build();

    let first = reader.next_chunk().await.unwrap().unwrap();
    assert_eq!(&first.data[..], b"hello");
    assert!(!first.up_to_date);

    let second = reader.next_chunk().await.unwrap().unwrap();
    assert!(second.up_to_date);
    assert_eq!(second.next_offset, Offset::at("o2"));
}

#[tokio::test]
async fn opened_sse_session_parses_first_dispatch_through_sse_parser() {
    let server = MockServer::start().await;

    let body = concat!(
        "data: hello\n\n",
        "event: control\n",
        "data: {\"streamNextOffset\":\"o2\",\"upToDate\":true}\n\n",
    );

    Mock::given(method("GET"))
        .and(path("/streams/s1"))
        .and(header("accept", "text/event-stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_bytes(body.as_bytes().to_vec()),
        )
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    let session = stream
        .read()
        .offset(Offset::Beginning)
        .live(LiveMode::Sse)
        .open()
        .await
        .unwrap();

    // The first dispatch must have gone through SseParser (yielding the
    // decoded "hello" payload), not the raw "data: hello\n\n" SSE framing.
    let body = session.body().await.unwrap();
    assert_eq!(&body[..], b"hello");
}
