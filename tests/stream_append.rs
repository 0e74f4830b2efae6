//! Integration tests for `DurableStream` create/append/head/delete/close
//! against a mock HTTP server.

use durable_streams::{Client, Offset};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> Client {
    Client::builder().base_url(server.uri()).build().unwrap()
}

#[tokio::test]
async fn create_then_append_returns_next_offset() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("stream-next-offset", "offset-1")
                .insert_header("etag", "\"abc\""),
        )
        .expect(1)
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    stream.create().await.unwrap();

    let resp = stream.append(b"hello".to_vec()).await.unwrap();
    assert_eq!(resp.next_offset, Offset::at("offset-1"));
    assert_eq!(resp.etag.as_deref(), Some("\"abc\""));
    assert!(!resp.is_duplicate);
}

#[tokio::test]
async fn duplicate_append_reports_204() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(204).insert_header("stream-next-offset", "offset-1"))
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    let resp = stream
        .append_with(b"hello".to_vec(), Default::default())
        .await
        .unwrap();
    assert!(resp.is_duplicate);
}

#[tokio::test]
async fn empty_append_is_rejected_locally() {
    let server = MockServer::start().await;
    let stream = client(&server).stream("/streams/s1");
    let err = stream.append(Vec::new()).await.unwrap_err();
    assert!(matches!(err, durable_streams::StreamError::EmptyAppend));
}

#[tokio::test]
async fn json_scalar_body_is_wrapped_in_single_element_array() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .and(body_json(json!([{"hello": "world"}])))
        .respond_with(ResponseTemplate::new(200).insert_header("stream-next-offset", "o1"))
        .expect(1)
        .mount(&server)
        .await;

    let mut stream = client(&server).stream("/streams/s1");
    stream.set_content_type("application/json");

    let body = serde_json::to_vec(&json!({"hello": "world"})).unwrap();
    stream.append(body).await.unwrap();
}

#[tokio::test]
async fn json_array_body_is_not_double_wrapped() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .and(body_json(json!([1, 2, 3])))
        .respond_with(ResponseTemplate::new(200).insert_header("stream-next-offset", "o1"))
        .expect(1)
        .mount(&server)
        .await;

    let mut stream = client(&server).stream("/streams/s1");
    stream.set_content_type("application/json");

    let body = serde_json::to_vec(&json!([1, 2, 3])).unwrap();
    stream.append(body).await.unwrap();
}

#[tokio::test]
async fn head_reports_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/streams/s1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("stream-next-offset", "offset-9")
                .insert_header("content-type", "application/octet-stream")
                .insert_header("stream-ttl", "3600"),
        )
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    let head = stream.head().await.unwrap();
    assert_eq!(head.next_offset, Offset::at("offset-9"));
    assert_eq!(head.ttl, Some(std::time::Duration::from_secs(3600)));
}

#[tokio::test]
async fn head_not_found_maps_to_not_found_error() {
    let server = MockServer::start().await;

    Mock::given(method("HEAD"))
        .and(path("/streams/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/missing");
    let err = stream.head().await.unwrap_err();
    assert!(matches!(err, durable_streams::StreamError::NotFound { .. }));
}

#[tokio::test]
async fn close_is_idempotent_on_204() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .and(header("stream-closed", "true"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    stream.close().await.unwrap();
}

#[tokio::test]
async fn delete_removes_stream() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1");
    stream.delete().await.unwrap();
}

#[tokio::test]
async fn enable_batching_coalesces_concurrent_appends() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/streams/s1"))
        .respond_with(ResponseTemplate::new(200).insert_header("stream-next-offset", "o1"))
        .mount(&server)
        .await;

    let stream = client(&server).stream("/streams/s1").enable_batching();

    let a = stream.clone();
    let b = stream.clone();
    let (ra, rb) = tokio::join!(a.append(b"one".to_vec()), b.append(b"two".to_vec()));
    ra.unwrap();
    rb.unwrap();
}
