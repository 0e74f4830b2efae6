//! Stream handle and operations.

use crate::client::Client;
use crate::error::StreamError;
use crate::iterator::ReadBuilder;
use crate::producer::ProducerBuilder;
use crate::types::Offset;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

/// Protocol header names
pub(crate) const HEADER_CONTENT_TYPE: &str = "content-type";
pub(crate) const HEADER_STREAM_OFFSET: &str = "stream-next-offset";
pub(crate) const HEADER_STREAM_CURSOR: &str = "stream-cursor";
pub(crate) const HEADER_STREAM_UP_TO_DATE: &str = "stream-up-to-date";
pub(crate) const HEADER_STREAM_SEQ: &str = "stream-seq";
pub(crate) const HEADER_STREAM_TTL: &str = "stream-ttl";
pub(crate) const HEADER_STREAM_EXPIRES: &str = "stream-expires-at";
pub(crate) const HEADER_ETAG: &str = "etag";
pub(crate) const HEADER_IF_MATCH: &str = "if-match";
pub(crate) const HEADER_STREAM_CLOSED: &str = "stream-closed";

/// Producer headers
pub(crate) const HEADER_PRODUCER_ID: &str = "producer-id";
pub(crate) const HEADER_PRODUCER_EPOCH: &str = "producer-epoch";
pub(crate) const HEADER_PRODUCER_SEQ: &str = "producer-seq";
pub(crate) const HEADER_PRODUCER_EXPECTED_SEQ: &str = "producer-expected-seq";

/// Maximum retries for transient errors on append operations
const MAX_APPEND_RETRIES: u32 = 3;

/// A handle to a durable stream.
///
/// This is a lightweight, cloneable object - not a persistent connection.
/// Operations make HTTP requests on demand.
#[derive(Clone)]
pub struct DurableStream {
    pub(crate) url: String,
    pub(crate) client: Client,
    pub(crate) content_type: Option<String>,
    batching: Option<Arc<AsyncMutex<CoalesceState>>>,
}

impl std::fmt::Debug for DurableStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStream")
            .field("url", &self.url)
            .field("content_type", &self.content_type)
            .field("batching", &self.batching.is_some())
            .finish()
    }
}

/// Pending appends awaiting coalescing into a single in-flight POST. Not
/// exactly-once (see [`DurableStream::enable_batching`]) - a separate
/// concern from the [`Producer`](crate::Producer)'s sequence-fenced batching.
struct CoalesceState {
    pending: Vec<Bytes>,
    waiters: Vec<oneshot::Sender<Result<AppendResponse, Arc<StreamError>>>>,
    sending: bool,
}

impl DurableStream {
    /// Enable coalescing of concurrent `append()` calls: while a POST for
    /// this handle is in flight, further `append()` calls queue instead of
    /// firing their own request, then are merged (byte concatenation, or
    /// JSON-array merge in JSON mode) into the next POST. Returns a new
    /// handle sharing the coalescing buffer with every clone taken from it.
    ///
    /// This does not provide exactly-once delivery - retries of a coalesced
    /// POST can still duplicate data. Use [`Producer`](crate::Producer) when
    /// that matters.
    pub fn enable_batching(&self) -> Self {
        let mut s = self.clone();
        s.batching = Some(Arc::new(AsyncMutex::new(CoalesceState {
            pending: Vec::new(),
            waiters: Vec::new(),
            sending: false,
        })));
        s
    }

    /// Get the stream URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the content type set on this stream handle.
    ///
    /// This is used as the default Content-Type for append operations
    /// and by the Producer for JSON mode detection.
    ///
    /// Note: This is not automatically populated from the server.
    /// Use [`set_content_type`](Self::set_content_type) to set it after
    /// creating a stream, or set it explicitly on the Producer.
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Set the content type for this stream handle.
    ///
    /// This affects append operations and Producer JSON mode detection.
    ///
    /// # Example
    /// ```ignore
    /// let mut stream = client.stream("...");
    /// stream.set_content_type("application/json");
    /// ```
    pub fn set_content_type(&mut self, ct: impl Into<String>) {
        self.content_type = Some(ct.into());
    }

    /// Create the stream.
    ///
    /// Idempotent - succeeds if stream already exists with matching config.
    /// Returns `StreamError::Conflict` only if config differs.
    pub async fn create(&self) -> Result<(), StreamError> {
        self.create_with(CreateOptions::default()).await
    }

    /// Create the stream with options.
    pub async fn create_with(&self, options: CreateOptions) -> Result<(), StreamError> {
        let content_type = options
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        let mut req = self
            .client
            .inner
            .put(&self.url)
            .header(HEADER_CONTENT_TYPE, content_type);

        // Add TTL header if specified
        if let Some(ttl) = options.ttl {
            req = req.header(HEADER_STREAM_TTL, ttl.as_secs().to_string());
        }

        // Add expires header if specified
        if let Some(expires) = &options.expires_at {
            req = req.header(HEADER_STREAM_EXPIRES, expires);
        }

        // Add custom headers
        let client_headers = self.client.get_headers();
        for (key, value) in client_headers.iter() {
            req = req.header(key.clone(), value.clone());
        }

        for (key, value) in &options.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        // Add initial data if provided
        if let Some(data) = options.initial_data {
            req = req.body(data);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        match status {
            200 | 201 | 204 => Ok(()),
            409 => Err(StreamError::Conflict),
            _ => Err(StreamError::from_status(status, &self.url)),
        }
    }

    /// Append data to the stream.
    pub async fn append(&self, data: impl Into<Bytes>) -> Result<AppendResponse, StreamError> {
        self.append_with(data, AppendOptions::default()).await
    }

    /// Append data with options.
    ///
    /// If the stream's content type is JSON and `data` does not already
    /// parse as a top-level JSON array, it is wrapped into a single-element
    /// array so message boundaries survive the write. If
    /// [`enable_batching`](Self::enable_batching) is set, the append is
    /// queued and coalesced with any others racing it rather than sent
    /// immediately.
    pub async fn append_with(
        &self,
        data: impl Into<Bytes>,
        options: AppendOptions,
    ) -> Result<AppendResponse, StreamError> {
        let data = data.into();
        if data.is_empty() {
            return Err(StreamError::EmptyAppend);
        }

        let data = json_wrap_single(self.content_type.as_deref(), data);

        match &self.batching {
            Some(coalesce) => self.append_coalesced(coalesce, data, options).await,
            None => self.append_direct(data, options).await,
        }
    }

    /// Queue `data` behind this handle's coalescing buffer and merge it with
    /// whatever else is pending into the next outgoing POST. Every caller
    /// queued during the same send receives the same broadcast result.
    async fn append_coalesced(
        &self,
        coalesce: &Arc<AsyncMutex<CoalesceState>>,
        data: Bytes,
        options: AppendOptions,
    ) -> Result<AppendResponse, StreamError> {
        let (tx, rx) = oneshot::channel();
        let should_spawn = {
            let mut state = coalesce.lock().await;
            state.pending.push(data);
            state.waiters.push(tx);
            if state.sending {
                false
            } else {
                state.sending = true;
                true
            }
        };

        if should_spawn {
            let this = self.clone();
            let coalesce = coalesce.clone();
            tokio::spawn(async move {
                loop {
                    let (items, waiters) = {
                        let mut state = coalesce.lock().await;
                        (
                            std::mem::take(&mut state.pending),
                            std::mem::take(&mut state.waiters),
                        )
                    };

                    let merged = merge_bytes(this.content_type.as_deref(), items);
                    let result = this
                        .append_direct(merged, options.clone())
                        .await
                        .map_err(Arc::new);
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }

                    let mut state = coalesce.lock().await;
                    if state.pending.is_empty() {
                        state.sending = false;
                        break;
                    }
                }
            });
        }

        rx.await
            .unwrap_or(Err(Arc::new(StreamError::IteratorClosed)))
            .map_err(|e| StreamError::from_shared(&e))
    }

    /// Close the stream: no further appends are accepted after this
    /// succeeds, though readers may still drain what was already written.
    /// Idempotent - closing an already-closed stream also returns `Ok`.
    pub async fn close(&self) -> Result<(), StreamError> {
        let mut req = self
            .client
            .inner
            .post(&self.url)
            .header(HEADER_STREAM_CLOSED, "true")
            .body(Bytes::new());

        let client_headers = self.client.get_headers();
        for (key, value) in client_headers.iter() {
            req = req.header(key.clone(), value.clone());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        match status {
            200 | 204 => Ok(()),
            404 => Err(StreamError::NotFound {
                url: self.url.clone(),
            }),
            _ => Err(StreamError::from_status(status, &self.url)),
        }
    }

    /// Send a single append POST, retrying transient server errors.
    ///
    /// Not safe to call directly with caller-controlled retries on a plain
    /// (non-producer) append: a retried POST here can duplicate data if the
    /// first attempt's response was lost rather than never received.
    async fn append_direct(
        &self,
        data: Bytes,
        options: AppendOptions,
    ) -> Result<AppendResponse, StreamError> {
        let content_type = self
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream");

        // Retry logic for transient errors
        let mut last_error = None;

        for attempt in 0..=MAX_APPEND_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 100ms, 200ms, 400ms
                tokio::time::sleep(std::time::Duration::from_millis(100 * (1 << (attempt - 1)))).await;
            }

            let mut req = self
                .client
                .inner
                .post(&self.url)
                .header(HEADER_CONTENT_TYPE, content_type)
                .body(data.clone());

            // Add sequence header if specified
            if let Some(seq) = &options.seq {
                req = req.header(HEADER_STREAM_SEQ, seq.as_str());
            }

            // Add if-match header if specified
            if let Some(etag) = &options.if_match {
                req = req.header(HEADER_IF_MATCH, etag.as_str());
            }

            // Add custom headers
            let client_headers = self.client.get_headers();
            for (key, value) in client_headers.iter() {
                req = req.header(key.clone(), value.clone());
            }

            for (key, value) in &options.headers {
                req = req.header(key.as_str(), value.as_str());
            }

            let resp = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(StreamError::from(e));
                    continue; // Retry on network error
                }
            };

            let status = resp.status().as_u16();

            match status {
                200 | 201 | 204 => {
                    let next_offset = resp
                        .headers()
                        .get(HEADER_STREAM_OFFSET)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| Offset::parse(s))
                        .unwrap_or(Offset::Beginning);

                    let etag = resp
                        .headers()
                        .get(HEADER_ETAG)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());

                    return Ok(AppendResponse {
                        next_offset,
                        etag,
                        is_duplicate: status == 204,
                    });
                }
                404 => return Err(StreamError::NotFound {
                    url: self.url.clone(),
                }),
                409 => return Err(StreamError::SeqConflict),
                // Retry on transient server errors
                500 | 502 | 503 | 504 | 429 => {
                    last_error = Some(StreamError::from_status(status, &self.url));
                    continue;
                }
                _ => return Err(StreamError::from_status(status, &self.url)),
            }
        }

        // Return last error if all retries failed
        Err(last_error.unwrap_or_else(|| StreamError::ServerError {
            status: 500,
            message: "All retries failed".to_string(),
        }))
    }

    /// Get stream metadata via HEAD request.
    pub async fn head(&self) -> Result<HeadResponse, StreamError> {
        self.head_with(HeadOptions::default()).await
    }

    /// Get stream metadata with options.
    pub async fn head_with(&self, options: HeadOptions) -> Result<HeadResponse, StreamError> {
        let mut req = self.client.inner.head(&self.url);

        // Add custom headers
        let client_headers = self.client.get_headers();
        for (key, value) in client_headers.iter() {
            req = req.header(key.clone(), value.clone());
        }

        for (key, value) in &options.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        match status {
            200 => {
                let next_offset = resp
                    .headers()
                    .get(HEADER_STREAM_OFFSET)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| Offset::parse(s))
                    .unwrap_or(Offset::Beginning);

                let content_type = resp
                    .headers()
                    .get(HEADER_CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                let ttl = resp
                    .headers()
                    .get(HEADER_STREAM_TTL)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs);

                let expires_at = resp
                    .headers()
                    .get(HEADER_STREAM_EXPIRES)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                let etag = resp
                    .headers()
                    .get(HEADER_ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());

                Ok(HeadResponse {
                    next_offset,
                    content_type,
                    ttl,
                    expires_at,
                    etag,
                })
            }
            404 => Err(StreamError::NotFound {
                url: self.url.clone(),
            }),
            _ => Err(StreamError::from_status(status, &self.url)),
        }
    }

    /// Delete the stream.
    pub async fn delete(&self) -> Result<(), StreamError> {
        self.delete_with(DeleteOptions::default()).await
    }

    /// Delete the stream with options.
    pub async fn delete_with(&self, options: DeleteOptions) -> Result<(), StreamError> {
        let mut req = self.client.inner.delete(&self.url);

        // Add custom headers
        let client_headers = self.client.get_headers();
        for (key, value) in client_headers.iter() {
            req = req.header(key.clone(), value.clone());
        }

        for (key, value) in &options.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        match status {
            200 | 204 => Ok(()),
            404 => Err(StreamError::NotFound {
                url: self.url.clone(),
            }),
            _ => Err(StreamError::from_status(status, &self.url)),
        }
    }

    /// Create a reader builder for consuming the stream.
    pub fn read(&self) -> ReadBuilder {
        ReadBuilder::new(self.clone())
    }

    /// Create an idempotent producer builder.
    pub fn producer(&self, producer_id: impl Into<String>) -> ProducerBuilder {
        ProducerBuilder::new(self.clone(), producer_id.into())
    }

    /// Build a read URL with query parameters, merging in caller-supplied
    /// extras and sorting every parameter lexicographically by key. Stable
    /// key ordering matters here: a CDN sitting in front of the stream
    /// collapses concurrent long-poll requests by URL, so two callers
    /// asking for the same offset/live/cursor (plus the same extra params,
    /// in whatever order they were added) must produce byte-identical URLs.
    pub(crate) fn build_read_url(
        &self,
        offset: &Offset,
        live: Option<&str>,
        cursor: Option<&str>,
        extra: &[(String, String)],
    ) -> String {
        let mut params: Vec<(String, String)> =
            vec![("offset".to_string(), offset.to_query_value().to_string())];
        if let Some(live) = live {
            params.push(("live".to_string(), live.to_string()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor".to_string(), cursor.to_string()));
        }
        params.extend(extra.iter().cloned());
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let mut url = self.url.clone();
        url.push(if url.contains('?') { '&' } else { '?' });
        let encoded: Vec<String> = params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect();
        url.push_str(&encoded.join("&"));
        url
    }
}

/// Options for creating a stream.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct CreateOptions {
    pub content_type: Option<String>,
    pub ttl: Option<Duration>,
    pub expires_at: Option<String>,
    pub headers: Vec<(String, String)>,
    pub initial_data: Option<Bytes>,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(mut self, ct: impl Into<String>) -> Self {
        self.content_type = Some(ct.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn expires_at(mut self, expires: impl Into<String>) -> Self {
        self.expires_at = Some(expires.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn initial_data(mut self, data: impl Into<Bytes>) -> Self {
        self.initial_data = Some(data.into());
        self
    }
}

/// Options for appending to a stream.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct AppendOptions {
    pub seq: Option<String>,
    pub if_match: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl AppendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq(mut self, seq: impl Into<String>) -> Self {
        self.seq = Some(seq.into());
        self
    }

    pub fn if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Options for HEAD request.
#[derive(Clone, Debug, Default)]
pub struct HeadOptions {
    pub headers: Vec<(String, String)>,
}

impl HeadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Options for DELETE request.
#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    pub headers: Vec<(String, String)>,
}

impl DeleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Response from an append operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct AppendResponse {
    pub next_offset: Offset,
    pub etag: Option<String>,
    /// `true` if the server recognized this as a retry of an already-applied
    /// append (204) rather than a fresh write (200/201).
    pub is_duplicate: bool,
}

/// Response from a HEAD operation.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct HeadResponse {
    pub next_offset: Offset,
    pub content_type: Option<String>,
    pub ttl: Option<Duration>,
    pub expires_at: Option<String>,
    pub etag: Option<String>,
}

/// If `content_type` is JSON and `data` is not already a top-level JSON
/// array, wrap it in a single-element array so it round-trips as one
/// message. Non-JSON content types and already-array bodies pass through
/// unchanged.
fn json_wrap_single(content_type: Option<&str>, data: Bytes) -> Bytes {
    if !is_json_content_type(content_type) {
        return data;
    }
    match serde_json::from_slice::<serde_json::Value>(&data) {
        Ok(serde_json::Value::Array(_)) => data,
        Ok(value) => serde_json::to_vec(&serde_json::Value::Array(vec![value]))
            .map(Bytes::from)
            .unwrap_or(data),
        Err(_) => data,
    }
}

/// Merge coalesced append payloads into one body. In JSON mode, each item is
/// parsed and flattened into one array (arrays splice their elements in,
/// scalars push as a single element); otherwise items are concatenated.
fn merge_bytes(content_type: Option<&str>, items: Vec<Bytes>) -> Bytes {
    if items.len() == 1 {
        return items.into_iter().next().unwrap();
    }

    if is_json_content_type(content_type) {
        let mut merged = Vec::new();
        for item in &items {
            match serde_json::from_slice::<serde_json::Value>(item) {
                Ok(serde_json::Value::Array(values)) => merged.extend(values),
                Ok(value) => merged.push(value),
                Err(_) => {}
            }
        }
        if let Ok(body) = serde_json::to_vec(&serde_json::Value::Array(merged)) {
            return Bytes::from(body);
        }
    }

    let mut out = Vec::with_capacity(items.iter().map(|b| b.len()).sum());
    for item in items {
        out.extend_from_slice(&item);
    }
    Bytes::from(out)
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false)
}

pub(crate) fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
