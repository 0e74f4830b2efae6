//! Stream consumption: the low-level [`ChunkIterator`] transport driver and
//! the [`Session`] it powers, which adds multi-subscriber fan-out on top.

use crate::dynamic::{resolve_all, DynamicValue};
use crate::error::{CancelReason, StreamError};
use crate::fanout::{self, ContentMode, DispatchBus, PullChannel, RawDispatch, Unsubscribe};
use crate::sse::{SseEvent, SseParser};
use crate::stream::{DurableStream, HEADER_STREAM_CURSOR, HEADER_STREAM_OFFSET, HEADER_STREAM_UP_TO_DATE};
use crate::types::{LiveMode, Offset};
use crate::visibility::VisibilityGate;
use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A chunk of data pulled off the transport.
///
/// One `Chunk` is one unit of delivery: a full HTTP response body in
/// catch-up/long-poll mode, or one SSE data payload in SSE mode.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Chunk {
    pub data: Bytes,
    pub next_offset: Offset,
    pub up_to_date: bool,
    pub cursor: Option<String>,
    pub status_code: Option<u16>,
}

/// Header/param overrides returned by an `on_error` hook, merged into the
/// retried request.
#[derive(Default, Clone)]
pub struct ErrorOverride {
    pub headers: Vec<(String, DynamicValue)>,
    pub params: Vec<(String, DynamicValue)>,
}

/// Invoked before a retryable error is retried. Returning `Err` is fatal:
/// the session closes with that error instead of retrying.
pub type OnErrorHook =
    Arc<dyn Fn(&StreamError) -> Result<ErrorOverride, StreamError> + Send + Sync>;

/// Builder for configuring stream reads.
#[must_use = "builders do nothing unless you call .build() or .open()"]
pub struct ReadBuilder {
    stream: DurableStream,
    offset: Offset,
    live: LiveMode,
    timeout: Duration,
    headers: Vec<(String, DynamicValue)>,
    params: Vec<(String, DynamicValue)>,
    cursor: Option<String>,
    json: bool,
    retry: crate::retry::RetryConfig,
    on_error: Option<OnErrorHook>,
    visibility: Option<VisibilityGate>,
}

impl std::fmt::Debug for ReadBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuilder")
            .field("offset", &self.offset)
            .field("live", &self.live)
            .field("json", &self.json)
            .finish()
    }
}

impl ReadBuilder {
    pub(crate) fn new(stream: DurableStream) -> Self {
        Self {
            stream,
            offset: Offset::Beginning,
            live: LiveMode::Off,
            timeout: Duration::from_secs(65),
            headers: Vec::new(),
            params: Vec::new(),
            cursor: None,
            json: false,
            retry: crate::retry::RetryConfig::default(),
            on_error: None,
            visibility: None,
        }
    }

    /// Set the starting offset.
    pub fn offset(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = offset.into();
        self
    }

    /// Set the live mode.
    pub fn live(mut self, mode: LiveMode) -> Self {
        self.live = mode;
        self
    }

    /// Set the timeout for long-poll requests (default ~65s).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Add a static header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), DynamicValue::from(value.into())));
        self
    }

    /// Add a header evaluated fresh before every request.
    pub fn dynamic_header(mut self, key: impl Into<String>, value: DynamicValue) -> Self {
        self.headers.push((key.into(), value));
        self
    }

    /// Add a static query parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), DynamicValue::from(value.into())));
        self
    }

    /// Add a query parameter evaluated fresh before every request.
    pub fn dynamic_param(mut self, key: impl Into<String>, value: DynamicValue) -> Self {
        self.params.push((key.into(), value));
        self
    }

    /// Force JSON content-mode regardless of the server's `Content-Type`.
    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Override the backoff/retry policy used on retryable errors.
    pub fn retry(mut self, retry: crate::retry::RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Install a hook invoked before each retry with the error that
    /// triggered it. An `Ok` override is merged into the retried request;
    /// an `Err` closes the session with that error instead of retrying.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&StreamError) -> Result<ErrorOverride, StreamError> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Wire up a host visibility signal.
    pub fn visibility(mut self, gate: VisibilityGate) -> Self {
        self.visibility = Some(gate);
        self
    }

    /// Set the initial cursor.
    pub fn cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Build a single-consumer [`ChunkIterator`].
    ///
    /// No network request is made until `next_chunk()` is called.
    pub fn build(self) -> ChunkIterator {
        ChunkIterator {
            stream: self.stream,
            offset: self.offset,
            live: self.live,
            timeout: self.timeout,
            headers: self.headers,
            params: self.params,
            cursor: self.cursor,
            up_to_date: false,
            closed: false,
            done: false,
            sse_state: None,
            retry: self.retry,
            on_error: self.on_error,
            visibility: self.visibility.unwrap_or_else(VisibilityGate::always_visible),
            json: self.json,
        }
    }

    /// Open a multi-subscriber [`Session`]: issues the first request
    /// immediately and holds its body unread until a consumer attaches,
    /// then drives subsequent requests as consumers drain each dispatch.
    pub async fn open(self) -> Result<Session, StreamError> {
        let json_requested = self.json;
        let mut iter = self.build();
        iter.json = json_requested;

        let first = iter.fetch_first().await?;

        let content_mode = if json_requested
            || first
                .content_type
                .as_deref()
                .map(|ct| ct.starts_with("application/json"))
                .unwrap_or(false)
        {
            ContentMode::Json
        } else {
            ContentMode::Bytes
        };

        let bus = DispatchBus::new(content_mode);
        let content_type = Arc::new(SyncMutex::new(first.content_type.clone()));
        let offset = Arc::new(SyncMutex::new(iter.offset.clone()));
        let cursor = Arc::new(SyncMutex::new(iter.cursor.clone()));
        let up_to_date = Arc::new(AtomicBool::new(false));
        let (closed_tx, closed_rx) = watch::channel(None::<SessionOutcome>);
        let cancel = Arc::new(tokio::sync::Notify::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let live_is_auto = matches!(iter.live, LiveMode::Auto);

        let session = Session {
            bus: bus.clone(),
            offset: offset.clone(),
            cursor: cursor.clone(),
            up_to_date: up_to_date.clone(),
            content_type: content_type.clone(),
            closed: closed_rx,
            cancel: cancel.clone(),
            cancelled: cancelled.clone(),
            live_resolved: Arc::new(SyncMutex::new(if live_is_auto {
                None
            } else {
                Some(iter.live.clone())
            })),
        };

        let driver_live_resolved = session.live_resolved.clone();
        tokio::spawn(async move {
            bus.wait_for_consumer().await;
            if live_is_auto {
                // A promise accumulator (body()/text()/json()) only ever
                // needs one response; anything else (pull channel,
                // subscriber) wants ongoing updates. We can't distinguish
                // those at attach time without a handshake, so Auto
                // resolves to long-poll once any consumer attaches - SSE
                // upgrade happens naturally once the driver reaches
                // up_to_date and loops back through next_chunk.
                let resolved = LiveMode::LongPoll;
                *driver_live_resolved.lock() = Some(resolved.clone());
                iter.live = resolved;
            }

            let raw = Arc::new(RawDispatch {
                data: first.data,
                offset: first.next_offset.clone(),
                up_to_date: first.up_to_date,
                cursor: first.cursor.clone(),
            });
            *offset.lock() = first.next_offset;
            *cursor.lock() = first.cursor;
            up_to_date.store(first.up_to_date, Ordering::Release);
            bus.publish_and_wait_drain(raw).await;

            if first.up_to_date && iter.live == LiveMode::Off {
                bus.close(None);
                let _ = closed_tx.send(Some(SessionOutcome::Ok));
                return;
            }

            loop {
                if cancelled.load(Ordering::Acquire) {
                    bus.close(Some(Arc::new(StreamError::Cancelled {
                        reason: CancelReason::User,
                    })));
                    let _ = closed_tx.send(Some(SessionOutcome::Cancelled));
                    return;
                }

                let result = tokio::select! {
                    _ = cancel.notified() => {
                        bus.close(Some(Arc::new(StreamError::Cancelled { reason: CancelReason::User })));
                        let _ = closed_tx.send(Some(SessionOutcome::Cancelled));
                        return;
                    }
                    r = iter.next_chunk() => r,
                };

                match result {
                    Ok(Some(chunk)) => {
                        *offset.lock() = chunk.next_offset.clone();
                        *cursor.lock() = chunk.cursor.clone();
                        up_to_date.store(chunk.up_to_date, Ordering::Release);

                        let raw = Arc::new(RawDispatch {
                            data: chunk.data,
                            offset: chunk.next_offset,
                            up_to_date: chunk.up_to_date,
                            cursor: chunk.cursor,
                        });
                        bus.publish_and_wait_drain(raw).await;
                    }
                    Ok(None) => {
                        bus.close(None);
                        let _ = closed_tx.send(Some(SessionOutcome::Ok));
                        return;
                    }
                    Err(e) => {
                        bus.close(Some(Arc::new(e)));
                        let _ = closed_tx.send(Some(SessionOutcome::Failed));
                        return;
                    }
                }
            }
        });

        Ok(session)
    }
}

/// Outcome recorded when a session reaches `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Ok,
    Cancelled,
    Failed,
}

struct FirstResponse {
    data: Bytes,
    next_offset: Offset,
    up_to_date: bool,
    cursor: Option<String>,
    content_type: Option<String>,
}

/// A live, multi-subscriber read session. Obtained via [`ReadBuilder::open`].
pub struct Session {
    bus: Arc<DispatchBus>,
    offset: Arc<SyncMutex<Offset>>,
    cursor: Arc<SyncMutex<Option<String>>>,
    up_to_date: Arc<AtomicBool>,
    content_type: Arc<SyncMutex<Option<String>>>,
    closed: watch::Receiver<Option<SessionOutcome>>,
    cancel: Arc<tokio::sync::Notify>,
    cancelled: Arc<AtomicBool>,
    live_resolved: Arc<SyncMutex<Option<LiveMode>>>,
}

impl Session {
    pub fn offset(&self) -> Offset {
        self.offset.lock().clone()
    }

    pub fn cursor(&self) -> Option<String> {
        self.cursor.lock().clone()
    }

    pub fn up_to_date(&self) -> bool {
        self.up_to_date.load(Ordering::Acquire)
    }

    pub fn content_type(&self) -> Option<String> {
        self.content_type.lock().clone()
    }

    /// The resolved live mode, once a consumer has attached and `Auto` (if
    /// requested) has picked a concrete transport.
    pub fn live(&self) -> Option<LiveMode> {
        self.live_resolved.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Resolves once the session reaches `Closed`, with its outcome.
    pub async fn closed(&self) -> SessionOutcome {
        let mut rx = self.closed.clone();
        loop {
            if let Some(outcome) = *rx.borrow() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return SessionOutcome::Failed;
            }
        }
    }

    /// Cancel the session: aborts the in-flight request, fails pending
    /// consumer calls with `Cancelled`, ends streams and subscribers.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel.notify_waiters();
    }

    /// Accumulate the full body, resolving on the first `up_to_date`.
    pub async fn body(&self) -> Result<Bytes, StreamError> {
        fanout::accumulate_body(&self.bus).await
    }

    /// Accumulate the full body as text. Fails with a parse error if the
    /// bytes are not valid UTF-8.
    pub async fn text(&self) -> Result<String, StreamError> {
        fanout::accumulate_text(&self.bus).await
    }

    /// Accumulate all JSON items across dispatches in order. Fails with
    /// `WrongContentMode` if this session isn't in JSON mode.
    pub async fn json(&self) -> Result<Vec<Value>, StreamError> {
        fanout::accumulate_json(&self.bus).await
    }

    /// One byte chunk per pull; the driver backpressures on this channel
    /// draining (along with every other attached consumer) before fetching
    /// the next chunk.
    pub fn body_stream(&self) -> PullChannel<Bytes> {
        fanout::body_stream(self.bus.clone())
    }

    /// One decoded text chunk per pull.
    pub fn text_stream(&self) -> PullChannel<Arc<str>> {
        fanout::text_stream(self.bus.clone())
    }

    /// One JSON batch per pull.
    pub fn json_stream(&self) -> PullChannel<Arc<Vec<Value>>> {
        fanout::json_stream(self.bus.clone())
    }

    /// Subscribe a callback to every raw-bytes dispatch.
    pub fn subscribe_bytes<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<RawDispatch>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        fanout::subscribe_bytes(self.bus.clone(), callback)
    }

    /// Subscribe a callback to every decoded-text dispatch.
    pub fn subscribe_text<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<str>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        fanout::subscribe_text(self.bus.clone(), callback)
    }

    /// Subscribe a callback to every JSON-batch dispatch.
    pub fn subscribe_json<F, Fut>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Arc<Vec<Value>>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        fanout::subscribe_json(self.bus.clone(), callback)
    }
}

/// Low-level single-consumer transport driver. `Session` wraps one of these
/// internally; use this directly for simple single-reader consumption
/// without the fan-out machinery.
pub struct ChunkIterator {
    stream: DurableStream,
    offset: Offset,
    live: LiveMode,
    timeout: Duration,
    headers: Vec<(String, DynamicValue)>,
    params: Vec<(String, DynamicValue)>,
    cursor: Option<String>,
    up_to_date: bool,
    closed: bool,
    done: bool,
    sse_state: Option<SseState>,
    retry: crate::retry::RetryConfig,
    on_error: Option<OnErrorHook>,
    visibility: VisibilityGate,
    json: bool,
}

struct SseState {
    response: reqwest::Response,
    parser: SseParser,
}

impl ChunkIterator {
    pub fn offset(&self) -> &Offset {
        &self.offset
    }

    pub fn is_up_to_date(&self) -> bool {
        self.up_to_date
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.sse_state = None;
    }

    /// Issue the first request. Only used by `Session::open`; a bare
    /// `ChunkIterator` gets the same response through its first
    /// `next_chunk()` call instead.
    ///
    /// An explicit `LiveMode::Sse` session is routed through
    /// `establish_sse_and_read` so the first response carries the
    /// `Accept: text/event-stream` header and is parsed through
    /// `SseParser` like every later chunk, rather than buffered raw.
    async fn fetch_first(&mut self) -> Result<FirstResponse, StreamError> {
        self.visibility.wait_until_visible().await;

        if self.live == LiveMode::Sse {
            let chunk = self.establish_sse_and_read().await?;
            return Ok(match chunk {
                Some(c) => FirstResponse {
                    data: c.data,
                    next_offset: c.next_offset,
                    up_to_date: c.up_to_date,
                    cursor: c.cursor,
                    content_type: None,
                },
                None => FirstResponse {
                    data: Bytes::new(),
                    next_offset: self.offset.clone(),
                    up_to_date: true,
                    cursor: self.cursor.clone(),
                    content_type: None,
                },
            });
        }

        let live_param = match self.live {
            LiveMode::LongPoll => Some("long-poll"),
            LiveMode::Auto | LiveMode::Off | LiveMode::Sse => None,
        };

        let resp = self.send_get(live_param, false).await?;
        let status = resp.status().as_u16();

        match status {
            200 => {
                let next_offset = header_offset(&resp, &self.offset);
                let cursor = header_str(&resp, HEADER_STREAM_CURSOR);
                let up_to_date = header_flag(&resp, HEADER_STREAM_UP_TO_DATE);
                let content_type = resp
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string());
                let data = resp.bytes().await?;

                self.offset = next_offset.clone();
                self.cursor = cursor.clone();
                self.up_to_date = up_to_date;

                Ok(FirstResponse {
                    data,
                    next_offset,
                    up_to_date,
                    cursor,
                    content_type,
                })
            }
            204 => Ok(FirstResponse {
                data: Bytes::new(),
                next_offset: self.offset.clone(),
                up_to_date: true,
                cursor: self.cursor.clone(),
                content_type: None,
            }),
            404 => Err(StreamError::NotFound {
                url: self.stream.url.clone(),
            }),
            410 => Err(StreamError::OffsetGone {
                offset: self.offset.to_string(),
            }),
            _ => Err(StreamError::from_status(status, &self.stream.url)),
        }
    }

    /// Fetch the next chunk.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>, StreamError> {
        if self.closed {
            return Err(StreamError::IteratorClosed);
        }
        if self.done {
            return Ok(None);
        }

        if self.sse_state.is_some() {
            return self.next_sse_chunk().await;
        }

        match self.live {
            LiveMode::Sse => self.establish_sse_and_read().await,
            LiveMode::Auto => {
                if self.up_to_date {
                    self.establish_sse_and_read().await
                } else {
                    self.next_http(None).await
                }
            }
            LiveMode::LongPoll => self.next_http(Some("long-poll")).await,
            LiveMode::Off => self.next_http(None).await,
        }
    }

    async fn send_get(
        &self,
        live_param: Option<&str>,
        sse: bool,
    ) -> Result<reqwest::Response, StreamError> {
        let extra_params = resolve_all(&self.params).await;
        let url = self
            .stream
            .build_read_url(&self.offset, live_param, self.cursor.as_deref(), &extra_params);

        let mut req = self.stream.client.inner.get(&url);
        if sse {
            req = req.header("Accept", "text/event-stream");
        }

        let client_headers = self.stream.client.get_headers();
        for (key, value) in client_headers.iter() {
            req = req.header(key.clone(), value.clone());
        }
        for (key, value) in resolve_all(&self.headers).await {
            req = req.header(key, value);
        }

        if live_param == Some("long-poll") {
            req = req.timeout(self.timeout);
        }

        Ok(req.send().await?)
    }

    async fn next_http(&mut self, live_param: Option<&str>) -> Result<Option<Chunk>, StreamError> {
        self.visibility.wait_until_visible().await;

        let mut attempt = 0u32;
        loop {
            let mut gate = self.visibility.clone();
            let request = self.send_get(live_param, false);
            tokio::select! {
                biased;
                _ = gate.wait_until_hidden() => {
                    // Pause, not a user cancel: wait for visibility to
                    // return and re-issue rather than closing the session.
                    #[cfg(feature = "tracing")]
                    tracing::debug!(url = %self.stream.url, "session paused: host reported hidden");
                    self.visibility.wait_until_visible().await;
                    continue;
                }
                result = request => {
                    match result {
                        Ok(resp) => match self.handle_http_response(resp).await {
                            ChunkOutcome::Done(chunk) => return Ok(chunk),
                            ChunkOutcome::Retry(err) => {
                                self.retry_or_fail(&mut attempt, err).await?;
                            }
                        },
                        Err(e) if is_timeout(&e) => {
                            self.up_to_date = true;
                            if self.live == LiveMode::Off {
                                self.done = true;
                                return Ok(None);
                            }
                            return Ok(Some(Chunk {
                                data: Bytes::new(),
                                next_offset: self.offset.clone(),
                                up_to_date: true,
                                cursor: self.cursor.clone(),
                                status_code: Some(204),
                            }));
                        }
                        Err(e) => {
                            self.retry_or_fail(&mut attempt, e).await?;
                        }
                    }
                }
            }
        }
    }

    async fn handle_http_response(&mut self, resp: reqwest::Response) -> ChunkOutcome {
        let status = resp.status().as_u16();
        match status {
            200 => {
                let next_offset = header_offset(&resp, &self.offset);
                let cursor = header_str(&resp, HEADER_STREAM_CURSOR);
                let up_to_date = header_flag(&resp, HEADER_STREAM_UP_TO_DATE);
                let data = match resp.bytes().await {
                    Ok(d) => d,
                    Err(e) => return ChunkOutcome::Retry(e.into()),
                };

                self.offset = next_offset.clone();
                self.cursor = cursor.clone();
                self.up_to_date = up_to_date;
                if up_to_date && self.live == LiveMode::Off {
                    self.done = true;
                }

                ChunkOutcome::Done(Some(Chunk {
                    data,
                    next_offset,
                    up_to_date,
                    cursor,
                    status_code: Some(200),
                }))
            }
            204 => {
                if let Some(offset) = resp
                    .headers()
                    .get(HEADER_STREAM_OFFSET)
                    .and_then(|v| v.to_str().ok())
                {
                    self.offset = Offset::parse(offset);
                }
                if let Some(cursor) = header_str(&resp, HEADER_STREAM_CURSOR) {
                    self.cursor = Some(cursor);
                }
                self.up_to_date = true;

                if self.live == LiveMode::Off {
                    self.done = true;
                    return ChunkOutcome::Done(None);
                }
                ChunkOutcome::Done(Some(Chunk {
                    data: Bytes::new(),
                    next_offset: self.offset.clone(),
                    up_to_date: true,
                    cursor: self.cursor.clone(),
                    status_code: Some(204),
                }))
            }
            304 => {
                if let Some(cursor) = header_str(&resp, HEADER_STREAM_CURSOR) {
                    self.cursor = Some(cursor);
                }
                ChunkOutcome::Done(Some(Chunk {
                    data: Bytes::new(),
                    next_offset: self.offset.clone(),
                    up_to_date: self.up_to_date,
                    cursor: self.cursor.clone(),
                    status_code: Some(304),
                }))
            }
            404 => ChunkOutcome::Retry(StreamError::NotFound {
                url: self.stream.url.clone(),
            }),
            410 => ChunkOutcome::Retry(StreamError::OffsetGone {
                offset: self.offset.to_string(),
            }),
            _ => ChunkOutcome::Retry(StreamError::from_status(status, &self.stream.url)),
        }
    }

    /// Apply backoff and the `on_error` hook, or propagate the error if it
    /// isn't retryable or retries are exhausted.
    async fn retry_or_fail(&mut self, attempt: &mut u32, err: StreamError) -> Result<(), StreamError> {
        if !err.is_retryable() || !self.retry.should_retry(*attempt) {
            #[cfg(feature = "tracing")]
            tracing::warn!(url = %self.stream.url, attempt = *attempt, error = %err, "session driver giving up");
            return Err(err);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.stream.url, attempt = *attempt, error = %err, "session driver retrying after error");

        if let Some(hook) = &self.on_error {
            match hook(&err) {
                Ok(overrides) => {
                    self.headers.extend(overrides.headers);
                    self.params.extend(overrides.params);
                }
                Err(fatal) => return Err(fatal),
            }
        }

        let delay = self.retry.next_backoff(*attempt, self.retry.initial_backoff);
        *attempt += 1;
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn establish_sse_and_read(&mut self) -> Result<Option<Chunk>, StreamError> {
        let resp = self.send_get(Some("sse"), true).await?;
        let status = resp.status().as_u16();

        match status {
            200 => {
                let content_type = resp
                    .headers()
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();

                if !content_type.contains("text/event-stream") {
                    self.live = LiveMode::LongPoll;
                    return self.next_http(Some("long-poll")).await;
                }

                self.sse_state = Some(SseState {
                    response: resp,
                    parser: SseParser::new(),
                });
                self.next_sse_chunk().await
            }
            400 => {
                self.live = LiveMode::LongPoll;
                self.next_http(Some("long-poll")).await
            }
            404 => Err(StreamError::NotFound {
                url: self.stream.url.clone(),
            }),
            _ => Err(StreamError::from_status(status, &self.stream.url)),
        }
    }

    async fn next_sse_chunk(&mut self) -> Result<Option<Chunk>, StreamError> {
        loop {
            let next = {
                let state = match &mut self.sse_state {
                    Some(s) => s,
                    None => return self.next_http(Some("long-poll")).await,
                };

                match state.response.chunk().await {
                    Ok(Some(bytes)) => {
                        let events = state.parser.push(&bytes).map_err(StreamError::ParseError)?;
                        PollOutcome::Events(events)
                    }
                    Ok(None) => PollOutcome::BodyEnded(state.parser.has_pending_bytes()),
                    Err(e) => return Err(e.into()),
                }
            };

            match next {
                PollOutcome::Events(events) => {
                    for event in events {
                        match event {
                            SseEvent::Control {
                                stream_next_offset,
                                stream_cursor,
                                up_to_date,
                                stream_closed,
                            } => {
                                self.offset = Offset::parse(&stream_next_offset);
                                if let Some(cursor) = stream_cursor {
                                    self.cursor = Some(cursor);
                                }
                                self.up_to_date = up_to_date;

                                if up_to_date || stream_closed {
                                    self.done = true;
                                    self.sse_state = None;
                                    return Ok(Some(Chunk {
                                        data: Bytes::new(),
                                        next_offset: self.offset.clone(),
                                        up_to_date: true,
                                        cursor: self.cursor.clone(),
                                        status_code: Some(200),
                                    }));
                                }
                            }
                            SseEvent::Data(data) => {
                                return Ok(Some(Chunk {
                                    data: Bytes::from(data),
                                    next_offset: self.offset.clone(),
                                    up_to_date: self.up_to_date,
                                    cursor: self.cursor.clone(),
                                    status_code: Some(200),
                                }));
                            }
                        }
                    }
                    // All completed events were control events that didn't
                    // terminate the chunk (shouldn't normally happen); loop
                    // to read more bytes.
                }
                PollOutcome::BodyEnded(had_pending) => {
                    self.sse_state = None;
                    if had_pending {
                        return Err(StreamError::ParseError(
                            "SSE body ended mid-event".to_string(),
                        ));
                    }
                    if self.live.is_live() {
                        return Ok(Some(Chunk {
                            data: Bytes::new(),
                            next_offset: self.offset.clone(),
                            up_to_date: self.up_to_date,
                            cursor: self.cursor.clone(),
                            status_code: None,
                        }));
                    }
                    self.done = true;
                    return Ok(None);
                }
            }
        }
    }
}

enum PollOutcome {
    Events(Vec<SseEvent>),
    BodyEnded(bool),
}

enum ChunkOutcome {
    Done(Option<Chunk>),
    Retry(StreamError),
}

fn is_timeout(e: &reqwest::Error) -> bool {
    e.is_timeout()
}

fn header_offset(resp: &reqwest::Response, fallback: &Offset) -> Offset {
    resp.headers()
        .get(HEADER_STREAM_OFFSET)
        .and_then(|v| v.to_str().ok())
        .map(Offset::parse)
        .unwrap_or_else(|| fallback.clone())
}

fn header_str(resp: &reqwest::Response, name: &str) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn header_flag(resp: &reqwest::Response, name: &str) -> bool {
    resp.headers().get(name).and_then(|v| v.to_str().ok()) == Some("true")
}
