//! Consumption fan-out.
//!
//! A session owns one [`DispatchBus`]; every raw chunk the transport driver
//! produces is published once and fanned out to however many consumers are
//! currently attached, across three surfaces (bytes, text, json). The
//! driver does not issue the next network request until every consumer
//! registered at publish time has acknowledged the current generation -
//! that acknowledgment is the backpressure signal the driver waits on.
//!
//! Promise accumulators ack the instant they've folded a dispatch into
//! their running total, so they never hold up the driver. Pullable
//! channels and subscribers ack only once their caller has actually drained
//! or processed the dispatch.

use crate::error::StreamError;
use crate::types::Offset;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// One dispatch as held by the bus, in its raw (bytes) form.
#[derive(Debug, Clone)]
pub struct RawDispatch {
    pub data: Bytes,
    pub offset: Offset,
    pub up_to_date: bool,
    pub cursor: Option<String>,
}

/// Whether a session's body is framed as JSON items or opaque bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    Bytes,
    Json,
}

pub type ConsumerId = u64;

enum Slot {
    Dispatch(Arc<RawDispatch>),
    Closed(Option<Arc<StreamError>>),
}

struct BusState {
    content_mode: ContentMode,
    generation: u64,
    current: Slot,
    registered: HashSet<ConsumerId>,
    acked: HashSet<ConsumerId>,
}

/// The per-session dispatch bus.
pub struct DispatchBus {
    state: Mutex<BusState>,
    notify: Notify,
    next_id: AtomicU64,
}

impl DispatchBus {
    pub fn new(content_mode: ContentMode) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BusState {
                content_mode,
                generation: 0,
                current: Slot::Closed(None), // nothing published yet; treated as "no data"
                registered: HashSet::new(),
                acked: HashSet::new(),
            }),
            notify: Notify::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn content_mode(&self) -> ContentMode {
        self.state.lock().content_mode
    }

    /// Register a new consumer, observing dispatches from this point forward.
    pub fn register(&self) -> ConsumerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut s = self.state.lock();
            s.registered.insert(id);
        }
        // Wake a driver parked in `wait_for_consumer` (a session with
        // zero active consumers pauses after the parked first response).
        self.notify.notify_waiters();
        id
    }

    /// Block until at least one consumer is registered.
    pub async fn wait_for_consumer(&self) {
        loop {
            if !self.state.lock().registered.is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Detach a consumer. If it was the last one blocking a drain, wakes the
    /// driver.
    pub fn unregister(&self, id: ConsumerId) {
        let mut s = self.state.lock();
        s.registered.remove(&id);
        s.acked.remove(&id);
        let drained = s.registered.is_subset(&s.acked);
        drop(s);
        if drained {
            self.notify.notify_waiters();
        }
    }

    /// Block until a generation newer than `last_seen` is available, or the
    /// bus is closed. Does not itself ack - call [`ack`](Self::ack) once the
    /// consumer has actually consumed the dispatch.
    pub async fn wait_next(&self, last_seen: u64) -> (u64, BusEvent) {
        loop {
            {
                let s = self.state.lock();
                if s.generation > last_seen {
                    let event = match &s.current {
                        Slot::Dispatch(raw) => BusEvent::Dispatch(raw.clone()),
                        Slot::Closed(err) => BusEvent::Closed(err.clone()),
                    };
                    return (s.generation, event);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Acknowledge that `id` has finished handling `generation`. Wakes the
    /// driver if every registered consumer has now acked.
    pub fn ack(&self, id: ConsumerId, generation: u64) {
        let mut s = self.state.lock();
        if s.generation != generation {
            // Stale ack (consumer was slow and a newer generation already
            // published); nothing to do.
            return;
        }
        s.acked.insert(id);
        let drained = s.registered.is_subset(&s.acked);
        drop(s);
        if drained {
            self.notify.notify_waiters();
        }
    }

    /// Publish a new raw dispatch and wait for every currently-registered
    /// consumer to ack it. This is the driver's sole backpressure point: it
    /// returns only once the fan-out has fully drained.
    pub async fn publish_and_wait_drain(&self, raw: Arc<RawDispatch>) {
        {
            let mut s = self.state.lock();
            s.generation += 1;
            s.current = Slot::Dispatch(raw);
            s.acked.clear();
        }
        self.notify.notify_waiters();
        self.wait_drained().await;
    }

    /// Terminate the bus: no further dispatches, wakes every waiter.
    pub fn close(&self, err: Option<Arc<StreamError>>) {
        let mut s = self.state.lock();
        s.generation += 1;
        s.current = Slot::Closed(err);
        drop(s);
        self.notify.notify_waiters();
    }

    /// A published dispatch is drained once every *currently* registered
    /// consumer has acked it. Zero registered consumers is deliberately
    /// treated as "not drained" - the driver must pause rather
    /// than race ahead when nobody is listening.
    async fn wait_drained(&self) {
        loop {
            {
                let s = self.state.lock();
                if !s.registered.is_empty() && s.registered.is_subset(&s.acked) {
                    return;
                }
            }
            self.notify.notified().await;
        }
    }
}

/// A dispatch delivered to a consumer on one of the three surfaces.
#[derive(Debug, Clone)]
pub enum BusEvent {
    Dispatch(Arc<RawDispatch>),
    Closed(Option<Arc<StreamError>>),
}

fn project_text(raw: &RawDispatch) -> Result<Arc<str>, StreamError> {
    std::str::from_utf8(&raw.data)
        .map(Arc::from)
        .map_err(|e| StreamError::ParseError(format!("invalid utf-8: {e}")))
}

fn project_json(
    raw: &RawDispatch,
    content_mode: ContentMode,
) -> Result<Arc<Vec<serde_json::Value>>, StreamError> {
    if content_mode != ContentMode::Json {
        return Err(StreamError::WrongContentMode);
    }
    if raw.data.is_empty() {
        return Ok(Arc::new(Vec::new()));
    }
    let value: serde_json::Value = serde_json::from_slice(&raw.data)?;
    match value {
        serde_json::Value::Array(items) => Ok(Arc::new(items)),
        _ => Err(StreamError::ParseError(
            "json body was not a top-level array".to_string(),
        )),
    }
}

/// Accumulate bytes across dispatches, resolving on the first `up_to_date`
/// (promise accumulators; resolved as "resolve
/// immediately").
pub async fn accumulate_body(bus: &DispatchBus) -> Result<Bytes, StreamError> {
    let id = bus.register();
    let mut buf = Vec::new();
    let mut last_seen = 0;
    loop {
        let (generation, event) = bus.wait_next(last_seen).await;
        last_seen = generation;
        match event {
            BusEvent::Dispatch(raw) => {
                buf.extend_from_slice(&raw.data);
                let up_to_date = raw.up_to_date;
                bus.ack(id, generation);
                if up_to_date {
                    bus.unregister(id);
                    return Ok(Bytes::from(buf));
                }
            }
            BusEvent::Closed(err) => {
                bus.unregister(id);
                return match err {
                    Some(e) => Err(StreamError::from_shared(&e)),
                    None => Ok(Bytes::from(buf)),
                };
            }
        }
    }
}

/// Accumulate text across dispatches.
pub async fn accumulate_text(bus: &DispatchBus) -> Result<String, StreamError> {
    let id = bus.register();
    let mut buf = String::new();
    let mut last_seen = 0;
    loop {
        let (generation, event) = bus.wait_next(last_seen).await;
        last_seen = generation;
        match event {
            BusEvent::Dispatch(raw) => {
                let text = match project_text(&raw) {
                    Ok(t) => t,
                    Err(e) => {
                        bus.unregister(id);
                        return Err(e);
                    }
                };
                buf.push_str(&text);
                let up_to_date = raw.up_to_date;
                bus.ack(id, generation);
                if up_to_date {
                    bus.unregister(id);
                    return Ok(buf);
                }
            }
            BusEvent::Closed(err) => {
                bus.unregister(id);
                return match err {
                    Some(e) => Err(StreamError::from_shared(&e)),
                    None => Ok(buf),
                };
            }
        }
    }
}

/// Accumulate JSON items across dispatches, flattening array batches in
/// order: intra- and inter-batch order is preserved.
pub async fn accumulate_json(
    bus: &DispatchBus,
) -> Result<Vec<serde_json::Value>, StreamError> {
    let content_mode = bus.content_mode();
    if content_mode != ContentMode::Json {
        return Err(StreamError::WrongContentMode);
    }
    let id = bus.register();
    let mut items = Vec::new();
    let mut last_seen = 0;
    loop {
        let (generation, event) = bus.wait_next(last_seen).await;
        last_seen = generation;
        match event {
            BusEvent::Dispatch(raw) => {
                match project_json(&raw, content_mode) {
                    Ok(batch) => items.extend(batch.iter().cloned()),
                    Err(e) => {
                        bus.unregister(id);
                        return Err(e);
                    }
                }
                let up_to_date = raw.up_to_date;
                bus.ack(id, generation);
                if up_to_date {
                    bus.unregister(id);
                    return Ok(items);
                }
            }
            BusEvent::Closed(err) => {
                bus.unregister(id);
                return match err {
                    Some(e) => Err(StreamError::from_shared(&e)),
                    None => Ok(items),
                };
            }
        }
    }
}

/// A pullable channel: one projected chunk per `pull()` call. The next
/// network fetch is deferred until every active pullable (and every other
/// consumer) has drained the current dispatch - dropping the channel
/// unregisters it so the driver isn't blocked waiting on an abandoned
/// reader.
pub struct PullChannel<T> {
    bus: Arc<DispatchBus>,
    id: ConsumerId,
    last_seen: u64,
    project: Box<dyn Fn(&RawDispatch, ContentMode) -> Result<T, StreamError> + Send + Sync>,
}

impl<T> PullChannel<T> {
    fn new(
        bus: Arc<DispatchBus>,
        project: impl Fn(&RawDispatch, ContentMode) -> Result<T, StreamError> + Send + Sync + 'static,
    ) -> Self {
        let id = bus.register();
        Self {
            bus,
            id,
            last_seen: 0,
            project: Box::new(project),
        }
    }

    /// Pull the next chunk. Returns `None` once the session closes with no
    /// further error to report.
    pub async fn pull(&mut self) -> Option<Result<T, StreamError>> {
        let (generation, event) = self.bus.wait_next(self.last_seen).await;
        self.last_seen = generation;
        match event {
            BusEvent::Dispatch(raw) => {
                let content_mode = self.bus.content_mode();
                let projected = (self.project)(&raw, content_mode);
                self.bus.ack(self.id, generation);
                Some(projected)
            }
            BusEvent::Closed(err) => err.map(|e| Err(StreamError::from_shared(&e))),
        }
    }
}

impl<T> Drop for PullChannel<T> {
    fn drop(&mut self) {
        self.bus.unregister(self.id);
    }
}

pub fn body_stream(bus: Arc<DispatchBus>) -> PullChannel<Bytes> {
    PullChannel::new(bus, |raw, _| Ok(raw.data.clone()))
}

pub fn text_stream(bus: Arc<DispatchBus>) -> PullChannel<Arc<str>> {
    PullChannel::new(bus, |raw, _| project_text(raw))
}

pub fn json_stream(bus: Arc<DispatchBus>) -> PullChannel<Arc<Vec<serde_json::Value>>> {
    PullChannel::new(bus, project_json)
}

/// Handle returned by `subscribe_*`; dropping it is equivalent to calling
/// [`unsubscribe`](Self::unsubscribe).
pub struct Unsubscribe {
    bus: Arc<DispatchBus>,
    id: ConsumerId,
    stop: Arc<Notify>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        // Drop impl does the work; named method for a readable call site.
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.stop.notify_waiters();
        self.bus.unregister(self.id);
    }
}

/// Subscribe a callback to every dispatch on the bytes surface.
///
/// The session will not issue its next network request until `callback`'s
/// returned future resolves for the current dispatch. All subscribers
/// attached before the first dispatch observe the exact same sequence
/// (testable property #2), and receive the same underlying `Bytes` handle
/// (zero-copy) - callbacks must not mutate through it (there is no mutable
/// access exposed, so this is enforced by the type).
pub fn subscribe_bytes<F, Fut>(bus: Arc<DispatchBus>, callback: F) -> Unsubscribe
where
    F: Fn(Arc<RawDispatch>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    subscribe(bus, move |raw, _mode| {
        let fut = callback(raw);
        async move {
            fut.await;
            Ok(())
        }
    })
}

/// Subscribe a callback to every dispatch on the text surface.
pub fn subscribe_text<F, Fut>(bus: Arc<DispatchBus>, callback: F) -> Unsubscribe
where
    F: Fn(Arc<str>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    subscribe(bus, move |raw, _mode| {
        let text = project_text(&raw);
        async move {
            match text {
                Ok(t) => {
                    callback(t).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    })
}

/// Subscribe a callback to every dispatch on the json surface.
pub fn subscribe_json<F, Fut>(bus: Arc<DispatchBus>, callback: F) -> Unsubscribe
where
    F: Fn(Arc<Vec<serde_json::Value>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    subscribe(bus, move |raw, mode| {
        let items = project_json(&raw, mode);
        async move {
            match items {
                Ok(v) => {
                    callback(v).await;
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    })
}

fn subscribe<F, Fut>(bus: Arc<DispatchBus>, handler: F) -> Unsubscribe
where
    F: Fn(Arc<RawDispatch>, ContentMode) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StreamError>> + Send + 'static,
{
    let id = bus.register();
    let stop = Arc::new(Notify::new());
    let task_bus = bus.clone();
    let task_stop = stop.clone();

    tokio::spawn(async move {
        let mut last_seen = 0;
        loop {
            let wait = task_bus.wait_next(last_seen);
            tokio::select! {
                _ = task_stop.notified() => return,
                (generation, event) = wait => {
                    last_seen = generation;
                    match event {
                        BusEvent::Dispatch(raw) => {
                            let content_mode = task_bus.content_mode();
                            // Errors from the handler are swallowed here;
                            // a future revision may route them through
                            // on_error the way the read session does.
                            let _ = handler(raw, content_mode).await;
                            task_bus.ack(id, generation);
                        }
                        BusEvent::Closed(_) => return,
                    }
                }
            }
        }
    });

    Unsubscribe { bus, id, stop }
}
