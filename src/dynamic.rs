//! Dynamic header/param values.
//!
//! A configured header or query param value is a tagged variant: a plain
//! string, a synchronous evaluator, or an async evaluator. Evaluators run
//! fresh before every request; evaluators for a given session are
//! invoked sequentially, never concurrently, so ordering between them (e.g.
//! a signing header that depends on another header's value) is
//! deterministic.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A header or query parameter value that may be computed per-request.
#[derive(Clone)]
pub enum DynamicValue {
    Static(String),
    Sync(Arc<dyn Fn() -> String + Send + Sync>),
    Async(Arc<dyn Fn() -> BoxFuture<String> + Send + Sync>),
}

impl DynamicValue {
    /// Resolve to a concrete string, awaiting if this is an async evaluator.
    pub async fn resolve(&self) -> String {
        match self {
            DynamicValue::Static(s) => s.clone(),
            DynamicValue::Sync(f) => f(),
            DynamicValue::Async(f) => f().await,
        }
    }

    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        DynamicValue::Sync(Arc::new(f))
    }

    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = String> + Send + 'static,
    {
        DynamicValue::Async(Arc::new(move || Box::pin(f()) as BoxFuture<String>))
    }
}

impl fmt::Debug for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicValue::Static(s) => f.debug_tuple("Static").field(s).finish(),
            DynamicValue::Sync(_) => write!(f, "Sync(<fn>)"),
            DynamicValue::Async(_) => write!(f, "Async(<fn>)"),
        }
    }
}

impl From<&str> for DynamicValue {
    fn from(s: &str) -> Self {
        DynamicValue::Static(s.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(s: String) -> Self {
        DynamicValue::Static(s)
    }
}

/// Resolve a list of dynamic (name, value) pairs in order.
pub async fn resolve_all(pairs: &[(String, DynamicValue)]) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(pairs.len());
    for (name, value) in pairs {
        out.push((name.clone(), value.resolve().await));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolves_to_itself() {
        let v: DynamicValue = "abc".into();
        assert_eq!(v.resolve().await, "abc");
    }

    #[tokio::test]
    async fn sync_is_invoked_per_resolve() {
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let c = counter.clone();
        let v = DynamicValue::sync(move || {
            let n = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            format!("call-{n}")
        });
        assert_eq!(v.resolve().await, "call-0");
        assert_eq!(v.resolve().await, "call-1");
    }

    #[tokio::test]
    async fn async_evaluator_is_awaited() {
        let v = DynamicValue::async_fn(|| async {
            tokio::task::yield_now().await;
            "async-value".to_string()
        });
        assert_eq!(v.resolve().await, "async-value");
    }

    #[tokio::test]
    async fn resolve_all_preserves_order() {
        let pairs = vec![
            ("a".to_string(), DynamicValue::from("1")),
            ("b".to_string(), DynamicValue::from("2")),
        ];
        let resolved = resolve_all(&pairs).await;
        assert_eq!(
            resolved,
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]
        );
    }
}
