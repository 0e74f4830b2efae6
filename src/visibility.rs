//! Visibility gate: pauses a session's driver when the host signals
//! the page/tab is hidden, and resumes it on return to visible.
//!
//! This has no equivalent in a plain HTTP client - it exists because a
//! browser-hosted session should not keep an in-flight long-poll or SSE
//! connection open while the tab is backgrounded. The gate is a thin
//! wrapper over a `tokio::sync::watch` channel so a host environment (e.g.
//! a wasm binding layer) can drive it without this crate depending on any
//! particular windowing API.

use tokio::sync::watch;

/// Current visibility as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    pub fn is_hidden(self) -> bool {
        matches!(self, Visibility::Hidden)
    }
}

/// Host-side handle used to report visibility changes into a session.
#[derive(Clone)]
pub struct VisibilitySignal {
    tx: watch::Sender<Visibility>,
}

impl VisibilitySignal {
    /// Create a new signal, starting in the given visibility state.
    ///
    /// If the host's page is already hidden at session start, pass
    /// `Visibility::Hidden` here - the driver must not issue its first
    /// continuation request until visibility returns.
    pub fn new(initial: Visibility) -> (Self, VisibilityGate) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx }, VisibilityGate { rx })
    }

    /// Report that the host is now hidden or visible.
    ///
    /// A no-op if the gate side has been dropped (session already closed).
    pub fn set(&self, visibility: Visibility) {
        let _ = self.tx.send(visibility);
    }
}

/// Driver-side handle consulted before issuing the next network request.
#[derive(Clone)]
pub struct VisibilityGate {
    rx: watch::Receiver<Visibility>,
}

impl VisibilityGate {
    /// A gate that is always visible - used when no host signal is wired up.
    pub fn always_visible() -> Self {
        let (_signal, gate) = VisibilitySignal::new(Visibility::Visible);
        gate
    }

    pub fn is_hidden(&self) -> bool {
        self.rx.borrow().is_hidden()
    }

    /// Block until the host reports `Visible`. Resolves immediately if
    /// already visible.
    pub async fn wait_until_visible(&mut self) {
        while self.rx.borrow().is_hidden() {
            if self.rx.changed().await.is_err() {
                // Signal side dropped; treat as permanently visible rather
                // than hanging the driver forever.
                return;
            }
        }
    }

    /// Block until the host reports `Hidden`. Used to race an in-flight
    /// request against a visibility change so it can be aborted.
    /// Never resolves if the signal side has been dropped.
    pub async fn wait_until_hidden(&mut self) {
        while !self.rx.borrow().is_hidden() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_visible_by_default() {
        let gate = VisibilityGate::always_visible();
        assert!(!gate.is_hidden());
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_visible() {
        let (_signal, mut gate) = VisibilitySignal::new(Visibility::Visible);
        gate.wait_until_visible().await;
    }

    #[tokio::test]
    async fn wait_blocks_until_signalled_visible() {
        let (signal, mut gate) = VisibilitySignal::new(Visibility::Hidden);
        assert!(gate.is_hidden());

        let waiter = tokio::spawn(async move {
            gate.wait_until_visible().await;
        });

        tokio::task::yield_now().await;
        signal.set(Visibility::Visible);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_until_visible should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_signal_does_not_hang_the_gate() {
        let (signal, mut gate) = VisibilitySignal::new(Visibility::Hidden);
        drop(signal);
        gate.wait_until_visible().await;
    }
}
