//! Stream identity and live-connection accounting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Only uniqueness matters, so relaxed ordering is enough.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a stream, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GensioId(u64);

impl GensioId {
    pub fn new() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for GensioId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GensioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gensio-{}", self.0)
    }
}

/// Counts the streams an accepter has handed out and not yet seen close.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { active: Arc::new(tx) }
    }

    /// Count one connection until the guard drops.
    pub fn track(&self, id: GensioId) -> ConnectionGuard {
        self.active.send_modify(|n| *n += 1);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Resolve once no tracked connection is left.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // the sender lives in self, so this cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the tracker's count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    id: GensioId,
}

impl ConnectionGuard {
    pub fn id(&self) -> GensioId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(gensio = %self.id, "connection released");
    }
}
