use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

/// Handle to one open control connection, registered or not.
///
/// `outbound` feeds the connection's single writer task; `is_alive` is
/// cleared by the liveness supervisor before each ping and set again when a
/// pong comes back; `cancel` force-terminates the session.
#[derive(Clone)]
pub struct SessionHandle {
    pub outbound: mpsc::Sender<Message>,
    pub is_alive: Arc<AtomicBool>,
    pub cancel: CancellationToken,
}

/// Process-wide set of open control connections, walked by the liveness
/// supervisor.
pub struct SessionSet {
    inner: DashMap<u64, SessionHandle>,
    next_id: AtomicU64,
}

impl SessionSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn add(&self, handle: SessionHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.insert(id, handle);
        id
    }

    pub fn remove(&self, id: u64) {
        self.inner.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Clone out the current handles so callers don't hold map guards across
    /// awaits.
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        self.inner.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SessionHandle {
        let (tx, _rx) = mpsc::channel(1);
        SessionHandle {
            outbound: tx,
            is_alive: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn add_and_remove_track_membership() {
        let set = SessionSet::new();
        let a = set.add(handle());
        let b = set.add(handle());
        assert_ne!(a, b);
        assert_eq!(set.len(), 2);

        set.remove(a);
        assert_eq!(set.len(), 1);
        set.remove(a); // idempotent
        assert_eq!(set.len(), 1);
        set.remove(b);
        assert!(set.is_empty());
    }

    #[test]
    fn snapshot_is_detached_from_the_set() {
        let set = SessionSet::new();
        let id = set.add(handle());
        let snap = set.snapshot();
        set.remove(id);
        assert_eq!(snap.len(), 1);
        assert!(set.is_empty());
    }
}
