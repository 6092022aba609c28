use std::time::Instant;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tunl_protocol::Headers;

/// A tunnel's answer to one public request, decoded off the wire.
#[derive(Debug)]
pub struct ResponseData {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// What the edge knew about a request when it was dispatched; feeds the
/// request log at the terminal outcome.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    pub method: String,
    pub path: String,
    pub request_bytes: usize,
    pub started_at: Instant,
    pub user_agent: Option<String>,
    pub ip: String,
}

struct PendingEntry {
    responder: oneshot::Sender<ResponseData>,
    subdomain: String,
    metadata: RequestMetadata,
}

/// Requests dispatched to a tunnel and awaiting their response.
///
/// Every entry terminates exactly once: `resolve` (response arrived),
/// `remove` (edge-side timeout), or `fail_all_for` (channel loss, which
/// drops the responder so the waiting edge handler observes a closed
/// channel). All three converge on an atomic remove-then-act, so late
/// arrivals for an already-terminated id are no-ops.
pub struct PendingTable {
    inner: DashMap<String, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DashMap::new(),
        })
    }

    pub fn insert(
        &self,
        request_id: String,
        subdomain: String,
        metadata: RequestMetadata,
        responder: oneshot::Sender<ResponseData>,
    ) {
        self.inner.insert(
            request_id,
            PendingEntry {
                responder,
                subdomain,
                metadata,
            },
        );
    }

    /// Deliver a response. Returns false when the id is unknown — a late
    /// response after timeout or cancellation, dropped silently.
    pub fn resolve(&self, request_id: &str, data: ResponseData) -> bool {
        match self.inner.remove(request_id) {
            Some((_, entry)) => {
                // The receiver may have hung up between removal and send;
                // that race is the receiver's timeout winning.
                let _ = entry.responder.send(data);
                true
            }
            None => false,
        }
    }

    /// Discard an entry without responding (timeout or cancelled caller).
    pub fn remove(&self, request_id: &str) -> Option<RequestMetadata> {
        self.inner
            .remove(request_id)
            .map(|(_, entry)| entry.metadata)
    }

    /// Drop every entry bound to `subdomain`. Their responders are dropped
    /// with them, so each waiting edge handler sees the channel close and
    /// answers 502. Returns how many were dropped.
    pub fn fail_all_for(&self, subdomain: &str) -> usize {
        let before = self.inner.len();
        self.inner.retain(|_, entry| entry.subdomain != subdomain);
        before - self.inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
