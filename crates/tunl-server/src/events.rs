//! Tunnel lifecycle and request-log events.
//!
//! Persistence of these records is an external concern; the server talks to
//! it through [`EventSink`] and never waits on it. Callers spawn the sink
//! calls so a slow or failing backend cannot stall dispatch.

use std::time::SystemTime;

use async_trait::async_trait;

/// A tunnel came up.
#[derive(Debug, Clone)]
pub struct TunnelOpened {
    pub subdomain: String,
    pub user_id: Option<String>,
    pub ip: String,
    pub connected_at: SystemTime,
}

/// A tunnel went away (explicit close, channel loss, or idle sweep).
#[derive(Debug, Clone)]
pub struct TunnelClosed {
    pub subdomain: String,
    pub user_id: Option<String>,
    pub disconnected_at: SystemTime,
}

/// One public HTTP request, recorded at its terminal outcome.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub subdomain: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub request_bytes: usize,
    /// Zero when the request timed out or the channel was lost.
    pub response_bytes: usize,
    pub duration_ms: u64,
    pub user_agent: Option<String>,
    pub ip: String,
}

/// Receiver for lifecycle and request records.
///
/// Implementations log their own failures; none of these calls may block
/// request dispatch.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn tunnel_opened(&self, event: TunnelOpened);
    async fn tunnel_closed(&self, event: TunnelClosed);
    async fn request_logged(&self, event: RequestLog);
}

/// Sink for deployments without persistence; records go to the debug log.
pub struct NullSink;

#[async_trait]
impl EventSink for NullSink {
    async fn tunnel_opened(&self, event: TunnelOpened) {
        tracing::debug!(subdomain = %event.subdomain, "tunnel opened");
    }

    async fn tunnel_closed(&self, event: TunnelClosed) {
        tracing::debug!(subdomain = %event.subdomain, "tunnel closed");
    }

    async fn request_logged(&self, event: RequestLog) {
        tracing::debug!(
            subdomain = %event.subdomain,
            method = %event.method,
            path = %event.path,
            status = event.status,
            duration_ms = event.duration_ms,
            "request"
        );
    }
}
