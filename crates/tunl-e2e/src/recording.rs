//! Event sink that records everything for test assertions.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use tunl_server::{EventSink, RequestLog, TunnelClosed, TunnelOpened};

/// Captures lifecycle and request-log events in memory.
pub struct RecordingSink {
    opened: Mutex<Vec<TunnelOpened>>,
    closed: Mutex<Vec<TunnelClosed>>,
    requests: Mutex<Vec<RequestLog>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn opened(&self) -> Vec<TunnelOpened> {
        self.opened.lock().clone()
    }

    pub fn closed(&self) -> Vec<TunnelClosed> {
        self.closed.lock().clone()
    }

    pub fn requests(&self) -> Vec<RequestLog> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn tunnel_opened(&self, event: TunnelOpened) {
        self.opened.lock().push(event);
    }

    async fn tunnel_closed(&self, event: TunnelClosed) {
        self.closed.lock().push(event);
    }

    async fn request_logged(&self, event: RequestLog) {
        self.requests.lock().push(event);
    }
}
