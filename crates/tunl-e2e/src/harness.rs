//! In-process test server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use tunl_common::limits::{DEFAULT_DISPATCH_TIMEOUT, REGISTRATION_TIMEOUT};
use tunl_server::{
    ControlPlane, EdgeServer, LivenessSupervisor, MemoryUserDirectory, PendingTable, Registry,
    SessionSet,
};

use crate::recording::RecordingSink;

/// Knobs the scenarios shrink from their production values.
#[derive(Debug, Clone)]
pub struct TestServerOptions {
    pub dispatch_timeout: Duration,
    pub registration_timeout: Duration,
    /// When set, the liveness supervisor runs at this cadence.
    pub liveness_interval: Option<Duration>,
}

impl Default for TestServerOptions {
    fn default() -> Self {
        Self {
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            registration_timeout: REGISTRATION_TIMEOUT,
            liveness_interval: None,
        }
    }
}

/// A complete tunl server on ephemeral loopback ports.
pub struct TestServer {
    pub control_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub base_domain: String,
    pub registry: Arc<Registry>,
    pub users: Arc<MemoryUserDirectory>,
    pub events: Arc<RecordingSink>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(TestServerOptions::default()).await
    }

    pub async fn start_with(options: TestServerOptions) -> Self {
        let base_domain = "tunnel.test".to_string();

        let users = MemoryUserDirectory::new();
        let events = RecordingSink::new();
        let registry = Registry::new(users.clone(), events.clone());
        let pending = PendingTable::new();
        let sessions = SessionSet::new();

        let control = ControlPlane::new(
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::clone(&sessions),
            base_domain.clone(),
            false,
            options.registration_timeout,
        );
        let edge = EdgeServer::new(
            Arc::clone(&registry),
            pending,
            events.clone(),
            base_domain.clone(),
            options.dispatch_timeout,
        );

        let control_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind control plane");
        let http_listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind edge");
        let control_addr = control_listener.local_addr().unwrap();
        let http_addr = http_listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Err(e) = control.run_with_listener(control_listener).await {
                tracing::error!("control plane error: {e}");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = edge.run_with_listener(http_listener).await {
                tracing::error!("edge error: {e}");
            }
        });
        if let Some(interval) = options.liveness_interval {
            tokio::spawn(LivenessSupervisor::new(sessions, interval).run());
        }

        // Let the listeners come up.
        tokio::time::sleep(Duration::from_millis(10)).await;

        Self {
            control_addr,
            http_addr,
            base_domain,
            registry,
            users,
            events,
        }
    }

    /// Websocket URL of the control plane.
    pub fn control_url(&self) -> String {
        format!("ws://{}", self.control_addr)
    }

    /// Host header value routing to `subdomain`.
    pub fn host_for(&self, subdomain: &str) -> String {
        format!("{subdomain}.{}", self.base_domain)
    }

    /// Edge URL for a path; pair with a `Host` header from [`host_for`].
    pub fn edge_url(&self, path: &str) -> String {
        format!("http://{}{}", self.http_addr, path)
    }
}
