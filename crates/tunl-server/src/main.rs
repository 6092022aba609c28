use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use tunl_common::limits::{
    DEFAULT_DISPATCH_TIMEOUT, HEARTBEAT_INTERVAL, MAX_TUNNEL_IDLE, REGISTRATION_TIMEOUT,
    SWEEP_INTERVAL,
};
use tunl_server::{
    ControlPlane, EdgeServer, EventSink, LivenessSupervisor, MemoryUserDirectory, NullSink,
    PendingTable, Registry, ServerConfig, SessionSet, UserDirectory,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tunl_server=info".parse()?),
        )
        .init();

    let config = ServerConfig::from_env();
    tracing::info!("base domain: {}", config.base_domain);
    tracing::info!("edge port: {}", config.http_port);
    tracing::info!("control port: {}", config.control_port);

    // The account store and event persistence are external collaborators;
    // this binary runs with the in-process stand-ins.
    let users: Arc<dyn UserDirectory> = MemoryUserDirectory::new();
    let events: Arc<dyn EventSink> = Arc::new(NullSink);

    let registry = Registry::new(users, Arc::clone(&events));
    let pending = PendingTable::new();
    let sessions = SessionSet::new();

    let control = ControlPlane::new(
        Arc::clone(&registry),
        Arc::clone(&pending),
        Arc::clone(&sessions),
        config.base_domain.clone(),
        config.https,
        REGISTRATION_TIMEOUT,
    );
    let edge = EdgeServer::new(
        Arc::clone(&registry),
        pending,
        events,
        config.base_domain.clone(),
        DEFAULT_DISPATCH_TIMEOUT,
    );
    let liveness = LivenessSupervisor::new(sessions, HEARTBEAT_INTERVAL);

    let sweeper = {
        let registry = Arc::clone(&registry);
        async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await; // the startup tick
            loop {
                ticker.tick().await;
                let swept = registry.sweep_idle(MAX_TUNNEL_IDLE).await;
                if !swept.is_empty() {
                    tracing::info!("swept {} idle tunnel(s)", swept.len());
                }
            }
        }
    };

    let control_addr: SocketAddr = format!("0.0.0.0:{}", config.control_port).parse()?;
    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;

    tokio::select! {
        result = control.run(control_addr) => {
            tracing::error!("control plane stopped: {:?}", result);
        }
        result = edge.run(http_addr) => {
            tracing::error!("edge stopped: {:?}", result);
        }
        _ = liveness.run() => {}
        _ = sweeper => {}
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    tracing::info!("server shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("received SIGTERM");
        }
    }
}
