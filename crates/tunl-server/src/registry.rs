use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::events::{EventSink, TunnelClosed, TunnelOpened};
use crate::users::UserDirectory;

/// Activity timestamps are millis since this process-local epoch.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Live binding of a subdomain to a control connection.
///
/// The control session owns the socket; the registry holds this non-owning
/// handle for dispatch and teardown.
pub struct TunnelHandle {
    pub outbound: mpsc::Sender<Message>,
    pub cancel: CancellationToken,
    pub user_id: Option<String>,
    pub ip: String,
    pub connected_at: SystemTime,
    last_activity: AtomicU64,
}

impl TunnelHandle {
    pub fn new(outbound: mpsc::Sender<Message>, cancel: CancellationToken, ip: String) -> Self {
        Self {
            outbound,
            cancel,
            user_id: None,
            ip,
            connected_at: SystemTime::now(),
            last_activity: AtomicU64::new(now_millis()),
        }
    }

    /// Record activity. `fetch_max` keeps the timestamp monotonic under
    /// concurrent touches.
    pub fn touch(&self) {
        self.last_activity.fetch_max(now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(now_millis().saturating_sub(self.last_activity.load(Ordering::Relaxed)))
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("Subdomain already taken: {0}")]
    SubdomainTaken(String),

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Tunnel limit reached ({0} active)")]
    TunnelLimitReached(usize),
}

/// In-memory map of live tunnels, keyed by subdomain.
pub struct Registry {
    tunnels: DashMap<String, Arc<TunnelHandle>>,
    users: Arc<dyn UserDirectory>,
    events: Arc<dyn EventSink>,
}

impl Registry {
    pub fn new(users: Arc<dyn UserDirectory>, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            tunnels: DashMap::new(),
            users,
            events,
        })
    }

    /// Bind `subdomain` to a control connection.
    ///
    /// First writer wins: the uniqueness check and the insert are one atomic
    /// entry operation, so concurrent registrations of the same name leave
    /// exactly one of them owning it. With an API key the quota is claimed
    /// through the directory's atomic slot reservation, so concurrent
    /// registrations under one key on different subdomains cannot
    /// oversubscribe the user's limit either; a reservation whose subdomain
    /// insert then loses its race is handed back.
    pub async fn register(
        &self,
        subdomain: &str,
        mut handle: TunnelHandle,
        api_key: Option<&str>,
    ) -> Result<(), RegisterError> {
        // Fast fail before paying for the user lookup.
        if self.tunnels.contains_key(subdomain) {
            return Err(RegisterError::SubdomainTaken(subdomain.to_string()));
        }

        if let Some(key) = api_key {
            let user = self
                .users
                .lookup(key)
                .await
                .filter(|u| u.is_active)
                .ok_or(RegisterError::InvalidApiKey)?;
            if !self
                .users
                .try_reserve_slot(&user.user_id, user.tunnel_limit)
                .await
            {
                let live = self.users.active_tunnel_count(&user.user_id).await;
                return Err(RegisterError::TunnelLimitReached(live));
            }
            handle.user_id = Some(user.user_id);
        }

        let handle = Arc::new(handle);
        match self.tunnels.entry(subdomain.to_string()) {
            Entry::Occupied(_) => {
                // Hand back the slot claimed above.
                if let Some(user_id) = &handle.user_id {
                    self.users.tunnel_ended(user_id).await;
                }
                return Err(RegisterError::SubdomainTaken(subdomain.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            }
        }

        let event = TunnelOpened {
            subdomain: subdomain.to_string(),
            user_id: handle.user_id.clone(),
            ip: handle.ip.clone(),
            connected_at: handle.connected_at,
        };
        let sink = Arc::clone(&self.events);
        tokio::spawn(async move { sink.tunnel_opened(event).await });

        Ok(())
    }

    pub fn lookup(&self, subdomain: &str) -> Option<Arc<TunnelHandle>> {
        self.tunnels.get(subdomain).map(|e| Arc::clone(e.value()))
    }

    pub fn touch(&self, subdomain: &str) {
        if let Some(handle) = self.tunnels.get(subdomain) {
            handle.touch();
        }
    }

    /// Remove a tunnel. Idempotent: removing an absent subdomain is a no-op.
    /// Cancels the owning session and reports the close downstream.
    pub async fn unregister(&self, subdomain: &str) {
        let Some((_, handle)) = self.tunnels.remove(subdomain) else {
            return;
        };
        handle.cancel.cancel();

        if let Some(user_id) = &handle.user_id {
            self.users.tunnel_ended(user_id).await;
        }

        let event = TunnelClosed {
            subdomain: subdomain.to_string(),
            user_id: handle.user_id.clone(),
            disconnected_at: SystemTime::now(),
        };
        let sink = Arc::clone(&self.events);
        tokio::spawn(async move { sink.tunnel_closed(event).await });
    }

    pub fn active_count(&self) -> usize {
        self.tunnels.len()
    }

    /// Unregister every tunnel idle longer than `max_idle`. Returns the
    /// swept subdomains.
    pub async fn sweep_idle(&self, max_idle: Duration) -> Vec<String> {
        let idle: Vec<String> = self
            .tunnels
            .iter()
            .filter(|e| e.value().idle_for() > max_idle)
            .map(|e| e.key().clone())
            .collect();

        for subdomain in &idle {
            tracing::info!(%subdomain, "sweeping idle tunnel");
            self.unregister(subdomain).await;
        }
        idle
    }
}
