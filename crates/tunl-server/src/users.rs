//! User lookup for authenticated tunnels.
//!
//! The account store lives outside the server; this trait is the seam. The
//! registry consults it when a `Register` carries an API key: an unknown or
//! inactive key rejects the tunnel, and the user's live tunnel count is
//! checked against their limit.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// An account as the tunnel server sees it.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
    pub tunnel_limit: usize,
    pub is_active: bool,
}

/// Key-to-user lookup and per-user live tunnel counts.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve an API key to its account, if any.
    async fn lookup(&self, api_key: &str) -> Option<UserRecord>;

    /// How many tunnels the user currently has open.
    async fn active_tunnel_count(&self, user_id: &str) -> usize;

    /// Claim a tunnel slot: increment the live count only while it is
    /// below `limit`, as one atomic operation. Separate read-then-write
    /// would let concurrent registrations under the same key oversubscribe
    /// the limit. A SQL backend would express this as a conditional
    /// `UPDATE ... WHERE count < limit`.
    async fn try_reserve_slot(&self, user_id: &str, limit: usize) -> bool;

    /// Release a slot claimed by [`try_reserve_slot`]: the tunnel closed
    /// or its registration was rolled back.
    ///
    /// [`try_reserve_slot`]: UserDirectory::try_reserve_slot
    async fn tunnel_ended(&self, _user_id: &str) {}
}

/// In-memory directory. The default for single-process deployments (where
/// an empty directory simply rejects every API key) and for tests.
pub struct MemoryUserDirectory {
    keys: DashMap<String, UserRecord>,
    live: DashMap<String, usize>,
}

impl MemoryUserDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            keys: DashMap::new(),
            live: DashMap::new(),
        })
    }

    /// Register an account under an API key.
    pub fn add_user(&self, api_key: &str, record: UserRecord) {
        self.keys.insert(api_key.to_string(), record);
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn lookup(&self, api_key: &str) -> Option<UserRecord> {
        self.keys.get(api_key).map(|r| r.clone())
    }

    async fn active_tunnel_count(&self, user_id: &str) -> usize {
        self.live.get(user_id).map(|n| *n).unwrap_or(0)
    }

    async fn try_reserve_slot(&self, user_id: &str, limit: usize) -> bool {
        // The entry guard pins the shard, making the check-and-increment
        // one atomic step.
        let mut slot = self.live.entry(user_id.to_string()).or_insert(0);
        if *slot >= limit {
            return false;
        }
        *slot += 1;
        true
    }

    async fn tunnel_ended(&self, user_id: &str) {
        if let Some(mut n) = self.live.get_mut(user_id) {
            *n = n.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_key_resolves_to_none() {
        let dir = MemoryUserDirectory::new();
        assert!(dir.lookup("nope").await.is_none());
    }

    #[tokio::test]
    async fn slots_reserve_up_to_the_limit_and_release() {
        let dir = MemoryUserDirectory::new();

        assert!(dir.try_reserve_slot("u1", 2).await);
        assert!(dir.try_reserve_slot("u1", 2).await);
        assert!(!dir.try_reserve_slot("u1", 2).await);
        assert_eq!(dir.active_tunnel_count("u1").await, 2);

        dir.tunnel_ended("u1").await;
        assert_eq!(dir.active_tunnel_count("u1").await, 1);
        assert!(dir.try_reserve_slot("u1", 2).await);

        // Never goes negative.
        dir.tunnel_ended("u1").await;
        dir.tunnel_ended("u1").await;
        dir.tunnel_ended("u1").await;
        assert_eq!(dir.active_tunnel_count("u1").await, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_reservations_never_oversubscribe() {
        let dir = MemoryUserDirectory::new();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let dir = Arc::clone(&dir);
            tasks.push(tokio::spawn(
                async move { dir.try_reserve_slot("u1", 3).await },
            ));
        }

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(dir.active_tunnel_count("u1").await, 3);
    }
}
