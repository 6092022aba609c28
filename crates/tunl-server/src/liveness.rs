use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_tungstenite::tungstenite::Message;

use crate::sessions::SessionSet;

/// Dead-peer detection for every open control channel.
///
/// One process-wide ticker: each round, a session whose `is_alive` flag was
/// never refreshed by a pong since the previous round is terminated;
/// otherwise the flag is cleared and a fresh ping goes out. One missed pong
/// is fatal.
pub struct LivenessSupervisor {
    sessions: Arc<SessionSet>,
    interval: Duration,
}

impl LivenessSupervisor {
    pub fn new(sessions: Arc<SessionSet>, interval: Duration) -> Self {
        Self { sessions, interval }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            for session in self.sessions.snapshot() {
                if !session.is_alive.load(Ordering::SeqCst) {
                    tracing::info!("terminating unresponsive control channel");
                    session.cancel.cancel();
                    continue;
                }
                session.is_alive.store(false, Ordering::SeqCst);
                // A full outbound queue means the peer is not draining
                // writes; skip the ping and let the next round kill it.
                let _ = session.outbound.try_send(Message::Ping(Bytes::new()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sessions::SessionHandle;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn responsive_session_gets_pinged_not_killed() {
        let sessions = SessionSet::new();
        let (tx, mut rx) = mpsc::channel(8);
        let is_alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        sessions.add(SessionHandle {
            outbound: tx,
            is_alive: Arc::clone(&is_alive),
            cancel: cancel.clone(),
        });

        let supervisor = LivenessSupervisor::new(Arc::clone(&sessions), Duration::from_secs(30));
        tokio::spawn(supervisor.run());

        // First round pings and clears the flag.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
        assert!(!is_alive.load(Ordering::SeqCst));
        assert!(!cancel.is_cancelled());

        // Pong arrives before the next round; session survives it.
        is_alive.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!cancel.is_cancelled());
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pong_terminates_the_session() {
        let sessions = SessionSet::new();
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        sessions.add(SessionHandle {
            outbound: tx,
            is_alive: Arc::new(AtomicBool::new(true)),
            cancel: cancel.clone(),
        });

        let supervisor = LivenessSupervisor::new(Arc::clone(&sessions), Duration::from_secs(30));
        tokio::spawn(supervisor.run());

        // Round one pings; no pong ever comes back.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!cancel.is_cancelled());

        // Round two finds the stale flag and terminates.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(cancel.is_cancelled());
    }
}
