use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tunl_common::limits::{
    HEARTBEAT_INTERVAL, LOCAL_REQUEST_TIMEOUT, PONG_DEADLINE, RECONNECT_FACTOR,
    RECONNECT_INITIAL_DELAY, RECONNECT_MAX_DELAY,
};
use tunl_protocol::{codec, ControlMessage};

use crate::forwarder::Forwarder;

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Server-reported errors that end the client for good. Reconnecting after
/// any of these would just reproduce the rejection.
const FATAL_ERRORS: &[&str] = &[
    "subdomain already taken",
    "invalid subdomain",
    "invalid api key",
    "tunnel limit reached",
    "registration failed",
    "rate limit exceeded",
    "message too large",
];

/// Case-insensitive substring match against the fatal-error set.
pub fn is_fatal(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    FATAL_ERRORS.iter().any(|f| reason.contains(f))
}

/// Exponential reconnect backoff; resets once a session registers.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
    initial: Duration,
    factor: f64,
    max: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::with(RECONNECT_INITIAL_DELAY, RECONNECT_FACTOR, RECONNECT_MAX_DELAY)
    }

    pub fn with(initial: Duration, factor: f64, max: Duration) -> Self {
        Self {
            delay: initial,
            initial,
            factor,
            max,
        }
    }

    /// The delay to sleep before the next attempt; grows afterward.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        let grown = Duration::from_millis((current.as_millis() as f64 * self.factor) as u64);
        self.delay = grown.min(self.max);
        current
    }

    pub fn reset(&mut self) {
        self.delay = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Client-side configuration for one tunnel.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub api_key: Option<String>,
    /// None = keep reconnecting forever (backoff saturates at its ceiling).
    pub max_reconnects: Option<u32>,
    pub heartbeat_interval: Duration,
    pub pong_deadline: Duration,
    pub local_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_url: String, local_port: u16) -> Self {
        Self {
            server_url,
            local_port,
            subdomain: None,
            api_key: None,
            max_reconnects: None,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            pong_deadline: PONG_DEADLINE,
            local_timeout: LOCAL_REQUEST_TIMEOUT,
        }
    }
}

/// How a session ended.
enum SessionEnd {
    /// Transient: reconnect with backoff.
    Retry,
    /// Registration or policy rejection: stop for good.
    Fatal(String),
}

struct SessionOutcome {
    registered: bool,
    end: SessionEnd,
}

/// Owns the control-channel lifecycle: connect, register, serve, reconnect.
pub struct ConnectionManager {
    config: ClientConfig,
    forwarder: Forwarder,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let forwarder = Forwarder::new(config.local_port, config.local_timeout);
        Self { config, forwarder }
    }

    /// Run until a fatal error (Err) or forever.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = Backoff::new();
        let mut failures: u32 = 0;

        loop {
            match self.run_session().await {
                Ok(outcome) => {
                    if outcome.registered {
                        backoff.reset();
                        failures = 0;
                    }
                    if let SessionEnd::Fatal(message) = outcome.end {
                        bail!("{message}");
                    }
                }
                Err(e) => {
                    tracing::warn!("connection failed: {e:#}");
                }
            }

            failures += 1;
            if let Some(cap) = self.config.max_reconnects {
                if failures > cap {
                    bail!("giving up after {cap} reconnect attempts");
                }
            }

            let delay = backoff.next_delay();
            tracing::info!("reconnecting in {delay:?} (attempt {failures})");
            tokio::time::sleep(delay).await;
        }
    }

    async fn run_session(&self) -> Result<SessionOutcome> {
        tracing::debug!("connecting to {}", self.config.server_url);
        let (ws, _) = connect_async(self.config.server_url.as_str())
            .await
            .context("failed to connect to tunnel server")?;

        let (sink, mut source) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(64);
        let writer = tokio::spawn(write_task(sink, out_rx));

        let register = ControlMessage::Register {
            subdomain: self.config.subdomain.clone(),
            api_key: self.config.api_key.clone(),
        };
        out_tx
            .send(Message::text(codec::encode(&register)?))
            .await
            .map_err(|_| anyhow!("connection closed before registration"))?;

        let last_pong = Arc::new(Mutex::new(Instant::now()));
        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_task(
            out_tx.clone(),
            Arc::clone(&last_pong),
            cancel.clone(),
            self.config.heartbeat_interval,
            self.config.pong_deadline,
        ));

        let mut registered = false;
        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(
                        "no pong within {:?}, terminating channel",
                        self.config.pong_deadline
                    );
                    break SessionEnd::Retry;
                }
                frame = source.next() => {
                    let Some(frame) = frame else { break SessionEnd::Retry };
                    match frame {
                        Ok(Message::Text(text)) => match codec::decode(&text) {
                            Ok(Some(msg)) => {
                                match self.handle_message(msg, &out_tx, &mut registered) {
                                    None => {}
                                    Some(end) => break end,
                                }
                            }
                            Ok(None) => tracing::debug!("ignoring unknown message kind"),
                            Err(e) => tracing::warn!("malformed frame from server: {e}"),
                        },
                        Ok(Message::Ping(payload)) => {
                            let _ = out_tx.send(Message::Pong(payload)).await;
                        }
                        Ok(Message::Pong(_)) => {
                            *last_pong.lock() = Instant::now();
                        }
                        Ok(Message::Close(frame)) => {
                            if let Some(frame) = &frame {
                                let reason = frame.reason.to_string();
                                tracing::info!("server closed channel ({:?}): {reason}", frame.code);
                                if is_fatal(&reason) {
                                    break SessionEnd::Fatal(reason);
                                }
                            } else {
                                tracing::info!("server closed channel");
                            }
                            break SessionEnd::Retry;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("websocket error: {e}");
                            break SessionEnd::Retry;
                        }
                    }
                }
            }
        };

        cancel.cancel();
        let _ = heartbeat.await;
        drop(out_tx);
        let _ = writer.await;

        Ok(SessionOutcome { registered, end })
    }

    /// Returns Some(end) when the session must stop.
    fn handle_message(
        &self,
        msg: ControlMessage,
        out_tx: &mpsc::Sender<Message>,
        registered: &mut bool,
    ) -> Option<SessionEnd> {
        match msg {
            ControlMessage::Registered { subdomain, url } => {
                *registered = true;
                tracing::info!(%subdomain, "tunnel established: {url}");
                None
            }
            ControlMessage::Request {
                request_id,
                method,
                path,
                headers,
                body,
            } => {
                tracing::debug!(%request_id, "{method} {path}");
                let forwarder = self.forwarder.clone();
                let out_tx = out_tx.clone();
                tokio::spawn(async move {
                    let response = forwarder
                        .handle(request_id, method, path, headers, body)
                        .await;
                    match codec::encode(&response) {
                        Ok(frame) => {
                            // The channel may have closed while the local
                            // request was in flight; the response is dropped.
                            if out_tx.send(Message::text(frame)).await.is_err() {
                                tracing::debug!("channel closed, response dropped");
                            }
                        }
                        Err(e) => tracing::error!("failed to encode response: {e}"),
                    }
                });
                None
            }
            ControlMessage::Error { message } => {
                if is_fatal(&message) {
                    Some(SessionEnd::Fatal(message))
                } else {
                    tracing::warn!("server error: {message}");
                    None
                }
            }
            ControlMessage::Register { .. } | ControlMessage::Response { .. } => {
                tracing::debug!("ignoring unexpected client-bound kind");
                None
            }
        }
    }
}

/// Single writer draining the outbound queue into the socket.
async fn write_task(mut sink: SplitSink<WebSocket, Message>, mut out_rx: mpsc::Receiver<Message>) {
    while let Some(msg) = out_rx.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Periodic pings plus the dead-peer watchdog: when the last pong is older
/// than the deadline, the session is cancelled and reconnection takes over.
async fn heartbeat_task(
    out_tx: mpsc::Sender<Message>,
    last_pong: Arc<Mutex<Instant>>,
    cancel: CancellationToken,
    interval: Duration,
    deadline: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // the immediate tick
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if last_pong.lock().elapsed() > deadline {
                    cancel.cancel();
                    break;
                }
                if out_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                tracing::trace!("ping sent");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotonic_up_to_the_ceiling() {
        let mut backoff = Backoff::new();
        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= previous);
            assert!(delay <= RECONNECT_MAX_DELAY);
            previous = delay;
        }
        assert_eq!(previous, RECONNECT_MAX_DELAY);
    }

    #[test]
    fn backoff_starts_at_the_initial_delay_and_resets() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), RECONNECT_INITIAL_DELAY);
        assert!(backoff.next_delay() > RECONNECT_INITIAL_DELAY);

        backoff.reset();
        assert_eq!(backoff.next_delay(), RECONNECT_INITIAL_DELAY);
    }

    #[test]
    fn backoff_growth_uses_the_factor() {
        let mut backoff = Backoff::with(Duration::from_secs(1), 1.5, Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_millis(1500));
        assert_eq!(backoff.next_delay(), Duration::from_millis(2250));
    }

    #[test]
    fn fatal_errors_match_case_insensitively_as_substrings() {
        assert!(is_fatal("Subdomain already taken: dup"));
        assert!(is_fatal("Invalid subdomain: ab"));
        assert!(is_fatal("INVALID API KEY"));
        assert!(is_fatal("Tunnel limit reached (3 active)"));
        assert!(is_fatal("Registration failed"));
        assert!(is_fatal("Rate limit exceeded"));
        assert!(is_fatal("Message too large"));

        assert!(!is_fatal("connection reset by peer"));
        assert!(!is_fatal("internal server error"));
        assert!(!is_fatal(""));
    }
}
