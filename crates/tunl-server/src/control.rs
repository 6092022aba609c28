use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use tunl_common::limits::MAX_MESSAGES_PER_SECOND;
use tunl_common::subdomain;
use tunl_protocol::{codec, ControlMessage, Headers};

use crate::pending::{PendingTable, ResponseData};
use crate::registry::{Registry, TunnelHandle};
use crate::sessions::{SessionHandle, SessionSet};

/// Attempts at a fresh generated name when registration races another
/// client onto the same label.
const GENERATE_RETRIES: usize = 3;

/// Accepts tunnel clients and runs one session state machine per
/// connection: Handshaking (Register only, deadline-bound) -> Active
/// (Responses and liveness) -> Closed.
pub struct ControlPlane {
    registry: Arc<Registry>,
    pending: Arc<PendingTable>,
    sessions: Arc<SessionSet>,
    base_domain: String,
    https: bool,
    registration_timeout: Duration,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<Registry>,
        pending: Arc<PendingTable>,
        sessions: Arc<SessionSet>,
        base_domain: String,
        https: bool,
        registration_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pending,
            sessions,
            base_domain,
            https,
            registration_timeout,
        })
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("control plane listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);

            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream, peer).await {
                    tracing::debug!("control connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        tracing::debug!("control channel open from {peer}");

        let (sink, mut source) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<Message>(64);
        let is_alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let session_id = self.sessions.add(SessionHandle {
            outbound: out_tx.clone(),
            is_alive: Arc::clone(&is_alive),
            cancel: cancel.clone(),
        });
        let writer = tokio::spawn(write_task(sink, out_rx));

        let mut bound: Option<String> = None;
        let mut limiter = RateLimiter::new(MAX_MESSAGES_PER_SECOND as usize);

        let register_deadline = tokio::time::sleep(self.registration_timeout);
        tokio::pin!(register_deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("session for {peer} terminated");
                    break;
                }
                _ = &mut register_deadline, if bound.is_none() => {
                    tracing::warn!("no Register from {peer} within {:?}, terminating", self.registration_timeout);
                    break;
                }
                frame = source.next() => {
                    let Some(frame) = frame else { break };
                    match frame {
                        Ok(Message::Text(text)) => {
                            if !limiter.allow(Instant::now()) {
                                tracing::warn!("rate limit exceeded by {peer}");
                                send_close(&out_tx, CloseCode::Policy, "Rate limit exceeded").await;
                                break;
                            }
                            if codec::check_frame_size(&text).is_err() {
                                tracing::warn!("oversized frame ({} bytes) from {peer}", text.len());
                                send_close(&out_tx, CloseCode::Size, "Message too large").await;
                                break;
                            }
                            match codec::decode(&text) {
                                Ok(Some(msg)) => {
                                    if !self.handle_message(msg, &mut bound, &out_tx, &cancel, peer).await {
                                        break;
                                    }
                                }
                                Ok(None) => tracing::debug!("ignoring unknown message kind from {peer}"),
                                Err(e) => tracing::warn!("malformed message from {peer}: {e}"),
                            }
                        }
                        Ok(Message::Ping(payload)) => {
                            let _ = out_tx.send(Message::Pong(payload)).await;
                            if let Some(sub) = &bound {
                                self.registry.touch(sub);
                            }
                        }
                        Ok(Message::Pong(_)) => {
                            is_alive.store(true, Ordering::SeqCst);
                            if let Some(sub) = &bound {
                                self.registry.touch(sub);
                            }
                        }
                        Ok(Message::Close(_)) => {
                            tracing::debug!("client {peer} closed the channel");
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!("websocket error from {peer}: {e}");
                            break;
                        }
                    }
                }
            }
        }

        cancel.cancel();
        self.sessions.remove(session_id);
        if let Some(sub) = bound {
            self.registry.unregister(&sub).await;
            let dropped = self.pending.fail_all_for(&sub);
            if dropped > 0 {
                tracing::debug!("dropped {dropped} pending request(s) for {sub}");
            }
        }
        drop(out_tx);
        let _ = writer.await;
        Ok(())
    }

    /// Returns false when the session must end.
    async fn handle_message(
        &self,
        msg: ControlMessage,
        bound: &mut Option<String>,
        out_tx: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
        peer: SocketAddr,
    ) -> bool {
        match msg {
            ControlMessage::Register { subdomain, api_key } if bound.is_none() => {
                match self
                    .handle_register(subdomain, api_key, out_tx, cancel, peer)
                    .await
                {
                    Some(sub) => {
                        *bound = Some(sub);
                        true
                    }
                    None => false,
                }
            }
            ControlMessage::Register { .. } => {
                tracing::warn!("duplicate Register from {peer} ignored");
                true
            }
            ControlMessage::Response {
                request_id,
                status_code,
                headers,
                body,
            } => {
                let Some(sub) = bound.as_deref() else {
                    tracing::warn!("Response from {peer} before registration ignored");
                    return true;
                };
                self.registry.touch(sub);
                let data = response_data(status_code, headers, body);
                if !self.pending.resolve(&request_id, data) {
                    tracing::debug!(%request_id, "late response dropped");
                }
                true
            }
            ControlMessage::Error { message } => {
                tracing::warn!("client {peer} reported: {message}");
                true
            }
            ControlMessage::Registered { .. } | ControlMessage::Request { .. } => {
                tracing::warn!("unexpected server-bound kind from {peer} ignored");
                true
            }
        }
    }

    /// Run policy, then registration. On success replies `Registered` and
    /// returns the bound subdomain; on failure replies `Error`, closes with
    /// a policy code, and returns None.
    async fn handle_register(
        &self,
        requested: Option<String>,
        api_key: Option<String>,
        out_tx: &mpsc::Sender<Message>,
        cancel: &CancellationToken,
        peer: SocketAddr,
    ) -> Option<String> {
        let generated = requested.is_none();
        let mut sub = match requested {
            Some(s) => match subdomain::validate(&s) {
                Ok(s) => s,
                Err(e) => {
                    self.reject(out_tx, &e.to_string()).await;
                    return None;
                }
            },
            None => subdomain::generate_subdomain(),
        };

        let mut attempts = 0;
        loop {
            let handle = TunnelHandle::new(out_tx.clone(), cancel.clone(), peer.ip().to_string());
            match self
                .registry
                .register(&sub, handle, api_key.as_deref())
                .await
            {
                Ok(()) => break,
                Err(e @ crate::registry::RegisterError::SubdomainTaken(_))
                    if generated && attempts < GENERATE_RETRIES =>
                {
                    tracing::debug!("generated subdomain collided ({e}), retrying");
                    attempts += 1;
                    sub = subdomain::generate_subdomain();
                }
                Err(e) => {
                    self.reject(out_tx, &e.to_string()).await;
                    return None;
                }
            }
        }

        let scheme = if self.https { "https" } else { "http" };
        let url = format!("{scheme}://{sub}.{}", self.base_domain);
        let reply = ControlMessage::Registered {
            subdomain: sub.clone(),
            url: url.clone(),
        };
        match codec::encode(&reply) {
            Ok(frame) => {
                if out_tx.send(Message::text(frame)).await.is_err() {
                    return None;
                }
            }
            Err(e) => {
                tracing::error!("failed to encode Registered: {e}");
                return None;
            }
        }

        tracing::info!(subdomain = %sub, %url, ip = %peer.ip(), "tunnel registered");
        Some(sub)
    }

    async fn reject(&self, out_tx: &mpsc::Sender<Message>, message: &str) {
        tracing::info!("registration rejected: {message}");
        if let Ok(frame) = codec::encode(&ControlMessage::Error {
            message: message.to_string(),
        }) {
            let _ = out_tx.send(Message::text(frame)).await;
        }
        send_close(out_tx, CloseCode::Policy, message).await;
    }
}

/// Single writer per connection: everything the session sends — dispatched
/// requests, liveness pings, registration replies — funnels through here,
/// serializing access to the socket. Forwarding a close frame ends the task.
async fn write_task(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = out_rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn send_close(out_tx: &mpsc::Sender<Message>, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = out_tx.send(Message::Close(Some(frame))).await;
}

/// Decode a wire `Response` into edge-ready data. Bodies are expected in
/// base64; a payload that does not parse is carried through as literal
/// UTF-8 bytes for tolerance of plain-text senders.
fn response_data(
    status_code: Option<u16>,
    headers: Option<Headers>,
    body: Option<String>,
) -> ResponseData {
    let body = match body {
        None => Vec::new(),
        Some(text) => BASE64
            .decode(text.as_bytes())
            .unwrap_or_else(|_| text.into_bytes()),
    };
    ResponseData {
        status: status_code.unwrap_or(200),
        headers: headers.unwrap_or_default(),
        body,
    }
}

/// Rolling one-second message budget per connection.
struct RateLimiter {
    window: VecDeque<Instant>,
    max: usize,
}

impl RateLimiter {
    fn new(max: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(max + 1),
            max,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        while self
            .window
            .front()
            .is_some_and(|t| now.duration_since(*t) >= Duration::from_secs(1))
        {
            self.window.pop_front();
        }
        self.window.push_back(now);
        self.window.len() <= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_up_to_max_per_window() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(3);
        assert!(limiter.allow(now));
        assert!(limiter.allow(now));
        assert!(limiter.allow(now));
        assert!(!limiter.allow(now));
    }

    #[test]
    fn rate_limiter_window_rolls_forward() {
        let now = Instant::now();
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.allow(now));
        assert!(limiter.allow(now + Duration::from_millis(500)));
        assert!(!limiter.allow(now + Duration::from_millis(900)));

        // The first message has aged out; the half-second one has not.
        let later = now + Duration::from_millis(1100);
        assert!(!limiter.allow(later));

        // Past the whole burst, the budget is fresh again.
        let much_later = now + Duration::from_millis(2500);
        assert!(limiter.allow(much_later));
        assert!(limiter.allow(much_later));
    }

    #[test]
    fn response_data_defaults_status_to_200() {
        let data = response_data(None, None, None);
        assert_eq!(data.status, 200);
        assert!(data.headers.is_empty());
        assert!(data.body.is_empty());
    }

    #[test]
    fn response_body_is_base64_decoded() {
        let data = response_data(Some(201), None, Some("aGVsbG8=".into()));
        assert_eq!(data.status, 201);
        assert_eq!(data.body, b"hello");
    }

    #[test]
    fn non_base64_body_is_taken_literally() {
        let data = response_data(Some(200), None, Some("not base64!!".into()));
        assert_eq!(data.body, b"not base64!!");
    }
}
