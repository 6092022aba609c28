//! Protocol-level tunnel client for tests.
//!
//! Unlike the real client it exposes registration outcomes directly (tests
//! assert on rejection messages) and can play dead for liveness scenarios.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tunl::Forwarder;
use tunl_protocol::{codec, ControlMessage};

use crate::harness::TestServer;

type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug)]
pub struct TestClient {
    pub subdomain: String,
    pub url: String,
    cancel: CancellationToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestClient {
    /// Register and serve forwarded requests against `127.0.0.1:local_port`.
    pub async fn connect(
        server: &TestServer,
        local_port: u16,
        subdomain: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<Self> {
        Self::connect_inner(server, local_port, subdomain, api_key, true).await
    }

    /// Register, then stop reading the socket entirely. The server's pings
    /// go unanswered, so the liveness supervisor will terminate the session.
    pub async fn connect_unresponsive(server: &TestServer, subdomain: &str) -> Result<Self> {
        Self::connect_inner(server, 0, Some(subdomain), None, false).await
    }

    async fn connect_inner(
        server: &TestServer,
        local_port: u16,
        subdomain: Option<&str>,
        api_key: Option<&str>,
        serve: bool,
    ) -> Result<Self> {
        let (ws, _) = connect_async(server.control_url().as_str())
            .await
            .context("failed to connect to control plane")?;
        let (mut sink, mut source) = ws.split();

        let register = ControlMessage::Register {
            subdomain: subdomain.map(str::to_string),
            api_key: api_key.map(str::to_string),
        };
        sink.send(Message::text(codec::encode(&register)?)).await?;

        let (subdomain, url) =
            tokio::time::timeout(Duration::from_secs(5), await_registration(&mut sink, &mut source))
                .await
                .context("registration timed out")??;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(serve_loop(
            sink,
            source,
            local_port,
            cancel.clone(),
            serve,
        ));

        Ok(Self {
            subdomain,
            url,
            cancel,
            _handle: handle,
        })
    }

    /// Tear down the control connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TestClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn await_registration(
    sink: &mut SplitSink<WebSocket, Message>,
    source: &mut SplitStream<WebSocket>,
) -> Result<(String, String)> {
    while let Some(frame) = source.next().await {
        match frame? {
            Message::Text(text) => match codec::decode(&text) {
                Ok(Some(ControlMessage::Registered { subdomain, url })) => {
                    return Ok((subdomain, url))
                }
                Ok(Some(ControlMessage::Error { message })) => bail!("{message}"),
                Ok(_) => {}
                Err(e) => bail!("bad frame during registration: {e}"),
            },
            Message::Ping(payload) => {
                sink.send(Message::Pong(payload)).await?;
            }
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                bail!("channel closed during registration: {reason}");
            }
            _ => {}
        }
    }
    bail!("connection ended during registration")
}

async fn serve_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut source: SplitStream<WebSocket>,
    local_port: u16,
    cancel: CancellationToken,
    serve: bool,
) {
    if !serve {
        // Hold the socket open without reading anything.
        cancel.cancelled().await;
        let _ = sink.close().await;
        return;
    }

    let forwarder = Forwarder::new(local_port, Duration::from_secs(30));
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(32);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(msg) = out_rx.recv() => {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
            frame = source.next() => {
                let Some(Ok(msg)) = frame else { break };
                match msg {
                    Message::Text(text) => {
                        if let Ok(Some(ControlMessage::Request {
                            request_id,
                            method,
                            path,
                            headers,
                            body,
                        })) = codec::decode(&text)
                        {
                            let forwarder = forwarder.clone();
                            let out_tx = out_tx.clone();
                            tokio::spawn(async move {
                                let response = forwarder
                                    .handle(request_id, method, path, headers, body)
                                    .await;
                                if let Ok(frame) = codec::encode(&response) {
                                    let _ = out_tx.send(Message::text(frame)).await;
                                }
                            });
                        }
                    }
                    Message::Ping(payload) => {
                        let _ = out_tx.send(Message::Pong(payload)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    let _ = sink.close().await;
}
