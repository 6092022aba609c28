use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

use tunl_common::generate_request_id;
use tunl_protocol::{codec, ControlMessage, HeaderValue, Headers};

use crate::events::{EventSink, RequestLog};
use crate::pending::{PendingTable, RequestMetadata, ResponseData};
use crate::registry::Registry;

/// Public-facing HTTP plane: turns each inbound request into a `Request`
/// control message and waits for the matching `Response`.
pub struct EdgeServer {
    registry: Arc<Registry>,
    pending: Arc<PendingTable>,
    events: Arc<dyn EventSink>,
    base_domain: String,
    dispatch_timeout: Duration,
}

impl EdgeServer {
    pub fn new(
        registry: Arc<Registry>,
        pending: Arc<PendingTable>,
        events: Arc<dyn EventSink>,
        base_domain: String,
        dispatch_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pending,
            events,
            base_domain,
            dispatch_timeout,
        })
    }

    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("edge listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let this = Arc::clone(&self);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let this = Arc::clone(&this);
                    async move { this.handle_request(req, peer).await }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!("edge connection error from {}: {}", peer, e);
                }
            });
        }
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let host = req
            .headers()
            .get("host")
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();

        match extract_subdomain(&host, &self.base_domain) {
            Some(subdomain) => Ok(self.dispatch(subdomain, req, peer).await),
            None => Ok(self.serve_apex(req)),
        }
    }

    /// Requests on the bare base domain: landing page and stats.
    fn serve_apex(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if req.uri().path() == "/api/stats" {
            let stats = serde_json::json!({
                "activeTunnels": self.registry.active_count(),
                "timestamp": SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
            });
            return Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(stats.to_string())))
                .unwrap();
        }

        Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain; charset=utf-8")
            .body(Full::new(Bytes::from(
                "tunl: expose local HTTP servers on public subdomains\n",
            )))
            .unwrap()
    }

    async fn dispatch(
        &self,
        subdomain: String,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<Full<Bytes>> {
        let Some(tunnel) = self.registry.lookup(&subdomain) else {
            return plain(
                StatusCode::NOT_FOUND,
                format!("No active tunnel for subdomain \"{subdomain}\"\n"),
            );
        };

        let method = req.method().to_string();
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());
        let user_agent = req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let headers = wire_headers(req.headers());

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                tracing::error!("failed to read request body: {e}");
                return plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to read request body\n",
                );
            }
        };

        let request_id = generate_request_id();
        let metadata = RequestMetadata {
            method: method.clone(),
            path: path.clone(),
            request_bytes: body.len(),
            started_at: Instant::now(),
            user_agent,
            ip: peer.ip().to_string(),
        };

        let message = ControlMessage::Request {
            request_id: request_id.clone(),
            method,
            path,
            headers,
            body: if body.is_empty() {
                None
            } else {
                Some(BASE64.encode(&body))
            },
        };
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(%request_id, "failed to encode request: {e}");
                return plain(StatusCode::BAD_GATEWAY, "Failed to forward request\n");
            }
        };

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.insert(
            request_id.clone(),
            subdomain.clone(),
            metadata.clone(),
            response_tx,
        );
        self.registry.touch(&subdomain);

        if tunnel.outbound.send(Message::text(frame)).await.is_err() {
            self.pending.remove(&request_id);
            self.log_request(&subdomain, &metadata, 502, 0);
            return plain(StatusCode::BAD_GATEWAY, "Tunnel connection lost\n");
        }

        match tokio::time::timeout(self.dispatch_timeout, response_rx).await {
            Ok(Ok(data)) => {
                self.log_request(&subdomain, &metadata, data.status, data.body.len());
                tunnel_response(data)
            }
            Ok(Err(_)) => {
                // Responder dropped: the control channel went away while we
                // were waiting.
                self.log_request(&subdomain, &metadata, 502, 0);
                plain(StatusCode::BAD_GATEWAY, "Tunnel disconnected\n")
            }
            Err(_) => {
                self.pending.remove(&request_id);
                self.log_request(&subdomain, &metadata, 504, 0);
                plain(
                    StatusCode::GATEWAY_TIMEOUT,
                    format!(
                        "Tunnel did not respond within {}s\n",
                        self.dispatch_timeout.as_secs()
                    ),
                )
            }
        }
    }

    fn log_request(
        &self,
        subdomain: &str,
        metadata: &RequestMetadata,
        status: u16,
        response_bytes: usize,
    ) {
        let event = RequestLog {
            subdomain: subdomain.to_string(),
            method: metadata.method.clone(),
            path: metadata.path.clone(),
            status,
            request_bytes: metadata.request_bytes,
            response_bytes,
            duration_ms: metadata.started_at.elapsed().as_millis() as u64,
            user_agent: metadata.user_agent.clone(),
            ip: metadata.ip.clone(),
        };
        let sink = Arc::clone(&self.events);
        tokio::spawn(async move { sink.request_logged(event).await });
    }
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.into())))
        .unwrap()
}

/// Build the public response from a tunnel's answer. Header values that the
/// client sent as lists come out as repeated headers.
fn tunnel_response(data: ResponseData) -> Response<Full<Bytes>> {
    let mut builder = Response::builder().status(data.status);
    for (name, value) in &data.headers {
        for v in value.iter() {
            builder = builder.header(name.as_str(), v);
        }
    }
    match builder.body(Full::new(Bytes::from(data.body))) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("tunnel returned unusable response headers: {e}");
            plain(StatusCode::BAD_GATEWAY, "Tunnel returned an invalid response\n")
        }
    }
}

/// Collect hyper headers into the wire shape, folding repeated names into
/// lists.
fn wire_headers(map: &hyper::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for name in map.keys() {
        let values: Vec<String> = map
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        match values.len() {
            0 => {}
            1 => {
                out.insert(
                    name.as_str().to_string(),
                    HeaderValue::One(values.into_iter().next().unwrap()),
                );
            }
            _ => {
                out.insert(name.as_str().to_string(), HeaderValue::Many(values));
            }
        }
    }
    out
}

/// Pick the tunnel subdomain out of a Host header.
///
/// The base domain is matched as a full suffix (ports stripped on both
/// sides), so `badexample.com` is not mistaken for a subdomain of
/// `example.com` and multi-label bases like `example.co.uk` work. Bare
/// `localhost` and loopback mean "no subdomain".
fn extract_subdomain(host: &str, base_domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or("").to_ascii_lowercase();
    if host.is_empty() || host == "localhost" || host == "127.0.0.1" {
        return None;
    }

    let base = base_domain
        .split(':')
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if host == base {
        return None;
    }

    let prefix = host.strip_suffix(&format!(".{base}"))?;
    prefix.split('.').next().map(str::to_string)
}
