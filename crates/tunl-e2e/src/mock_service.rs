//! Mock local HTTP service.
//!
//! Plays the server behind the tunnel: records every request it receives
//! and answers with a configurable status, headers, and body. An echo mode
//! reflects the request body, and a delay simulates a slow upstream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A recorded HTTP request for test assertions.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

pub struct MockHttpService {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
    response_status: Arc<RwLock<StatusCode>>,
    response_body: Arc<RwLock<Vec<u8>>>,
    response_headers: Arc<RwLock<Vec<(String, String)>>>,
    response_delay: Arc<RwLock<Option<Duration>>>,
    echo: Arc<AtomicBool>,
}

impl MockHttpService {
    /// Start on an ephemeral loopback port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock service");
        let addr = listener.local_addr().unwrap();

        let requests: Arc<RwLock<Vec<RecordedRequest>>> = Arc::new(RwLock::new(Vec::new()));
        let response_status = Arc::new(RwLock::new(StatusCode::OK));
        let response_body: Arc<RwLock<Vec<u8>>> = Arc::new(RwLock::new(b"OK".to_vec()));
        let response_headers: Arc<RwLock<Vec<(String, String)>>> = Arc::new(RwLock::new(vec![]));
        let response_delay: Arc<RwLock<Option<Duration>>> = Arc::new(RwLock::new(None));
        let echo = Arc::new(AtomicBool::new(false));

        let state = (
            requests.clone(),
            response_status.clone(),
            response_body.clone(),
            response_headers.clone(),
            response_delay.clone(),
            echo.clone(),
        );

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let (requests, status, body, headers, delay, echo) = state.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let requests = requests.clone();
                        let status = status.clone();
                        let body = body.clone();
                        let headers = headers.clone();
                        let delay = delay.clone();
                        let echo = echo.clone();
                        async move {
                            let method = req.method().to_string();
                            let uri = req.uri().to_string();
                            let req_headers: Vec<(String, String)> = req
                                .headers()
                                .iter()
                                .map(|(k, v)| {
                                    (k.to_string(), v.to_str().unwrap_or("").to_string())
                                })
                                .collect();
                            let req_body = req
                                .into_body()
                                .collect()
                                .await
                                .map(|b| b.to_bytes().to_vec())
                                .unwrap_or_default();

                            requests.write().push(RecordedRequest {
                                method,
                                uri,
                                headers: req_headers,
                                body: req_body.clone(),
                            });

                            let pause = *delay.read();
                            if let Some(pause) = pause {
                                tokio::time::sleep(pause).await;
                            }

                            let resp_status = *status.read();
                            let resp_body = if echo.load(Ordering::SeqCst) {
                                req_body
                            } else {
                                body.read().clone()
                            };
                            let resp_headers = headers.read().clone();

                            let mut builder = Response::builder().status(resp_status);
                            for (name, value) in resp_headers {
                                builder = builder.header(name, value);
                            }

                            Ok::<_, Infallible>(
                                builder.body(Full::new(Bytes::from(resp_body))).unwrap(),
                            )
                        }
                    });

                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            requests,
            response_status,
            response_body,
            response_headers,
            response_delay,
            echo,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.requests.read().last().cloned()
    }

    pub fn clear_requests(&self) {
        self.requests.write().clear();
    }

    pub fn set_response_status(&self, status: StatusCode) {
        *self.response_status.write() = status;
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        *self.response_body.write() = body.into();
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.response_headers
            .write()
            .push((name.into(), value.into()));
    }

    /// Delay every response by `pause`.
    pub fn set_response_delay(&self, pause: Duration) {
        *self.response_delay.write() = Some(pause);
    }

    /// Reflect each request body back as the response body.
    pub fn set_echo(&self, on: bool) {
        self.echo.store(on, Ordering::SeqCst);
    }
}
