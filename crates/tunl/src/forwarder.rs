use std::io::ErrorKind;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use tunl_common::limits::MAX_LOCAL_RESPONSE_BYTES;
use tunl_protocol::{ControlMessage, HeaderValue, Headers};

/// Hop-by-hop headers stripped before the request reaches the local server.
/// `content-length` is recomputed from the decoded body.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Response headers that describe the connection or framing rather than the
/// payload; the payload is re-framed on the control channel.
const RESPONSE_SKIP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-length",
];

/// Proxies forwarded requests to the local HTTP server and shapes the
/// answer (or the failure) into a `Response` message.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    local_base: String,
    local_port: u16,
}

impl Forwarder {
    pub fn new(local_port: u16, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("failed to build HTTP client"),
            local_base: format!("http://127.0.0.1:{local_port}"),
            local_port,
        }
    }

    /// Replay one forwarded request against the local server.
    ///
    /// Always produces a `Response` for the request id: local failures are
    /// translated to gateway statuses (503 refused, 504 timed out, 502
    /// otherwise) instead of being dropped.
    pub async fn handle(
        &self,
        request_id: String,
        method: String,
        path: String,
        headers: Headers,
        body: Option<String>,
    ) -> ControlMessage {
        let body_bytes = match body {
            Some(encoded) => match BASE64.decode(encoded.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return error_response(request_id, 400, format!("Invalid body encoding: {e}"))
                }
            },
            None => Vec::new(),
        };

        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                return error_response(request_id, 400, format!("Unsupported method: {method}"))
            }
        };

        let url = if path.starts_with('/') {
            format!("{}{}", self.local_base, path)
        } else {
            format!("{}/{}", self.local_base, path)
        };

        let mut request = self.client.request(method, &url);
        for (name, value) in &headers {
            if skip_request_header(name) {
                continue;
            }
            for v in value.iter() {
                request = request.header(name.as_str(), v);
            }
        }
        if !body_bytes.is_empty() {
            request = request.body(body_bytes);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return self.translate_error(request_id, &e),
        };

        let status = response.status().as_u16();
        let resp_headers = response_headers(response.headers());

        let mut response = response;
        let mut buf: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if buf.len() + chunk.len() > MAX_LOCAL_RESPONSE_BYTES {
                        tracing::warn!("local response exceeded the body cap, aborting");
                        return error_response(
                            request_id,
                            413,
                            "Local response body exceeded the 100 MiB limit",
                        );
                    }
                    buf.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => return self.translate_error(request_id, &e),
            }
        }

        tracing::debug!(status, bytes = buf.len(), "local response");

        ControlMessage::Response {
            request_id,
            status_code: Some(status),
            headers: Some(resp_headers),
            body: if buf.is_empty() {
                None
            } else {
                Some(BASE64.encode(&buf))
            },
        }
    }

    fn translate_error(&self, request_id: String, err: &reqwest::Error) -> ControlMessage {
        if err.is_timeout() {
            return error_response(
                request_id,
                504,
                format!(
                    "Gateway timeout: local server on port {} did not respond",
                    self.local_port
                ),
            );
        }
        if let Some(ErrorKind::ConnectionRefused) = io_error_kind(err) {
            return error_response(
                request_id,
                503,
                format!(
                    "Connection refused: is your server running on port {}?",
                    self.local_port
                ),
            );
        }
        // DNS failures and everything else the transport can throw.
        error_response(request_id, 502, format!("Bad gateway: {err}"))
    }
}

fn skip_request_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name == "content-length" || HOP_BY_HOP.contains(&name.as_str())
}

fn skip_response_header(name: &str) -> bool {
    RESPONSE_SKIP.contains(&name.to_ascii_lowercase().as_str())
}

/// Collect local-response headers into the wire shape, folding repeated
/// names into lists.
fn response_headers(map: &reqwest::header::HeaderMap) -> Headers {
    let mut out = Headers::new();
    for name in map.keys() {
        if skip_response_header(name.as_str()) {
            continue;
        }
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

/// Walk an error's source chain looking for the underlying IO error kind.
fn io_error_kind(err: &(dyn std::error::Error + 'static)) -> Option<ErrorKind> {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = inner.source();
    }
    None
}

/// A synthesized plain-text response for a request the local server never
/// answered properly.
fn error_response(request_id: String, status: u16, message: impl Into<String>) -> ControlMessage {
    let message = message.into();
    let mut headers = Headers::new();
    headers.insert(
        "content-type".to_string(),
        HeaderValue::One("text/plain; charset=utf-8".to_string()),
    );
    ControlMessage::Response {
        request_id,
        status_code: Some(status),
        headers: Some(headers),
        body: Some(BASE64.encode(message.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_skipped() {
        assert!(skip_request_header("Host"));
        assert!(skip_request_header("connection"));
        assert!(skip_request_header("Transfer-Encoding"));
        assert!(skip_request_header("proxy-authorization"));
        assert!(skip_request_header("content-length"));
        assert!(!skip_request_header("content-type"));
        assert!(!skip_request_header("authorization"));
    }

    #[test]
    fn framing_headers_are_dropped_from_responses() {
        assert!(skip_response_header("Connection"));
        assert!(skip_response_header("keep-alive"));
        assert!(skip_response_header("content-length"));
        assert!(!skip_response_header("set-cookie"));
    }

    #[test]
    fn response_headers_fold_repeats() {
        let mut map = reqwest::header::HeaderMap::new();
        map.insert("content-type", "text/html".parse().unwrap());
        map.append("set-cookie", "a=1".parse().unwrap());
        map.append("set-cookie", "b=2".parse().unwrap());
        map.insert("connection", "keep-alive".parse().unwrap());

        let headers = response_headers(&map);
        assert_eq!(
            headers.get("content-type"),
            Some(&HeaderValue::One("text/html".into()))
        );
        assert_eq!(
            headers.get("set-cookie"),
            Some(&HeaderValue::Many(vec!["a=1".into(), "b=2".into()]))
        );
        assert!(!headers.contains_key("connection"));
    }

    #[test]
    fn error_response_carries_plain_text_body() {
        let msg = error_response("id1".into(), 503, "Connection refused");
        let ControlMessage::Response {
            request_id,
            status_code,
            headers,
            body,
        } = msg
        else {
            panic!("expected Response");
        };
        assert_eq!(request_id, "id1");
        assert_eq!(status_code, Some(503));
        assert_eq!(
            headers.unwrap().get("content-type"),
            Some(&HeaderValue::One("text/plain; charset=utf-8".into()))
        );
        assert_eq!(
            BASE64.decode(body.unwrap()).unwrap(),
            b"Connection refused"
        );
    }

    #[test]
    fn io_error_kind_finds_nested_kinds() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapped: {}", self.0)
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let outer = Wrapper(std::io::Error::new(
            ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(io_error_kind(&outer), Some(ErrorKind::ConnectionRefused));

        let plain = std::fmt::Error;
        assert_eq!(io_error_kind(&plain), None);
    }
}
