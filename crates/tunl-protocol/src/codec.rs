use serde_json::Value;
use thiserror::Error;

use crate::messages::ControlMessage;

/// Maximum size of a single encoded frame (1 MiB).
///
/// Enforced by the receiving side of the server's control session; a peer
/// exceeding it gets its channel closed with a "too large" close frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Errors that can occur while encoding or decoding control frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("frame too large: {0} bytes (max {MAX_FRAME_BYTES})")]
    FrameTooLarge(usize),
}

/// Serialize a control message to its text-frame form.
pub fn encode(msg: &ControlMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Check an inbound frame against [`MAX_FRAME_BYTES`].
pub fn check_frame_size(text: &str) -> Result<(), CodecError> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(text.len()));
    }
    Ok(())
}

/// Parse a text frame into a control message.
///
/// Returns `Ok(None)` for a well-formed object whose `type` is not a
/// recognized kind; callers log and carry on without closing the channel.
/// Structurally invalid frames and recognized kinds with missing required
/// fields fail with [`CodecError::Malformed`].
pub fn decode(text: &str) -> Result<Option<ControlMessage>, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CodecError::Malformed("missing \"type\" field".into()))?;

    if !matches!(
        kind,
        "register" | "registered" | "request" | "response" | "error"
    ) {
        return Ok(None);
    }

    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{HeaderValue, Headers};

    #[test]
    fn roundtrip_request() {
        let mut headers = Headers::new();
        headers.insert("host".into(), HeaderValue::One("myapp.tunl.cc".into()));
        let msg = ControlMessage::Request {
            request_id: "0123456789abcdef0123456789abcdef".into(),
            method: "GET".into(),
            path: "/ping".into(),
            headers,
            body: None,
        };

        let text = encode(&msg).unwrap();
        let decoded = decode(&text).unwrap().unwrap();
        match decoded {
            ControlMessage::Request {
                request_id,
                method,
                path,
                ..
            } => {
                assert_eq!(request_id, "0123456789abcdef0123456789abcdef");
                assert_eq!(method, "GET");
                assert_eq!(path, "/ping");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_ignored_not_an_error() {
        let decoded = decode(r#"{"type":"heartbeat","seq":4}"#).unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = decode("{not json").unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn missing_type_is_malformed() {
        let err = decode(r#"{"subdomain":"myapp"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn non_string_type_is_malformed() {
        let err = decode(r#"{"type":7}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn known_kind_missing_required_field_is_malformed() {
        // Registered requires both subdomain and url.
        let err = decode(r#"{"type":"registered","subdomain":"myapp"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn oversized_frame_is_rejected_by_size_check() {
        let big = "x".repeat(MAX_FRAME_BYTES + 1);
        let err = check_frame_size(&big).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(n) if n == MAX_FRAME_BYTES + 1));

        let ok = "x".repeat(MAX_FRAME_BYTES);
        assert!(check_frame_size(&ok).is_ok());
    }
}
