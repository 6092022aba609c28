use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// HTTP headers as they travel on the wire: name to one value or several.
pub type Headers = HashMap<String, HeaderValue>;

/// A header value is either a single string or a list of strings
/// (repeated headers such as `set-cookie`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    One(String),
    Many(Vec<String>),
}

impl HeaderValue {
    /// Iterate the value(s) as string slices.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            HeaderValue::One(v) => std::slice::from_ref(v).iter().map(String::as_str),
            HeaderValue::Many(vs) => vs.as_slice().iter().map(String::as_str),
        }
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::One(v)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(vs: Vec<String>) -> Self {
        HeaderValue::Many(vs)
    }
}

/// All control-channel messages, tagged by a `type` field.
///
/// Bodies are base64 in both directions so binary payloads survive the
/// JSON transport intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Client asks for a tunnel, optionally naming a subdomain and key.
    #[serde(rename_all = "camelCase")]
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },

    /// Server confirms the tunnel and announces the public URL.
    Registered { subdomain: String, url: String },

    /// Server forwards a public HTTP request to the client.
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: String,
        method: String,
        path: String,
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    /// Client returns the local server's answer for a request id.
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        /// Absent means 200 at the edge.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status_code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<Headers>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },

    /// Either side reports a terminal problem in human-readable form.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_serializes_with_lowercase_tag() {
        let msg = ControlMessage::Register {
            subdomain: Some("myapp".into()),
            api_key: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"register","subdomain":"myapp"}"#);
    }

    #[test]
    fn register_api_key_field_is_camel_case() {
        let msg = ControlMessage::Register {
            subdomain: None,
            api_key: Some("sk_live_1".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"register","apiKey":"sk_live_1"}"#);
    }

    #[test]
    fn registered_roundtrip() {
        let json = r#"{"type":"registered","subdomain":"myapp","url":"http://myapp.localhost:3000"}"#;
        let parsed: ControlMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ControlMessage::Registered { subdomain, url } => {
                assert_eq!(subdomain, "myapp");
                assert_eq!(url, "http://myapp.localhost:3000");
            }
            other => panic!("expected Registered, got {other:?}"),
        }
    }

    #[test]
    fn request_fields_are_camel_case() {
        let mut headers = Headers::new();
        headers.insert("accept".into(), HeaderValue::One("*/*".into()));
        let msg = ControlMessage::Request {
            request_id: "a".repeat(32),
            method: "POST".into(),
            path: "/api/items?limit=5".into(),
            headers,
            body: Some("aGVsbG8=".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"request""#));
        assert!(json.contains(r#""requestId":"#));
        assert!(!json.contains("request_id"));
    }

    #[test]
    fn response_status_code_is_optional() {
        let json = r#"{"type":"response","requestId":"abc"}"#;
        let parsed: ControlMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ControlMessage::Response {
                request_id,
                status_code,
                headers,
                body,
            } => {
                assert_eq!(request_id, "abc");
                assert_eq!(status_code, None);
                assert!(headers.is_none());
                assert!(body.is_none());
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn header_values_accept_string_or_list() {
        let json = r#"{
            "type":"response",
            "requestId":"abc",
            "statusCode":200,
            "headers":{"content-type":"text/html","set-cookie":["a=1","b=2"]}
        }"#;
        let parsed: ControlMessage = serde_json::from_str(json).unwrap();
        let ControlMessage::Response { headers, .. } = parsed else {
            panic!("expected Response");
        };
        let headers = headers.unwrap();
        assert_eq!(
            headers.get("content-type"),
            Some(&HeaderValue::One("text/html".into()))
        );
        assert_eq!(
            headers.get("set-cookie"),
            Some(&HeaderValue::Many(vec!["a=1".into(), "b=2".into()]))
        );
    }

    #[test]
    fn header_value_iter_flattens_both_shapes() {
        let one = HeaderValue::One("x".into());
        assert_eq!(one.iter().collect::<Vec<_>>(), vec!["x"]);

        let many = HeaderValue::Many(vec!["a".into(), "b".into()]);
        assert_eq!(many.iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
