//! Frames exchanged with the relay over the websocket.
//!
//! Every frame is a JSON text message tagged by `type`. Bodies are base64
//! so binary payloads survive the text channel.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// A header name and value, in order of appearance.
pub type Header = (String, String);

/// Frames sent by the tunnel client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection.
    Register {
        #[serde(skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        version: String,
    },
    /// Status and headers of a forwarded request's response.
    ResponseStart {
        id: String,
        status: u16,
        headers: Vec<Header>,
    },
    /// A piece of the response body.
    ResponseChunk { id: String, data: String },
    /// The response body is complete.
    ResponseEnd { id: String },
    /// The request could not be forwarded or was aborted.
    ResponseError { id: String, message: String },
}

impl ClientFrame {
    pub fn chunk(id: &str, bytes: &[u8]) -> Self {
        Self::ResponseChunk {
            id: id.to_string(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn error(id: &str, message: impl Into<String>) -> Self {
        Self::ResponseError {
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Request id of a frame that finishes a forwarded request.
    pub fn finished_request(&self) -> Option<&str> {
        match self {
            Self::ResponseEnd { id } | Self::ResponseError { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// Registration accepted.
    Registered { public_url: String },
    /// Registration refused or a relay-side failure.
    Error { message: String },
    /// A public request to replay against the local server.
    Request(ForwardRequest),
    /// Abort a forwarded request.
    Cancel { id: String },
}

/// A request received on the public URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub id: String,
    pub method: String,
    /// Path and query, starting with `/`.
    pub path: String,
    #[serde(default)]
    pub headers: Vec<Header>,
    /// Base64 body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl ForwardRequest {
    /// Decoded request body, empty when absent.
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        match &self.body {
            Some(body) => STANDARD.decode(body),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_from_relay() {
        let text = json!({
            "type": "request",
            "id": "r1",
            "method": "POST",
            "path": "/mcp?x=1",
            "headers": [["content-type", "application/json"]],
            "body": STANDARD.encode(b"{}"),
        })
        .to_string();

        let frame: RelayFrame = serde_json::from_str(&text).unwrap();
        let RelayFrame::Request(request) = frame else {
            panic!("expected a request frame");
        };
        assert_eq!(request.path, "/mcp?x=1");
        assert_eq!(request.headers[0].0, "content-type");
        assert_eq!(request.body_bytes().unwrap(), b"{}");
    }

    #[test]
    fn test_client_frame_shape() {
        let frame = ClientFrame::ResponseStart {
            id: "r1".into(),
            status: 200,
            headers: vec![("content-type".into(), "text/event-stream".into())],
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "type": "response_start",
                "id": "r1",
                "status": 200,
                "headers": [["content-type", "text/event-stream"]]
            })
        );

        let chunk = ClientFrame::chunk("r1", b"data");
        assert_eq!(serde_json::to_value(&chunk).unwrap()["data"], "ZGF0YQ==");
        assert_eq!(chunk.finished_request(), None);
        assert_eq!(ClientFrame::error("r1", "boom").finished_request(), Some("r1"));
    }

    #[test]
    fn test_register_omits_missing_subdomain() {
        let frame = ClientFrame::Register {
            subdomain: None,
            version: "0.1.0".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "register", "version": "0.1.0"})
        );
    }
}
