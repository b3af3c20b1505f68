//! Replays relay requests against the local server.

use crate::error::{TunnelError, TunnelResult};
use crate::frames::{ClientFrame, ForwardRequest, Header};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Connection-scoped headers that must not cross the tunnel, plus the ones
/// the HTTP client recomputes for the new hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Drop hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &[Header]) -> Vec<Header> {
    let listed: Vec<String> = headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, value)| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !HOP_BY_HOP.contains(&name.as_str()) && !listed.contains(&name)
        })
        .cloned()
        .collect()
}

/// HTTP client bound to `127.0.0.1:<port>`.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    port: u16,
}

impl Forwarder {
    pub fn new(port: u16) -> TunnelResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TunnelError::Config(e.to_string()))?;
        Ok(Self { client, port })
    }

    /// Local URL for a relay path. Paths must be absolute; the host is
    /// always loopback.
    pub fn target(&self, path: &str) -> Option<url::Url> {
        if !path.starts_with('/') {
            return None;
        }
        url::Url::parse(&format!("http://127.0.0.1:{}{}", self.port, path)).ok()
    }

    /// Forward one request, writing its response frames to `frames`.
    ///
    /// Always ends with `response_end` or `response_error`. Cancelling drops
    /// the local connection mid-stream.
    pub async fn forward(
        &self,
        request: ForwardRequest,
        frames: mpsc::Sender<ClientFrame>,
        cancel: CancellationToken,
    ) {
        let id = request.id.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            result = self.replay(request, &frames) => result,
        };

        if let Err(message) = outcome {
            debug!(request_id = %id, error = %message, "Forwarded request failed");
            let _ = frames.send(ClientFrame::error(&id, message)).await;
        }
    }

    async fn replay(&self, request: ForwardRequest, frames: &mpsc::Sender<ClientFrame>) -> Result<(), String> {
        let id = request.id.as_str();
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| format!("invalid method {}", request.method))?;
        let url = self
            .target(&request.path)
            .ok_or_else(|| format!("invalid path {}", request.path))?;
        let body = request
            .body_bytes()
            .map_err(|e| format!("invalid body encoding: {}", e))?;

        debug!(request_id = %id, %method, path = %request.path, "Forwarding request");
        let mut builder = self.client.request(method, url);
        for (name, value) in strip_hop_by_hop(&request.headers) {
            builder = builder.header(name, value);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| format!("local server unavailable: {}", e))?;

        let headers: Vec<Header> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let start = ClientFrame::ResponseStart {
            id: id.to_string(),
            status: response.status().as_u16(),
            headers: strip_hop_by_hop(&headers),
        };
        send(frames, start).await?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| format!("local response failed: {}", e))?;
            send(frames, ClientFrame::chunk(id, &chunk)).await?;
        }
        send(frames, ClientFrame::ResponseEnd { id: id.to_string() }).await
    }
}

async fn send(frames: &mpsc::Sender<ClientFrame>, frame: ClientFrame) -> Result<(), String> {
    frames
        .send(frame)
        .await
        .map_err(|_| "relay connection closed".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use std::time::Duration;
    use wiremock::matchers::{body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn headers(pairs: &[(&str, &str)]) -> Vec<Header> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn forwarder(server: &MockServer) -> Forwarder {
        Forwarder::new(server.address().port()).unwrap()
    }

    async fn collect(mut rx: mpsc::Receiver<ClientFrame>) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let stripped = strip_hop_by_hop(&headers(&[
            ("Connection", "keep-alive, X-Session-Hint"),
            ("Keep-Alive", "timeout=5"),
            ("X-Session-Hint", "abc"),
            ("Transfer-Encoding", "chunked"),
            ("Authorization", "Bearer t"),
            ("Content-Type", "application/json"),
        ]));

        assert_eq!(
            stripped,
            headers(&[("Authorization", "Bearer t"), ("Content-Type", "application/json")])
        );
    }

    #[test]
    fn test_target_stays_on_loopback() {
        let forwarder = Forwarder::new(8787).unwrap();

        let url = forwarder.target("/mcp?x=1").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8787/mcp?x=1");

        let url = forwarder.target("//evil.example.com/steal").unwrap();
        assert_eq!(url.host_str(), Some("127.0.0.1"));

        assert!(forwarder.target("http://evil.example.com/").is_none());
    }

    #[tokio::test]
    async fn test_forward_request_and_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(query_param("session", "1"))
            .and(body_string("{\"ping\":true}"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("x-reply", "yes")
                    .set_body_string("created"),
            )
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(16);
        let request = ForwardRequest {
            id: "r1".into(),
            method: "POST".into(),
            path: "/mcp?session=1".into(),
            headers: headers(&[
                ("content-type", "application/json"),
                ("proxy-authorization", "secret"),
                ("x-custom", "1"),
            ]),
            body: Some(STANDARD.encode("{\"ping\":true}")),
        };
        forwarder(&server)
            .forward(request, tx, CancellationToken::new())
            .await;
        let frames = collect(rx).await;

        let ClientFrame::ResponseStart { id, status, headers } = &frames[0] else {
            panic!("expected response_start, got {:?}", frames[0]);
        };
        assert_eq!(id, "r1");
        assert_eq!(*status, 201);
        assert!(headers.iter().any(|(n, v)| n == "x-reply" && v == "yes"));

        let body: Vec<u8> = frames
            .iter()
            .filter_map(|f| match f {
                ClientFrame::ResponseChunk { data, .. } => Some(STANDARD.decode(data).unwrap()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(body, b"created");
        assert_eq!(frames.last(), Some(&ClientFrame::ResponseEnd { id: "r1".into() }));

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].headers.get("x-custom").is_some());
        assert!(received[0].headers.get("proxy-authorization").is_none());
    }

    #[tokio::test]
    async fn test_cancel_aborts_forwarding() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let request = ForwardRequest {
            id: "slow".into(),
            method: "GET".into(),
            path: "/sse".into(),
            headers: Vec::new(),
            body: None,
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        tokio::time::timeout(
            Duration::from_secs(5),
            forwarder(&server).forward(request, tx, cancel),
        )
        .await
        .unwrap();

        let frames = collect(rx).await;
        assert_eq!(frames, vec![ClientFrame::error("slow", "cancelled")]);
    }

    #[tokio::test]
    async fn test_unreachable_local_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (tx, rx) = mpsc::channel(16);
        let request = ForwardRequest {
            id: "r2".into(),
            method: "GET".into(),
            path: "/health".into(),
            headers: Vec::new(),
            body: None,
        };
        Forwarder::new(port)
            .unwrap()
            .forward(request, tx, CancellationToken::new())
            .await;

        let frames = collect(rx).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].finished_request(), Some("r2"));
        assert!(matches!(frames[0], ClientFrame::ResponseError { .. }));
    }

    #[tokio::test]
    async fn test_invalid_method_is_rejected() {
        let (tx, rx) = mpsc::channel(16);
        let request = ForwardRequest {
            id: "r3".into(),
            method: "BAD METHOD".into(),
            path: "/".into(),
            headers: Vec::new(),
            body: None,
        };
        Forwarder::new(1)
            .unwrap()
            .forward(request, tx, CancellationToken::new())
            .await;

        let frames = collect(rx).await;
        assert_eq!(frames, vec![ClientFrame::error("r3", "invalid method BAD METHOD")]);
    }
}
