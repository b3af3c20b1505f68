use crate::middleware::auth::authenticate;
use axum::{
    extract::State,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use gantz_mcp::{Connection, McpServer};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

pub mod mcp;
pub mod sse;

/// Interval of SSE keep-alive comments
pub(crate) const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// State shared by every HTTP handler
pub struct AppState {
    pub server: Arc<McpServer>,
    pub sessions: Sessions,
    /// Cancelled on shutdown; ends open SSE streams
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(server: Arc<McpServer>, shutdown: CancellationToken) -> Self {
        Self {
            server,
            sessions: Sessions::default(),
            shutdown,
        }
    }
}

/// Open SSE connections by session id
#[derive(Clone, Default)]
pub struct Sessions {
    inner: Arc<Mutex<HashMap<String, Arc<Connection>>>>,
}

impl Sessions {
    pub fn insert(&self, id: String, connection: Arc<Connection>) {
        self.inner.lock().insert(id, connection);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        self.inner.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Serve HTTP until the state's shutdown token fires
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Create the HTTP router
pub fn create_router(state: Arc<AppState>) -> Router {
    let mcp_routes = Router::new()
        .route("/sse", get(sse::open_stream))
        .route("/messages", post(sse::post_message))
        .route("/mcp", post(mcp::handle_request))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), authenticate));

    Router::new()
        .route("/health", get(health_check))
        .merge(mcp_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.server.info().name,
        "version": env!("CARGO_PKG_VERSION"),
        "tools": state.server.registry().len(),
        "sessions": state.sessions.len(),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::AppState;
    use gantz_core::auth::{AuthToken, Authenticator, TokenScope};
    use gantz_core::rate_limit::RateLimiter;
    use gantz_core::sandbox::{Sandbox, SandboxConfig};
    use gantz_core::secrets::StaticSecretResolver;
    use gantz_core::{load_str, ManifestFormat};
    use gantz_mcp::McpServer;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    pub const TOKEN: &str = "test-token";
    pub const READ_TOKEN: &str = "read-token";

    const MANIFEST: &str = r#"
name: http-tools
tools:
  - name: echo_tool
    description: Echo a message
    access: read
    parameters: [{ name: msg, type: string, required: true }]
    execution: { shell: "echo {{msg}}", timeout: 5 }
  - name: write_tool
    description: Pretend to change something
    access: write
    execution: { shell: "echo done", timeout: 5 }
"#;

    pub fn state_with_auth(auth: Authenticator) -> Arc<AppState> {
        let registry = load_str(MANIFEST, ManifestFormat::Yaml).unwrap();
        let sandbox = Sandbox::new(SandboxConfig::default(), Arc::new(StaticSecretResolver::new()));
        let server = McpServer::new(Arc::new(registry), Arc::new(sandbox), Arc::new(auth));
        Arc::new(AppState::new(Arc::new(server), CancellationToken::new()))
    }

    /// Auth required, with a full token and a read-only token
    pub fn state() -> Arc<AppState> {
        let tokens = vec![
            AuthToken::new(TOKEN, Some("full".into()), TokenScope::full()),
            AuthToken::new(READ_TOKEN, Some("reader".into()), TokenScope::read_only()),
        ];
        state_with_auth(Authenticator::new(tokens, true, Arc::new(RateLimiter::unlimited())))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::testing::{state, state_with_auth, TOKEN};
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use gantz_core::auth::Authenticator;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn post_mcp(token: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    /// `data:` payloads of an SSE body, in order
    fn data_lines(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
            .map(|data| data.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_health_needs_no_token() {
        let app = create_router(state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "http-tools");
        assert_eq!(body["tools"], 2);
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_missing_token_is_rejected() {
        let state = state();
        let app = create_router(Arc::clone(&state));
        let call = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo_tool","arguments":{"msg":"hi"}}}"#;
        let response = app.oneshot(post_mcp(None, call)).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        let body: ErrorResponse = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body.error, "Unauthorized");
        assert_eq!(state.server.sandbox().spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected() {
        let app = create_router(state());
        let response = app
            .oneshot(Request::builder().uri("/sse").header(header::AUTHORIZATION, "Bearer nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_mcp_tools_list() {
        let app = create_router(state());
        let response = app
            .oneshot(post_mcp(Some(TOKEN), r#"{"jsonrpc":"2.0","id":"a","method":"tools/list"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let data = data_lines(&body_text(response).await);
        assert_eq!(data.len(), 2);
        let message: Value = serde_json::from_str(&data[0]).unwrap();
        assert_eq!(message["id"], "a");
        let names: Vec<&str> = message["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|tool| tool["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["echo_tool", "write_tool"]);
        assert_eq!(data[1], "[DONE]");
    }

    #[tokio::test]
    async fn test_mcp_tool_call() {
        let app = create_router(state());
        let call = r#"{"jsonrpc":"2.0","id":7,"method":"tools/call","params":{"name":"echo_tool","arguments":{"msg":"over http"}}}"#;
        let response = app.oneshot(post_mcp(Some(TOKEN), call)).await.unwrap();

        let data = data_lines(&body_text(response).await);
        let message: Value = serde_json::from_str(&data[0]).unwrap();
        assert_eq!(message["id"], 7);
        assert_eq!(message["result"]["content"][0]["text"], "over http\n");
        assert_eq!(data.last().unwrap(), "[DONE]");
    }

    #[tokio::test]
    async fn test_mcp_scope_is_enforced() {
        let app = create_router(state());
        let call = r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"write_tool"}}"#;
        let response = app
            .oneshot(post_mcp(Some(super::testing::READ_TOKEN), call))
            .await
            .unwrap();

        let data = data_lines(&body_text(response).await);
        let message: Value = serde_json::from_str(&data[0]).unwrap();
        assert_eq!(message["error"]["kind"], "Forbidden");
    }

    #[tokio::test]
    async fn test_mcp_malformed_body() {
        let app = create_router(state());
        let response = app.oneshot(post_mcp(Some(TOKEN), "{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], -32700);
        assert_eq!(body["id"], Value::Null);
    }

    #[tokio::test]
    async fn test_mcp_notification_is_accepted() {
        let app = create_router(state());
        let response = app
            .oneshot(post_mcp(Some(TOKEN), r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_open_server_accepts_anonymous_callers() {
        let app = create_router(state_with_auth(Authenticator::open()));
        let response = app
            .oneshot(post_mcp(None, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let data = data_lines(&body_text(response).await);
        let message: Value = serde_json::from_str(&data[0]).unwrap();
        assert_eq!(message["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_messages_for_unknown_session() {
        let app = create_router(state());
        let request = Request::builder()
            .method("POST")
            .uri("/messages?session_id=missing")
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_messages_without_session_id() {
        let app = create_router(state());
        let request = Request::builder()
            .method("POST")
            .uri("/messages")
            .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
