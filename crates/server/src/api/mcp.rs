// Single-request endpoint: one POST, one SSE response stream

use super::{AppState, KEEPALIVE_INTERVAL};
use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::{future, StreamExt};
use gantz_core::auth::CallerIdentity;
use gantz_mcp::protocol::{parse_request, JsonRpcResponse};
use gantz_mcp::Chunk;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;

/// Marks the end of a response stream
const DONE: &str = "[DONE]";

/// POST /mcp. The body is one JSON-RPC message; the response streams its
/// progress notifications and result as `data:` events, then `[DONE]`.
/// Closing the response cancels the request.
pub async fn handle_request(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    body: String,
) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(error) => {
            return (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::error(Value::Null, error))).into_response();
        }
    };

    let notification = request.is_notification();
    let session = state.server.stateless_session(caller);
    let chunks = session.produce(request);

    if notification {
        tokio::spawn(chunks.for_each(|_| future::ready(())));
        return StatusCode::ACCEPTED.into_response();
    }

    let events = chunks.filter_map(|chunk| {
        let event = match chunk {
            Chunk::Done => Some(Event::default().data(DONE)),
            other => other.to_json().map(|json| Event::default().data(json)),
        };
        future::ready(event.map(Ok::<_, Infallible>))
    });
    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
        .into_response()
}
