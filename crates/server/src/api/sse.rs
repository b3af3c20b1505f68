// Long-lived SSE sessions: GET /sse streams responses, POST /messages feeds requests

use super::{AppState, ErrorResponse, Sessions, KEEPALIVE_INTERVAL};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures::{future, stream, Stream, StreamExt};
use gantz_core::audit::Transport;
use gantz_core::auth::CallerIdentity;
use gantz_mcp::protocol::{parse_request, JsonRpcResponse};
use gantz_mcp::{Chunk, Connection};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const OUTPUT_BUFFER: usize = 64;

/// Drops the session from the table when the SSE stream goes away. Dropping
/// the last `Connection` closes the session and kills its running tools.
struct SessionGuard {
    sessions: Sessions,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.sessions.remove(&self.id).is_some() {
            tracing::info!(session_id = %self.id, "SSE client disconnected");
        }
    }
}

/// GET /sse. The first event, `endpoint`, tells the client where to POST its
/// messages; every response and notification follows as a `message` event.
pub async fn open_stream(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session = state.server.session(Transport::Sse, Some(caller));
    let id = session.id().to_string();
    let (tx, rx) = mpsc::channel::<Chunk>(OUTPUT_BUFFER);
    state
        .sessions
        .insert(id.clone(), Arc::new(Connection::spawn(session, tx)));
    tracing::info!(session_id = %id, "SSE client connected");

    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        id: id.clone(),
    };
    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={}", id));
    let messages = ReceiverStream::new(rx).filter_map(|chunk| {
        future::ready(chunk.to_json().map(|json| Ok(Event::default().event("message").data(json))))
    });

    let stream = stream::once(future::ready(Ok::<_, Infallible>(endpoint)))
        .chain(messages)
        .map(move |event| {
            let _held = &guard;
            event
        })
        .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEPALIVE_INTERVAL))
}

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub session_id: String,
}

/// POST /messages?session_id=... Queues one message on the session; its
/// response arrives on the SSE stream.
pub async fn post_message(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<CallerIdentity>,
    Query(query): Query<MessageQuery>,
    body: String,
) -> Response {
    let Some(connection) = state.sessions.get(&query.session_id) else {
        return (StatusCode::NOT_FOUND, Json(ErrorResponse::new("Unknown session"))).into_response();
    };

    if !owns_session(connection.session().caller().as_ref(), &caller) {
        tracing::warn!(session_id = %query.session_id, caller = %caller.id, "Message for another caller's session");
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse::new("Session belongs to another caller")),
        )
            .into_response();
    }

    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(error) => {
            return (StatusCode::BAD_REQUEST, Json(JsonRpcResponse::error(Value::Null, error))).into_response();
        }
    };

    match connection.submit(request) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => (StatusCode::GONE, Json(ErrorResponse::new("Session closed"))).into_response(),
    }
}

/// Token callers must match the session's token; anonymous sessions accept
/// any anonymous caller, since the session id is the only credential.
fn owns_session(owner: Option<&CallerIdentity>, caller: &CallerIdentity) -> bool {
    match owner {
        Some(owner) if owner.is_anonymous() => caller.is_anonymous(),
        Some(owner) => owner.id == caller.id,
        None => false,
    }
}
