// Per-connection session: state machine and request dispatch
//
// Every request is turned into a finite stream of chunks ending in
// `Chunk::Done`. Transports only decide how chunks are framed.

use crate::protocol::{
    codes, CallToolParams, CallToolResult, CancelledParams, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ToolContent, ToolsCapability, PROTOCOL_VERSION,
};
use crate::server::McpServer;
use futures::stream::{self, BoxStream, StreamExt};
use gantz_core::audit::{InvocationEvent, InvocationOutcome, Transport};
use gantz_core::auth::{AuthError, CallerIdentity};
use gantz_core::redact::Redactor;
use gantz_core::sandbox::{ExecutionContext, ExecutionResult, SandboxError, Termination};
use gantz_core::{Operation, RequestId};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
pub const NOTIFICATION_CANCELLED: &str = "notifications/cancelled";
pub const NOTIFICATION_PROGRESS: &str = "notifications/progress";

/// Connection lifecycle.
///
/// `Connected -> Idle` on `initialize`; `Idle -> Listing -> Idle` for
/// `tools/list`; `Idle -> Invoking [-> Streaming] -> Idle` for `tools/call`;
/// any state `-> Closed` on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Idle,
    Listing,
    Invoking,
    Streaming,
    Closed,
}

/// One element of a request's output stream
#[derive(Debug, Clone)]
pub enum Chunk {
    /// `notifications/progress` for a streaming tool
    Progress(JsonRpcRequest),
    /// Terminal response; absent for notifications
    Response(JsonRpcResponse),
    /// End of the stream
    Done,
}

impl Chunk {
    /// JSON text of the message, `None` for the `Done` sentinel
    pub fn to_json(&self) -> Option<String> {
        let encoded = match self {
            Chunk::Progress(notification) => serde_json::to_string(notification),
            Chunk::Response(response) => serde_json::to_string(response),
            Chunk::Done => return None,
        };
        match encoded {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode outgoing message");
                None
            }
        }
    }
}

fn pending_key(id: &Value) -> String {
    id.to_string()
}

pub struct Session {
    id: String,
    server: Arc<McpServer>,
    transport: Transport,
    state: Mutex<SessionState>,
    caller: Mutex<Option<CallerIdentity>>,
    /// Cancellation tokens of queued and running requests, by JSON-RPC id
    pending: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(server: Arc<McpServer>, transport: Transport, caller: Option<CallerIdentity>) -> Self {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let caller = caller.map(|c| if c.is_anonymous() { CallerIdentity::anonymous_for(&id[..8]) } else { c });
        tracing::debug!(session_id = %id, %transport, "Session opened");
        Self {
            id,
            server,
            transport,
            state: Mutex::new(SessionState::Connected),
            caller: Mutex::new(caller),
            pending: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn caller(&self) -> Option<CallerIdentity> {
        self.caller.lock().clone()
    }

    fn is_initialized(&self) -> bool {
        !matches!(self.state(), SessionState::Connected | SessionState::Closed)
    }

    /// Error for requests that arrive before the handshake. Without a caller
    /// on an authenticated server the missing credential is what matters.
    fn not_ready_error(&self) -> JsonRpcError {
        if self.server.auth().is_required() && self.caller().is_none() {
            auth_error(&AuthError::Unauthorized)
        } else {
            JsonRpcError::not_initialized()
        }
    }

    fn transition(&self, to: SessionState) {
        let mut state = self.state.lock();
        if *state != SessionState::Closed {
            tracing::trace!(session_id = %self.id, from = ?*state, to = ?to, "Session state change");
            *state = to;
        }
    }

    /// Skip the `initialize` handshake for a caller resolved by the
    /// transport. The identity is kept as given, so anonymous stateless
    /// requests share one rate-limit budget.
    pub(crate) fn mark_ready(&self, caller: CallerIdentity) {
        *self.caller.lock() = Some(caller);
        self.transition(SessionState::Idle);
    }

    /// Close the session and cancel everything still queued or running
    pub fn close(&self) {
        *self.state.lock() = SessionState::Closed;
        if !self.cancel.is_cancelled() {
            tracing::debug!(session_id = %self.id, "Session closed");
            self.cancel.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Register a request as pending so a later cancel can reach it, even
    /// before it leaves the queue
    pub fn register(&self, request: &JsonRpcRequest) -> CancellationToken {
        match &request.id {
            Some(id) => self
                .pending
                .lock()
                .entry(pending_key(id))
                .or_insert_with(|| self.cancel.child_token())
                .clone(),
            None => self.cancel.child_token(),
        }
    }

    /// Handle `notifications/cancelled`. Returns whether a request was found.
    pub fn cancel_request(&self, request: &JsonRpcRequest) -> bool {
        let Ok(params) = request.parse_params::<CancelledParams>() else {
            return false;
        };
        let token = self.pending.lock().get(&pending_key(&params.request_id)).cloned();
        match token {
            Some(token) => {
                tracing::info!(
                    session_id = %self.id,
                    request = %params.request_id,
                    reason = params.reason.as_deref().unwrap_or(""),
                    "Request cancelled by client"
                );
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Process one request into a stream of chunks terminated by `Done`.
    ///
    /// Dropping the stream before it finishes cancels the request.
    pub fn produce(self: &Arc<Self>, request: JsonRpcRequest) -> BoxStream<'static, Chunk> {
        let cancel = self.register(&request);
        let guard = cancel.clone().drop_guard();
        let id = request.id.clone();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.dispatch(request, cancel, progress_tx).await });

        let response = stream::once(async move {
            let _guard = guard;
            match handle.await {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "Request handler failed");
                    id.map(|id| JsonRpcResponse::error(id, JsonRpcError::internal_error("Internal error")))
                }
            }
        })
        .filter_map(|response| futures::future::ready(response.map(Chunk::Response)));

        UnboundedReceiverStream::new(progress_rx)
            .chain(response)
            .chain(stream::once(futures::future::ready(Chunk::Done)))
            .boxed()
    }

    async fn dispatch(
        &self,
        request: JsonRpcRequest,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<Chunk>,
    ) -> Option<JsonRpcResponse> {
        let Some(id) = request.id.clone() else {
            self.handle_notification(&request);
            return None;
        };

        tracing::debug!(session_id = %self.id, method = %request.method, "Handling request");
        let result = match request.method.as_str() {
            METHOD_INITIALIZE => self.initialize(&request),
            METHOD_PING => Ok(json!({})),
            _ if !self.is_initialized() => Err(self.not_ready_error()),
            METHOD_TOOLS_LIST => self.list_tools(),
            METHOD_TOOLS_CALL => self.call_tool(&request, &id, cancel, progress).await,
            method => Err(JsonRpcError::method_not_found(method)),
        };
        self.pending.lock().remove(&pending_key(&id));

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            NOTIFICATION_INITIALIZED => {
                tracing::debug!(session_id = %self.id, "Client initialized");
            }
            NOTIFICATION_CANCELLED => {
                self.cancel_request(request);
            }
            other => {
                tracing::debug!(session_id = %self.id, method = %other, "Ignoring notification");
            }
        }
    }

    fn initialize(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = request.parse_params()?;
        let auth = self.server.auth();
        let existing = self.caller();

        let caller = match (params.auth_token.as_deref(), existing) {
            (Some(token), _) => auth.authenticate(Some(token)),
            (None, Some(caller)) => Ok(caller),
            (None, None) => auth.authenticate(None),
        }
        .map_err(|e| {
            tracing::warn!(session_id = %self.id, transport = %self.transport, "Initialize rejected: {}", e);
            auth_error(&e)
        })?;
        let caller = if caller.is_anonymous() {
            CallerIdentity::anonymous_for(&self.id[..8])
        } else {
            caller
        };

        tracing::info!(
            session_id = %self.id,
            caller = %caller.id,
            client = params.client_info.as_ref().map(|c| c.name.as_str()).unwrap_or("unknown"),
            client_protocol = params.protocol_version.as_deref().unwrap_or(""),
            "Session initialized"
        );
        *self.caller.lock() = Some(caller);
        self.transition(SessionState::Idle);

        to_value(InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability { list_changed: false },
            },
            server_info: self.server.info().clone(),
            instructions: self.server.registry().info().description.clone(),
        })
    }

    fn current_caller(&self) -> Result<CallerIdentity, JsonRpcError> {
        self.caller().ok_or_else(JsonRpcError::not_initialized)
    }

    fn list_tools(&self) -> Result<Value, JsonRpcError> {
        let caller = self.current_caller()?;
        self.server
            .auth()
            .check(&caller, None, Operation::Read)
            .map_err(|e| auth_error(&e))?;

        self.transition(SessionState::Listing);
        let result = to_value(self.server.tools_list());
        self.transition(SessionState::Idle);
        result
    }

    async fn call_tool(
        &self,
        request: &JsonRpcRequest,
        id: &Value,
        cancel: CancellationToken,
        progress: mpsc::UnboundedSender<Chunk>,
    ) -> Result<Value, JsonRpcError> {
        let started = Instant::now();
        let params: CallToolParams = request.parse_params()?;
        let caller = self.current_caller()?;
        let request_id = RequestId::new();
        let event = InvocationEvent::new(request_id, &params.name, &caller.id, self.transport);

        let Some(tool) = self.server.registry().get(&params.name) else {
            self.audit(
                event.with_arguments(None, &params.arguments, &Redactor::new()),
                InvocationOutcome::Invalid,
                Some("NotFound"),
                started,
            )
            .await;
            return Err(JsonRpcError::unknown_tool(&params.name));
        };
        let event = event.with_arguments(Some(&tool), &params.arguments, &Redactor::new());

        if let Err(e) = self.server.auth().check(&caller, Some(&tool.name), tool.access) {
            tracing::info!(request_id = %request_id, tool = %tool.name, caller = %caller.id, kind = e.kind(), "Tool call denied");
            self.audit(event, InvocationOutcome::Denied, Some(e.kind()), started).await;
            return Err(auth_error(&e));
        }

        self.transition(if tool.execution.streaming {
            SessionState::Streaming
        } else {
            SessionState::Invoking
        });

        let (output_tx, mut output_rx) = mpsc::unbounded_channel();
        let ctx = ExecutionContext::new(request_id)
            .with_cancel(cancel)
            .with_progress(output_tx);
        let progress_token = params
            .meta
            .as_ref()
            .and_then(|m| m.progress_token.clone())
            .unwrap_or_else(|| id.clone());

        let forward = async {
            let mut sequence = 0u64;
            while let Some(chunk) = output_rx.recv().await {
                sequence += 1;
                let notification = JsonRpcRequest::notification(
                    NOTIFICATION_PROGRESS,
                    json!({
                        "progressToken": progress_token,
                        "progress": sequence,
                        "requestId": id,
                        "stream": chunk.stream,
                        "message": chunk.text,
                    }),
                );
                let _ = progress.send(Chunk::Progress(notification));
            }
        };
        let (outcome, ()) = tokio::join!(
            self.server.sandbox().execute(&tool, &params.arguments, ctx),
            forward
        );
        self.transition(SessionState::Idle);

        match outcome {
            Ok(result) => {
                let (audit_outcome, detail) = match result.error() {
                    None => (InvocationOutcome::Success, None),
                    Some(e) => match result.termination {
                        Termination::TimedOut => (InvocationOutcome::Timeout, Some(e.kind())),
                        Termination::Cancelled => (InvocationOutcome::Cancelled, Some(e.kind())),
                        _ => (InvocationOutcome::Error, Some(e.kind())),
                    },
                };
                self.audit(event, audit_outcome, detail, started).await;
                call_result(&result)
            }
            Err(e) => {
                let audit_outcome = match e {
                    SandboxError::Validation(_) => InvocationOutcome::Invalid,
                    _ => InvocationOutcome::Error,
                };
                self.audit(event, audit_outcome, Some(e.kind()), started).await;
                Err(sandbox_error(&e))
            }
        }
    }

    async fn audit(&self, event: InvocationEvent, outcome: InvocationOutcome, detail: Option<&str>, started: Instant) {
        let event = event
            .with_outcome(outcome, detail.map(str::to_string))
            .with_duration_ms(started.elapsed().as_millis() as u64);
        self.server.audit().emit(&event).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn to_value(value: impl serde::Serialize) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(format!("Failed to encode result: {}", e)))
}

/// Map an auth failure onto the wire
pub fn auth_error(err: &AuthError) -> JsonRpcError {
    match err {
        AuthError::Unauthorized => JsonRpcError::new(codes::UNAUTHORIZED, err.kind(), err.to_string()),
        AuthError::Forbidden { .. } => JsonRpcError::new(codes::FORBIDDEN, err.kind(), err.to_string()),
        AuthError::RateLimited { retry_after_secs } => {
            JsonRpcError::new(codes::RATE_LIMITED, err.kind(), err.to_string())
                .with_data(json!({ "retryAfterSecs": retry_after_secs }))
        }
    }
}

/// Map a sandbox failure onto the wire. Messages carry no paths or templates.
pub fn sandbox_error(err: &SandboxError) -> JsonRpcError {
    match err {
        SandboxError::Validation(_) => JsonRpcError::new(codes::INVALID_PARAMS, err.kind(), err.to_string()),
        SandboxError::SecretUnavailable(_) | SandboxError::Execution(_) => {
            JsonRpcError::new(codes::EXECUTION_FAILED, err.kind(), err.to_string())
        }
    }
}

/// Build the `tools/call` result. Timeouts and cancellations become errors
/// that still carry the partial output.
fn call_result(result: &ExecutionResult) -> Result<Value, JsonRpcError> {
    let structured = to_value(result)?;
    if let Some(e) = result.error() {
        let code = match result.termination {
            Termination::TimedOut => Some(codes::TIMEOUT),
            Termination::Cancelled => Some(codes::CANCELLED),
            _ => None,
        };
        if let Some(code) = code {
            return Err(JsonRpcError::new(code, e.kind(), e.to_string()).with_data(structured));
        }
    }

    let mut content = vec![ToolContent::text(with_truncation_note(
        &result.stdout.text,
        result.stdout.truncated,
        result.stdout.original_size,
    ))];
    if !result.stderr.text.is_empty() {
        content.push(ToolContent::text(format!(
            "stderr:\n{}",
            with_truncation_note(&result.stderr.text, result.stderr.truncated, result.stderr.original_size)
        )));
    }
    if let Some(e) = result.error() {
        content.push(ToolContent::text(format!("Error: {}", e)));
    }

    to_value(CallToolResult {
        content,
        is_error: !result.success,
        structured_content: Some(structured),
    })
}

fn with_truncation_note(text: &str, truncated: bool, original_size: usize) -> String {
    if truncated {
        format!("{}\n[output truncated: {} of {} bytes shown]", text, text.len(), original_size)
    } else {
        text.to_string()
    }
}
