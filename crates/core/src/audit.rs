// Audit records for tool invocations

use crate::redact::{Redactor, REDACTED};
use crate::types::{RequestId, ToolDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Key fragments that mark an argument as secret regardless of declaration
const SECRET_KEY_HINTS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "credential",
    "private_key",
];

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit chain broken at line {line}")]
    ChainBroken { line: usize },
}

/// How an invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationOutcome {
    Success,
    Error,
    Timeout,
    Cancelled,
    /// Rejected by authentication, scope or rate limit
    Denied,
    /// Rejected by argument validation or an unknown tool name
    Invalid,
}

/// Transport the request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Sse,
    Http,
    Stdio,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Sse => f.write_str("sse"),
            Transport::Http => f.write_str("http"),
            Transport::Stdio => f.write_str("stdio"),
        }
    }
}

/// One `tools/call` as seen by the audit trail. Arguments are redacted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub timestamp: DateTime<Utc>,
    pub request_id: RequestId,
    pub tool_name: String,
    pub arguments: Value,
    pub duration_ms: u64,
    pub outcome: InvocationOutcome,
    /// Token id of the caller
    pub caller: String,
    pub transport: Transport,
    /// Error kind for failed outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl InvocationEvent {
    pub fn new(
        request_id: RequestId,
        tool_name: impl Into<String>,
        caller: impl Into<String>,
        transport: Transport,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id,
            tool_name: tool_name.into(),
            arguments: Value::Null,
            duration_ms: 0,
            outcome: InvocationOutcome::Success,
            caller: caller.into(),
            transport,
            detail: None,
        }
    }

    /// Attach the call arguments, redacted
    pub fn with_arguments(mut self, tool: Option<&ToolDefinition>, arguments: &Value, redactor: &Redactor) -> Self {
        self.arguments = redact_arguments(tool, arguments, redactor);
        self
    }

    pub fn with_outcome(mut self, outcome: InvocationOutcome, detail: Option<String>) -> Self {
        self.outcome = outcome;
        self.detail = detail;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

fn looks_secret(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEY_HINTS.iter().any(|hint| key.contains(hint))
}

/// Redact call arguments for the audit trail: declared `sensitive`
/// parameters, secret-looking keys, and credential patterns in strings.
pub fn redact_arguments(tool: Option<&ToolDefinition>, arguments: &Value, redactor: &Redactor) -> Value {
    match arguments {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| {
                    let sensitive = tool
                        .and_then(|t| t.parameter(key))
                        .map(|p| p.sensitive)
                        .unwrap_or(false);
                    let value = if sensitive || looks_secret(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(value, redactor)
                    };
                    (key.clone(), value)
                })
                .collect(),
        ),
        other => redact_value(other, redactor),
    }
}

fn redact_value(value: &Value, redactor: &Redactor) -> Value {
    match value {
        Value::String(s) => Value::String(redactor.redact(s)),
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_value(v, redactor)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let v = if looks_secret(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_value(v, redactor)
                    };
                    (k.clone(), v)
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Destination for invocation events
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &InvocationEvent) -> Result<(), AuditError>;
}

/// Emits each event as a structured `tracing` event on target `gantz::audit`
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait::async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &InvocationEvent) -> Result<(), AuditError> {
        tracing::info!(
            target: "gantz::audit",
            request_id = %event.request_id,
            tool = %event.tool_name,
            caller = %event.caller,
            transport = %event.transport,
            outcome = ?event.outcome,
            duration_ms = event.duration_ms,
            detail = event.detail.as_deref().unwrap_or(""),
            arguments = %event.arguments,
            "Tool invocation"
        );
        Ok(())
    }
}

/// A JSON Lines record: the event plus a hash chain over all records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub event: InvocationEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl AuditRecord {
    fn new(event: InvocationEvent, previous_hash: Option<String>) -> Result<Self, AuditError> {
        let entry_hash = Self::calculate_hash(&event, previous_hash.as_deref())?;
        Ok(Self {
            event,
            previous_hash,
            entry_hash,
        })
    }

    fn calculate_hash(event: &InvocationEvent, previous_hash: Option<&str>) -> Result<String, AuditError> {
        let mut hasher = Sha256::new();
        if let Some(prev) = previous_hash {
            hasher.update(prev.as_bytes());
        }
        hasher.update(serde_json::to_vec(event)?);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn verify_hash(&self) -> bool {
        Self::calculate_hash(&self.event, self.previous_hash.as_deref())
            .map(|hash| hash == self.entry_hash)
            .unwrap_or(false)
    }
}

struct JsonlState {
    file: tokio::fs::File,
    last_hash: Option<String>,
}

/// Append-only JSON Lines audit file with tamper-evident hash chaining
pub struct JsonlAuditSink {
    path: PathBuf,
    state: tokio::sync::Mutex<JsonlState>,
}

impl JsonlAuditSink {
    /// Open (or create) the file, continuing the chain from its last record
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let last_hash = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(serde_json::from_str::<AuditRecord>)
                .transpose()?
                .map(|record| record.entry_hash),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        tracing::debug!(path = %path.display(), "Opened audit log");
        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(JsonlState { file, last_hash }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, event: &InvocationEvent) -> Result<(), AuditError> {
        let mut state = self.state.lock().await;
        let record = AuditRecord::new(event.clone(), state.last_hash.clone())?;
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        state.file.write_all(&line).await?;
        state.file.flush().await?;
        state.last_hash = Some(record.entry_hash);
        Ok(())
    }
}

/// Verify the hash chain of a JSON Lines audit file, returning the record count
pub async fn verify_jsonl(path: impl AsRef<Path>) -> Result<usize, AuditError> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut previous: Option<String> = None;
    let mut count = 0;
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(line)?;
        if record.previous_hash != previous || !record.verify_hash() {
            return Err(AuditError::ChainBroken { line: index + 1 });
        }
        previous = Some(record.entry_hash);
        count += 1;
    }
    Ok(count)
}

/// Keeps events in memory, for tests
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: parking_lot::Mutex<Vec<InvocationEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InvocationEvent> {
        self.events.lock().clone()
    }
}

#[async_trait::async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: &InvocationEvent) -> Result<(), AuditError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Fans events out to several sinks. A failing sink is logged and skipped.
#[derive(Clone, Default)]
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Record to every sink; never fails
    pub async fn emit(&self, event: &InvocationEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.record(event).await {
                tracing::warn!(request_id = %event.request_id, error = %e, "Audit sink failed");
            }
        }
    }
}

#[async_trait::async_trait]
impl AuditSink for CompositeAuditSink {
    async fn record(&self, event: &InvocationEvent) -> Result<(), AuditError> {
        self.emit(event).await;
        Ok(())
    }
}
