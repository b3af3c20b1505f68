// Execution sandbox: runs a validated tool call as a child process group
// with a hard timeout, capped and redacted output, and a restricted
// environment.

mod command;
mod output;
mod process;

pub use command::{prepare, shell_quote, PreparedCommand};
pub use output::{BoundedCapture, CapturedOutput, LineSplitter, OutputChunk, OutputStream};
pub use process::{kill_process_group, ProcessGuard, ProcessTable};

use crate::redact::Redactor;
use crate::secrets::{SecretError, SecretResolver};
use crate::types::{RequestId, ToolDefinition};
use crate::validation::{validate_arguments, UnknownArgumentPolicy, ValidationError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Variables copied from the relay's own environment into every child
pub const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "LANG"];

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// How long to keep reading pipes after the child is gone
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_BUFFER_SIZE: usize = 8192;

/// Why an execution did not succeed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("tool timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("failed to start tool process: {0}")]
    ProcessSpawnFailed(String),

    #[error("tool exited with {}", exit_description(.code))]
    NonZeroExit { code: Option<i32> },

    #[error("execution cancelled")]
    Cancelled,
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Timeout { .. } => "Timeout",
            ExecutionError::ProcessSpawnFailed(_) => "ProcessSpawnFailed",
            ExecutionError::NonZeroExit { .. } => "NonZeroExit",
            ExecutionError::Cancelled => "Cancelled",
        }
    }
}

/// Failures that prevent a result from being produced
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("secret '{0}' is not available")]
    SecretUnavailable(String),

    #[error(transparent)]
    Execution(ExecutionError),
}

impl SandboxError {
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Validation(e) => e.kind(),
            SandboxError::SecretUnavailable(_) => "SecretUnavailable",
            SandboxError::Execution(e) => e.kind(),
        }
    }
}

/// How the child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    Exited,
    Signaled,
    TimedOut,
    Cancelled,
}

/// Outcome of a tool execution that got as far as running
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration_ms: u64,
    pub termination: Termination,
    pub attempts: u32,
    pub timeout_ms: u64,
}

impl ExecutionResult {
    /// The failure this result represents, if any
    pub fn error(&self) -> Option<ExecutionError> {
        match self.termination {
            Termination::TimedOut => Some(ExecutionError::Timeout {
                timeout_ms: self.timeout_ms,
            }),
            Termination::Cancelled => Some(ExecutionError::Cancelled),
            _ if self.success => None,
            _ => Some(ExecutionError::NonZeroExit {
                code: self.exit_code,
            }),
        }
    }

    pub fn truncated(&self) -> bool {
        self.stdout.truncated || self.stderr.truncated
    }
}

/// Sandbox settings shared by every execution
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
    pub unknown_arguments: UnknownArgumentPolicy,
    /// Used when the tool does not name its own working directory
    pub default_working_dir: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_output_bytes: 16 * 1024,
            unknown_arguments: UnknownArgumentPolicy::Reject,
            default_working_dir: None,
        }
    }
}

/// Per-call context supplied by the protocol layer
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: RequestId,
    pub cancel: CancellationToken,
    /// Receives redacted output lines of streaming tools while they run
    pub progress: Option<mpsc::UnboundedSender<OutputChunk>>,
}

impl ExecutionContext {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: mpsc::UnboundedSender<OutputChunk>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Result of a single spawn attempt
struct Attempt {
    stdout: CapturedOutput,
    stderr: CapturedOutput,
    exit_code: Option<i32>,
    termination: Termination,
}

impl Attempt {
    fn cancelled() -> Self {
        Self {
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            exit_code: None,
            termination: Termination::Cancelled,
        }
    }

    fn retryable(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code != Some(0)
    }
}

enum Wait {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Kills the child's process group if the execution future is dropped
/// before the child was reaped (e.g. the client disconnected).
struct GroupKill(Option<u32>);

impl GroupKill {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        if let Some(pgid) = self.0.take() {
            let _ = kill_process_group(pgid);
        }
    }
}

/// Runs tool invocations
pub struct Sandbox {
    config: SandboxConfig,
    secrets: Arc<dyn SecretResolver>,
    processes: Arc<ProcessTable>,
    spawns: AtomicU64,
}

impl Sandbox {
    pub fn new(config: SandboxConfig, secrets: Arc<dyn SecretResolver>) -> Self {
        Self {
            config,
            secrets,
            processes: Arc::new(ProcessTable::new()),
            spawns: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn processes(&self) -> &Arc<ProcessTable> {
        &self.processes
    }

    /// Total child processes started since creation
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    /// Validate arguments, render the command and run it.
    ///
    /// Validation and secret failures return before anything is spawned.
    /// Timeouts, cancellations and non-zero exits are reported through the
    /// result's `termination` and `success` fields.
    pub async fn execute(
        &self,
        tool: &ToolDefinition,
        arguments: &Value,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult, SandboxError> {
        let args = validate_arguments(tool, arguments, self.config.unknown_arguments)?;
        let secrets = self.resolve_secrets(tool).await?;
        let redactor = Redactor::with_secrets(secrets.iter().map(|(_, value)| value.clone()));
        let prepared = prepare(tool, &args);

        let timeout = tool.execution.timeout.unwrap_or(self.config.default_timeout);
        let cap = tool
            .execution
            .max_output_bytes
            .unwrap_or(self.config.max_output_bytes);
        let progress = if tool.execution.streaming {
            ctx.progress.clone()
        } else {
            None
        };

        let guard = self.processes.register(ctx.request_id, ctx.cancel.clone());
        let started = Instant::now();
        let max_attempts = tool.execution.retries.saturating_add(1);
        let mut backoff = INITIAL_RETRY_BACKOFF;
        let mut attempts = 0;

        let attempt = loop {
            if ctx.cancel.is_cancelled() {
                break Attempt::cancelled();
            }
            attempts += 1;

            let outcome = self
                .run_once(tool, &prepared, &secrets, &redactor, timeout, cap, &ctx, progress.clone(), &guard)
                .await;

            let retry = match &outcome {
                Ok(attempt) => attempt.retryable(),
                Err(_) => true,
            };
            if !retry || attempts >= max_attempts {
                match outcome {
                    Ok(attempt) => break attempt,
                    Err(e) => {
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            tool = %tool.name,
                            attempts,
                            error = %e,
                            "Failed to spawn tool process"
                        );
                        return Err(SandboxError::Execution(ExecutionError::ProcessSpawnFailed(
                            e.to_string(),
                        )));
                    }
                }
            }

            tracing::debug!(
                request_id = %ctx.request_id,
                tool = %tool.name,
                attempt = attempts,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying tool execution"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = ctx.cancel.cancelled() => {}
            }
            backoff = (backoff * 2).min(MAX_RETRY_BACKOFF);
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let success = attempt.termination == Termination::Exited && attempt.exit_code == Some(0);

        tracing::debug!(
            request_id = %ctx.request_id,
            tool = %tool.name,
            exit_code = ?attempt.exit_code,
            termination = ?attempt.termination,
            duration_ms,
            attempts,
            "Tool execution finished"
        );

        Ok(ExecutionResult {
            stdout: attempt.stdout,
            stderr: attempt.stderr,
            exit_code: attempt.exit_code,
            success,
            duration_ms,
            termination: attempt.termination,
            attempts,
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    async fn resolve_secrets(&self, tool: &ToolDefinition) -> Result<Vec<(String, String)>, SandboxError> {
        let mut resolved = Vec::with_capacity(tool.execution.secrets.len());
        for name in &tool.execution.secrets {
            match self.secrets.resolve(name).await {
                Ok(value) => resolved.push((name.clone(), value)),
                Err(e) => {
                    if let SecretError::Backend(_) = &e {
                        tracing::warn!(tool = %tool.name, secret = %name, error = %e, "Secret backend error");
                    }
                    return Err(SandboxError::SecretUnavailable(name.clone()));
                }
            }
        }
        Ok(resolved)
    }

    fn build_command(
        &self,
        tool: &ToolDefinition,
        prepared: &PreparedCommand,
        secrets: &[(String, String)],
    ) -> Command {
        let mut cmd = Command::new(&prepared.program);
        cmd.args(&prepared.args)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for name in PASSTHROUGH_ENV {
            if let Ok(value) = std::env::var(name) {
                cmd.env(name, value);
            }
        }
        for (key, value) in &prepared.env {
            cmd.env(key, value);
        }
        for (key, value) in secrets {
            cmd.env(key, value);
        }

        if let Some(dir) = tool
            .execution
            .working_dir
            .as_ref()
            .or(self.config.default_working_dir.as_ref())
        {
            cmd.current_dir(dir);
        }

        // New process group led by the child, so the whole tree can be killed
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_once(
        &self,
        tool: &ToolDefinition,
        prepared: &PreparedCommand,
        secrets: &[(String, String)],
        redactor: &Redactor,
        timeout: Duration,
        cap: usize,
        ctx: &ExecutionContext,
        progress: Option<mpsc::UnboundedSender<OutputChunk>>,
        guard: &ProcessGuard,
    ) -> std::io::Result<Attempt> {
        let mut cmd = self.build_command(tool, prepared, secrets);
        self.spawns.fetch_add(1, Ordering::Relaxed);
        let mut child = cmd.spawn()?;

        let pid = child.id();
        let mut group_kill = GroupKill(pid);
        guard.set_process_group(pid);
        tracing::debug!(request_id = %ctx.request_id, tool = %tool.name, pid = ?pid, "Spawned tool process");

        let stdout_capture = Arc::new(Mutex::new(BoundedCapture::new(cap)));
        let stderr_capture = Arc::new(Mutex::new(BoundedCapture::new(cap)));
        let mut stdout_task = child.stdout.take().map(|pipe| {
            tokio::spawn(pump(
                pipe,
                OutputStream::Stdout,
                Arc::clone(&stdout_capture),
                progress.clone().map(|tx| (tx, redactor.clone())),
                cap,
            ))
        });
        let mut stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(pump(
                pipe,
                OutputStream::Stderr,
                Arc::clone(&stderr_capture),
                progress.map(|tx| (tx, redactor.clone())),
                cap,
            ))
        });

        let wait = tokio::select! {
            status = child.wait() => Wait::Exited(status),
            _ = tokio::time::sleep(timeout) => Wait::TimedOut,
            _ = ctx.cancel.cancelled() => Wait::Cancelled,
        };

        let (exit_code, termination) = match wait {
            Wait::Exited(status) => {
                let status = status?;
                match status.code() {
                    Some(code) => (Some(code), Termination::Exited),
                    None => (None, Termination::Signaled),
                }
            }
            Wait::TimedOut => {
                kill_and_reap(&mut child, pid).await;
                tracing::warn!(
                    request_id = %ctx.request_id,
                    tool = %tool.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Tool timed out, process group killed"
                );
                (None, Termination::TimedOut)
            }
            Wait::Cancelled => {
                kill_and_reap(&mut child, pid).await;
                tracing::info!(request_id = %ctx.request_id, tool = %tool.name, "Tool execution cancelled");
                (None, Termination::Cancelled)
            }
        };
        group_kill.disarm();

        // Pipes may stay open in stray grandchildren; give up after a grace period
        let drained = tokio::time::timeout(PIPE_DRAIN_GRACE, async {
            if let Some(task) = stdout_task.as_mut() {
                let _ = task.await;
            }
            if let Some(task) = stderr_task.as_mut() {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                task.abort();
            }
        }

        let stdout = stdout_capture.lock().finish(redactor);
        let stderr = stderr_capture.lock().finish(redactor);
        Ok(Attempt {
            stdout,
            stderr,
            exit_code,
            termination,
        })
    }
}

async fn kill_and_reap(child: &mut tokio::process::Child, pgid: Option<u32>) {
    if let Some(pgid) = pgid {
        if let Err(e) = kill_process_group(pgid) {
            tracing::warn!(pgid, error = %e, "Failed to kill process group");
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn pump<R>(
    mut reader: R,
    stream: OutputStream,
    capture: Arc<Mutex<BoundedCapture>>,
    progress: Option<(mpsc::UnboundedSender<OutputChunk>, Redactor)>,
    budget: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut splitter = LineSplitter::new(budget);
    let forward = |text: String| {
        if let Some((tx, redactor)) = &progress {
            let _ = tx.send(OutputChunk {
                stream,
                text: redactor.redact(&text),
            });
        }
    };

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                capture.lock().push(&buf[..n]);
                if progress.is_some() {
                    splitter.push(&buf[..n]).into_iter().for_each(&forward);
                }
            }
        }
    }
    if progress.is_some() {
        splitter.flush().into_iter().for_each(&forward);
    }
}
