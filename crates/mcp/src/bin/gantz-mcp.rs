// Standalone MCP server binary speaking newline-delimited JSON on stdio

use anyhow::{Context, Result};
use gantz_core::audit::{CompositeAuditSink, TracingAuditSink};
use gantz_core::auth::{AuthToken, Authenticator, TokenScope};
use gantz_core::rate_limit::{RateLimitSettings, RateLimiter};
use gantz_core::sandbox::{Sandbox, SandboxConfig};
use gantz_core::secrets::EnvSecretResolver;
use gantz_mcp::server::McpServer;
use gantz_mcp::stdio::serve_stdio;
use std::path::PathBuf;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries protocol messages, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let manifest = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GANTZ_MANIFEST").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("gantz.yaml"));

    let registry = gantz_core::load(&manifest)
        .with_context(|| format!("Failed to load manifest {}", manifest.display()))?;
    tracing::info!("Loaded {} tools from {}", registry.len(), manifest.display());

    // A token in the environment turns authentication on
    let tokens: Vec<AuthToken> = std::env::var("GANTZ_TOKEN")
        .ok()
        .filter(|t| !t.is_empty())
        .map(|t| AuthToken::new(&t, Some("env".to_string()), TokenScope::full()))
        .into_iter()
        .collect();
    let required = !tokens.is_empty();
    let limiter = Arc::new(RateLimiter::new(&RateLimitSettings::default()));
    let auth = Arc::new(Authenticator::new(tokens, required, limiter));

    let sandbox = Arc::new(Sandbox::new(SandboxConfig::default(), Arc::new(EnvSecretResolver::new())));
    let audit = CompositeAuditSink::new().with_sink(Arc::new(TracingAuditSink));
    let server = Arc::new(McpServer::new(Arc::new(registry), sandbox, auth).with_audit(audit));

    serve_stdio(server).await?;
    Ok(())
}
