use crate::api::{self, AppState};
use crate::cli::{Command, RunArgs};
use crate::config::ServerConfig;
use anyhow::Context;
use gantz_core::auth::{generate_token, AuthToken, Authenticator, TokenScope};
use gantz_core::rate_limit::RateLimiter;
use gantz_core::sandbox::Sandbox;
use gantz_core::secrets::EnvSecretResolver;
use gantz_core::ToolRegistry;
use gantz_mcp::protocol::ListToolsResult;
use gantz_mcp::stdio::serve_stdio;
use gantz_mcp::McpServer;
use gantz_tunnel::{TunnelClient, TunnelError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Failures that end the process, each with its own exit status
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{0:#}")]
    Config(anyhow::Error),

    #[error("Tunnel failed: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) => 2,
            StartupError::Tunnel(_) => 3,
            StartupError::Bind { .. } => 4,
            StartupError::Other(_) => 1,
        }
    }
}

pub async fn dispatch(command: Command) -> Result<(), StartupError> {
    match command {
        Command::Run(args) => run(args).await,
        Command::Validate { manifest } => validate(&manifest),
        Command::Tools { manifest } => tools(&manifest),
        Command::Token => {
            println!("{}", generate_token());
            Ok(())
        }
    }
}

fn load_manifest(path: &Path) -> Result<ToolRegistry, StartupError> {
    gantz_core::load(path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))
        .map_err(StartupError::Config)
}

fn validate(path: &Path) -> Result<(), StartupError> {
    let registry = load_manifest(path)?;
    println!("{}: {} ({} tools)", path.display(), registry.info().name, registry.len());
    for name in registry.names() {
        println!("  {}", name);
    }
    Ok(())
}

fn tools(path: &Path) -> Result<(), StartupError> {
    let registry = load_manifest(path)?;
    let list = ListToolsResult {
        tools: registry.list_schemas(),
    };
    let json = serde_json::to_string_pretty(&list).context("Failed to encode tool list")?;
    println!("{}", json);
    Ok(())
}

/// Configured tokens plus the `--token` value. When auth is required and
/// nothing is configured a token is generated and returned for display.
fn resolve_tokens(
    config: &ServerConfig,
    cli_token: Option<&str>,
) -> anyhow::Result<(Vec<AuthToken>, Option<String>)> {
    let mut tokens = config.tokens()?;
    if let Some(value) = cli_token.filter(|t| !t.is_empty()) {
        tokens.push(AuthToken::new(value, Some("cli".to_string()), TokenScope::full()));
    }

    let mut generated = None;
    if config.auth.required && tokens.is_empty() {
        let value = generate_token();
        tokens.push(AuthToken::new(&value, Some("generated".to_string()), TokenScope::full()));
        generated = Some(value);
    }
    Ok((tokens, generated))
}

async fn run(args: RunArgs) -> Result<(), StartupError> {
    let mut config = ServerConfig::load(&args.config).map_err(StartupError::Config)?;
    args.apply(&mut config);

    let registry = Arc::new(load_manifest(&config.server.manifest)?);
    tracing::info!(
        manifest = %config.server.manifest.display(),
        tools = registry.len(),
        "Manifest loaded"
    );

    let (tokens, generated) =
        resolve_tokens(&config, args.token.as_deref()).map_err(StartupError::Config)?;
    let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
    let auth = Arc::new(Authenticator::new(tokens, config.auth.required, Arc::clone(&limiter)));
    if !auth.is_required() {
        tracing::warn!("Authentication is disabled; anyone who can reach the server can run tools");
    }

    let sandbox_config = config
        .execution
        .sandbox_config(config.server.working_dir.clone())
        .map_err(StartupError::Config)?;
    let sandbox = Arc::new(Sandbox::new(sandbox_config, Arc::new(EnvSecretResolver::new())));
    let audit = config.audit.sinks().await.map_err(StartupError::Config)?;
    let server = Arc::new(McpServer::new(registry, Arc::clone(&sandbox), auth).with_audit(audit));

    let shutdown = CancellationToken::new();
    let _stop_background = shutdown.clone().drop_guard();
    spawn_shutdown_listener(shutdown.clone());
    spawn_limiter_cleanup(limiter, shutdown.clone());

    if args.stdio {
        if let Some(token) = &generated {
            eprintln!("Auth token: {}", token);
        }
        tokio::select! {
            result = serve_stdio(server) => result.context("stdio transport failed")?,
            _ = shutdown.cancelled() => {}
        }
        shutdown.cancel();
        sandbox.processes().cancel_all();
        return Ok(());
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| StartupError::Bind { addr: addr.clone(), source })?;
    let local = listener.local_addr().context("Failed to read listen address")?;
    tracing::info!("Listening on {}", local);

    let tunnel = if config.tunnel.enabled {
        let tunnel_config = config
            .tunnel
            .tunnel_config(local.port())
            .map_err(StartupError::Config)?;
        let handle = TunnelClient::new(tunnel_config)?
            .connect(shutdown.clone())
            .await?;
        Some(handle)
    } else {
        tracing::info!("Tunnel disabled; set tunnel.enabled = true for a public URL");
        None
    };

    print!(
        "{}",
        banner(
            server.registry().len(),
            &config.server.manifest,
            &local.to_string(),
            tunnel.as_ref().map(|handle| handle.public_url()),
            generated.as_deref(),
        )
    );

    let state = Arc::new(AppState::new(server, shutdown.clone()));
    api::serve(listener, state).await.context("HTTP server failed")?;

    shutdown.cancel();
    if let Some(handle) = tunnel {
        handle.shutdown().await;
    }
    let killed = sandbox.processes().cancel_all();
    if killed > 0 {
        tracing::info!(killed, "Killed running tools on shutdown");
    }
    tracing::info!("Server stopped");
    Ok(())
}

/// Startup summary printed to stdout
fn banner(
    tools: usize,
    manifest: &Path,
    local: &str,
    public_url: Option<&str>,
    generated_token: Option<&str>,
) -> String {
    let mut out = format!("Serving {} tools from {}\n", tools, manifest.display());
    out.push_str(&format!("Local URL:  http://{}/sse\n", local));
    match public_url {
        Some(url) => out.push_str(&format!("Public URL: {}/sse\n", url.trim_end_matches('/'))),
        None => out.push_str("Public URL: none (tunnel disabled)\n"),
    }
    if let Some(token) = generated_token {
        out.push_str(&format!("Auth token: {}\n", token));
    }
    out
}

fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::info!("Shutdown signal received"),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                    return;
                }
            },
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}

fn spawn_limiter_cleanup(limiter: Arc<RateLimiter>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => limiter.cleanup(),
                _ = shutdown.cancelled() => break,
            }
        }
    });
}
