use crate::config::ServerConfig;
use crate::logging::LogFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gantz", version, about = "Expose local scripts as MCP tools", long_about = None)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the manifest's tools over SSE (or stdio)
    Run(RunArgs),

    /// Load a manifest and report problems
    Validate {
        /// Manifest file (YAML or JSON)
        manifest: PathBuf,
    },

    /// Print the tools/list payload for a manifest
    Tools {
        /// Manifest file (YAML or JSON)
        manifest: PathBuf,
    },

    /// Print a freshly generated auth token
    Token,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Configuration file
    #[arg(short, long, default_value = "gantz.toml")]
    pub config: PathBuf,

    /// Manifest file, overrides `server.manifest`
    #[arg(short, long, env = "GANTZ_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Require a bearer token; one is generated when none is configured
    #[arg(long)]
    pub auth: bool,

    /// Accept this bearer token (full scope)
    #[arg(long, env = "GANTZ_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Listen port, overrides `server.port`
    #[arg(short, long, env = "GANTZ_PORT")]
    pub port: Option<u16>,

    /// Listen address, overrides `server.host`
    #[arg(long)]
    pub host: Option<String>,

    /// Speak newline-delimited JSON on stdin/stdout instead of HTTP
    #[arg(long)]
    pub stdio: bool,

    /// Do not connect to the relay even if `tunnel.enabled` is set
    #[arg(long)]
    pub no_tunnel: bool,
}

impl RunArgs {
    /// Apply command-line overrides on top of the file configuration
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(manifest) = &self.manifest {
            config.server.manifest = manifest.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if self.auth {
            config.auth.required = true;
        }
        if self.no_tunnel {
            config.tunnel.enabled = false;
        }
    }
}
