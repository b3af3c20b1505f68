use anyhow::{bail, Context, Result};
use gantz_core::audit::{CompositeAuditSink, JsonlAuditSink, TracingAuditSink};
use gantz_core::auth::{AuthToken, TokenScope};
use gantz_core::rate_limit::RateLimitSettings;
use gantz_core::sandbox::SandboxConfig;
use gantz_core::validation::UnknownArgumentPolicy;
use gantz_core::Operation;
use gantz_tunnel::TunnelConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub tunnel: TunnelSection,

    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Working directory for tools that do not name their own
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_manifest() -> PathBuf {
    PathBuf::from("gantz.yaml")
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            manifest: default_manifest(),
            working_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// A configured bearer token. The value comes from the file or from an
/// environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub value: Option<String>,

    #[serde(default)]
    pub value_env: Option<String>,

    #[serde(default = "default_scope")]
    pub scope: Vec<Operation>,

    /// Allow-list of tool names; all tools when absent
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

fn default_scope() -> Vec<Operation> {
    vec![Operation::Read, Operation::Write]
}

impl TokenConfig {
    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    pub fn resolve(&self) -> Result<AuthToken> {
        let value = match (&self.value, &self.value_env) {
            (Some(value), _) => value.clone(),
            (None, Some(var)) => std::env::var(var).with_context(|| {
                format!("Environment variable {} for token {} is not set", var, self.label())
            })?,
            (None, None) => bail!("Token {} has neither value nor value_env", self.label()),
        };
        if value.is_empty() {
            bail!("Token {} is empty", self.label());
        }

        let scope = TokenScope {
            operations: self.scope.iter().copied().collect(),
            tools: self.tools.as_ref().map(|tools| tools.iter().cloned().collect()),
        };
        Ok(AuthToken::new(&value, self.name.clone(), scope))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: f64,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_reject_unknown")]
    pub reject_unknown_arguments: bool,
}

fn default_timeout_secs() -> f64 {
    30.0
}

fn default_max_output_bytes() -> usize {
    16 * 1024
}

fn default_reject_unknown() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            reject_unknown_arguments: default_reject_unknown(),
        }
    }
}

impl ExecutionConfig {
    pub fn sandbox_config(&self, working_dir: Option<PathBuf>) -> Result<SandboxConfig> {
        let default_timeout = Duration::try_from_secs_f64(self.default_timeout_secs)
            .context("execution.default_timeout_secs is out of range")?;
        Ok(SandboxConfig {
            default_timeout,
            max_output_bytes: self.max_output_bytes,
            unknown_arguments: if self.reject_unknown_arguments {
                UnknownArgumentPolicy::Reject
            } else {
                UnknownArgumentPolicy::Ignore
            },
            default_working_dir: working_dir,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_relay_url")]
    pub relay_url: String,

    #[serde(default)]
    pub relay_key: Option<String>,

    #[serde(default = "default_relay_key_env")]
    pub relay_key_env: String,

    #[serde(default)]
    pub subdomain: Option<String>,

    /// Stop reconnecting after this many failures; forever when absent
    #[serde(default)]
    pub max_reconnect_attempts: Option<u32>,
}

fn default_relay_url() -> String {
    "wss://relay.gantz.run/connect".to_string()
}

fn default_relay_key_env() -> String {
    "GANTZ_RELAY_KEY".to_string()
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            enabled: false,
            relay_url: default_relay_url(),
            relay_key: None,
            relay_key_env: default_relay_key_env(),
            subdomain: None,
            max_reconnect_attempts: None,
        }
    }
}

impl TunnelSection {
    pub fn tunnel_config(&self, local_port: u16) -> Result<TunnelConfig> {
        let url = Url::parse(&self.relay_url).context("Invalid tunnel relay_url")?;
        let mut config = TunnelConfig::new(url, local_port);

        let key = self
            .relay_key
            .clone()
            .or_else(|| std::env::var(&self.relay_key_env).ok())
            .filter(|key| !key.is_empty());
        if let Some(key) = key {
            config = config.with_relay_key(key);
        }
        if let Some(subdomain) = &self.subdomain {
            config = config.with_subdomain(subdomain.clone());
        }
        config.retry.max_attempts = self.max_reconnect_attempts;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append-only JSON Lines audit trail
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,

    /// Emit audit events through the log as well
    #[serde(default = "default_audit_tracing")]
    pub tracing: bool,
}

fn default_audit_tracing() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            jsonl_path: None,
            tracing: default_audit_tracing(),
        }
    }
}

impl AuditConfig {
    pub async fn sinks(&self) -> Result<CompositeAuditSink> {
        let mut sinks = CompositeAuditSink::new();
        if self.tracing {
            sinks = sinks.with_sink(Arc::new(TracingAuditSink));
        }
        if let Some(path) = &self.jsonl_path {
            let sink = JsonlAuditSink::open(path)
                .await
                .with_context(|| format!("Failed to open audit log {}", path.display()))?;
            sinks = sinks.with_sink(Arc::new(sink));
        }
        Ok(sinks)
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        let config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let timeout = self.execution.default_timeout_secs;
        if !timeout.is_finite() || timeout <= 0.0 {
            bail!("execution.default_timeout_secs must be a positive number");
        }
        if Duration::try_from_secs_f64(timeout).is_err() {
            bail!("execution.default_timeout_secs is out of range");
        }
        if self.execution.max_output_bytes == 0 {
            bail!("execution.max_output_bytes must be greater than zero");
        }
        if self.tunnel.enabled {
            Url::parse(&self.tunnel.relay_url).context("Invalid tunnel relay_url")?;
        }
        Ok(())
    }

    /// Tokens from the `[auth]` section
    pub fn tokens(&self) -> Result<Vec<AuthToken>> {
        self.auth.tokens.iter().map(TokenConfig::resolve).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
[server]
host = "0.0.0.0"
port = 9000
manifest = "tools.yaml"
working_dir = "/srv/tools"

[auth]
required = true
[[auth.tokens]]
name = "ci"
value = "ci-secret"
scope = ["read"]
tools = ["echo_tool"]

[execution]
default_timeout_secs = 5
max_output_bytes = 1024
reject_unknown_arguments = false

[rate_limit]
requests_per_minute = 60
expensive_tools = ["deploy_tool"]
expensive_per_minute = 2

[tunnel]
enabled = true
relay_url = "wss://relay.example.com/connect"
relay_key = "rk_test"
subdomain = "my-tools"
max_reconnect_attempts = 10

[audit]
jsonl_path = "audit.jsonl"
tracing = false
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join("gantz.toml")).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8787);
        assert_eq!(config.server.manifest, PathBuf::from("gantz.yaml"));
        assert!(!config.auth.required);
        assert_eq!(config.execution.max_output_bytes, 16384);
        assert_eq!(config.rate_limit.requests_per_minute, 120);
        assert!(!config.tunnel.enabled);
        assert!(config.audit.tracing);
    }

    #[test]
    fn test_full_config() {
        let file = write_config(FULL);
        let config = ServerConfig::load(file.path()).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.working_dir, Some(PathBuf::from("/srv/tools")));
        assert!(config.auth.required);
        assert_eq!(config.rate_limit.expensive_per_minute, 2);
        assert!(config.rate_limit.expensive_tools.contains("deploy_tool"));

        let sandbox = config
            .execution
            .sandbox_config(config.server.working_dir.clone())
            .unwrap();
        assert_eq!(sandbox.default_timeout, Duration::from_secs(5));
        assert_eq!(sandbox.unknown_arguments, UnknownArgumentPolicy::Ignore);

        let tunnel = config.tunnel.tunnel_config(9000).unwrap();
        assert_eq!(tunnel.relay_key.as_deref(), Some("rk_test"));
        assert_eq!(tunnel.subdomain.as_deref(), Some("my-tools"));
        assert_eq!(tunnel.retry.max_attempts, Some(10));
        assert_eq!(tunnel.local_port, 9000);
    }

    #[test]
    fn test_token_scope() {
        let file = write_config(FULL);
        let config = ServerConfig::load(file.path()).unwrap();
        let tokens = config.tokens().unwrap();

        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].id(), "ci");
        assert!(tokens[0].scope.allows_operation(Operation::Read));
        assert!(!tokens[0].scope.allows_operation(Operation::Write));
        assert!(tokens[0].scope.allows_tool("echo_tool"));
        assert!(!tokens[0].scope.allows_tool("deploy_tool"));
    }

    #[test]
    fn test_token_from_environment() {
        std::env::set_var("GANTZ_TEST_CONFIG_TOKEN", "from-env");
        let entry = TokenConfig {
            name: None,
            value: None,
            value_env: Some("GANTZ_TEST_CONFIG_TOKEN".into()),
            scope: default_scope(),
            tools: None,
        };
        let token = entry.resolve().unwrap();
        assert!(token.id().starts_with("tok_"));

        let missing = TokenConfig {
            value_env: Some("GANTZ_TEST_CONFIG_TOKEN_UNSET".into()),
            ..entry.clone()
        };
        assert!(missing.resolve().is_err());

        let empty = TokenConfig {
            value_env: None,
            ..entry
        };
        assert!(empty.resolve().is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config("[execution]\ndefault_timeout_secs = 0\n");
        assert!(ServerConfig::load(file.path()).is_err());

        let file = write_config("[execution]\ndefault_timeout_secs = 1e300\n");
        let err = ServerConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{}", err);

        let huge = ExecutionConfig {
            default_timeout_secs: 1e300,
            ..ExecutionConfig::default()
        };
        assert!(huge.sandbox_config(None).is_err());

        let file = write_config("[tunnel]\nenabled = true\nrelay_url = \"not a url\"\n");
        assert!(ServerConfig::load(file.path()).is_err());

        let file = write_config("[server]\nport = \"eighty\"\n");
        assert!(ServerConfig::load(file.path()).is_err());
    }

    #[tokio::test]
    async fn test_audit_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            jsonl_path: Some(dir.path().join("logs").join("audit.jsonl")),
            tracing: true,
        };
        let sinks = config.sinks().await.unwrap();
        assert_eq!(sinks.len(), 2);
        assert!(dir.path().join("logs").exists());

        assert!(AuditConfig { jsonl_path: None, tracing: false }.sinks().await.unwrap().is_empty());
    }
}
