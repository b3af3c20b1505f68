// Secret resolution for tool executions
//
// Secrets are looked up by name at call time and only ever placed in the
// child's environment. Nothing here caches or persists values.

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("secret '{0}' is not available")]
    NotFound(String),

    #[error("secret backend error: {0}")]
    Backend(String),
}

/// Source of named secret values
#[async_trait::async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<String, SecretError>;
}

/// Resolves secrets from the process environment, optionally under a prefix
/// (`GANTZ_SECRET_` + name).
#[derive(Debug, Clone, Default)]
pub struct EnvSecretResolver {
    prefix: Option<String>,
}

impl EnvSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn variable_name(&self, name: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}", prefix, name),
            None => name.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, name: &str) -> Result<String, SecretError> {
        std::env::var(self.variable_name(name)).map_err(|_| SecretError::NotFound(name.to_string()))
    }
}

/// Fixed set of secrets, used by tests and embedders
#[derive(Default)]
pub struct StaticSecretResolver {
    values: HashMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }
}

// Values stay out of Debug output
impl std::fmt::Debug for StaticSecretResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSecretResolver")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait::async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve(&self, name: &str) -> Result<String, SecretError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::NotFound(name.to_string()))
    }
}
