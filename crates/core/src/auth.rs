// Bearer token authentication, scopes and rate limiting

use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::types::Operation;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Identity used for every caller when authentication is disabled
pub const ANONYMOUS: &str = "anonymous";

/// Prefix of generated token values
const TOKEN_PREFIX: &str = "gz_";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing or invalid token")]
    Unauthorized,

    #[error("token is not allowed to {operation} tool '{tool}'")]
    Forbidden { tool: String, operation: Operation },

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Unauthorized => "Unauthorized",
            AuthError::Forbidden { .. } => "Forbidden",
            AuthError::RateLimited { .. } => "RateLimited",
        }
    }
}

impl From<RateLimitError> for AuthError {
    fn from(err: RateLimitError) -> Self {
        AuthError::RateLimited {
            retry_after_secs: err.retry_after().as_secs().max(1),
        }
    }
}

/// What a token may do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenScope {
    pub operations: BTreeSet<Operation>,
    /// Allow-list of tool names; `None` allows every tool
    pub tools: Option<BTreeSet<String>>,
}

impl TokenScope {
    /// Read and write on every tool
    pub fn full() -> Self {
        Self {
            operations: [Operation::Read, Operation::Write].into_iter().collect(),
            tools: None,
        }
    }

    pub fn read_only() -> Self {
        Self {
            operations: [Operation::Read].into_iter().collect(),
            tools: None,
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(tools.into_iter().map(Into::into).collect());
        self
    }

    pub fn allows_operation(&self, operation: Operation) -> bool {
        self.operations.contains(&operation)
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.as_ref().map_or(true, |tools| tools.contains(tool))
    }
}

/// A configured token. Only the digest of the secret value is kept.
#[derive(Clone)]
pub struct AuthToken {
    id: String,
    digest: [u8; 32],
    pub scope: TokenScope,
    pub issued_at: DateTime<Utc>,
}

impl AuthToken {
    /// Create from a secret value. Without a name the id is derived from the
    /// digest (`tok_` + 8 hex digits).
    pub fn new(value: &str, name: Option<String>, scope: TokenScope) -> Self {
        let digest = digest(value);
        let id = name.unwrap_or_else(|| format!("tok_{}", &hex::encode(digest)[..8]));
        Self {
            id,
            digest,
            scope,
            issued_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthToken")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Generate a random token value (32 random bytes, hex encoded)
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", TOKEN_PREFIX, hex::encode(bytes))
}

fn digest(value: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}

/// Compare two digests without short-circuiting on the first difference
fn digests_equal(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub id: String,
    pub scope: TokenScope,
}

impl CallerIdentity {
    pub fn anonymous() -> Self {
        Self {
            id: ANONYMOUS.to_string(),
            scope: TokenScope::full(),
        }
    }

    /// Anonymous identity scoped to one connection, so rate limits apply
    /// per connection when authentication is disabled
    pub fn anonymous_for(connection: &str) -> Self {
        Self {
            id: format!("{}:{}", ANONYMOUS, connection),
            scope: TokenScope::full(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.id == ANONYMOUS || self.id.starts_with("anonymous:")
    }
}

/// Outcome of [`Authenticator::authorize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow(CallerIdentity),
    Deny(AuthError),
}

/// Immutable token table plus the shared rate limiter
pub struct Authenticator {
    tokens: Vec<AuthToken>,
    required: bool,
    limiter: Arc<RateLimiter>,
}

impl Authenticator {
    pub fn new(tokens: Vec<AuthToken>, required: bool, limiter: Arc<RateLimiter>) -> Self {
        Self {
            tokens,
            required,
            limiter,
        }
    }

    /// Authentication disabled, no rate limits
    pub fn open() -> Self {
        Self::new(Vec::new(), false, Arc::new(RateLimiter::unlimited()))
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Resolve a presented token to a caller.
    ///
    /// Every configured digest is compared so timing does not reveal which
    /// token (if any) matched. A presented but unknown token is rejected even
    /// when authentication is optional, unless no tokens are configured.
    pub fn authenticate(&self, presented: Option<&str>) -> Result<CallerIdentity, AuthError> {
        if !self.required && self.tokens.is_empty() {
            return Ok(CallerIdentity::anonymous());
        }
        let Some(value) = presented else {
            return if self.required {
                Err(AuthError::Unauthorized)
            } else {
                Ok(CallerIdentity::anonymous())
            };
        };

        let presented = digest(value);
        let mut matched: Option<&AuthToken> = None;
        for token in &self.tokens {
            if digests_equal(&token.digest, &presented) && matched.is_none() {
                matched = Some(token);
            }
        }

        match matched {
            Some(token) => Ok(CallerIdentity {
                id: token.id.clone(),
                scope: token.scope.clone(),
            }),
            None => Err(AuthError::Unauthorized),
        }
    }

    /// Scope and rate-limit check for an already authenticated caller.
    /// `tool` is `None` for non-tool operations such as `tools/list`.
    pub fn check(
        &self,
        caller: &CallerIdentity,
        tool: Option<&str>,
        operation: Operation,
    ) -> Result<(), AuthError> {
        if !caller.scope.allows_operation(operation) || !tool.map_or(true, |t| caller.scope.allows_tool(t)) {
            return Err(AuthError::Forbidden {
                tool: tool.unwrap_or("*").to_string(),
                operation,
            });
        }
        self.limiter.check(&caller.id, tool)?;
        Ok(())
    }

    /// Authenticate and check in one step
    pub fn authorize(&self, token: Option<&str>, tool: Option<&str>, operation: Operation) -> AuthDecision {
        let result = self
            .authenticate(token)
            .and_then(|caller| self.check(&caller, tool, operation).map(|_| caller));
        match result {
            Ok(caller) => AuthDecision::Allow(caller),
            Err(reason) => {
                tracing::debug!(tool = ?tool, %operation, kind = reason.kind(), "Request denied");
                AuthDecision::Deny(reason)
            }
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("tokens", &self.tokens)
            .field("required", &self.required)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use std::time::Duration;

    fn authenticator(required: bool) -> Authenticator {
        let tokens = vec![
            AuthToken::new("admin-secret", Some("admin".into()), TokenScope::full()),
            AuthToken::new("reader-secret", None, TokenScope::read_only().with_tools(["echo_tool"])),
        ];
        Authenticator::new(tokens, required, Arc::new(RateLimiter::unlimited()))
    }

    #[test]
    fn test_valid_tokens() {
        let auth = authenticator(true);
        let admin = auth.authenticate(Some("admin-secret")).unwrap();
        assert_eq!(admin.id, "admin");

        let reader = auth.authenticate(Some("reader-secret")).unwrap();
        assert!(reader.id.starts_with("tok_"));
        assert_eq!(reader.id.len(), 12);
    }

    #[test]
    fn test_missing_or_unknown_token() {
        let auth = authenticator(true);
        assert_eq!(auth.authenticate(None), Err(AuthError::Unauthorized));
        assert_eq!(auth.authenticate(Some("nope")), Err(AuthError::Unauthorized));
        assert_eq!(auth.authenticate(Some("")), Err(AuthError::Unauthorized));
    }

    #[test]
    fn test_optional_auth_allows_anonymous() {
        let auth = authenticator(false);
        let caller = auth.authenticate(None).unwrap();
        assert!(caller.is_anonymous());
        assert_eq!(caller.scope, TokenScope::full());

        // A wrong token is still wrong
        assert_eq!(auth.authenticate(Some("nope")), Err(AuthError::Unauthorized));

        let open = Authenticator::open();
        assert!(open.authenticate(Some("anything")).unwrap().is_anonymous());
    }

    #[test]
    fn test_scope_enforced() {
        let auth = authenticator(true);

        match auth.authorize(Some("reader-secret"), Some("deploy_tool"), Operation::Write) {
            AuthDecision::Deny(err) => {
                assert_eq!(err.kind(), "Forbidden");
                assert_eq!(
                    err,
                    AuthError::Forbidden {
                        tool: "deploy_tool".into(),
                        operation: Operation::Write
                    }
                );
            }
            other => panic!("expected deny, got {:?}", other),
        }

        // Read-only token, allowed tool, but a write tool
        assert!(matches!(
            auth.authorize(Some("reader-secret"), Some("echo_tool"), Operation::Write),
            AuthDecision::Deny(AuthError::Forbidden { .. })
        ));
        assert!(matches!(
            auth.authorize(Some("reader-secret"), Some("echo_tool"), Operation::Read),
            AuthDecision::Allow(_)
        ));
        assert!(matches!(
            auth.authorize(Some("reader-secret"), None, Operation::Read),
            AuthDecision::Allow(_)
        ));
        assert!(matches!(
            auth.authorize(Some("admin-secret"), Some("deploy_tool"), Operation::Write),
            AuthDecision::Allow(_)
        ));
    }

    #[test]
    fn test_rate_limited() {
        let limiter = RateLimiter::with_configs(
            Some(RateLimitConfig::new(2, Duration::from_secs(60))),
            None,
            Vec::new(),
        );
        let auth = Authenticator::new(
            vec![AuthToken::new("t", None, TokenScope::full())],
            true,
            Arc::new(limiter),
        );

        assert!(matches!(auth.authorize(Some("t"), None, Operation::Read), AuthDecision::Allow(_)));
        assert!(matches!(auth.authorize(Some("t"), None, Operation::Read), AuthDecision::Allow(_)));
        match auth.authorize(Some("t"), None, Operation::Read) {
            AuthDecision::Deny(AuthError::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60)
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[test]
    fn test_generated_tokens() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(a.starts_with("gz_"));
        assert_eq!(a.len(), 3 + 64);
    }

    #[test]
    fn test_debug_hides_digest() {
        let token = AuthToken::new("super-secret", Some("ci".into()), TokenScope::full());
        let debug = format!("{:?}", token);
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains(&hex::encode(digest("super-secret"))));
    }
}
