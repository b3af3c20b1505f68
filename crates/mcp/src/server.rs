// MCP server: state shared by every connection

use crate::protocol::{ListToolsResult, ServerInfo};
use crate::session::Session;
use gantz_core::audit::{CompositeAuditSink, Transport};
use gantz_core::auth::{Authenticator, CallerIdentity};
use gantz_core::sandbox::Sandbox;
use gantz_core::ToolRegistry;
use std::sync::Arc;

/// Registry, sandbox, authenticator and audit sinks. Connections hold an
/// `Arc` to this and never mutate it.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<Sandbox>,
    auth: Arc<Authenticator>,
    audit: CompositeAuditSink,
    info: ServerInfo,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>, sandbox: Arc<Sandbox>, auth: Arc<Authenticator>) -> Self {
        let info = ServerInfo {
            name: registry.info().name.clone(),
            version: registry
                .info()
                .version
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        };
        Self {
            registry,
            sandbox,
            auth,
            audit: CompositeAuditSink::new(),
            info,
        }
    }

    pub fn with_audit(mut self, audit: CompositeAuditSink) -> Self {
        self.audit = audit;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn auth(&self) -> &Arc<Authenticator> {
        &self.auth
    }

    pub fn audit(&self) -> &CompositeAuditSink {
        &self.audit
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Public tool schemas, sorted by name
    pub fn tools_list(&self) -> ListToolsResult {
        ListToolsResult {
            tools: self.registry.list_schemas(),
        }
    }

    /// Open a session for a new connection. HTTP connections pass the caller
    /// resolved from their `Authorization` header; stdio passes `None` and
    /// authenticates during `initialize`.
    pub fn session(self: &Arc<Self>, transport: Transport, caller: Option<CallerIdentity>) -> Arc<Session> {
        Arc::new(Session::new(Arc::clone(self), transport, caller))
    }

    /// Session for a single request that carries its own credentials. It
    /// starts out initialized.
    pub fn stateless_session(self: &Arc<Self>, caller: CallerIdentity) -> Arc<Session> {
        let session = self.session(Transport::Http, None);
        session.mark_ready(caller);
        session
    }
}

impl std::fmt::Debug for McpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpServer")
            .field("info", &self.info)
            .field("tools", &self.registry.len())
            .finish()
    }
}
