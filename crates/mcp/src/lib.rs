// MCP (Model Context Protocol) server implementation
// Exposes manifest tools to agent clients over JSON-RPC 2.0

pub mod connection;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stdio;

pub use connection::{Connection, TransportError};
pub use server::McpServer;
pub use session::{Chunk, Session, SessionState};
