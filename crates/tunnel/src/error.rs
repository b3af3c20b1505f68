//! Error types for the tunnel client.

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors that can occur while establishing or running a tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Could not open the websocket to the relay.
    #[error("failed to connect to relay: {0}")]
    Connect(String),

    /// The relay refused the registration.
    #[error("relay rejected the tunnel: {0}")]
    Rejected(String),

    /// The relay sent something unexpected.
    #[error("relay protocol error: {0}")]
    Protocol(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("invalid tunnel configuration: {0}")]
    Config(String),

    /// The relay connection closed.
    #[error("relay connection closed")]
    Closed,

    /// Connecting or registering took too long.
    #[error("timed out connecting to relay")]
    Timeout,
}

impl TunnelError {
    /// Stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "Connect",
            Self::Rejected(_) => "Rejected",
            Self::Protocol(_) => "Protocol",
            Self::Json(_) => "Json",
            Self::Config(_) => "Config",
            Self::Closed => "Closed",
            Self::Timeout => "Timeout",
        }
    }

    /// Check if reconnecting could fix this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}
