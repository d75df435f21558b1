//! Client-side error types

use thiserror::Error;

/// Errors that can occur while routing and executing remote operations
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Server error (status {status:#04x}): {message}")]
    Server { status: u8, message: String },

    #[error("Invalid iteration: {0}")]
    InvalidIteration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Topology did not stabilize after {attempts} attempts: {last}")]
    TopologyUnstable { attempts: usize, last: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClientError::Transport(_) => "transport",
            ClientError::Connection(_) => "connection",
            ClientError::Timeout(_) => "timeout",
            ClientError::Protocol(_) => "protocol",
            ClientError::UnsupportedVersion(_) => "unsupported_version",
            ClientError::Server { .. } => "server",
            ClientError::InvalidIteration(_) => "invalid_iteration",
            ClientError::InvalidArgument(_) => "invalid_argument",
            ClientError::TopologyUnstable { .. } => "topology_unstable",
            ClientError::Config(_) => "config",
            ClientError::Internal(_) => "internal",
        }
    }

    /// Whether the failure is a transient connectivity problem.
    ///
    /// Retriable failures are retried against a refreshed topology and never
    /// reach the caller unless the retry budget runs out.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Connection(_))
    }

    /// Whether the channel that produced this error may be corrupted and must
    /// not go back to the pool.
    pub fn poisons_channel(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::Protocol(_)
                | ClientError::UnsupportedVersion(_)
        )
    }

    pub(crate) fn truncated(what: &str) -> Self {
        ClientError::Protocol(format!("Truncated frame while reading {}", what))
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(err: toml::de::Error) -> Self {
        ClientError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
