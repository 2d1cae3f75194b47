//! Error types for replication streaming
//!
//! Every error ends the current stream session. The supervisor decides
//! whether a new session is started, so the classification helpers here are
//! used for logging and alerting rather than for retry decisions.

use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed or unexpected replication frames
    Protocol,
    /// Errors reported by the server
    Server,
    /// Authentication failures
    Authentication,
    /// Invalid settings
    Configuration,
    /// Socket failures, timeouts, closed connections
    Network,
}

/// Replication stream errors
#[derive(Error, Debug)]
pub enum WalStreamError {
    /// Malformed frame, unexpected tag, truncated header
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// ErrorResponse received from the server
    #[error("Server error: {0}")]
    Server(String),

    /// The server refused to enter streaming mode
    #[error("START_REPLICATION rejected: {0}")]
    StartRejected(String),

    /// Authentication failed or is not supported
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,
}

impl WalStreamError {
    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a server error
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// Create a start-command rejection
    pub fn start_rejected(msg: impl Into<String>) -> Self {
        Self::StartRejected(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Check if a fresh connection may succeed where this one failed.
    ///
    /// Configuration and authentication problems do not fix themselves.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionClosed
            | Self::Timeout(_)
            | Self::Io(_)
            | Self::Protocol(_)
            | Self::Server(_)
            | Self::StartRejected(_) => true,
            Self::Auth(_) | Self::Config(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Server(_) | Self::StartRejected(_) => ErrorCategory::Server,
            Self::Auth(_) => ErrorCategory::Authentication,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Io(_) | Self::Timeout(_) | Self::ConnectionClosed => ErrorCategory::Network,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::Server(_) => "server_error",
            Self::StartRejected(_) => "start_rejected",
            Self::Auth(_) => "auth_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
        }
    }
}

/// Result type for replication streaming
pub type Result<T> = std::result::Result<T, WalStreamError>;
