//! Error types for change routing

use rivven_walstream::WalStreamError;
use thiserror::Error;

use crate::event::SubscriberId;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Unusable change payloads
    Event,
    /// Downstream store failures
    Subscriber,
    /// Invalid settings
    Configuration,
    /// Replication stream failures
    Stream,
    /// Local I/O
    Io,
}

/// Fan-out errors
#[derive(Error, Debug)]
pub enum FanoutError {
    /// Payload is not valid JSON or does not have the event shape
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Event decoded but unusable for its action
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// A downstream store rejected a mutation or could not be reached
    #[error("Subscriber {id} error: {message}")]
    Subscriber { id: SubscriberId, message: String },

    /// A subscriber with this id is already registered
    #[error("Subscriber {0} is already registered")]
    DuplicateSubscriber(SubscriberId),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Replication stream error
    #[error(transparent)]
    Stream(#[from] WalStreamError),

    /// The bridge could not be started
    #[error("Startup failed: {0}")]
    Startup(String),

    /// The replication thread died unexpectedly
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl FanoutError {
    /// Create an invalid-event error
    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Self::InvalidEvent(msg.into())
    }

    /// Create a subscriber error
    pub fn subscriber(id: SubscriberId, msg: impl Into<String>) -> Self {
        Self::Subscriber {
            id,
            message: msg.into(),
        }
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a startup error
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Check if retrying the same operation later may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Subscriber { .. } | Self::Io(_) => true,
            Self::Stream(e) => e.is_retriable(),
            Self::Decode(_)
            | Self::InvalidEvent(_)
            | Self::DuplicateSubscriber(_)
            | Self::Config(_)
            | Self::Yaml(_)
            | Self::Startup(_)
            | Self::Runtime(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Decode(_) | Self::InvalidEvent(_) => ErrorCategory::Event,
            Self::Subscriber { .. } | Self::DuplicateSubscriber(_) => ErrorCategory::Subscriber,
            Self::Config(_) | Self::Yaml(_) => ErrorCategory::Configuration,
            Self::Stream(_) | Self::Startup(_) | Self::Runtime(_) => ErrorCategory::Stream,
            Self::Io(_) => ErrorCategory::Io,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode_error",
            Self::InvalidEvent(_) => "invalid_event",
            Self::Subscriber { .. } => "subscriber_error",
            Self::DuplicateSubscriber(_) => "duplicate_subscriber",
            Self::Config(_) => "config_error",
            Self::Yaml(_) => "yaml_error",
            Self::Io(_) => "io_error",
            Self::Stream(e) => e.error_code(),
            Self::Startup(_) => "startup_failed",
            Self::Runtime(_) => "runtime_error",
        }
    }
}

/// Result type for change routing
pub type Result<T> = std::result::Result<T, FanoutError>;
