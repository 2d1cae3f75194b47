//! Configuration file
//!
//! ```yaml
//! source:
//!   host: localhost
//!   user: repl
//!   password: ${PGPASSWORD}
//!   database: app
//!   slot: fanout
//!   plugin_options: ["include-xids=0"]
//! router:
//!   locking: per_event
//! subscribers:
//!   - id: 1
//!     db_name: app
//!     host: ${MONGO_HOST:-localhost}
//!     port: 27017
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are expanded from the environment before
//! parsing.

use rivven_walstream::ReplicationConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{FanoutError, Result};
use crate::router::DispatchLocking;
use crate::subscriber::SubscriberDescriptor;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

fn default_scheme() -> String {
    "mongodb".to_string()
}

/// Router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Registry lock granularity during fan-out
    #[serde(default)]
    pub locking: DispatchLocking,
    /// URI scheme used when connecting subscribers
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            locking: DispatchLocking::default(),
            scheme: default_scheme(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutConfig {
    /// Replication source
    pub source: ReplicationConfig,
    #[serde(default)]
    pub router: RouterSettings,
    /// Subscribers connected at startup
    #[serde(default)]
    pub subscribers: Vec<SubscriberDescriptor>,
}

impl FanoutConfig {
    /// Load, expand and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;

        if self.router.scheme.is_empty() {
            return Err(FanoutError::config("router.scheme must not be empty"));
        }

        let mut seen = HashSet::new();
        for subscriber in &self.subscribers {
            if !seen.insert(subscriber.id) {
                return Err(FanoutError::config(format!(
                    "duplicate subscriber id {}",
                    subscriber.id
                )));
            }
            if subscriber.port == Some(0) {
                return Err(FanoutError::config(format!(
                    "subscriber {}: port must be non-zero",
                    subscriber.id
                )));
            }
            if subscriber.host.as_deref() == Some("") {
                return Err(FanoutError::config(format!(
                    "subscriber {}: host must not be empty",
                    subscriber.id
                )));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for FanoutConfig {
    type Err = FanoutError;

    fn from_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }
}
