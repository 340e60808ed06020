//! Engine configuration.
//!
//! # Responsibility
//! - Describe per-replica settings shared by every collection engine.
//! - Load settings from JSON and reject values the engine cannot honor.
//!
//! # Invariants
//! - `owner_id`, `actor_id` and `namespace` are non-empty identifiers made of
//!   ASCII letters, digits, `-`, `_`, `.` and `:`.
//! - `retry_budget >= 1`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use uuid::Uuid;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:\-]{0,127}$").expect("valid identifier regex")
});

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_RETRY_BUDGET: u32 = 3;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration load or validation failure.
#[derive(Debug)]
pub enum ConfigError {
    InvalidField {
        field: &'static str,
        message: String,
    },
    Io(std::io::Error),
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidField { field, message } => {
                write!(f, "invalid config field `{field}`: {message}")
            }
            Self::Io(err) => write!(f, "failed to read config: {err}"),
            Self::Parse(err) => write!(f, "failed to parse config: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Parse(err) => Some(err),
            Self::InvalidField { .. } => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

/// Settings for one local replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Owner whose remote snapshot this replica mirrors.
    pub owner_id: String,
    /// Replica identity used in write stamps. Generated when absent.
    #[serde(default = "generate_actor_id")]
    pub actor_id: String,
    /// Prefix for persisted blob keys.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Attempts per change within one replay cycle.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// Minimum gap between persisted writes; `0` writes through.
    #[serde(default)]
    pub persist_debounce_ms: u64,
    /// Local edits schedule a replay for the host to run through `poll_replay`.
    #[serde(default = "default_auto_replay")]
    pub auto_replay: bool,
}

fn generate_actor_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_retry_budget() -> u32 {
    DEFAULT_RETRY_BUDGET
}

fn default_auto_replay() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("local")
    }
}

impl SyncConfig {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            actor_id: generate_actor_id(),
            namespace: default_namespace(),
            retry_budget: default_retry_budget(),
            persist_debounce_ms: 0,
            auto_replay: default_auto_replay(),
        }
    }

    /// Checks identifier fields and numeric bounds.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_identifier("owner_id", &self.owner_id)?;
        validate_identifier("actor_id", &self.actor_id)?;
        validate_identifier("namespace", &self.namespace)?;
        if self.actor_id == crate::store::document::REMOTE_ACTOR {
            return Err(ConfigError::InvalidField {
                field: "actor_id",
                message: "reserved for remote writes".to_string(),
            });
        }
        if self.retry_budget == 0 {
            return Err(ConfigError::InvalidField {
                field: "retry_budget",
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Parses and validates a JSON config document.
    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }
}

fn validate_identifier(field: &'static str, value: &str) -> ConfigResult<()> {
    if IDENTIFIER_RE.is_match(value) {
        return Ok(());
    }
    Err(ConfigError::InvalidField {
        field,
        message: format!("`{value}` is not a valid identifier"),
    })
}
