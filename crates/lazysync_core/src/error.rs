//! Engine-level error types.
//!
//! # Responsibility
//! - `EngineError` covers failures of the local effect of a facade call and is
//!   returned synchronously.
//! - `SyncFailure` describes remote-effect failures captured into the status
//!   object; they never roll back local edits.

use crate::config::ConfigError;
use crate::model::entity::{EntityId, PayloadValidationError};
use crate::repo::blob_repo::RepoError;
use crate::store::DocumentError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type EngineResult<T> = Result<T, EngineError>;

/// Failure of a local engine operation.
#[derive(Debug)]
pub enum EngineError {
    UnknownEntity(EntityId),
    EntityDeleted(EntityId),
    Validation(PayloadValidationError),
    Document(DocumentError),
    Persistence(RepoError),
    /// The collection has no togglable status field.
    ToggleUnsupported(&'static str),
    Config(ConfigError),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(id) => write!(f, "entity not found: {id}"),
            Self::EntityDeleted(id) => write!(f, "entity is deleted: {id}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Document(err) => write!(f, "{err}"),
            Self::Persistence(err) => write!(f, "{err}"),
            Self::ToggleUnsupported(collection) => {
                write!(f, "collection `{collection}` has no togglable status")
            }
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Document(err) => Some(err),
            Self::Persistence(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::UnknownEntity(_) | Self::EntityDeleted(_) | Self::ToggleUnsupported(_) => None,
        }
    }
}

impl From<PayloadValidationError> for EngineError {
    fn from(value: PayloadValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DocumentError> for EngineError {
    fn from(value: DocumentError) -> Self {
        match value {
            DocumentError::UnknownEntity(id) => Self::UnknownEntity(id),
            other => Self::Document(other),
        }
    }
}

impl From<RepoError> for EngineError {
    fn from(value: RepoError) -> Self {
        Self::Persistence(value)
    }
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// Category of a remote-effect failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncFailureKind {
    /// Retryable transport failure; the change stays queued.
    TransientNetwork,
    /// The entity is gone remotely; the change was dropped.
    Conflict,
    /// Persisted local state could not be decoded and was reset.
    CorruptLocalState,
    /// The remote rejected the payload; the change was dropped.
    Validation,
}

impl SyncFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransientNetwork => "transient_network",
            Self::Conflict => "conflict",
            Self::CorruptLocalState => "corrupt_local_state",
            Self::Validation => "validation",
        }
    }
}

/// Most recent remote-effect failure, as exposed in the status object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub kind: SyncFailureKind,
    pub entity_id: Option<EntityId>,
    pub message: String,
    /// Unix epoch milliseconds.
    pub at: i64,
}

impl Display for SyncFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.entity_id {
            Some(id) => write!(f, "{} ({id}): {}", self.kind.as_str(), self.message),
            None => write!(f, "{}: {}", self.kind.as_str(), self.message),
        }
    }
}
