//! Remote collection contract.
//!
//! # Responsibility
//! - Define the query/mutation seam the engine uses to reach the
//!   authoritative store.
//! - Define the remote error taxonomy consumed by replay.
//!
//! # Invariants
//! - Every mutation is safe to re-issue. A create repeated with the same
//!   `client_id` answers `AlreadyExists` with the bound remote id.
//! - Implementations never see local bookkeeping fields.

use crate::model::entity::{EntityId, RemoteId};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Remote call failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or availability failure; safe to retry.
    Transient(String),
    /// The targeted remote entity does not exist.
    NotFound(String),
    /// A create for this client id was already accepted.
    AlreadyExists { remote_id: RemoteId },
    /// The payload was refused and will be refused again.
    Rejected(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable machine-readable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Rejected(_) => "rejected",
        }
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient(message) => write!(f, "remote unavailable: {message}"),
            Self::NotFound(remote_id) => write!(f, "remote entity not found: {remote_id}"),
            Self::AlreadyExists { remote_id } => {
                write!(f, "remote entity already exists: {remote_id}")
            }
            Self::Rejected(message) => write!(f, "remote rejected payload: {message}"),
        }
    }
}

impl Error for RemoteError {}

/// One entity as reported by the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntity<P> {
    pub remote_id: RemoteId,
    /// Local id supplied by the creating replica, when the server keeps it.
    pub client_id: Option<EntityId>,
    pub owner_id: String,
    pub payload: P,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Unix epoch milliseconds.
    pub updated_at: i64,
}

/// Create request sent during replay.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCreate<P> {
    /// Local entity id, echoed back for idempotent creates.
    pub client_id: EntityId,
    pub owner_id: String,
    pub payload: P,
}

/// Remote query and mutation API for one collection.
pub trait RemoteCollection<P> {
    /// Returns every entity the owner currently has remotely.
    fn fetch_snapshot(&self, owner_id: &str) -> RemoteResult<Vec<RemoteEntity<P>>>;

    /// Creates one entity and returns its remote id.
    fn create(&self, request: RemoteCreate<P>) -> RemoteResult<RemoteId>;

    /// Replaces the payload of an existing entity.
    fn update(&self, remote_id: &str, payload: &P) -> RemoteResult<()>;

    fn delete(&self, remote_id: &str) -> RemoteResult<()>;
}
