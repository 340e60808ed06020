//! Entity domain model shared by every synchronized collection.
//!
//! # Responsibility
//! - Define the typed entity view materialized from the replicated document.
//! - Define the payload contract each collection adapter implements.
//!
//! # Invariants
//! - `id` is generated locally and never changes for the entity lifetime.
//! - `remote_id` is bound at most once, on the first acknowledged create.
//! - `is_local_only` stays `true` until the server acknowledges the create.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use uuid::Uuid;

/// Stable local identifier for every entity.
pub type EntityId = Uuid;

/// Identifier assigned by the remote store.
pub type RemoteId = String;

/// Per-entity replication state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local state matches the last acknowledged remote state.
    Synced,
    /// A local change is queued and not yet acknowledged.
    Pending,
    /// The last replay attempt for this entity failed.
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }
}

/// Local validation failure for a collection payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadValidationError {
    pub field: &'static str,
    pub message: String,
}

impl PayloadValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl Display for PayloadValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid `{}`: {}", self.field, self.message)
    }
}

impl Error for PayloadValidationError {}

/// Contract implemented by each collection's payload shape.
///
/// The payload must serialize to a JSON object. Top-level keys become
/// last-writer-wins registers; keys listed in `SET_FIELDS` must be string
/// arrays and merge as sets.
pub trait CollectionPayload:
    Serialize + DeserializeOwned + Clone + PartialEq + Debug + Send + 'static
{
    /// Collection name used for storage keys and queue records.
    const COLLECTION: &'static str;

    /// Top-level fields that merge as string sets instead of registers.
    const SET_FIELDS: &'static [&'static str] = &[];

    /// Canonicalizes user input before it reaches the document.
    fn normalize(&mut self) {}

    /// Rejects payloads that must never be stored.
    fn validate(&self) -> Result<(), PayloadValidationError> {
        Ok(())
    }

    /// Flips the collection's primary status field.
    ///
    /// Returns `false` when the collection has no togglable status.
    fn toggle_status(&mut self) -> bool {
        false
    }
}

/// Typed entity view materialized from one document record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity<P> {
    pub id: EntityId,
    pub remote_id: Option<RemoteId>,
    pub owner_id: String,
    pub payload: P,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    /// Latest payload write, Unix epoch milliseconds.
    pub updated_at: i64,
    pub sync_status: SyncStatus,
    pub is_local_only: bool,
    /// Last time remote data or a remote acknowledgement touched this entity.
    pub last_sync_at: Option<i64>,
}

impl<P> Entity<P> {
    /// Returns whether the entity still has unconfirmed local work.
    pub fn has_unconfirmed_changes(&self) -> bool {
        self.sync_status != SyncStatus::Synced
    }
}

#[cfg(test)]
mod tests {
    use super::{Entity, PayloadValidationError, SyncStatus};
    use uuid::Uuid;

    #[test]
    fn sync_status_serializes_snake_case() {
        let encoded = serde_json::to_string(&SyncStatus::Pending).unwrap();
        assert_eq!(encoded, "\"pending\"");
        assert_eq!(SyncStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn validation_error_mentions_field() {
        let err = PayloadValidationError::new("title", "must not be empty");
        assert_eq!(err.to_string(), "invalid `title`: must not be empty");
    }

    #[test]
    fn unconfirmed_changes_follow_status() {
        let mut entity = Entity {
            id: Uuid::new_v4(),
            remote_id: None,
            owner_id: "owner".to_string(),
            payload: (),
            created_at: 1,
            updated_at: 1,
            sync_status: SyncStatus::Synced,
            is_local_only: false,
            last_sync_at: None,
        };
        assert!(!entity.has_unconfirmed_changes());
        entity.sync_status = SyncStatus::Failed;
        assert!(entity.has_unconfirmed_changes());
    }
}
