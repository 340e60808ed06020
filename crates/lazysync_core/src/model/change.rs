//! Pending change records kept in the replay queue.
//!
//! # Invariants
//! - `id` is unique; re-enqueueing the same id never duplicates a record.
//! - `payload` is the full field snapshot at enqueue time (create/update) and
//!   `None` for deletes.

use crate::model::entity::{EntityId, RemoteId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of one queued change.
pub type ChangeId = Uuid;

/// Remote mutation a queued change maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One mutation intent not yet confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingChange {
    pub id: ChangeId,
    pub collection: String,
    pub entity_id: EntityId,
    /// Remote target known at enqueue time, patched once a create is acked.
    #[serde(default)]
    pub remote_id: Option<RemoteId>,
    pub operation: ChangeOperation,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Unix epoch milliseconds.
    pub enqueued_at: i64,
    /// Replay attempts that ended in a retryable failure.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingChange {
    pub fn create(
        collection: impl Into<String>,
        entity_id: EntityId,
        payload: serde_json::Value,
        enqueued_at: i64,
    ) -> Self {
        Self::new(
            collection,
            entity_id,
            None,
            ChangeOperation::Create,
            Some(payload),
            enqueued_at,
        )
    }

    pub fn update(
        collection: impl Into<String>,
        entity_id: EntityId,
        remote_id: Option<RemoteId>,
        payload: serde_json::Value,
        enqueued_at: i64,
    ) -> Self {
        Self::new(
            collection,
            entity_id,
            remote_id,
            ChangeOperation::Update,
            Some(payload),
            enqueued_at,
        )
    }

    pub fn delete(
        collection: impl Into<String>,
        entity_id: EntityId,
        remote_id: Option<RemoteId>,
        enqueued_at: i64,
    ) -> Self {
        Self::new(
            collection,
            entity_id,
            remote_id,
            ChangeOperation::Delete,
            None,
            enqueued_at,
        )
    }

    fn new(
        collection: impl Into<String>,
        entity_id: EntityId,
        remote_id: Option<RemoteId>,
        operation: ChangeOperation,
        payload: Option<serde_json::Value>,
        enqueued_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            entity_id,
            remote_id,
            operation,
            payload,
            enqueued_at,
            attempts: 0,
            last_error: None,
        }
    }

    /// Returns whether a previous replay of this change failed.
    pub fn has_failed(&self) -> bool {
        self.last_error.is_some()
    }
}
