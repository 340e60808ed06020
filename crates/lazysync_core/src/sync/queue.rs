//! Durable pending-change queue.
//!
//! # Responsibility
//! - Keep unacknowledged mutation intents in enqueue order.
//! - Coalesce redundant intents for one entity at enqueue time.
//!
//! # Invariants
//! - Change ids are unique; re-enqueueing a known id is a no-op.
//! - For one entity, at most one create or update is queued at a time, and a
//!   delete is always the entity's last queued change.
//! - A never-attempted create followed by a delete leaves nothing queued.
//! - Folding keeps the attempt count so a create that may have reached the
//!   remote is never cancelled locally.

use crate::model::change::{ChangeId, ChangeOperation, PendingChange};
use crate::model::entity::{EntityId, RemoteId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Effect of one `enqueue` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The change was added at the tail.
    Appended,
    /// A change with the same id is already queued.
    Duplicate,
    /// The payload was folded into an earlier create or update.
    Coalesced,
    /// The change cancelled a queued create; nothing remains for the entity.
    Cancelled,
}

/// Ordered queue of changes awaiting remote acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingQueue {
    #[serde(default)]
    changes: Vec<PendingChange>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingChange> {
        self.changes.iter()
    }

    pub fn get(&self, change_id: ChangeId) -> Option<&PendingChange> {
        self.changes.iter().find(|change| change.id == change_id)
    }

    /// Adds `change`, folding it into queued work for the same entity.
    pub fn enqueue(&mut self, change: PendingChange) -> EnqueueOutcome {
        if self.get(change.id).is_some() {
            return EnqueueOutcome::Duplicate;
        }

        match change.operation {
            ChangeOperation::Create => {
                self.changes.push(change);
                EnqueueOutcome::Appended
            }
            ChangeOperation::Update => self.enqueue_update(change),
            ChangeOperation::Delete => self.enqueue_delete(change),
        }
    }

    fn enqueue_update(&mut self, change: PendingChange) -> EnqueueOutcome {
        let Some(index) = self.last_index_for(change.entity_id) else {
            self.changes.push(change);
            return EnqueueOutcome::Appended;
        };

        if self.changes[index].operation == ChangeOperation::Delete {
            self.changes.push(change);
            return EnqueueOutcome::Appended;
        }

        let queued = &mut self.changes[index];
        match queued.operation {
            ChangeOperation::Create => {
                queued.payload = change.payload;
                queued.last_error = None;
                EnqueueOutcome::Coalesced
            }
            ChangeOperation::Update => {
                let remote_id = change.remote_id.clone().or_else(|| queued.remote_id.clone());
                *queued = PendingChange { remote_id, ..change };
                EnqueueOutcome::Coalesced
            }
            ChangeOperation::Delete => EnqueueOutcome::Duplicate,
        }
    }

    fn enqueue_delete(&mut self, change: PendingChange) -> EnqueueOutcome {
        let entity_id = change.entity_id;
        let unsent_create = self.changes.iter().any(|queued| {
            queued.entity_id == entity_id
                && queued.operation == ChangeOperation::Create
                && queued.attempts == 0
        });
        if unsent_create {
            self.drop_entity(entity_id);
            return EnqueueOutcome::Cancelled;
        }

        if self
            .changes
            .iter()
            .any(|queued| queued.entity_id == entity_id && queued.operation == ChangeOperation::Delete)
        {
            return EnqueueOutcome::Duplicate;
        }

        self.changes.retain(|queued| {
            queued.entity_id != entity_id || queued.operation != ChangeOperation::Update
        });
        self.changes.push(change);
        EnqueueOutcome::Appended
    }

    /// Removes a confirmed change.
    pub fn dequeue(&mut self, change_id: ChangeId) -> Option<PendingChange> {
        let index = self.changes.iter().position(|change| change.id == change_id)?;
        Some(self.changes.remove(index))
    }

    /// Changes for `collection` in replay order.
    pub fn peek_pending(&self, collection: &str) -> Vec<PendingChange> {
        self.changes
            .iter()
            .filter(|change| change.collection == collection)
            .cloned()
            .collect()
    }

    pub fn has_changes_for(&self, entity_id: EntityId) -> bool {
        self.changes.iter().any(|change| change.entity_id == entity_id)
    }

    /// Entities that still have at least one queued change.
    pub fn entity_ids(&self) -> BTreeSet<EntityId> {
        self.changes.iter().map(|change| change.entity_id).collect()
    }

    /// Number of changes whose last replay attempt failed.
    pub fn failed_count(&self) -> usize {
        self.changes.iter().filter(|change| change.has_failed()).count()
    }

    /// Patches queued changes of `entity_id` that lack a remote target.
    ///
    /// Returns how many changes were patched.
    pub fn bind_remote_id(&mut self, entity_id: EntityId, remote_id: &RemoteId) -> usize {
        let mut patched = 0;
        for change in self
            .changes
            .iter_mut()
            .filter(|change| change.entity_id == entity_id && change.remote_id.is_none())
        {
            change.remote_id = Some(remote_id.clone());
            patched += 1;
        }
        patched
    }

    /// Stores the attempt count and error of a failed replay.
    pub fn record_failure(&mut self, change_id: ChangeId, attempts: u32, error: &str) -> bool {
        match self.changes.iter_mut().find(|change| change.id == change_id) {
            Some(change) => {
                change.attempts = change.attempts.saturating_add(attempts);
                change.last_error = Some(error.to_string());
                true
            }
            None => false,
        }
    }

    /// Removes every change of `entity_id`; returns how many were removed.
    pub fn drop_entity(&mut self, entity_id: EntityId) -> usize {
        let before = self.changes.len();
        self.changes.retain(|change| change.entity_id != entity_id);
        before - self.changes.len()
    }

    fn last_index_for(&self, entity_id: EntityId) -> Option<usize> {
        self.changes
            .iter()
            .rposition(|change| change.entity_id == entity_id)
    }
}
