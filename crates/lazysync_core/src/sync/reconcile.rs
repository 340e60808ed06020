//! Remote snapshot reconciliation.
//!
//! # Responsibility
//! - Fold one authoritative remote snapshot into the local document.
//!
//! # Invariants
//! - Pure: no I/O, the input document is never modified.
//! - Entities with unconfirmed local work are never overwritten or removed.
//! - `is_local_only` entities are never removed while visible.
//! - Records the snapshot no longer holds are purged, not tombstoned: the
//!   remote outcome is final, so no dead record outlives the pass.
//! - Entities first seen remotely get a local id derived from their remote id,
//!   so reconciling the same snapshot on two replicas yields the same ids.

use crate::model::entity::{CollectionPayload, EntityId, SyncStatus};
use crate::store::document::{
    DocumentMutation, EntityRecord, NewRecord, ReplicatedDocument, WriteContext, REMOTE_ACTOR,
};
use crate::store::fields::FieldSet;
use crate::store::register::Stamp;
use crate::store::DocumentResult;
use crate::sync::remote::RemoteEntity;
use std::collections::BTreeSet;
use uuid::Uuid;

const MATERIALIZED_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c61_7a79_7379_6e63_8000_0000_0000_0001);

/// What one reconciliation pass did, by local entity id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub materialized: Vec<EntityId>,
    pub overwritten: Vec<EntityId>,
    /// Remote data held back because local work is still unconfirmed.
    pub deferred: Vec<EntityId>,
    /// Records purged because the remote store no longer holds them.
    pub removed: Vec<EntityId>,
    pub unchanged: usize,
}

impl ReconcileReport {
    /// Returns whether the pass changed any visible data.
    pub fn changed_anything(&self) -> bool {
        !(self.materialized.is_empty() && self.overwritten.is_empty() && self.removed.is_empty())
    }
}

/// Deterministic local id for an entity first seen in a remote snapshot.
pub fn derive_local_id(collection: &str, remote_id: &str) -> EntityId {
    Uuid::new_v5(
        &MATERIALIZED_ID_NAMESPACE,
        format!("{collection}/{remote_id}").as_bytes(),
    )
}

/// Merges `snapshot` into a copy of `document`.
///
/// `protected` holds every entity id that still has a queued change.
/// `ctx` stamps the bookkeeping writes.
pub fn reconcile<P: CollectionPayload>(
    document: &ReplicatedDocument,
    snapshot: &[RemoteEntity<P>],
    protected: &BTreeSet<EntityId>,
    ctx: &WriteContext,
) -> DocumentResult<(ReplicatedDocument, ReconcileReport)> {
    let mut next = document.clone();
    let mut report = ReconcileReport::default();
    let mut seen = BTreeSet::new();

    for remote in snapshot {
        let fields = FieldSet::from_payload(&remote.payload)?;
        let Some(local) = find_counterpart(&next, remote) else {
            let id = derive_local_id(P::COLLECTION, &remote.remote_id);
            seen.insert(id);
            next.apply_in_place(&DocumentMutation::Insert(NewRecord {
                id,
                owner_id: remote.owner_id.clone(),
                created_at: remote.created_at,
                remote_id: Some(remote.remote_id.clone()),
                fields,
                sync_status: SyncStatus::Synced,
                is_local_only: false,
                last_sync_at: Some(ctx.now),
                stamp: Stamp::new(remote.updated_at, REMOTE_ACTOR),
            }))?;
            report.materialized.push(id);
            continue;
        };

        let id = local.id;
        seen.insert(id);
        if protected.contains(&id) || local.status() == SyncStatus::Pending {
            report.deferred.push(id);
            continue;
        }

        let changed = next.apply_in_place(&DocumentMutation::Overwrite {
            id,
            remote_id: remote.remote_id.clone(),
            fields,
            remote_updated_at: remote.updated_at,
            ctx: ctx.clone(),
        })?;
        if changed {
            report.overwritten.push(id);
        } else {
            report.unchanged += 1;
        }
    }

    let vanished: Vec<EntityId> = next
        .records()
        .filter(|record| {
            !seen.contains(&record.id)
                && !protected.contains(&record.id)
                && record.status() != SyncStatus::Pending
        })
        .filter(|record| {
            // Dead records left by an earlier pass go too.
            !record.is_visible()
                || (record.status() == SyncStatus::Synced
                    && !record.is_local_only()
                    && record.remote_id.is_some())
        })
        .map(|record| record.id)
        .collect();
    for id in vanished {
        next.apply_in_place(&DocumentMutation::Purge { id })?;
        report.removed.push(id);
    }

    Ok((next, report))
}

/// Matches by bound remote id first, then by the echoed client id.
fn find_counterpart<'a, P>(
    document: &'a ReplicatedDocument,
    remote: &RemoteEntity<P>,
) -> Option<&'a EntityRecord> {
    if let Some(record) = document.find_by_remote_id(&remote.remote_id) {
        return Some(record);
    }
    let client_id = remote.client_id?;
    document.get(client_id).filter(|record| {
        record
            .remote_id
            .as_deref()
            .map_or(true, |bound| bound == remote.remote_id)
    })
}
