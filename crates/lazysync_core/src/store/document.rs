//! Replicated document for one entity collection.
//!
//! # Responsibility
//! - Hold every entity record of a collection, including tombstones.
//! - Apply explicit, stamped mutations as pure transformations.
//! - Join two document copies with a deterministic CRDT merge.
//!
//! # Invariants
//! - `merge` is commutative, associative and idempotent.
//! - `merge` never drops a record present in either input.
//! - Re-applying a mutation with identical arguments changes nothing.
//! - `remote_id` is bound at most once per record.

use crate::model::entity::{CollectionPayload, Entity, EntityId, RemoteId, SyncStatus};
use crate::store::fields::FieldSet;
use crate::store::register::{LwwRegister, LwwSet, Stamp};
use crate::store::{DocumentError, DocumentResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Actor id used for stamps that originate from the remote store.
pub const REMOTE_ACTOR: &str = "remote";

/// Wall-clock time and replica identity for one local write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteContext {
    pub now: i64,
    pub actor: String,
}

impl WriteContext {
    pub fn new(now: i64, actor: impl Into<String>) -> Self {
        Self {
            now,
            actor: actor.into(),
        }
    }
}

/// Input for inserting a brand new record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub id: EntityId,
    pub owner_id: String,
    pub created_at: i64,
    pub remote_id: Option<RemoteId>,
    pub fields: FieldSet,
    pub sync_status: SyncStatus,
    pub is_local_only: bool,
    pub last_sync_at: Option<i64>,
    pub stamp: Stamp,
}

/// One explicit change to the document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentMutation {
    /// Adds a record; no-op when the id already exists.
    Insert(NewRecord),
    /// Replaces payload fields that differ from the current values.
    SetPayload {
        id: EntityId,
        fields: FieldSet,
        ctx: WriteContext,
    },
    SetSyncStatus {
        id: EntityId,
        status: SyncStatus,
        ctx: WriteContext,
    },
    /// Records a remote acknowledgement, binding `remote_id` when given.
    Acknowledge {
        id: EntityId,
        remote_id: Option<RemoteId>,
        status: SyncStatus,
        ctx: WriteContext,
    },
    /// Hides the record while keeping it mergeable.
    Tombstone { id: EntityId, ctx: WriteContext },
    /// Removes the record entirely once nothing references it.
    Purge { id: EntityId },
    /// Replaces payload with authoritative remote fields.
    Overwrite {
        id: EntityId,
        remote_id: RemoteId,
        fields: FieldSet,
        remote_updated_at: i64,
        ctx: WriteContext,
    },
}

impl DocumentMutation {
    pub fn target(&self) -> EntityId {
        match self {
            Self::Insert(record) => record.id,
            Self::SetPayload { id, .. }
            | Self::SetSyncStatus { id, .. }
            | Self::Acknowledge { id, .. }
            | Self::Tombstone { id, .. }
            | Self::Purge { id }
            | Self::Overwrite { id, .. } => *id,
        }
    }
}

/// Stored state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub owner_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub remote_id: Option<RemoteId>,
    #[serde(default)]
    pub last_sync_at: Option<i64>,
    #[serde(default)]
    pub fields: BTreeMap<String, LwwRegister<Value>>,
    #[serde(default)]
    pub sets: BTreeMap<String, LwwSet>,
    pub sync_status: LwwRegister<SyncStatus>,
    pub is_local_only: LwwRegister<bool>,
    pub is_deleted: LwwRegister<bool>,
}

impl EntityRecord {
    fn from_new(new: &NewRecord) -> Self {
        let stamp = &new.stamp;
        Self {
            id: new.id,
            owner_id: new.owner_id.clone(),
            created_at: new.created_at,
            remote_id: new.remote_id.clone(),
            last_sync_at: new.last_sync_at,
            fields: new
                .fields
                .scalars
                .iter()
                .map(|(key, value)| (key.clone(), LwwRegister::new(value.clone(), stamp.clone())))
                .collect(),
            sets: new
                .fields
                .sets
                .iter()
                .map(|(key, members)| (key.clone(), LwwSet::from_values(members, stamp)))
                .collect(),
            sync_status: LwwRegister::new(new.sync_status, stamp.clone()),
            is_local_only: LwwRegister::new(new.is_local_only, stamp.clone()),
            is_deleted: LwwRegister::new(false, stamp.clone()),
        }
    }

    pub fn is_visible(&self) -> bool {
        !self.is_deleted.value
    }

    pub fn status(&self) -> SyncStatus {
        self.sync_status.value
    }

    pub fn is_local_only(&self) -> bool {
        self.is_local_only.value
    }

    /// Latest payload write in epoch milliseconds.
    pub fn updated_at(&self) -> i64 {
        self.fields
            .values()
            .map(|register| register.stamp.at)
            .chain(self.sets.values().filter_map(|set| set.max_stamp().map(|s| s.at)))
            .max()
            .unwrap_or(self.created_at)
    }

    /// Current payload fields.
    pub fn field_set(&self) -> FieldSet {
        FieldSet {
            scalars: self
                .fields
                .iter()
                .map(|(key, register)| (key.clone(), register.value.clone()))
                .collect(),
            sets: self
                .sets
                .iter()
                .map(|(key, set)| (key.clone(), set.values()))
                .collect(),
        }
    }

    /// Materializes the typed entity view.
    pub fn to_entity<P: CollectionPayload>(&self) -> DocumentResult<Entity<P>> {
        Ok(Entity {
            id: self.id,
            remote_id: self.remote_id.clone(),
            owner_id: self.owner_id.clone(),
            payload: self.field_set().to_payload()?,
            created_at: self.created_at,
            updated_at: self.updated_at(),
            sync_status: self.status(),
            is_local_only: self.is_local_only(),
            last_sync_at: self.last_sync_at,
        })
    }

    fn max_stamp(&self) -> Option<&Stamp> {
        self.fields
            .values()
            .map(|register| &register.stamp)
            .chain(self.sets.values().filter_map(LwwSet::max_stamp))
            .chain([
                &self.sync_status.stamp,
                &self.is_local_only.stamp,
                &self.is_deleted.stamp,
            ])
            .max()
    }

    fn next_stamp(&self, ctx: &WriteContext) -> Stamp {
        Stamp::after(self.max_stamp(), ctx.now, &ctx.actor)
    }

    fn write_fields(&mut self, fields: &FieldSet, stamp: &Stamp) -> bool {
        let mut changed = false;
        for (key, value) in &fields.scalars {
            match self.fields.get_mut(key) {
                Some(register) => changed |= register.assign(value.clone(), stamp),
                None => {
                    self.fields
                        .insert(key.clone(), LwwRegister::new(value.clone(), stamp.clone()));
                    changed = true;
                }
            }
        }
        for (key, members) in &fields.sets {
            match self.sets.get_mut(key) {
                Some(set) => changed |= set.assign(members, stamp),
                None => {
                    self.sets
                        .insert(key.clone(), LwwSet::from_values(members, stamp));
                    changed = true;
                }
            }
        }
        changed
    }

    fn bind_remote_id(&mut self, remote_id: &str) -> DocumentResult<bool> {
        match self.remote_id.as_deref() {
            Some(bound) if bound == remote_id => Ok(false),
            Some(bound) => Err(DocumentError::RemoteIdConflict {
                id: self.id,
                bound: bound.to_string(),
                incoming: remote_id.to_string(),
            }),
            None => {
                self.remote_id = Some(remote_id.to_string());
                Ok(true)
            }
        }
    }

    fn set_last_sync_at(&mut self, at: i64) -> bool {
        let next = self.last_sync_at.max(Some(at));
        if next == self.last_sync_at {
            return false;
        }
        self.last_sync_at = next;
        true
    }

    fn merge(&self, other: &Self) -> Self {
        let mut fields = self.fields.clone();
        for (key, register) in &other.fields {
            let merged = match fields.get(key) {
                Some(existing) => existing.merge(register),
                None => register.clone(),
            };
            fields.insert(key.clone(), merged);
        }

        let mut sets = self.sets.clone();
        for (key, set) in &other.sets {
            let merged = match sets.get(key) {
                Some(existing) => existing.merge(set),
                None => set.clone(),
            };
            sets.insert(key.clone(), merged);
        }

        Self {
            id: self.id,
            owner_id: self.owner_id.clone().min(other.owner_id.clone()),
            created_at: self.created_at.min(other.created_at),
            remote_id: merge_remote_ids(&self.remote_id, &other.remote_id),
            last_sync_at: self.last_sync_at.max(other.last_sync_at),
            fields,
            sets,
            sync_status: self.sync_status.merge(&other.sync_status),
            is_local_only: self.is_local_only.merge(&other.is_local_only),
            is_deleted: self.is_deleted.merge(&other.is_deleted),
        }
    }
}

fn merge_remote_ids(left: &Option<RemoteId>, right: &Option<RemoteId>) -> Option<RemoteId> {
    match (left, right) {
        (Some(a), Some(b)) => Some(a.min(b).clone()),
        (Some(a), None) | (None, Some(a)) => Some(a.clone()),
        (None, None) => None,
    }
}

/// Mergeable mapping from local entity id to record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedDocument {
    #[serde(default)]
    records: BTreeMap<EntityId, EntityRecord>,
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.records.get(&id)
    }

    /// Returns the record only when it is not tombstoned.
    pub fn get_visible(&self, id: EntityId) -> Option<&EntityRecord> {
        self.records.get(&id).filter(|record| record.is_visible())
    }

    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    pub fn visible_records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values().filter(|record| record.is_visible())
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<&EntityRecord> {
        self.records
            .values()
            .find(|record| record.remote_id.as_deref() == Some(remote_id))
    }

    /// Pure mutation entry point: returns the mutated copy.
    pub fn apply(&self, mutation: &DocumentMutation) -> DocumentResult<Self> {
        let mut next = self.clone();
        next.apply_in_place(mutation)?;
        Ok(next)
    }

    /// Applies `mutation` in place and returns whether anything changed.
    ///
    /// On error the document is left untouched.
    pub fn apply_in_place(&mut self, mutation: &DocumentMutation) -> DocumentResult<bool> {
        if let DocumentMutation::Insert(new) = mutation {
            if self.records.contains_key(&new.id) {
                return Ok(false);
            }
            self.records.insert(new.id, EntityRecord::from_new(new));
            return Ok(true);
        }
        if let DocumentMutation::Purge { id } = mutation {
            return Ok(self.records.remove(id).is_some());
        }

        let id = mutation.target();
        let current = self
            .records
            .get(&id)
            .ok_or(DocumentError::UnknownEntity(id))?;
        let mut record = current.clone();

        let changed = match mutation {
            DocumentMutation::SetPayload { fields, ctx, .. } => {
                let stamp = record.next_stamp(ctx);
                record.write_fields(fields, &stamp)
            }
            DocumentMutation::SetSyncStatus { status, ctx, .. } => {
                let stamp = record.next_stamp(ctx);
                record.sync_status.assign(*status, &stamp)
            }
            DocumentMutation::Acknowledge {
                remote_id,
                status,
                ctx,
                ..
            } => {
                let stamp = record.next_stamp(ctx);
                let mut changed = match remote_id {
                    Some(remote_id) => record.bind_remote_id(remote_id)?,
                    None => false,
                };
                changed |= record.sync_status.assign(*status, &stamp);
                changed |= record.is_local_only.assign(false, &stamp);
                changed |= record.set_last_sync_at(ctx.now);
                changed
            }
            DocumentMutation::Tombstone { ctx, .. } => {
                let stamp = record.next_stamp(ctx);
                record.is_deleted.assign(true, &stamp)
            }
            DocumentMutation::Overwrite {
                remote_id,
                fields,
                remote_updated_at,
                ctx,
                ..
            } => {
                let stamp = record.next_stamp(ctx);
                let mut changed = record.bind_remote_id(remote_id)?;
                changed |= replace_fields(&mut record, fields, *remote_updated_at);
                changed |= record.sync_status.assign(SyncStatus::Synced, &stamp);
                changed |= record.is_local_only.assign(false, &stamp);
                changed |= record.is_deleted.assign(false, &stamp);
                changed |= record.set_last_sync_at(ctx.now);
                changed
            }
            DocumentMutation::Insert(_) | DocumentMutation::Purge { .. } => false,
        };

        if changed {
            self.records.insert(id, record);
        }
        Ok(changed)
    }

    /// Deterministic CRDT join with `other`.
    pub fn merge(&self, other: &Self) -> Self {
        let mut records = self.records.clone();
        for (id, record) in &other.records {
            let merged = match records.get(id) {
                Some(existing) => existing.merge(record),
                None => record.clone(),
            };
            records.insert(*id, merged);
        }
        Self { records }
    }

    /// Typed view of one visible entity.
    pub fn entity<P: CollectionPayload>(&self, id: EntityId) -> DocumentResult<Option<Entity<P>>> {
        self.get_visible(id)
            .map(EntityRecord::to_entity::<P>)
            .transpose()
    }

    /// Typed views of every visible entity, `updated_at DESC, id ASC`.
    pub fn entities<P: CollectionPayload>(&self) -> DocumentResult<Vec<Entity<P>>> {
        let mut entities = self
            .visible_records()
            .map(EntityRecord::to_entity::<P>)
            .collect::<DocumentResult<Vec<_>>>()?;
        entities.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(entities)
    }

    pub fn to_bytes(&self) -> DocumentResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| DocumentError::Encode(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> DocumentResult<Self> {
        serde_json::from_slice(bytes).map_err(|err| DocumentError::Decode(err.to_string()))
    }
}

/// Free-function form of [`ReplicatedDocument::merge`].
pub fn merge(left: &ReplicatedDocument, right: &ReplicatedDocument) -> ReplicatedDocument {
    left.merge(right)
}

fn replace_fields(record: &mut EntityRecord, fields: &FieldSet, remote_updated_at: i64) -> bool {
    let stamp = Stamp::new(remote_updated_at, REMOTE_ACTOR);
    let next_fields: BTreeMap<String, LwwRegister<Value>> = fields
        .scalars
        .iter()
        .map(|(key, value)| (key.clone(), LwwRegister::new(value.clone(), stamp.clone())))
        .collect();

    let mut next_sets = BTreeMap::new();
    for (key, members) in &fields.sets {
        let mut set = record.sets.get(key).cloned().unwrap_or_default();
        let set_stamp = Stamp::after(set.max_stamp(), remote_updated_at, REMOTE_ACTOR);
        set.assign(members, &set_stamp);
        next_sets.insert(key.clone(), set);
    }

    let changed = next_fields != record.fields || next_sets != record.sets;
    record.fields = next_fields;
    record.sets = next_sets;
    changed
}

#[cfg(test)]
mod tests {
    use super::{merge, DocumentMutation, NewRecord, ReplicatedDocument, WriteContext};
    use crate::model::entity::SyncStatus;
    use crate::store::fields::FieldSet;
    use crate::store::register::Stamp;
    use crate::store::DocumentError;
    use serde_json::json;
    use uuid::Uuid;

    fn fields(value: serde_json::Value) -> FieldSet {
        FieldSet::from_value(value, &["tags"]).unwrap()
    }

    fn insert(doc: &mut ReplicatedDocument, id: Uuid, title: &str, actor: &str, at: i64) {
        doc.apply_in_place(&DocumentMutation::Insert(NewRecord {
            id,
            owner_id: "owner".to_string(),
            created_at: at,
            remote_id: None,
            fields: fields(json!({"title": title, "tags": ["base"]})),
            sync_status: SyncStatus::Pending,
            is_local_only: true,
            last_sync_at: None,
            stamp: Stamp::new(at, actor),
        }))
        .unwrap();
    }

    fn set_payload(
        doc: &ReplicatedDocument,
        id: Uuid,
        value: serde_json::Value,
        actor: &str,
        now: i64,
    ) -> ReplicatedDocument {
        doc.apply(&DocumentMutation::SetPayload {
            id,
            fields: fields(value),
            ctx: WriteContext::new(now, actor),
        })
        .unwrap()
    }

    fn divergent_pair() -> (ReplicatedDocument, ReplicatedDocument, Uuid) {
        let shared_id = Uuid::new_v4();
        let mut base = ReplicatedDocument::new();
        insert(&mut base, shared_id, "base", "a", 100);

        let left_fields = json!({"title": "left", "tags": ["base", "l"]});
        let mut left = set_payload(&base, shared_id, left_fields, "a", 200);
        insert(&mut left, Uuid::new_v4(), "only-left", "a", 210);
        let right_fields = json!({"title": "right", "tags": ["r"]});
        let mut right = set_payload(&base, shared_id, right_fields, "b", 300);
        insert(&mut right, Uuid::new_v4(), "only-right", "b", 310);
        (left, right, shared_id)
    }

    #[test]
    fn merge_is_commutative_and_keeps_all_records() {
        let (left, right, shared_id) = divergent_pair();
        let merged = merge(&left, &right);
        assert_eq!(merged, merge(&right, &left));
        assert_eq!(merged.len(), 3);

        let record = merged.get(shared_id).unwrap();
        assert_eq!(record.fields["title"].value, json!("right"));
        // "base" was removed by the newer write; "l" and "r" both survive.
        let tags: Vec<String> = record.sets["tags"].values().into_iter().collect();
        assert_eq!(tags, vec!["l", "r"]);
    }

    #[test]
    fn merge_is_idempotent_and_associative() {
        let (left, right, _) = divergent_pair();
        assert_eq!(merge(&left, &left), left);

        let mut third = ReplicatedDocument::new();
        insert(&mut third, Uuid::new_v4(), "third", "c", 50);
        assert_eq!(
            merge(&merge(&left, &right), &third),
            merge(&left, &merge(&right, &third))
        );
    }

    #[test]
    fn tombstone_survives_merge_with_stale_copy() {
        let id = Uuid::new_v4();
        let mut base = ReplicatedDocument::new();
        insert(&mut base, id, "doomed", "a", 10);
        let deleted = base
            .apply(&DocumentMutation::Tombstone {
                id,
                ctx: WriteContext::new(20, "a"),
            })
            .unwrap();

        let merged = merge(&base, &deleted);
        assert!(merged.get_visible(id).is_none());
        assert!(merged.get(id).is_some());
    }

    #[test]
    fn apply_is_pure_and_repeatable() {
        let id = Uuid::new_v4();
        let mut base = ReplicatedDocument::new();
        insert(&mut base, id, "first", "a", 10);
        let snapshot = base.clone();

        let once = set_payload(&base, id, json!({"title": "second", "tags": ["base"]}), "a", 20);
        let again = set_payload(&base, id, json!({"title": "second", "tags": ["base"]}), "a", 20);
        assert_eq!(base, snapshot);
        assert_eq!(once, again);

        let twice = set_payload(&once, id, json!({"title": "second", "tags": ["base"]}), "a", 30);
        assert_eq!(twice, once);
    }

    #[test]
    fn local_write_wins_over_skewed_future_stamp() {
        let id = Uuid::new_v4();
        let mut doc = ReplicatedDocument::new();
        insert(&mut doc, id, "from-the-future", "z", 10_000);
        let doc = set_payload(&doc, id, json!({"title": "now", "tags": []}), "a", 50);
        let record = doc.get(id).unwrap();
        assert_eq!(record.fields["title"].value, json!("now"));
        assert!(record.updated_at() > 10_000);
    }

    #[test]
    fn remote_id_binds_once() {
        let id = Uuid::new_v4();
        let mut doc = ReplicatedDocument::new();
        insert(&mut doc, id, "task", "a", 10);
        let ack = |remote: &str| DocumentMutation::Acknowledge {
            id,
            remote_id: Some(remote.to_string()),
            status: SyncStatus::Synced,
            ctx: WriteContext::new(20, "a"),
        };

        assert!(doc.apply_in_place(&ack("r-1")).unwrap());
        assert!(!doc.apply_in_place(&ack("r-1")).unwrap());
        let err = doc.apply_in_place(&ack("r-2")).unwrap_err();
        assert!(matches!(err, DocumentError::RemoteIdConflict { .. }));

        let record = doc.get(id).unwrap();
        assert_eq!(record.remote_id.as_deref(), Some("r-1"));
        assert!(!record.is_local_only());
        assert_eq!(record.status(), SyncStatus::Synced);
        assert_eq!(record.last_sync_at, Some(20));
    }

    #[test]
    fn mutations_on_unknown_ids_fail_without_side_effects() {
        let doc = ReplicatedDocument::new();
        let err = doc
            .apply(&DocumentMutation::Tombstone {
                id: Uuid::new_v4(),
                ctx: WriteContext::new(1, "a"),
            })
            .unwrap_err();
        assert!(matches!(err, DocumentError::UnknownEntity(_)));
        assert!(doc.is_empty());
    }

    #[test]
    fn bytes_round_trip_and_garbage_is_rejected() {
        let (left, _, _) = divergent_pair();
        let decoded = ReplicatedDocument::from_bytes(&left.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, left);
        assert!(ReplicatedDocument::from_bytes(b"\x00not json").is_err());
    }

    mod merge_laws {
        use super::fields;
        use crate::model::entity::SyncStatus;
        use crate::store::document::{
            merge, DocumentMutation, NewRecord, ReplicatedDocument, WriteContext,
        };
        use crate::store::register::Stamp;
        use proptest::prelude::*;
        use serde_json::json;
        use uuid::Uuid;

        const SLOTS: usize = 4;
        const SEEDED: usize = 3;
        const TITLES: [&str; 3] = ["alpha", "beta", "gamma"];
        const TAGS: [&str; 3] = ["x", "y", "z"];

        #[derive(Debug, Clone)]
        enum Step {
            Insert { slot: usize, title: usize, at: i64 },
            SetPayload { slot: usize, title: usize, tags: Vec<usize>, at: i64 },
            SetStatus { slot: usize, failed: bool, at: i64 },
            Acknowledge { slot: usize, remote: usize, at: i64 },
            Tombstone { slot: usize, at: i64 },
            Overwrite { slot: usize, remote: usize, title: usize, remote_at: i64, at: i64 },
            Purge { slot: usize },
        }

        fn id(slot: usize) -> Uuid {
            Uuid::from_u128(slot as u128 + 1)
        }

        fn payload(title: usize, tags: &[usize]) -> serde_json::Value {
            let tags: Vec<&str> = tags.iter().map(|tag| TAGS[*tag]).collect();
            json!({"title": TITLES[title], "tags": tags})
        }

        fn step() -> impl Strategy<Value = Step> {
            let tags = prop::collection::vec(0..TAGS.len(), 0..3);
            prop_oneof![
                (0..SLOTS, 0..TITLES.len(), 1..500_i64)
                    .prop_map(|(slot, title, at)| Step::Insert { slot, title, at }),
                (0..SLOTS, 0..TITLES.len(), tags, 1..500_i64).prop_map(
                    |(slot, title, tags, at)| Step::SetPayload {
                        slot,
                        title,
                        tags,
                        at
                    }
                ),
                (0..SLOTS, any::<bool>(), 1..500_i64)
                    .prop_map(|(slot, failed, at)| Step::SetStatus { slot, failed, at }),
                (0..SLOTS, 0..2_usize, 1..500_i64)
                    .prop_map(|(slot, remote, at)| Step::Acknowledge { slot, remote, at }),
                (0..SLOTS, 1..500_i64).prop_map(|(slot, at)| Step::Tombstone { slot, at }),
                (0..SLOTS, 0..2_usize, 0..TITLES.len(), 1..500_i64, 1..500_i64).prop_map(
                    |(slot, remote, title, remote_at, at)| Step::Overwrite {
                        slot,
                        remote,
                        title,
                        remote_at,
                        at
                    }
                ),
                (0..SLOTS).prop_map(|slot| Step::Purge { slot }),
            ]
        }

        fn history() -> impl Strategy<Value = Vec<Step>> {
            prop::collection::vec(step(), 0..12)
        }

        fn mutation(step: &Step, actor: &str) -> DocumentMutation {
            let ctx = |at: i64| WriteContext::new(at, actor);
            match step {
                Step::Insert { slot, title, at } => DocumentMutation::Insert(NewRecord {
                    id: id(*slot),
                    owner_id: format!("owner-{actor}"),
                    created_at: *at,
                    remote_id: None,
                    fields: fields(payload(*title, &[0])),
                    sync_status: SyncStatus::Pending,
                    is_local_only: true,
                    last_sync_at: None,
                    stamp: Stamp::new(*at, actor),
                }),
                Step::SetPayload {
                    slot,
                    title,
                    tags,
                    at,
                } => DocumentMutation::SetPayload {
                    id: id(*slot),
                    fields: fields(payload(*title, tags)),
                    ctx: ctx(*at),
                },
                Step::SetStatus { slot, failed, at } => DocumentMutation::SetSyncStatus {
                    id: id(*slot),
                    status: if *failed {
                        SyncStatus::Failed
                    } else {
                        SyncStatus::Synced
                    },
                    ctx: ctx(*at),
                },
                Step::Acknowledge { slot, remote, at } => DocumentMutation::Acknowledge {
                    id: id(*slot),
                    remote_id: Some(format!("r-{remote}")),
                    status: SyncStatus::Synced,
                    ctx: ctx(*at),
                },
                Step::Tombstone { slot, at } => DocumentMutation::Tombstone {
                    id: id(*slot),
                    ctx: ctx(*at),
                },
                Step::Overwrite {
                    slot,
                    remote,
                    title,
                    remote_at,
                    at,
                } => DocumentMutation::Overwrite {
                    id: id(*slot),
                    remote_id: format!("r-{remote}"),
                    fields: fields(payload(*title, &[1, 2])),
                    remote_updated_at: *remote_at,
                    ctx: ctx(*at),
                },
                Step::Purge { slot } => DocumentMutation::Purge { id: id(*slot) },
            }
        }

        /// Seeded base document with `steps` applied by `actor`.
        fn replica(steps: &[Step], actor: &str) -> ReplicatedDocument {
            let mut doc = ReplicatedDocument::new();
            for slot in 0..SEEDED {
                doc.apply_in_place(&mutation(
                    &Step::Insert {
                        slot,
                        title: 0,
                        at: 1,
                    },
                    "seed",
                ))
                .unwrap();
            }
            for step in steps {
                // Rejected writes leave the replica untouched.
                let _ = doc.apply_in_place(&mutation(step, actor));
            }
            doc
        }

        proptest! {
            #[test]
            fn merge_commutes(left in history(), right in history()) {
                let a = replica(&left, "a");
                let b = replica(&right, "b");
                prop_assert_eq!(merge(&a, &b), merge(&b, &a));
            }

            #[test]
            fn merge_associates(
                first in history(),
                second in history(),
                third in history(),
            ) {
                let a = replica(&first, "a");
                let b = replica(&second, "b");
                let c = replica(&third, "c");
                prop_assert_eq!(
                    merge(&merge(&a, &b), &c),
                    merge(&a, &merge(&b, &c))
                );
            }

            #[test]
            fn merge_is_idempotent(left in history(), right in history()) {
                let a = replica(&left, "a");
                let b = replica(&right, "b");
                prop_assert_eq!(merge(&a, &a), a.clone());
                let joined = merge(&a, &b);
                prop_assert_eq!(merge(&joined, &b), joined.clone());
                prop_assert_eq!(merge(&joined, &a), joined);
            }

            #[test]
            fn tombstone_wins_over_the_state_it_deleted(
                steps in history(),
                at in 1..500_i64,
            ) {
                let live = replica(&steps, "a");
                let mut dead = live.clone();
                for slot in 0..SLOTS {
                    let _ = dead.apply_in_place(&mutation(&Step::Tombstone { slot, at }, "b"));
                }
                let merged = merge(&live, &dead);
                for slot in 0..SLOTS {
                    if dead.get(id(slot)).is_some() {
                        prop_assert!(merged.get_visible(id(slot)).is_none());
                    }
                }
            }
        }
    }
}
