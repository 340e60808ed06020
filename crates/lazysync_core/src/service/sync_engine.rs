//! Per-collection sync engine facade.
//!
//! # Responsibility
//! - Expose CRUD + toggle over one collection with optimistic local effects.
//! - Drive replay and reconciliation from explicit host signals.
//! - Schedule a replay after local edits; the host runs it via `poll_replay`.
//! - Publish a status snapshot and notify subscribers when it changes.
//!
//! # Invariants
//! - Every local edit is applied to the document and queued before any
//!   remote call is attempted.
//! - CRUD calls never reach the remote store; only `poll_replay`,
//!   `force_sync` and the host signals do.
//! - Remote failures never roll back local edits; they surface only through
//!   `status()` and logs.
//! - Document and queue are persisted after every state change.
//! - Sync attempts while offline return without touching state.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{EngineError, EngineResult, SyncFailure, SyncFailureKind};
use crate::logging::sanitize_message;
use crate::model::change::PendingChange;
use crate::model::entity::{CollectionPayload, Entity, EntityId, SyncStatus};
use crate::repo::blob_repo::BlobStore;
use crate::repo::persistence::{BlobSlot, PersistenceAdapter, StorageKeys};
use crate::store::document::{DocumentMutation, NewRecord, ReplicatedDocument, WriteContext};
use crate::store::fields::FieldSet;
use crate::store::register::Stamp;
use crate::sync::connection::{ConnectionEvent, ConnectionMonitor, ConnectionState};
use crate::sync::queue::{EnqueueOutcome, PendingQueue};
use crate::sync::reconcile::{reconcile, ReconcileReport};
use crate::sync::remote::{RemoteCollection, RemoteEntity, RemoteError};
use crate::sync::replay::{Rebind, ReplayAgent, ReplayReport};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

pub type SubscriptionId = u64;

/// Reactive status snapshot for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusView {
    pub connection_state: ConnectionState,
    /// Queued changes not yet acknowledged.
    pub pending_count: usize,
    /// Entities whose last replay failed.
    pub failed_count: usize,
    pub last_sync_at: Option<i64>,
    /// Persisted state was unreadable and has been reset.
    pub local_data_stale: bool,
    pub last_failure: Option<SyncFailure>,
}

/// Notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    StatusChanged(SyncStatusView),
    /// A local entity received its remote id; references by local id stay valid.
    EntityRebound(Rebind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    AlreadySyncing,
    /// No local edit has scheduled a replay since the last pass.
    NothingDue,
}

/// Work done by one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub replay: ReplayReport,
    /// `None` when the snapshot could not be fetched or applied.
    pub reconcile: Option<ReconcileReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Skipped(SkipReason),
    Completed(CycleReport),
    Failed(CycleReport),
}

impl SyncOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            Self::Completed(report) | Self::Failed(report) => Some(report),
            Self::Skipped(_) => None,
        }
    }
}

type Listener = Box<dyn FnMut(&EngineEvent) + Send>;

/// Offline-first engine for one collection.
pub struct SyncEngine<P, R> {
    config: SyncConfig,
    remote: R,
    clock: Arc<dyn Clock>,
    persistence: PersistenceAdapter,
    document: ReplicatedDocument,
    queue: PendingQueue,
    monitor: ConnectionMonitor,
    replay: ReplayAgent,
    selected: Option<EntityId>,
    replay_due: bool,
    local_data_stale: bool,
    last_sync_at: Option<i64>,
    last_failure: Option<SyncFailure>,
    listeners: BTreeMap<SubscriptionId, Listener>,
    next_subscription: SubscriptionId,
    last_published: Option<SyncStatusView>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, R> SyncEngine<P, R>
where
    P: CollectionPayload,
    R: RemoteCollection<P>,
{
    /// Loads persisted state, repairs queue/document drift and starts the
    /// connection monitor from the host's current availability.
    ///
    /// Unreadable persisted blobs are replaced by empty state and reported
    /// through `local_data_stale`.
    pub fn open(
        config: SyncConfig,
        store: Box<dyn BlobStore>,
        remote: R,
        clock: Arc<dyn Clock>,
        host_online: bool,
    ) -> EngineResult<Self> {
        config.validate()?;
        let now = clock.now_ms();
        let persistence = PersistenceAdapter::new(
            store,
            StorageKeys::new(&config.namespace, P::COLLECTION),
            config.persist_debounce_ms,
        );
        let document = persistence.load::<ReplicatedDocument>(BlobSlot::Document)?;
        let queue = persistence.load::<PendingQueue>(BlobSlot::Queue)?;
        let local_data_stale = document.corrupt || queue.corrupt;

        let mut engine = Self {
            replay: ReplayAgent::new(config.retry_budget, config.actor_id.clone()),
            monitor: ConnectionMonitor::new(host_online, now),
            config,
            remote,
            clock,
            persistence,
            document: document.value,
            queue: queue.value,
            selected: None,
            replay_due: false,
            local_data_stale,
            last_sync_at: None,
            last_failure: None,
            listeners: BTreeMap::new(),
            next_subscription: 1,
            last_published: None,
            _payload: PhantomData,
        };

        if local_data_stale {
            engine.last_failure = Some(SyncFailure {
                kind: SyncFailureKind::CorruptLocalState,
                entity_id: None,
                message: "persisted sync state was unreadable and has been reset".to_string(),
                at: now,
            });
        }
        let repaired = engine.recover(now)?;
        engine.last_sync_at = engine
            .document
            .records()
            .filter_map(|record| record.last_sync_at)
            .max();
        if repaired > 0 || local_data_stale {
            engine.persist()?;
        }
        engine.replay_due = engine.config.auto_replay && !engine.queue.is_empty();

        info!(
            "event=engine_open module=engine status=ok collection={} entities={} queued={} repaired={} stale={} state={}",
            P::COLLECTION,
            engine.document.len(),
            engine.queue.len(),
            repaired,
            local_data_stale,
            engine.monitor.state().as_str()
        );
        Ok(engine)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.state()
    }

    /// Creates an entity locally and queues its remote create.
    pub fn create(&mut self, mut payload: P) -> EngineResult<Entity<P>> {
        payload.normalize();
        payload.validate()?;
        let now = self.clock.now_ms();
        let id = Uuid::new_v4();
        let fields = FieldSet::from_payload(&payload)?;

        self.document
            .apply_in_place(&DocumentMutation::Insert(NewRecord {
                id,
                owner_id: self.config.owner_id.clone(),
                created_at: now,
                remote_id: None,
                fields: fields.clone(),
                sync_status: SyncStatus::Pending,
                is_local_only: true,
                last_sync_at: None,
                stamp: Stamp::new(now, self.config.actor_id.as_str()),
            }))?;
        self.queue
            .enqueue(PendingChange::create(P::COLLECTION, id, fields.to_value(), now));
        debug!(
            "event=entity_create module=engine status=ok collection={} entity_id={}",
            P::COLLECTION,
            id
        );

        let entity = self.require_entity(id)?;
        self.after_local_change()?;
        Ok(entity)
    }

    /// Edits an entity's payload through `edit`.
    ///
    /// Edits that leave the payload unchanged queue nothing.
    pub fn update(&mut self, id: EntityId, edit: impl FnOnce(&mut P)) -> EngineResult<Entity<P>> {
        let mut payload = self.editable_payload(id)?;
        edit(&mut payload);
        self.write_payload(id, payload)
    }

    /// Flips the collection's status field (task done, note archived).
    pub fn toggle_status(&mut self, id: EntityId) -> EngineResult<Entity<P>> {
        let mut payload = self.editable_payload(id)?;
        if !payload.toggle_status() {
            return Err(EngineError::ToggleUnsupported(P::COLLECTION));
        }
        self.write_payload(id, payload)
    }

    /// Deletes an entity locally.
    ///
    /// Entities that never reached the remote store are removed without any
    /// remote call.
    pub fn delete(&mut self, id: EntityId) -> EngineResult<()> {
        let record = self
            .document
            .get(id)
            .ok_or(EngineError::UnknownEntity(id))?;
        if !record.is_visible() {
            return Err(EngineError::EntityDeleted(id));
        }
        let remote_id = record.remote_id.clone();
        let now = self.clock.now_ms();
        let ctx = self.write_context(now);

        self.document
            .apply_in_place(&DocumentMutation::Tombstone { id, ctx: ctx.clone() })?;
        let never_sent = remote_id.is_none() && !self.queue.has_changes_for(id);
        let purge = never_sent
            || self
                .queue
                .enqueue(PendingChange::delete(P::COLLECTION, id, remote_id, now))
                == EnqueueOutcome::Cancelled;
        if purge {
            self.document
                .apply_in_place(&DocumentMutation::Purge { id })?;
        } else {
            self.document.apply_in_place(&DocumentMutation::SetSyncStatus {
                id,
                status: SyncStatus::Pending,
                ctx,
            })?;
        }
        if self.selected == Some(id) {
            self.selected = None;
        }
        debug!(
            "event=entity_delete module=engine status=ok collection={} entity_id={} purged={}",
            P::COLLECTION,
            id,
            purge
        );
        self.after_local_change()
    }

    pub fn get(&self, id: EntityId) -> EngineResult<Option<Entity<P>>> {
        Ok(self.document.entity(id)?)
    }

    pub fn get_by_remote_id(&self, remote_id: &str) -> EngineResult<Option<Entity<P>>> {
        match self.document.find_by_remote_id(remote_id) {
            Some(record) if record.is_visible() => Ok(Some(record.to_entity()?)),
            _ => Ok(None),
        }
    }

    /// Visible entities, newest first.
    pub fn list(&self) -> EngineResult<Vec<Entity<P>>> {
        Ok(self.document.entities()?)
    }

    /// Points the selection at a visible entity, or clears it.
    pub fn select(&mut self, id: Option<EntityId>) -> EngineResult<()> {
        if let Some(id) = id {
            self.require_entity(id)?;
        }
        self.selected = id;
        Ok(())
    }

    pub fn selected(&self) -> Option<EntityId> {
        self.selected
    }

    pub fn selected_entity(&self) -> EngineResult<Option<Entity<P>>> {
        match self.selected {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    /// Queued changes in replay order.
    pub fn pending_changes(&self) -> Vec<PendingChange> {
        self.queue.peek_pending(P::COLLECTION)
    }

    pub fn status(&self) -> SyncStatusView {
        SyncStatusView {
            connection_state: self.monitor.state(),
            pending_count: self.queue.len(),
            failed_count: self
                .document
                .visible_records()
                .filter(|record| record.status() == SyncStatus::Failed)
                .count(),
            last_sync_at: self.last_sync_at,
            local_data_stale: self.local_data_stale,
            last_failure: self.last_failure.clone(),
        }
    }

    /// Returns whether a local edit has scheduled a replay that has not run.
    pub fn replay_due(&self) -> bool {
        self.replay_due
    }

    /// Registers `listener` for status changes and rebind notifications.
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&EngineEvent) + Send + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.listeners.insert(id, Box::new(listener));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Runs one full cycle: replay the queue, then fetch and reconcile the
    /// remote snapshot.
    pub fn force_sync(&mut self) -> SyncOutcome {
        match self.monitor.state() {
            ConnectionState::Offline => return SyncOutcome::Skipped(SkipReason::Offline),
            ConnectionState::Syncing => return SyncOutcome::Skipped(SkipReason::AlreadySyncing),
            ConnectionState::Online | ConnectionState::Error => {}
        }

        let outcome = self.run_cycle();
        self.persist_logged("sync_cycle");
        self.publish_status();
        outcome
    }

    /// Runs the replay pass scheduled by local edits, if one is due.
    ///
    /// Hosts call this off the edit path (worker, timer or idle hook). Unlike
    /// `force_sync` it does not fetch a snapshot.
    pub fn poll_replay(&mut self) -> SyncOutcome {
        if !self.replay_due {
            return SyncOutcome::Skipped(SkipReason::NothingDue);
        }
        match self.monitor.state() {
            ConnectionState::Offline => return SyncOutcome::Skipped(SkipReason::Offline),
            ConnectionState::Syncing => return SyncOutcome::Skipped(SkipReason::AlreadySyncing),
            ConnectionState::Online | ConnectionState::Error => {}
        }

        self.replay_due = false;
        let started_at = self.clock.now_ms();
        self.transition(ConnectionEvent::CycleStarted, started_at);
        let replay = self.replay_pending(started_at);
        let failed = replay.has_failures();
        let report = CycleReport {
            replay,
            reconcile: None,
        };
        let outcome = if failed {
            self.transition(ConnectionEvent::CycleFailed, self.clock.now_ms());
            SyncOutcome::Failed(report)
        } else {
            self.last_failure = None;
            self.transition(ConnectionEvent::CycleSucceeded, self.clock.now_ms());
            SyncOutcome::Completed(report)
        };
        self.persist_logged("replay");
        self.publish_status();
        outcome
    }

    /// Host network-availability signal.
    pub fn on_connectivity_changed(&mut self, online: bool) -> SyncOutcome {
        let now = self.clock.now_ms();
        if online {
            self.transition(ConnectionEvent::ConnectivityRestored, now);
            return self.force_sync();
        }
        self.transition(ConnectionEvent::ConnectivityLost, now);
        self.publish_status();
        SyncOutcome::Skipped(SkipReason::Offline)
    }

    /// Applies a snapshot pushed by the remote store.
    pub fn on_remote_snapshot(
        &mut self,
        snapshot: &[RemoteEntity<P>],
    ) -> EngineResult<ReconcileReport> {
        let now = self.clock.now_ms();
        let report = self.apply_snapshot(snapshot, now)?;
        self.persist()?;
        self.publish_status();
        Ok(report)
    }

    /// Best-effort background wake-up from the host.
    pub fn on_background_wake(&mut self) -> SyncOutcome {
        debug!(
            "event=background_wake module=engine status=ok collection={} queued={}",
            P::COLLECTION,
            self.queue.len()
        );
        self.force_sync()
    }

    /// Writes any debounced state to storage now.
    pub fn flush(&mut self) -> EngineResult<()> {
        self.persistence.flush()?;
        Ok(())
    }

    fn run_cycle(&mut self) -> SyncOutcome {
        let started_at = self.clock.now_ms();
        self.transition(ConnectionEvent::CycleStarted, started_at);
        self.replay_due = false;

        let replay = self.replay_pending(started_at);
        let mut failed = replay.has_failures();
        let reconcile = match self.remote.fetch_snapshot(&self.config.owner_id) {
            Ok(snapshot) => match self.apply_snapshot(&snapshot, self.clock.now_ms()) {
                Ok(report) => Some(report),
                Err(err) => {
                    failed = true;
                    self.record_failure(SyncFailureKind::CorruptLocalState, None, err.to_string());
                    None
                }
            },
            Err(err) => {
                failed = true;
                self.record_failure(failure_kind(&err), None, err.to_string());
                None
            }
        };

        let finished_at = self.clock.now_ms();
        let report = CycleReport { replay, reconcile };
        info!(
            "event=sync_cycle module=engine status={} collection={} replayed={} failures={} reconciled={} duration_ms={}",
            if failed { "error" } else { "ok" },
            P::COLLECTION,
            report.replay.succeeded,
            report.replay.failures.len(),
            report.reconcile.is_some(),
            finished_at.saturating_sub(started_at)
        );
        if failed {
            self.transition(ConnectionEvent::CycleFailed, finished_at);
            SyncOutcome::Failed(report)
        } else {
            self.transition(ConnectionEvent::CycleSucceeded, finished_at);
            self.last_failure = None;
            SyncOutcome::Completed(report)
        }
    }

    fn replay_pending(&mut self, now: i64) -> ReplayReport {
        let report = self.replay.replay::<P, R>(
            &mut self.document,
            &mut self.queue,
            &self.remote,
            &self.config.owner_id,
            now,
        );
        if let Some(failure) = report.failures.last() {
            self.record_failure(failure.kind, Some(failure.entity_id), failure.message.clone());
        }
        self.drop_stale_selection();
        for rebind in &report.rebinds {
            self.publish(&EngineEvent::EntityRebound(rebind.clone()));
        }
        report
    }

    fn apply_snapshot(
        &mut self,
        snapshot: &[RemoteEntity<P>],
        now: i64,
    ) -> EngineResult<ReconcileReport> {
        let protected = self.queue.entity_ids();
        let ctx = self.write_context(now);
        let (document, report) = reconcile(&self.document, snapshot, &protected, &ctx)?;
        self.document = document;
        self.last_sync_at = self.last_sync_at.max(Some(now));
        self.local_data_stale = false;
        self.drop_stale_selection();
        info!(
            "event=snapshot_apply module=engine status=ok collection={} remote={} materialized={} overwritten={} deferred={} removed={}",
            P::COLLECTION,
            snapshot.len(),
            report.materialized.len(),
            report.overwritten.len(),
            report.deferred.len(),
            report.removed.len()
        );
        Ok(report)
    }

    /// Persists and schedules a replay for the next `poll_replay`.
    fn after_local_change(&mut self) -> EngineResult<()> {
        self.persist()?;
        if self.config.auto_replay {
            self.replay_due = true;
        }
        self.publish_status();
        Ok(())
    }

    /// Rebuilds whichever of document and queue lost track of the other.
    fn recover(&mut self, now: i64) -> EngineResult<usize> {
        let mut repaired = 0;

        for change in self.queue.peek_pending(P::COLLECTION) {
            if self.document.get(change.entity_id).is_some() {
                continue;
            }
            let Some(payload) = change.payload.clone() else {
                continue;
            };
            repaired += 1;
            let fields = match FieldSet::from_value(payload, P::SET_FIELDS) {
                Ok(fields) => fields,
                Err(err) => {
                    warn!(
                        "event=engine_recover module=engine status=dropped collection={} entity_id={} error={}",
                        P::COLLECTION,
                        change.entity_id,
                        sanitize_message(&err.to_string(), 120)
                    );
                    self.queue.dequeue(change.id);
                    continue;
                }
            };
            self.document
                .apply_in_place(&DocumentMutation::Insert(NewRecord {
                    id: change.entity_id,
                    owner_id: self.config.owner_id.clone(),
                    created_at: change.enqueued_at,
                    is_local_only: change.remote_id.is_none(),
                    remote_id: change.remote_id.clone(),
                    fields,
                    sync_status: SyncStatus::Pending,
                    last_sync_at: None,
                    stamp: Stamp::new(change.enqueued_at, self.config.actor_id.as_str()),
                }))?;
        }

        let orphans: Vec<_> = self
            .document
            .records()
            .filter(|record| {
                record.status() == SyncStatus::Pending && !self.queue.has_changes_for(record.id)
            })
            .map(|record| {
                (
                    record.id,
                    record.remote_id.clone(),
                    record.is_visible(),
                    record.field_set(),
                )
            })
            .collect();
        for (id, remote_id, visible, fields) in orphans {
            repaired += 1;
            let change = match (visible, remote_id) {
                (true, None) => PendingChange::create(P::COLLECTION, id, fields.to_value(), now),
                (true, Some(remote_id)) => {
                    PendingChange::update(P::COLLECTION, id, Some(remote_id), fields.to_value(), now)
                }
                (false, Some(remote_id)) => {
                    PendingChange::delete(P::COLLECTION, id, Some(remote_id), now)
                }
                (false, None) => {
                    self.document
                        .apply_in_place(&DocumentMutation::Purge { id })?;
                    continue;
                }
            };
            self.queue.enqueue(change);
        }

        if repaired > 0 {
            info!(
                "event=engine_recover module=engine status=ok collection={} repaired={}",
                P::COLLECTION,
                repaired
            );
        }
        Ok(repaired)
    }

    fn editable_payload(&self, id: EntityId) -> EngineResult<P> {
        Ok(self.require_entity(id)?.payload)
    }

    fn write_payload(&mut self, id: EntityId, mut payload: P) -> EngineResult<Entity<P>> {
        payload.normalize();
        payload.validate()?;
        let now = self.clock.now_ms();
        let ctx = self.write_context(now);
        let fields = FieldSet::from_payload(&payload)?;

        let changed = self.document.apply_in_place(&DocumentMutation::SetPayload {
            id,
            fields: fields.clone(),
            ctx: ctx.clone(),
        })?;
        if changed {
            self.document.apply_in_place(&DocumentMutation::SetSyncStatus {
                id,
                status: SyncStatus::Pending,
                ctx,
            })?;
            let remote_id = self
                .document
                .get(id)
                .and_then(|record| record.remote_id.clone());
            self.queue.enqueue(PendingChange::update(
                P::COLLECTION,
                id,
                remote_id,
                fields.to_value(),
                now,
            ));
            debug!(
                "event=entity_update module=engine status=ok collection={} entity_id={}",
                P::COLLECTION,
                id
            );
        }

        let entity = self.require_entity(id)?;
        if changed {
            self.after_local_change()?;
        }
        Ok(entity)
    }

    fn require_entity(&self, id: EntityId) -> EngineResult<Entity<P>> {
        match self.document.get(id) {
            None => Err(EngineError::UnknownEntity(id)),
            Some(record) if !record.is_visible() => Err(EngineError::EntityDeleted(id)),
            Some(record) => Ok(record.to_entity()?),
        }
    }

    fn write_context(&self, now: i64) -> WriteContext {
        WriteContext::new(now, self.config.actor_id.clone())
    }

    fn transition(&mut self, event: ConnectionEvent, now: i64) {
        // Rejections are logged by the monitor and leave state untouched.
        let _ = self.monitor.apply(event, now);
    }

    fn record_failure(&mut self, kind: SyncFailureKind, entity_id: Option<EntityId>, message: String) {
        self.last_failure = Some(SyncFailure {
            kind,
            entity_id,
            message,
            at: self.clock.now_ms(),
        });
    }

    fn drop_stale_selection(&mut self) {
        if let Some(id) = self.selected {
            if self.document.get_visible(id).is_none() {
                self.selected = None;
            }
        }
    }

    fn persist(&mut self) -> EngineResult<()> {
        let now = self.clock.now_ms();
        self.persistence.stage(BlobSlot::Document, &self.document)?;
        self.persistence.stage(BlobSlot::Queue, &self.queue)?;
        self.persistence.commit(now)?;
        Ok(())
    }

    fn persist_logged(&mut self, phase: &str) {
        if let Err(err) = self.persist() {
            error!(
                "event=persist module=engine status=error collection={} phase={} error={}",
                P::COLLECTION,
                phase,
                err
            );
        }
    }

    fn publish_status(&mut self) {
        let view = self.status();
        if self.last_published.as_ref() == Some(&view) {
            return;
        }
        self.last_published = Some(view.clone());
        self.publish(&EngineEvent::StatusChanged(view));
    }

    fn publish(&mut self, event: &EngineEvent) {
        for listener in self.listeners.values_mut() {
            listener(event);
        }
    }
}

fn failure_kind(err: &RemoteError) -> SyncFailureKind {
    match err {
        RemoteError::Transient(_) => SyncFailureKind::TransientNetwork,
        RemoteError::NotFound(_) => SyncFailureKind::Conflict,
        RemoteError::AlreadyExists { .. } | RemoteError::Rejected(_) => SyncFailureKind::Validation,
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineEvent, SkipReason, SyncEngine, SyncOutcome};
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use crate::db::open_db_in_memory;
    use crate::error::EngineError;
    use crate::model::content::{Note, Task, TaskStatus};
    use crate::model::entity::SyncStatus;
    use crate::repo::blob_repo::{BlobStore, SqliteBlobStore};
    use crate::repo::persistence::{BlobSlot, StorageKeys};
    use crate::sync::connection::ConnectionState;
    use crate::sync::loopback::{LoopbackRemote, RemoteCallKind};
    use crate::sync::queue::PendingQueue;
    use crate::sync::remote::RemoteError;
    use std::sync::{Arc, Mutex};

    type TestEngine = SyncEngine<Task, LoopbackRemote<Task>>;

    fn engine(online: bool) -> (TestEngine, LoopbackRemote<Task>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let remote = LoopbackRemote::new(Arc::new(clock.clone()));
        let store = SqliteBlobStore::try_new(open_db_in_memory().unwrap()).unwrap();
        let engine = SyncEngine::open(
            SyncConfig::new("owner-1"),
            Box::new(store),
            remote.clone(),
            Arc::new(clock.clone()),
            online,
        )
        .unwrap();
        (engine, remote, clock)
    }

    #[test]
    fn offline_create_stays_local_and_queued() {
        let (mut engine, remote, _) = engine(false);
        let task = engine.create(Task::new("  buy   milk ")).unwrap();
        assert_eq!(task.payload.title, "buy milk");
        assert!(task.is_local_only);
        assert_eq!(task.sync_status, SyncStatus::Pending);
        assert_eq!(engine.status().pending_count, 1);
        assert!(remote.calls().is_empty());
        assert_eq!(
            engine.force_sync(),
            SyncOutcome::Skipped(SkipReason::Offline)
        );
    }

    #[test]
    fn online_create_returns_before_replay_then_poll_confirms() {
        let (mut engine, remote, _) = engine(true);
        let task = engine.create(Task::new("ship")).unwrap();
        assert_eq!(task.sync_status, SyncStatus::Pending);
        assert!(remote.calls().is_empty());
        assert!(engine.replay_due());

        assert!(engine.poll_replay().is_completed());
        let stored = engine.get(task.id).unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(stored.remote_id.is_some());
        assert_eq!(remote.call_count(RemoteCallKind::Create), 1);
        assert_eq!(engine.connection_state(), ConnectionState::Online);
        assert!(!engine.replay_due());
        assert_eq!(
            engine.poll_replay(),
            SyncOutcome::Skipped(SkipReason::NothingDue)
        );
    }

    #[test]
    fn local_edits_never_wait_on_a_failing_remote() {
        let (mut engine, remote, _) = engine(true);
        for _ in 0..3 {
            remote.fail_next(
                RemoteCallKind::Create,
                RemoteError::Transient("timeout".to_string()),
            );
        }
        let task = engine.create(Task::new("queued")).unwrap();
        engine.toggle_status(task.id).unwrap();
        assert!(remote.calls().is_empty());
        assert_eq!(engine.connection_state(), ConnectionState::Online);
        assert_eq!(engine.status().pending_count, 1);

        let outcome = engine.poll_replay();
        assert!(matches!(outcome, SyncOutcome::Failed(_)));
        assert_eq!(remote.call_count(RemoteCallKind::Create), 3);
        assert_eq!(engine.connection_state(), ConnectionState::Error);
    }

    #[test]
    fn poll_replay_while_offline_keeps_replay_due() {
        let (mut engine, remote, _) = engine(false);
        engine.create(Task::new("later")).unwrap();
        assert_eq!(
            engine.poll_replay(),
            SyncOutcome::Skipped(SkipReason::Offline)
        );
        assert!(engine.replay_due());
        assert!(engine.on_connectivity_changed(true).is_completed());
        assert!(!engine.replay_due());
        assert_eq!(remote.call_count(RemoteCallKind::Create), 1);
    }

    #[test]
    fn failed_count_ignores_deleted_entities() {
        let (mut engine, remote, _) = engine(true);
        let kept = engine.create(Task::new("kept")).unwrap();
        let dropped = engine.create(Task::new("dropped")).unwrap();
        engine.poll_replay();

        remote.fail_next(
            RemoteCallKind::Delete,
            RemoteError::Rejected("locked".to_string()),
        );
        engine.delete(dropped.id).unwrap();
        assert!(matches!(engine.poll_replay(), SyncOutcome::Failed(_)));
        assert_eq!(engine.status().failed_count, 0);

        remote.fail_next(
            RemoteCallKind::Update,
            RemoteError::Rejected("too long".to_string()),
        );
        engine.update(kept.id, |t| t.title = "kept, edited".to_string()).unwrap();
        engine.poll_replay();
        assert_eq!(engine.status().failed_count, 1);
    }

    #[test]
    fn debounced_persist_writes_document_and_queue_together() {
        let clock = ManualClock::new(1_000);
        let store = SqliteBlobStore::try_new(open_db_in_memory().unwrap()).unwrap();
        let mut config = SyncConfig::new("owner-1");
        config.persist_debounce_ms = 60_000;
        let mut engine = SyncEngine::open(
            config,
            Box::new(store.clone()),
            LoopbackRemote::<Task>::new(Arc::new(clock.clone())),
            Arc::new(clock.clone()),
            false,
        )
        .unwrap();
        engine.create(Task::new("durable")).unwrap();

        let keys = StorageKeys::new(&engine.config().namespace, "tasks");
        let queue_bytes = store.read_blob(keys.key(BlobSlot::Queue)).unwrap().unwrap();
        let queue: PendingQueue = serde_json::from_slice(&queue_bytes).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(store.read_blob(keys.key(BlobSlot::Document)).unwrap().is_some());
    }

    #[test]
    fn toggle_twice_offline_leaves_one_todo_record() {
        let (mut engine, _, _) = engine(false);
        let task = engine.create(Task::new("toggle me")).unwrap();
        engine.toggle_status(task.id).unwrap();
        let back = engine.toggle_status(task.id).unwrap();
        assert_eq!(back.payload.status, TaskStatus::Todo);

        let pending = engine.pending_changes();
        assert_eq!(pending.len(), 1);
        let payload = pending[0].payload.as_ref().unwrap();
        assert_eq!(payload["status"], "todo");
    }

    #[test]
    fn edits_to_deleted_or_unknown_entities_fail() {
        let (mut engine, _, _) = engine(false);
        let task = engine.create(Task::new("gone")).unwrap();
        engine.delete(task.id).unwrap();
        assert!(engine.get(task.id).unwrap().is_none());
        assert!(matches!(
            engine.update(uuid::Uuid::new_v4(), |t| t.title = "x".to_string()),
            Err(EngineError::UnknownEntity(_))
        ));
        assert!(matches!(
            engine.create(Task::new("   ")),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn subscribers_see_status_changes_until_unsubscribed() {
        let (mut engine, _, _) = engine(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = engine.subscribe(move |event| {
            if let EngineEvent::StatusChanged(view) = event {
                sink.lock().unwrap().push(view.pending_count);
            }
        });

        engine.create(Task::new("one")).unwrap();
        engine.create(Task::new("two")).unwrap();
        assert!(engine.unsubscribe(id));
        engine.create(Task::new("three")).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn selection_clears_when_entity_is_deleted() {
        let (mut engine, _, _) = engine(false);
        let task = engine.create(Task::new("pick")).unwrap();
        engine.select(Some(task.id)).unwrap();
        assert_eq!(engine.selected(), Some(task.id));
        engine.delete(task.id).unwrap();
        assert_eq!(engine.selected(), None);
        assert!(engine.select(Some(task.id)).is_err());
    }

    #[test]
    fn toggle_without_status_field_is_rejected() {
        #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Plain {
            title: String,
        }
        impl crate::model::entity::CollectionPayload for Plain {
            const COLLECTION: &'static str = "plain";
        }

        let clock = ManualClock::new(1);
        let store = SqliteBlobStore::try_new(open_db_in_memory().unwrap()).unwrap();
        let mut engine = SyncEngine::open(
            SyncConfig::new("owner-1"),
            Box::new(store),
            LoopbackRemote::<Plain>::new(Arc::new(clock.clone())),
            Arc::new(clock),
            false,
        )
        .unwrap();
        let entity = engine
            .create(Plain {
                title: "x".to_string(),
            })
            .unwrap();
        assert!(matches!(
            engine.toggle_status(entity.id),
            Err(EngineError::ToggleUnsupported("plain"))
        ));
    }

    #[test]
    fn notes_toggle_archived() {
        let clock = ManualClock::new(1);
        let store = SqliteBlobStore::try_new(open_db_in_memory().unwrap()).unwrap();
        let mut engine = SyncEngine::open(
            SyncConfig::new("owner-1"),
            Box::new(store),
            LoopbackRemote::<Note>::new(Arc::new(clock.clone())),
            Arc::new(clock),
            false,
        )
        .unwrap();
        let note = engine.create(Note::new("n", "body")).unwrap();
        assert!(engine.toggle_status(note.id).unwrap().payload.archived);
    }
}
