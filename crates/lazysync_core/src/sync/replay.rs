//! Queue replay against the remote mutation API.
//!
//! # Responsibility
//! - Drain queued changes of one collection in order, one call at a time.
//! - Fold each remote outcome back into the document and the queue.
//!
//! # Invariants
//! - Changes of one entity are sent in enqueue order; once one fails, the
//!   entity's later changes wait for the next cycle.
//! - Only transient failures are retried, at most `retry_budget` attempts per
//!   change per cycle.
//! - A failed change stays queued with its attempt count and error, except
//!   validation rejections, which are dropped.

use crate::error::SyncFailureKind;
use crate::logging::sanitize_message;
use crate::model::change::{ChangeOperation, PendingChange};
use crate::model::entity::{CollectionPayload, EntityId, RemoteId, SyncStatus};
use crate::store::document::{DocumentMutation, ReplicatedDocument, WriteContext};
use crate::store::DocumentError;
use crate::sync::queue::PendingQueue;
use crate::sync::remote::{RemoteCollection, RemoteCreate, RemoteError, RemoteResult};
use log::{info, warn};
use std::collections::BTreeSet;

/// A create acknowledgement that bound a remote id to a local entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rebind {
    pub entity_id: EntityId,
    pub remote_id: RemoteId,
}

/// One change that did not reach the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
    pub entity_id: EntityId,
    pub operation: ChangeOperation,
    pub kind: SyncFailureKind,
    pub message: String,
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Changes taken from the queue this pass.
    pub attempted: usize,
    pub succeeded: usize,
    /// Changes skipped because an earlier change of the same entity failed.
    pub blocked: usize,
    /// Remote calls issued, retries included.
    pub remote_calls: usize,
    pub rebinds: Vec<Rebind>,
    /// Entities dropped because they no longer exist remotely. Accepted as
    /// remote deletions, not counted as failures.
    pub conflicts: Vec<EntityId>,
    pub failures: Vec<ReplayFailure>,
}

impl ReplayReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

enum Outcome {
    Created(RemoteId),
    Updated,
    Deleted,
    Conflict,
    Failed {
        kind: SyncFailureKind,
        message: String,
        attempts: u32,
        keep_queued: bool,
    },
}

/// Sequential replay driver for one replica.
#[derive(Debug, Clone)]
pub struct ReplayAgent {
    retry_budget: u32,
    actor: String,
}

impl ReplayAgent {
    pub fn new(retry_budget: u32, actor: impl Into<String>) -> Self {
        Self {
            retry_budget: retry_budget.max(1),
            actor: actor.into(),
        }
    }

    /// Replays every queued change of `P::COLLECTION`.
    pub fn replay<P, R>(
        &self,
        document: &mut ReplicatedDocument,
        queue: &mut PendingQueue,
        remote: &R,
        owner_id: &str,
        now: i64,
    ) -> ReplayReport
    where
        P: CollectionPayload,
        R: RemoteCollection<P> + ?Sized,
    {
        let mut report = ReplayReport::default();
        let mut blocked = BTreeSet::new();
        let ctx = WriteContext::new(now, self.actor.clone());

        for snapshot in queue.peek_pending(P::COLLECTION) {
            if blocked.contains(&snapshot.entity_id) {
                report.blocked += 1;
                continue;
            }
            // Earlier outcomes may have patched or removed this change.
            let Some(change) = queue.get(snapshot.id).cloned() else {
                continue;
            };

            report.attempted += 1;
            let outcome = self.send::<P, R>(&change, document, remote, owner_id, &mut report);
            match outcome {
                Outcome::Created(remote_id) => {
                    queue.dequeue(change.id);
                    queue.bind_remote_id(change.entity_id, &remote_id);
                    let status = settled_status(queue, change.entity_id);
                    let acked = settle(
                        document,
                        DocumentMutation::Acknowledge {
                            id: change.entity_id,
                            remote_id: Some(remote_id.clone()),
                            status,
                            ctx: ctx.clone(),
                        },
                        &change,
                        &mut report,
                    );
                    if !acked {
                        continue;
                    }
                    info!(
                        "event=entity_rebind module=sync status=ok collection={} entity_id={} remote_id={}",
                        P::COLLECTION,
                        change.entity_id,
                        remote_id
                    );
                    report.rebinds.push(Rebind {
                        entity_id: change.entity_id,
                        remote_id,
                    });
                    report.succeeded += 1;
                }
                Outcome::Updated => {
                    queue.dequeue(change.id);
                    let status = settled_status(queue, change.entity_id);
                    if settle(
                        document,
                        DocumentMutation::Acknowledge {
                            id: change.entity_id,
                            remote_id: None,
                            status,
                            ctx: ctx.clone(),
                        },
                        &change,
                        &mut report,
                    ) {
                        report.succeeded += 1;
                    }
                }
                Outcome::Deleted => {
                    queue.drop_entity(change.entity_id);
                    let purge = DocumentMutation::Purge {
                        id: change.entity_id,
                    };
                    if settle(document, purge, &change, &mut report) {
                        report.succeeded += 1;
                    }
                }
                Outcome::Conflict => {
                    // The remote copy is gone for good; no local delete may follow.
                    queue.drop_entity(change.entity_id);
                    let purge = DocumentMutation::Purge {
                        id: change.entity_id,
                    };
                    if !settle(document, purge, &change, &mut report) {
                        continue;
                    }
                    warn!(
                        "event=replay_conflict module=sync status=dropped collection={} entity_id={} operation={}",
                        P::COLLECTION,
                        change.entity_id,
                        change.operation.as_str()
                    );
                    report.conflicts.push(change.entity_id);
                }
                Outcome::Failed {
                    kind,
                    message,
                    attempts,
                    keep_queued,
                } => {
                    if keep_queued {
                        queue.record_failure(change.id, attempts, &message);
                    } else {
                        queue.dequeue(change.id);
                    }
                    settle(
                        document,
                        DocumentMutation::SetSyncStatus {
                            id: change.entity_id,
                            status: SyncStatus::Failed,
                            ctx: ctx.clone(),
                        },
                        &change,
                        &mut report,
                    );
                    warn!(
                        "event=replay_change module=sync status=failed collection={} entity_id={} operation={} kind={} attempts={} error={}",
                        P::COLLECTION,
                        change.entity_id,
                        change.operation.as_str(),
                        kind.as_str(),
                        attempts,
                        sanitize_message(&message, 160)
                    );
                    blocked.insert(change.entity_id);
                    report.failures.push(failure(&change, kind, message));
                }
            }
        }

        info!(
            "event=replay_pass module=sync status={} collection={} attempted={} succeeded={} failed={} blocked={} calls={}",
            if report.has_failures() { "error" } else { "ok" },
            P::COLLECTION,
            report.attempted,
            report.succeeded,
            report.failures.len(),
            report.blocked,
            report.remote_calls
        );
        report
    }

    fn send<P, R>(
        &self,
        change: &PendingChange,
        document: &ReplicatedDocument,
        remote: &R,
        owner_id: &str,
        report: &mut ReplayReport,
    ) -> Outcome
    where
        P: CollectionPayload,
        R: RemoteCollection<P> + ?Sized,
    {
        let remote_id = change.remote_id.clone().or_else(|| {
            document
                .get(change.entity_id)
                .and_then(|record| record.remote_id.clone())
        });

        match (change.operation, remote_id) {
            (ChangeOperation::Delete, None) => Outcome::Deleted,
            (ChangeOperation::Delete, Some(remote_id)) => {
                match self.with_retries(report, || remote.delete(&remote_id)) {
                    (Ok(()), _) | (Err(RemoteError::NotFound(_)), _) => Outcome::Deleted,
                    (Err(err), attempts) => failed(err, attempts),
                }
            }
            // Updates without a remote target mean the create never landed.
            (ChangeOperation::Create, _) | (ChangeOperation::Update, None) => {
                let payload = match decode_payload::<P>(change) {
                    Ok(payload) => payload,
                    Err(message) => return invalid(message),
                };
                let request = RemoteCreate {
                    client_id: change.entity_id,
                    owner_id: owner_id.to_string(),
                    payload,
                };
                match self.with_retries(report, || remote.create(request.clone())) {
                    (Ok(remote_id), _) | (Err(RemoteError::AlreadyExists { remote_id }), _) => {
                        Outcome::Created(remote_id)
                    }
                    (Err(err), attempts) => failed(err, attempts),
                }
            }
            (ChangeOperation::Update, Some(remote_id)) => {
                let payload = match decode_payload::<P>(change) {
                    Ok(payload) => payload,
                    Err(message) => return invalid(message),
                };
                match self.with_retries(report, || remote.update(&remote_id, &payload)) {
                    (Ok(()), _) => Outcome::Updated,
                    (Err(RemoteError::NotFound(_)), _) => Outcome::Conflict,
                    (Err(err), attempts) => failed(err, attempts),
                }
            }
        }
    }

    /// Calls `op` until it succeeds, fails permanently, or the budget runs out.
    fn with_retries<T>(
        &self,
        report: &mut ReplayReport,
        mut op: impl FnMut() -> RemoteResult<T>,
    ) -> (RemoteResult<T>, u32) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            report.remote_calls += 1;
            match op() {
                Err(err) if err.is_retryable() && attempts < self.retry_budget => continue,
                result => return (result, attempts),
            }
        }
    }
}

fn decode_payload<P: CollectionPayload>(change: &PendingChange) -> Result<P, String> {
    let Some(payload) = change.payload.clone() else {
        return Err("queued change has no payload".to_string());
    };
    serde_json::from_value(payload).map_err(|err| format!("queued payload is invalid: {err}"))
}

fn failed(err: RemoteError, attempts: u32) -> Outcome {
    let kind = match err {
        RemoteError::Transient(_) => SyncFailureKind::TransientNetwork,
        RemoteError::NotFound(_) => SyncFailureKind::Conflict,
        RemoteError::AlreadyExists { .. } | RemoteError::Rejected(_) => SyncFailureKind::Validation,
    };
    Outcome::Failed {
        kind,
        keep_queued: err.is_retryable(),
        message: err.to_string(),
        attempts,
    }
}

fn invalid(message: String) -> Outcome {
    Outcome::Failed {
        kind: SyncFailureKind::Validation,
        message,
        attempts: 0,
        keep_queued: false,
    }
}

fn failure(change: &PendingChange, kind: SyncFailureKind, message: String) -> ReplayFailure {
    ReplayFailure {
        entity_id: change.entity_id,
        operation: change.operation,
        kind,
        message,
    }
}

fn settled_status(queue: &PendingQueue, entity_id: EntityId) -> SyncStatus {
    if queue.has_changes_for(entity_id) {
        SyncStatus::Pending
    } else {
        SyncStatus::Synced
    }
}

/// Applies a replay write after the queue already moved on.
///
/// Unknown entities are skipped; any other error is logged and reported as a
/// `CorruptLocalState` failure. Returns whether the write held.
fn settle(
    document: &mut ReplicatedDocument,
    mutation: DocumentMutation,
    change: &PendingChange,
    report: &mut ReplayReport,
) -> bool {
    match document.apply_in_place(&mutation) {
        Ok(_) | Err(DocumentError::UnknownEntity(_)) => true,
        Err(err) => {
            warn!(
                "event=replay_apply module=sync status=error entity_id={} operation={} error={}",
                mutation.target(),
                change.operation.as_str(),
                err
            );
            report.failures.push(failure(
                change,
                SyncFailureKind::CorruptLocalState,
                err.to_string(),
            ));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ReplayAgent;
    use crate::clock::ManualClock;
    use crate::error::SyncFailureKind;
    use crate::model::change::PendingChange;
    use crate::model::content::Task;
    use crate::model::entity::{EntityId, SyncStatus};
    use crate::store::document::{DocumentMutation, NewRecord, ReplicatedDocument};
    use crate::store::fields::FieldSet;
    use crate::store::register::Stamp;
    use crate::sync::loopback::{LoopbackRemote, RemoteCall, RemoteCallKind};
    use crate::sync::queue::PendingQueue;
    use crate::sync::remote::RemoteError;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Fixture {
        document: ReplicatedDocument,
        queue: PendingQueue,
        remote: LoopbackRemote<Task>,
        agent: ReplayAgent,
    }

    impl Fixture {
        fn new(retry_budget: u32) -> Self {
            Self {
                document: ReplicatedDocument::new(),
                queue: PendingQueue::new(),
                remote: LoopbackRemote::new(Arc::new(ManualClock::new(500))),
                agent: ReplayAgent::new(retry_budget, "device-a"),
            }
        }

        fn local_create(&mut self, title: &str) -> EntityId {
            let id = Uuid::new_v4();
            let fields = FieldSet::from_payload(&Task::new(title)).unwrap();
            self.queue
                .enqueue(PendingChange::create("tasks", id, fields.to_value(), 10));
            self.document
                .apply_in_place(&DocumentMutation::Insert(NewRecord {
                    id,
                    owner_id: "owner".to_string(),
                    created_at: 10,
                    remote_id: None,
                    fields,
                    sync_status: SyncStatus::Pending,
                    is_local_only: true,
                    last_sync_at: None,
                    stamp: Stamp::new(10, "device-a"),
                }))
                .unwrap();
            id
        }

        fn run(&mut self) -> super::ReplayReport {
            self.agent.replay::<Task, _>(
                &mut self.document,
                &mut self.queue,
                &self.remote,
                "owner",
                100,
            )
        }
    }

    #[test]
    fn successful_create_binds_remote_id() {
        let mut fx = Fixture::new(3);
        let id = fx.local_create("write docs");
        let report = fx.run();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.rebinds.len(), 1);
        assert!(fx.queue.is_empty());
        let record = fx.document.get(id).unwrap();
        assert_eq!(record.status(), SyncStatus::Synced);
        assert!(!record.is_local_only());
        assert_eq!(record.remote_id, Some(report.rebinds[0].remote_id.clone()));
    }

    #[test]
    fn transient_failures_exhaust_budget_then_mark_failed() {
        let mut fx = Fixture::new(2);
        let id = fx.local_create("flaky");
        for _ in 0..2 {
            fx.remote.fail_next(
                RemoteCallKind::Create,
                RemoteError::Transient("timeout".to_string()),
            );
        }
        let report = fx.run();

        assert_eq!(report.remote_calls, 2);
        assert_eq!(report.failures[0].kind, SyncFailureKind::TransientNetwork);
        assert_eq!(fx.document.get(id).unwrap().status(), SyncStatus::Failed);
        let change = fx.queue.iter().next().unwrap();
        assert_eq!(change.attempts, 2);
        assert!(change.has_failed());
    }

    #[test]
    fn retry_within_budget_succeeds() {
        let mut fx = Fixture::new(3);
        fx.local_create("eventually");
        fx.remote.fail_next(
            RemoteCallKind::Create,
            RemoteError::Transient("blip".to_string()),
        );
        let report = fx.run();
        assert!(!report.has_failures());
        assert_eq!(report.remote_calls, 2);
    }

    #[test]
    fn failed_entity_blocks_its_later_changes() {
        let mut fx = Fixture::new(1);
        let id = fx.local_create("first");
        let create_id = fx.queue.iter().next().unwrap().id;
        fx.queue.record_failure(create_id, 1, "earlier cycle");
        fx.queue.enqueue(PendingChange::delete("tasks", id, None, 20));
        fx.remote.fail_next(
            RemoteCallKind::Create,
            RemoteError::Transient("down".to_string()),
        );
        let other = fx.local_create("second");

        let report = fx.run();
        assert_eq!(report.blocked, 1);
        assert_eq!(fx.remote.call_count(RemoteCallKind::Delete), 0);
        assert_eq!(fx.document.get(other).unwrap().status(), SyncStatus::Synced);
    }

    #[test]
    fn duplicate_create_is_reconciled_by_id() {
        let mut fx = Fixture::new(1);
        let id = fx.local_create("lost response");
        fx.remote.fail_next_after_commit(
            RemoteCallKind::Create,
            RemoteError::Transient("response lost".to_string()),
        );
        assert!(fx.run().has_failures());

        let report = fx.run();
        assert!(!report.has_failures());
        let stored = fx.remote.entities();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            fx.document.get(id).unwrap().remote_id.as_deref(),
            Some(stored[0].remote_id.as_str())
        );
    }

    #[test]
    fn update_conflict_drops_change_and_purges_record() {
        let mut fx = Fixture::new(3);
        let id = fx.local_create("shared");
        fx.run();
        let remote_id = fx.document.get(id).unwrap().remote_id.clone().unwrap();
        fx.remote.remove_remote(&remote_id);

        let fields = FieldSet::from_payload(&Task::new("edited")).unwrap();
        fx.queue.enqueue(PendingChange::update(
            "tasks",
            id,
            Some(remote_id),
            fields.to_value(),
            30,
        ));
        let report = fx.run();

        assert_eq!(report.conflicts, vec![id]);
        assert!(!report.has_failures());
        assert!(fx.queue.is_empty());
        assert!(fx.document.get(id).is_none());
        assert!(fx.document.is_empty());
    }

    #[test]
    fn document_write_error_after_dequeue_is_reported() {
        let mut fx = Fixture::new(1);
        let id = Uuid::new_v4();
        let fields = FieldSet::from_payload(&Task::new("bound elsewhere")).unwrap();
        fx.document
            .apply_in_place(&DocumentMutation::Insert(NewRecord {
                id,
                owner_id: "owner".to_string(),
                created_at: 10,
                remote_id: Some("r-stale".to_string()),
                fields: fields.clone(),
                sync_status: SyncStatus::Pending,
                is_local_only: false,
                last_sync_at: None,
                stamp: Stamp::new(10, "device-a"),
            }))
            .unwrap();
        fx.queue
            .enqueue(PendingChange::create("tasks", id, fields.to_value(), 10));

        let report = fx.run();
        assert_eq!(report.succeeded, 0);
        assert!(report.rebinds.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity_id, id);
        assert_eq!(report.failures[0].kind, SyncFailureKind::CorruptLocalState);
        assert_eq!(
            fx.document.get(id).unwrap().remote_id.as_deref(),
            Some("r-stale")
        );
    }

    #[test]
    fn rejected_payload_is_dropped_and_marked_failed() {
        let mut fx = Fixture::new(3);
        let id = fx.local_create("refused");
        fx.remote.fail_next(
            RemoteCallKind::Create,
            RemoteError::Rejected("title too spicy".to_string()),
        );
        let report = fx.run();

        assert_eq!(report.failures[0].kind, SyncFailureKind::Validation);
        assert_eq!(report.remote_calls, 1);
        assert!(fx.queue.is_empty());
        assert_eq!(fx.document.get(id).unwrap().status(), SyncStatus::Failed);
    }

    #[test]
    fn delete_of_missing_remote_entity_counts_as_success() {
        let mut fx = Fixture::new(3);
        let id = fx.local_create("short lived");
        fx.run();
        let remote_id = fx.document.get(id).unwrap().remote_id.clone();
        fx.remote.remove_remote(remote_id.as_deref().unwrap());
        fx.queue
            .enqueue(PendingChange::delete("tasks", id, remote_id, 40));
        fx.remote.clear_calls();

        let report = fx.run();
        assert!(!report.has_failures());
        assert!(fx.document.get(id).is_none());
        assert!(matches!(fx.remote.calls()[0], RemoteCall::Delete { .. }));
    }
}
