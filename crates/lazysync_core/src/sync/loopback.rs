//! In-process remote store.
//!
//! Backs the CLI smoke run and tests. Keeps entities in memory, records every
//! call, and can be scripted to fail upcoming calls.

use crate::clock::Clock;
use crate::model::entity::{CollectionPayload, EntityId, RemoteId};
use crate::sync::remote::{RemoteCollection, RemoteCreate, RemoteEntity, RemoteError, RemoteResult};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Remote operation selector for scripted failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCallKind {
    FetchSnapshot,
    Create,
    Update,
    Delete,
}

/// One recorded remote call. Payloads are kept as JSON for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    FetchSnapshot { owner_id: String },
    Create { client_id: EntityId, payload: Value },
    Update { remote_id: RemoteId, payload: Value },
    Delete { remote_id: RemoteId },
}

impl RemoteCall {
    pub fn kind(&self) -> RemoteCallKind {
        match self {
            Self::FetchSnapshot { .. } => RemoteCallKind::FetchSnapshot,
            Self::Create { .. } => RemoteCallKind::Create,
            Self::Update { .. } => RemoteCallKind::Update,
            Self::Delete { .. } => RemoteCallKind::Delete,
        }
    }
}

#[derive(Debug)]
struct ScriptedFailure {
    kind: RemoteCallKind,
    error: RemoteError,
    /// Apply the call before failing, as when a response is lost in transit.
    commit: bool,
}

struct LoopbackState<P> {
    entities: BTreeMap<RemoteId, RemoteEntity<P>>,
    next_seq: u64,
    calls: Vec<RemoteCall>,
    scripted: VecDeque<ScriptedFailure>,
}

impl<P> LoopbackState<P> {
    fn take_failure(&mut self, kind: RemoteCallKind) -> Option<ScriptedFailure> {
        let index = self.scripted.iter().position(|failure| failure.kind == kind)?;
        self.scripted.remove(index)
    }

    fn next_remote_id(&mut self, collection: &str) -> RemoteId {
        self.next_seq += 1;
        format!("{collection}-{:06}", self.next_seq)
    }
}

/// Shared in-memory remote collection. Clones observe the same state.
pub struct LoopbackRemote<P> {
    state: Arc<Mutex<LoopbackState<P>>>,
    clock: Arc<dyn Clock>,
}

impl<P> Clone for LoopbackRemote<P> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<P: CollectionPayload> LoopbackRemote<P> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LoopbackState {
                entities: BTreeMap::new(),
                next_seq: 0,
                calls: Vec::new(),
                scripted: VecDeque::new(),
            })),
            clock,
        }
    }

    /// Fails the next call of `kind` with `error` without applying it.
    pub fn fail_next(&self, kind: RemoteCallKind, error: RemoteError) {
        self.script(kind, error, false);
    }

    /// Applies the next call of `kind`, then reports `error` to the caller.
    pub fn fail_next_after_commit(&self, kind: RemoteCallKind, error: RemoteError) {
        self.script(kind, error, true);
    }

    /// Adds an entity as if another replica created it.
    pub fn insert_remote(&self, owner_id: &str, payload: P) -> RemoteId {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        let remote_id = state.next_remote_id(P::COLLECTION);
        state.entities.insert(
            remote_id.clone(),
            RemoteEntity {
                remote_id: remote_id.clone(),
                client_id: None,
                owner_id: owner_id.to_string(),
                payload,
                created_at: now,
                updated_at: now,
            },
        );
        remote_id
    }

    /// Edits an entity as if another replica updated it.
    pub fn update_remote(&self, remote_id: &str, payload: P) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.lock();
        match state.entities.get_mut(remote_id) {
            Some(entity) => {
                entity.payload = payload;
                entity.updated_at = now;
                true
            }
            None => false,
        }
    }

    /// Deletes an entity as if another replica removed it.
    pub fn remove_remote(&self, remote_id: &str) -> bool {
        self.lock().entities.remove(remote_id).is_some()
    }

    pub fn entities(&self) -> Vec<RemoteEntity<P>> {
        self.lock().entities.values().cloned().collect()
    }

    pub fn entity(&self, remote_id: &str) -> Option<RemoteEntity<P>> {
        self.lock().entities.get(remote_id).cloned()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, kind: RemoteCallKind) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.kind() == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn script(&self, kind: RemoteCallKind, error: RemoteError, commit: bool) {
        self.lock()
            .scripted
            .push_back(ScriptedFailure { kind, error, commit });
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `call`, consults the script, then runs `apply`.
    fn invoke<T>(
        &self,
        call: RemoteCall,
        apply: impl FnOnce(&mut LoopbackState<P>) -> RemoteResult<T>,
    ) -> RemoteResult<T> {
        let mut state = self.lock();
        let kind = call.kind();
        state.calls.push(call);
        match state.take_failure(kind) {
            Some(failure) if failure.commit => {
                let _ = apply(&mut *state);
                Err(failure.error)
            }
            Some(failure) => Err(failure.error),
            None => apply(&mut *state),
        }
    }
}

fn to_json<P: CollectionPayload>(payload: &P) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

impl<P: CollectionPayload> RemoteCollection<P> for LoopbackRemote<P> {
    fn fetch_snapshot(&self, owner_id: &str) -> RemoteResult<Vec<RemoteEntity<P>>> {
        let call = RemoteCall::FetchSnapshot {
            owner_id: owner_id.to_string(),
        };
        self.invoke(call, |state| {
            Ok(state
                .entities
                .values()
                .filter(|entity| entity.owner_id == owner_id)
                .cloned()
                .collect())
        })
    }

    fn create(&self, request: RemoteCreate<P>) -> RemoteResult<RemoteId> {
        let now = self.clock.now_ms();
        let call = RemoteCall::Create {
            client_id: request.client_id,
            payload: to_json(&request.payload),
        };
        self.invoke(call, move |state| {
            let existing = state
                .entities
                .values()
                .find(|entity| entity.client_id == Some(request.client_id));
            if let Some(existing) = existing {
                return Err(RemoteError::AlreadyExists {
                    remote_id: existing.remote_id.clone(),
                });
            }

            let remote_id = state.next_remote_id(P::COLLECTION);
            state.entities.insert(
                remote_id.clone(),
                RemoteEntity {
                    remote_id: remote_id.clone(),
                    client_id: Some(request.client_id),
                    owner_id: request.owner_id,
                    payload: request.payload,
                    created_at: now,
                    updated_at: now,
                },
            );
            Ok(remote_id)
        })
    }

    fn update(&self, remote_id: &str, payload: &P) -> RemoteResult<()> {
        let now = self.clock.now_ms();
        let call = RemoteCall::Update {
            remote_id: remote_id.to_string(),
            payload: to_json(payload),
        };
        self.invoke(call, |state| match state.entities.get_mut(remote_id) {
            Some(entity) => {
                entity.payload = payload.clone();
                entity.updated_at = now;
                Ok(())
            }
            None => Err(RemoteError::NotFound(remote_id.to_string())),
        })
    }

    fn delete(&self, remote_id: &str) -> RemoteResult<()> {
        let call = RemoteCall::Delete {
            remote_id: remote_id.to_string(),
        };
        self.invoke(call, |state| match state.entities.remove(remote_id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(remote_id.to_string())),
        })
    }
}
