//! Offline-first sync core.
//!
//! Keeps task, note and snippet collections in mergeable local documents,
//! queues unacknowledged edits durably, and reconciles with a remote store
//! once connectivity returns.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use error::{EngineError, EngineResult, SyncFailure, SyncFailureKind};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::content::{Note, Snippet, Task, TaskStatus};
pub use model::entity::{CollectionPayload, Entity, EntityId, RemoteId, SyncStatus};
pub use repo::blob_repo::{BlobStore, RepoError, RepoResult, SqliteBlobStore};
pub use service::collections::{NoteEngine, SnippetEngine, TaskEngine};
pub use service::sync_engine::{
    CycleReport, EngineEvent, SkipReason, SubscriptionId, SyncEngine, SyncOutcome, SyncStatusView,
};
pub use store::document::{merge, ReplicatedDocument};
pub use sync::connection::ConnectionState;
pub use sync::loopback::LoopbackRemote;
pub use sync::remote::{RemoteCollection, RemoteCreate, RemoteEntity, RemoteError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
