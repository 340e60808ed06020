//! Namespaced blob storage contracts and SQLite implementation.
//!
//! # Responsibility
//! - Store opaque document/queue blobs under string keys.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Writes are upserts; a key holds exactly one blob.
//! - Repositories refuse connections whose migrations were not applied.

use crate::db::migrations::{current_user_version, latest_version};
use crate::db::{DbError, SharedConnection};
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

pub type RepoResult<T> = Result<T, RepoError>;

/// Persistence error for blob reads and writes.
#[derive(Debug)]
pub enum RepoError {
    Db(DbError),
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    Encode(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "connection schema version {actual_version} does not match expected {expected_version}"
            ),
            Self::MissingRequiredTable(table) => write!(f, "required table `{table}` is missing"),
            Self::Encode(message) => write!(f, "failed to encode blob: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Key/blob storage used by the persistence adapter.
pub trait BlobStore: Send {
    fn read_blob(&self, key: &str) -> RepoResult<Option<Vec<u8>>>;
    fn write_blob(&self, key: &str, payload: &[u8]) -> RepoResult<()>;
    fn delete_blob(&self, key: &str) -> RepoResult<()>;
}

/// SQLite-backed blob store over a shared connection.
#[derive(Clone)]
pub struct SqliteBlobStore {
    conn: SharedConnection,
}

impl SqliteBlobStore {
    /// Wraps a migrated connection owned by this store alone.
    pub fn try_new(conn: Connection) -> RepoResult<Self> {
        Self::try_shared(Arc::new(Mutex::new(conn)))
    }

    /// Wraps a migrated connection shared with other stores.
    pub fn try_shared(conn: SharedConnection) -> RepoResult<Self> {
        {
            let guard = lock(&conn)?;
            ensure_connection_ready(&guard)?;
        }
        Ok(Self { conn })
    }

    /// Returns the underlying shared handle.
    pub fn connection(&self) -> SharedConnection {
        Arc::clone(&self.conn)
    }
}

impl BlobStore for SqliteBlobStore {
    fn read_blob(&self, key: &str) -> RepoResult<Option<Vec<u8>>> {
        let conn = lock(&self.conn)?;
        let payload = conn
            .query_row(
                "SELECT payload FROM sync_blobs WHERE key = ?1;",
                [key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(payload)
    }

    fn write_blob(&self, key: &str, payload: &[u8]) -> RepoResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO sync_blobs (key, payload, updated_at)
             VALUES (?1, ?2, (strftime('%s', 'now') * 1000))
             ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at;",
            params![key, payload],
        )?;
        Ok(())
    }

    fn delete_blob(&self, key: &str) -> RepoResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute("DELETE FROM sync_blobs WHERE key = ?1;", [key])?;
        Ok(())
    }
}

fn lock(conn: &SharedConnection) -> RepoResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| RepoError::Db(DbError::LockPoisoned))
}

fn ensure_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version = current_user_version(conn)?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    let table_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sync_blobs');",
        [],
        |row| row.get(0),
    )?;
    if !table_exists {
        return Err(RepoError::MissingRequiredTable("sync_blobs"));
    }
    Ok(())
}
