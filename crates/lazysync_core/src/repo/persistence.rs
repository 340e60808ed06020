//! Persistence adapter for one collection's document and queue.
//!
//! # Responsibility
//! - Serialize the replicated document and pending queue into namespaced
//!   blobs and load them back.
//! - Debounce writes and guarantee a final flush on teardown.
//!
//! # Invariants
//! - Missing or corrupt blobs load as empty values; corruption is reported
//!   through `Loaded::corrupt` and logged, never returned as an error.
//! - Document and queue blobs are written independently.
//! - Dropping the adapter flushes every pending write.

use crate::logging::sanitize_message;
use crate::repo::blob_repo::{BlobStore, RepoError, RepoResult};
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Which of the two per-collection blobs a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlobSlot {
    Document,
    Queue,
}

impl BlobSlot {
    fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Queue => "queue",
        }
    }
}

/// Storage keys for one collection, `{namespace}/{collection}/{slot}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    document: String,
    queue: String,
}

impl StorageKeys {
    pub fn new(namespace: &str, collection: &str) -> Self {
        Self {
            document: format!("{namespace}/{collection}/{}", BlobSlot::Document.as_str()),
            queue: format!("{namespace}/{collection}/{}", BlobSlot::Queue.as_str()),
        }
    }

    pub fn key(&self, slot: BlobSlot) -> &str {
        match slot {
            BlobSlot::Document => &self.document,
            BlobSlot::Queue => &self.queue,
        }
    }
}

/// Result of loading one blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub value: T,
    /// The stored bytes existed but could not be decoded.
    pub corrupt: bool,
}

/// Debounced writer over a [`BlobStore`].
pub struct PersistenceAdapter {
    store: Box<dyn BlobStore>,
    keys: StorageKeys,
    debounce_ms: i64,
    last_write_at: Option<i64>,
    pending_document: Option<Vec<u8>>,
    pending_queue: Option<Vec<u8>>,
}

impl PersistenceAdapter {
    pub fn new(store: Box<dyn BlobStore>, keys: StorageKeys, debounce_ms: u64) -> Self {
        Self {
            store,
            keys,
            debounce_ms: i64::try_from(debounce_ms).unwrap_or(i64::MAX),
            last_write_at: None,
            pending_document: None,
            pending_queue: None,
        }
    }

    pub fn keys(&self) -> &StorageKeys {
        &self.keys
    }

    /// Loads one slot, falling back to `T::default()`.
    ///
    /// # Errors
    /// - Returns storage transport errors; decode failures are not errors.
    pub fn load<T>(&self, slot: BlobSlot) -> RepoResult<Loaded<T>>
    where
        T: DeserializeOwned + Default,
    {
        let key = self.keys.key(slot);
        let Some(bytes) = self.store.read_blob(key)? else {
            return Ok(Loaded {
                value: T::default(),
                corrupt: false,
            });
        };

        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => Ok(Loaded {
                value,
                corrupt: false,
            }),
            Err(err) => {
                warn!(
                    "event=blob_load module=persistence status=corrupt slot={} key={} bytes={} error={}",
                    slot.as_str(),
                    key,
                    bytes.len(),
                    sanitize_message(&err.to_string(), 120)
                );
                Ok(Loaded {
                    value: T::default(),
                    corrupt: true,
                })
            }
        }
    }

    /// Stages `value` for `slot` and writes it unless the debounce window is
    /// still open.
    pub fn save<T: Serialize>(&mut self, slot: BlobSlot, value: &T, now: i64) -> RepoResult<()> {
        self.stage(slot, value)?;
        self.commit(now)?;
        Ok(())
    }

    /// Serializes `value` into the staging slot without writing it.
    pub fn stage<T: Serialize>(&mut self, slot: BlobSlot, value: &T) -> RepoResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|err| RepoError::Encode(err.to_string()))?;
        match slot {
            BlobSlot::Document => self.pending_document = Some(bytes),
            BlobSlot::Queue => self.pending_queue = Some(bytes),
        }
        Ok(())
    }

    /// Writes every staged slot if the debounce window allows it.
    ///
    /// Returns whether a write happened. One window covers all slots staged
    /// before the call.
    pub fn commit(&mut self, now: i64) -> RepoResult<bool> {
        if !self.has_pending_writes() || !self.write_due(now) {
            return Ok(false);
        }
        self.flush()?;
        self.last_write_at = Some(now);
        Ok(true)
    }

    /// Returns whether any staged write has not reached storage yet.
    pub fn has_pending_writes(&self) -> bool {
        self.pending_document.is_some() || self.pending_queue.is_some()
    }

    /// Writes every staged blob.
    ///
    /// A blob stays staged when its write fails so a later flush retries it.
    pub fn flush(&mut self) -> RepoResult<()> {
        if let Some(bytes) = self.pending_document.take() {
            if let Err(err) = self.store.write_blob(self.keys.key(BlobSlot::Document), &bytes) {
                self.pending_document = Some(bytes);
                return Err(err);
            }
        }
        if let Some(bytes) = self.pending_queue.take() {
            if let Err(err) = self.store.write_blob(self.keys.key(BlobSlot::Queue), &bytes) {
                self.pending_queue = Some(bytes);
                return Err(err);
            }
        }
        Ok(())
    }

    fn write_due(&self, now: i64) -> bool {
        match self.last_write_at {
            _ if self.debounce_ms == 0 => true,
            None => true,
            Some(last) => now.saturating_sub(last) >= self.debounce_ms,
        }
    }
}

impl Drop for PersistenceAdapter {
    fn drop(&mut self) {
        if !self.has_pending_writes() {
            return;
        }
        if let Err(err) = self.flush() {
            error!(
                "event=persist_flush module=persistence status=error phase=teardown key={} error={}",
                self.keys.key(BlobSlot::Document),
                err
            );
        }
    }
}
