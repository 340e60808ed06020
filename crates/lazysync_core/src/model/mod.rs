//! Domain model for synchronized collections.
//!
//! # Responsibility
//! - Define the typed entity view and per-collection payload shapes.
//! - Define queued change records consumed by replay.
//!
//! # Invariants
//! - Every entity is identified by a stable local `EntityId`.
//! - Deletion is a document tombstone until the remote store confirms it.

pub mod change;
pub mod content;
pub mod entity;
