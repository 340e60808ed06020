//! Durable storage for sync state.
//!
//! # Responsibility
//! - Define the blob storage contract and its SQLite implementation.
//! - Provide the per-collection persistence adapter used by the engine.
//!
//! # Invariants
//! - Storage details never leak above the adapter; callers see typed values.
//! - Load never fails on corrupt data; it reports it.

pub mod blob_repo;
pub mod persistence;
