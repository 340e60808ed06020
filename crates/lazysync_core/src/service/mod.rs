//! Public facade services.
//!
//! # Responsibility
//! - Expose one generic sync engine per collection to host layers.
//! - Bind tasks, notes and snippets to the engine through thin adapters.

pub mod collections;
pub mod sync_engine;
