//! Synchronization pipeline: queue, connection state, replay, reconciliation.
//!
//! # Responsibility
//! - Own everything between the local document and the remote collection.
//! - Keep remote I/O behind the `RemoteCollection` seam.

pub mod connection;
pub mod loopback;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod replay;
