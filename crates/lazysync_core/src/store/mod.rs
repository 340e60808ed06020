//! Local replicated store.
//!
//! # Responsibility
//! - Keep one collection's entities in a mergeable document.
//! - Convert typed payloads into register/set fields and back.
//!
//! # Invariants
//! - All document writes go through `DocumentMutation`.
//! - Merge never loses a record present in either input.

use crate::model::entity::EntityId;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod document;
pub mod fields;
pub mod register;

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Document mutation and codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    UnknownEntity(EntityId),
    RemoteIdConflict {
        id: EntityId,
        bound: String,
        incoming: String,
    },
    InvalidSetField(String),
    Encode(String),
    Decode(String),
}

impl Display for DocumentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity(id) => write!(f, "entity not found in document: {id}"),
            Self::RemoteIdConflict {
                id,
                bound,
                incoming,
            } => write!(
                f,
                "entity {id} is already bound to remote id `{bound}`; refusing `{incoming}`"
            ),
            Self::InvalidSetField(field) => {
                write!(f, "set field `{field}` must be an array of strings")
            }
            Self::Encode(message) => write!(f, "failed to encode document data: {message}"),
            Self::Decode(message) => write!(f, "failed to decode document data: {message}"),
        }
    }
}

impl Error for DocumentError {}
