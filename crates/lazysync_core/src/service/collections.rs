//! Collection adapters for tasks, notes and snippets.
//!
//! Each adapter binds a payload type to its collection name, normalization,
//! validation and toggle behavior. The engine itself is shared.

use crate::model::content::{normalize_tags, normalize_title, validate_title, Note, Snippet, Task};
use crate::model::entity::{CollectionPayload, PayloadValidationError};
use crate::service::sync_engine::SyncEngine;

const MAX_LANGUAGE_CHARS: usize = 64;

impl CollectionPayload for Task {
    const COLLECTION: &'static str = "tasks";
    const SET_FIELDS: &'static [&'static str] = &["tags"];

    fn normalize(&mut self) {
        self.title = normalize_title(&self.title);
        self.tags = normalize_tags(&self.tags);
    }

    fn validate(&self) -> Result<(), PayloadValidationError> {
        validate_title(&self.title)?;
        if matches!(self.due_at, Some(due_at) if due_at < 0) {
            return Err(PayloadValidationError::new(
                "due_at",
                "must be a non-negative epoch timestamp",
            ));
        }
        Ok(())
    }

    fn toggle_status(&mut self) -> bool {
        self.status = self.status.toggled();
        true
    }
}

impl CollectionPayload for Note {
    const COLLECTION: &'static str = "notes";
    const SET_FIELDS: &'static [&'static str] = &["tags"];

    fn normalize(&mut self) {
        self.title = normalize_title(&self.title);
        self.tags = normalize_tags(&self.tags);
    }

    fn validate(&self) -> Result<(), PayloadValidationError> {
        validate_title(&self.title)
    }

    fn toggle_status(&mut self) -> bool {
        self.archived = !self.archived;
        true
    }
}

impl CollectionPayload for Snippet {
    const COLLECTION: &'static str = "snippets";
    const SET_FIELDS: &'static [&'static str] = &["tags"];

    fn normalize(&mut self) {
        self.title = normalize_title(&self.title);
        self.language = self.language.trim().to_ascii_lowercase();
        self.tags = normalize_tags(&self.tags);
    }

    fn validate(&self) -> Result<(), PayloadValidationError> {
        validate_title(&self.title)?;
        if self.language.chars().count() > MAX_LANGUAGE_CHARS {
            return Err(PayloadValidationError::new(
                "language",
                format!("must be at most {MAX_LANGUAGE_CHARS} characters"),
            ));
        }
        Ok(())
    }

    fn toggle_status(&mut self) -> bool {
        self.archived = !self.archived;
        true
    }
}

pub type TaskEngine<R> = SyncEngine<Task, R>;
pub type NoteEngine<R> = SyncEngine<Note, R>;
pub type SnippetEngine<R> = SyncEngine<Snippet, R>;
