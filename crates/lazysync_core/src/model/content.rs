//! Payload shapes for the task, note and snippet collections.
//!
//! # Responsibility
//! - Define collection-specific fields carried by synchronized entities.
//! - Provide tag normalization shared by every collection.
//!
//! # Invariants
//! - Tags are trimmed, lowercased, whitespace-collapsed and deduplicated.
//! - Titles are never empty after normalization.

use crate::model::entity::PayloadValidationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

const MAX_TITLE_CHARS: usize = 500;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not started.
    #[default]
    Todo,
    /// Work is in progress.
    InProgress,
    /// Completed successfully.
    Done,
    /// No longer actionable.
    Cancelled,
}

impl TaskStatus {
    /// Status reached by a single toggle.
    ///
    /// Open work toggles to `Done`; finished or cancelled work re-opens.
    pub fn toggled(self) -> Self {
        match self {
            Self::Todo | Self::InProgress => Self::Done,
            Self::Done | Self::Cancelled => Self::Todo,
        }
    }
}

/// Actionable task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub title: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Unix epoch milliseconds.
    #[serde(default)]
    pub due_at: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            notes: String::new(),
            status: TaskStatus::Todo,
            due_at: None,
            tags: Vec::new(),
        }
    }
}

/// Free-form markdown note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Note {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            archived: false,
            tags: Vec::new(),
        }
    }
}

/// Stored code snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snippet {
    pub title: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Snippet {
    pub fn new(
        title: impl Into<String>,
        language: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            language: language.into(),
            code: code.into(),
            archived: false,
            tags: Vec::new(),
        }
    }
}

/// Normalizes one tag, returning `None` for blank input.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let collapsed = WHITESPACE_RE.replace_all(tag.trim(), " ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed.to_lowercase())
    }
}

/// Normalizes, deduplicates and sorts tag values.
pub fn normalize_tags(tags: &[String]) -> Vec<String> {
    let unique: BTreeSet<String> = tags.iter().filter_map(|tag| normalize_tag(tag)).collect();
    unique.into_iter().collect()
}

pub(crate) fn normalize_title(title: &str) -> String {
    WHITESPACE_RE.replace_all(title.trim(), " ").into_owned()
}

pub(crate) fn validate_title(title: &str) -> Result<(), PayloadValidationError> {
    if title.trim().is_empty() {
        return Err(PayloadValidationError::new("title", "must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(PayloadValidationError::new(
            "title",
            format!("must be at most {MAX_TITLE_CHARS} characters"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{normalize_tag, normalize_tags, normalize_title, validate_title, TaskStatus};

    #[test]
    fn normalize_tag_collapses_whitespace_and_lowercases() {
        assert_eq!(
            normalize_tag("  Deep   Work ").as_deref(),
            Some("deep work")
        );
        assert_eq!(normalize_tag("   "), None);
    }

    #[test]
    fn normalize_tags_deduplicates_and_sorts() {
        let tags = vec![
            "Work".to_string(),
            "home".to_string(),
            "work ".to_string(),
            "".to_string(),
        ];
        assert_eq!(normalize_tags(&tags), vec!["home", "work"]);
    }

    #[test]
    fn task_status_toggle_round_trips_open_work() {
        assert_eq!(TaskStatus::Todo.toggled(), TaskStatus::Done);
        assert_eq!(TaskStatus::Done.toggled(), TaskStatus::Todo);
        assert_eq!(TaskStatus::InProgress.toggled(), TaskStatus::Done);
        assert_eq!(TaskStatus::Cancelled.toggled(), TaskStatus::Todo);
    }

    #[test]
    fn title_rules() {
        assert_eq!(normalize_title("  a \n b "), "a b");
        assert!(validate_title(" ").is_err());
        assert!(validate_title(&"x".repeat(501)).is_err());
        assert!(validate_title("ok").is_ok());
    }
}
