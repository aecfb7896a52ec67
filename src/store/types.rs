//! Records exchanged between the store, the notifier, and viewers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content_type;

/// One file currently present in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    /// Unique on-disk name, also the identifier clients use.
    pub storage_name: String,
    /// Name the uploading client gave the file.
    pub display_name: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
    pub content_type: String,
    pub is_image: bool,
    #[serde(rename = "isPDF")]
    pub is_pdf: bool,
}

impl StoredFile {
    pub fn new(
        storage_name: impl Into<String>,
        display_name: impl Into<String>,
        size_bytes: u64,
        modified_at: DateTime<Utc>,
        content_type: impl Into<String>,
    ) -> Self {
        let content_type = content_type.into();
        Self {
            storage_name: storage_name.into(),
            display_name: display_name.into(),
            size_bytes,
            modified_at,
            is_image: content_type::is_image(&content_type),
            is_pdf: content_type::is_pdf(&content_type),
            content_type,
        }
    }
}

/// Kind of mutation a [`ChangeEvent`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Upload,
    Delete,
}

/// A committed mutation of the store, referencing files by storage name only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    pub affected: Vec<String>,
}

impl ChangeEvent {
    pub fn upload(affected: Vec<String>) -> Self {
        Self {
            action: ChangeAction::Upload,
            affected,
        }
    }

    pub fn delete(storage_name: impl Into<String>) -> Self {
        Self {
            action: ChangeAction::Delete,
            affected: vec![storage_name.into()],
        }
    }
}
