//! Snapshot persistence, one JSON document per file.
//!
//! ```text
//! ┌──────────────┐  capture()   ┌──────────────────┐  save()   ┌────────────────────┐
//! │ Document     │ ───────────► │ DocumentSnapshot │ ────────► │ <root>/<id>.json   │
//! │ (in memory)  │ ◄─────────── │ (serde)          │ ◄──────── │ FileStorage        │
//! └──────────────┘ into_document└──────────────────┘  load()   └────────────────────┘
//! ```
//!
//! Storage is injected wherever persistence is needed through the
//! [`DocumentStorage`] trait. A failed save leaves the in-memory document
//! untouched and editable.

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::AccessLevel;
use crate::document::Document;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Persisted form of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub language: String,
    pub owner_id: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub access: BTreeMap<String, AccessLevel>,
}

impl DocumentSnapshot {
    /// Capture `document`; `owner_name` is resolved by the caller.
    pub fn capture(document: &Document, owner_name: impl Into<String>) -> Self {
        Self {
            id: document.id().to_string(),
            title: document.title().to_string(),
            content: document.content().to_string(),
            language: document.language().to_string(),
            owner_id: document.owner_id().to_string(),
            owner_name: owner_name.into(),
            is_public: document.is_public(),
            access: document.collaborators().clone(),
        }
    }

    pub fn into_document(self) -> Document {
        Document::restore(
            self.id,
            self.title,
            self.owner_id,
            self.content,
            self.language,
            self.is_public,
            self.access,
        )
    }
}

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("document '{0}' not found")]
    NotFound(String),

    /// Ids become file names, so separators and dot-segments are rejected.
    #[error("invalid document id '{0}'")]
    InvalidId(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Load/save one snapshot per document id.
pub trait DocumentStorage: Send + Sync {
    fn save(&self, snapshot: &DocumentSnapshot) -> Result<(), StorageError>;

    fn load(&self, document_id: &str) -> Result<DocumentSnapshot, StorageError>;

    fn exists(&self, document_id: &str) -> bool;

    fn delete(&self, document_id: &str) -> Result<bool, StorageError>;

    /// Ids of every stored document.
    fn list(&self) -> Result<Vec<String>, StorageError>;
}

pub(crate) fn validate_id(document_id: &str) -> Result<(), StorageError> {
    let invalid = document_id.is_empty()
        || document_id == "."
        || document_id == ".."
        || document_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StorageError::InvalidId(document_id.to_string()));
    }
    Ok(())
}
