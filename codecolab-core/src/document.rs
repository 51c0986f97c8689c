//! Collaborative document: content, access table and version history.
//!
//! Every content mutation flows through [`Document::apply_edit`], which is
//! gated on the editor holding [`AccessLevel::Edit`]. Whole-content
//! replacement is the special case `position = 0`,
//! `deletion_length = len(old content)`.
//!
//! The owner always resolves to `Edit` and never appears in the access
//! table.

use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::AccessLevel;
use crate::edit::{apply_patch, CursorRemap, EditOperation};
use crate::error::{CollabError, Result};
use crate::events::EventBus;

/// Successful edits between automatic version snapshots.
pub const AUTO_SAVE_INTERVAL: u64 = 10;

/// Versions kept per document; the oldest are dropped first.
pub const MAX_VERSIONS: usize = 50;

const DEFAULT_LANGUAGE: &str = "Plain";

/// Document shared between the local manager and editor surfaces.
pub type SharedDocument = Arc<RwLock<Document>>;

/// Point-in-time copy of a document's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentVersion {
    pub content: String,
    pub editor_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

/// Notifications emitted by a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEvent {
    ContentChanged { content: String, editor_id: Option<String> },
    TitleChanged(String),
    LanguageChanged(String),
    PublicAccessChanged(bool),
    CollaboratorAdded { user_id: String, level: AccessLevel },
    CollaboratorRemoved { user_id: String },
    VersionSaved { index: usize, description: String },
}

#[derive(Debug)]
pub struct Document {
    id: String,
    title: String,
    content: String,
    language: String,
    owner_id: String,
    last_modified: DateTime<Utc>,
    is_public: bool,
    access: BTreeMap<String, AccessLevel>,
    versions: Vec<DocumentVersion>,
    edits_since_version: u64,
    events: EventBus<DocumentEvent>,
}

impl Document {
    /// New empty document owned by `owner_id`. Records the initial version.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        let mut doc = Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            language: DEFAULT_LANGUAGE.to_string(),
            owner_id: owner_id.into(),
            last_modified: Utc::now(),
            is_public: false,
            access: BTreeMap::new(),
            versions: Vec::new(),
            edits_since_version: 0,
            events: EventBus::new(),
        };
        let owner = doc.owner_id.clone();
        doc.push_version(&owner, "Initial document creation");
        doc
    }

    /// Rebuild a document from persisted fields.
    ///
    /// Entries naming the owner are ignored. History restarts with a single
    /// "Loaded from storage" version.
    pub fn restore(
        id: impl Into<String>,
        title: impl Into<String>,
        owner_id: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
        is_public: bool,
        access: impl IntoIterator<Item = (String, AccessLevel)>,
    ) -> Self {
        let mut doc = Self::new(id, title, owner_id);
        doc.content = content.into();
        doc.language = language.into();
        doc.is_public = is_public;
        for (user_id, level) in access {
            if user_id != doc.owner_id {
                doc.access.insert(user_id, level);
            }
        }
        doc.versions.clear();
        let owner = doc.owner_id.clone();
        doc.push_version(&owner, "Loaded from storage");
        doc
    }

    pub fn into_shared(self) -> SharedDocument {
        Arc::new(RwLock::new(self))
    }

    pub fn subscribe(&mut self) -> Receiver<DocumentEvent> {
        self.events.subscribe()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn is_public(&self) -> bool {
        self.is_public
    }

    /// Explicit access table entries. The owner is never listed.
    pub fn collaborators(&self) -> &BTreeMap<String, AccessLevel> {
        &self.access
    }

    pub fn version_history(&self) -> &[DocumentVersion] {
        &self.versions
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        let title = title.into();
        if self.title != title {
            self.title = title.clone();
            self.events.emit(DocumentEvent::TitleChanged(title));
        }
    }

    pub fn set_language(&mut self, language: impl Into<String>) {
        let language = language.into();
        if self.language != language {
            self.language = language.clone();
            self.events.emit(DocumentEvent::LanguageChanged(language));
        }
    }

    // ─── Access control ──────────────────────────────────────────────

    /// Effective access for `user_id`, first match wins: owner → `Edit`;
    /// public document → `ReadOnly`; access table entry; `None`.
    ///
    /// Publishing a document therefore makes it read-only for everyone but
    /// the owner, table entries included.
    pub fn access_level(&self, user_id: &str) -> AccessLevel {
        if user_id == self.owner_id {
            AccessLevel::Edit
        } else if self.is_public {
            AccessLevel::ReadOnly
        } else {
            self.access.get(user_id).copied().unwrap_or_default()
        }
    }

    pub fn has_edit_permission(&self, user_id: &str) -> bool {
        self.access_level(user_id).can_edit()
    }

    /// Grant `level` to `user_id`, replacing any previous entry.
    ///
    /// Does not check who is asking; see [`Document::share_as`].
    pub fn share_with(&mut self, user_id: impl Into<String>, level: AccessLevel) -> Result<()> {
        let user_id = user_id.into();
        self.reject_owner(&user_id)?;
        self.access.insert(user_id.clone(), level);
        self.events.emit(DocumentEvent::CollaboratorAdded { user_id, level });
        Ok(())
    }

    /// Remove `user_id` from the access table. Returns whether an entry
    /// existed.
    pub fn revoke_access(&mut self, user_id: &str) -> Result<bool> {
        self.reject_owner(user_id)?;
        let existed = self.access.remove(user_id).is_some();
        if existed {
            self.events.emit(DocumentEvent::CollaboratorRemoved { user_id: user_id.to_string() });
        }
        Ok(existed)
    }

    /// Toggle public read access. Callers restrict this to the owner.
    pub fn set_public_access(&mut self, is_public: bool) {
        if self.is_public != is_public {
            self.is_public = is_public;
            self.events.emit(DocumentEvent::PublicAccessChanged(is_public));
        }
    }

    /// Owner-gated [`Document::share_with`].
    pub fn share_as(
        &mut self,
        actor_id: &str,
        user_id: impl Into<String>,
        level: AccessLevel,
    ) -> Result<()> {
        self.require_owner(actor_id)?;
        self.share_with(user_id, level)
    }

    /// Owner-gated [`Document::revoke_access`].
    pub fn revoke_as(&mut self, actor_id: &str, user_id: &str) -> Result<bool> {
        self.require_owner(actor_id)?;
        self.revoke_access(user_id)
    }

    /// Owner-gated [`Document::set_public_access`].
    pub fn set_public_access_as(&mut self, actor_id: &str, is_public: bool) -> Result<()> {
        self.require_owner(actor_id)?;
        self.set_public_access(is_public);
        Ok(())
    }

    fn reject_owner(&self, user_id: &str) -> Result<()> {
        if user_id == self.owner_id {
            return Err(CollabError::OwnerAccess { document_id: self.id.clone() });
        }
        Ok(())
    }

    fn require_owner(&self, actor_id: &str) -> Result<()> {
        if actor_id != self.owner_id {
            return Err(self.denied(actor_id, AccessLevel::Edit));
        }
        Ok(())
    }

    fn require_edit(&self, user_id: &str) -> Result<()> {
        if !self.has_edit_permission(user_id) {
            return Err(self.denied(user_id, AccessLevel::Edit));
        }
        Ok(())
    }

    fn denied(&self, user_id: &str, required: AccessLevel) -> CollabError {
        CollabError::PermissionDenied {
            user_id: user_id.to_string(),
            document_id: self.id.clone(),
            required,
        }
    }

    // ─── Content mutation ────────────────────────────────────────────

    /// Apply a positional patch on behalf of `op.user_id`.
    ///
    /// On failure the document is unchanged. Every
    /// [`AUTO_SAVE_INTERVAL`]th successful edit records an "Auto-saved"
    /// version.
    pub fn apply_edit(&mut self, op: &EditOperation) -> Result<CursorRemap> {
        self.require_edit(&op.user_id)?;
        let outcome = apply_patch(&self.content, op)?;

        if outcome.content != self.content {
            self.content = outcome.content;
            self.last_modified = Utc::now();
            self.events.emit(DocumentEvent::ContentChanged {
                content: self.content.clone(),
                editor_id: Some(op.user_id.clone()),
            });
        }

        self.edits_since_version += 1;
        if self.edits_since_version >= AUTO_SAVE_INTERVAL {
            self.push_version(&op.user_id, "Auto-saved");
        }
        Ok(outcome.remap)
    }

    /// Replace the whole content.
    pub fn edit_content(&mut self, new_content: impl Into<String>, editor_id: &str) -> Result<()> {
        let op = EditOperation::replace_all(editor_id, self.id.clone(), &self.content, new_content);
        self.apply_edit(&op).map(|_| ())
    }

    /// Insert `delta` at `position`.
    pub fn update_content(
        &mut self,
        delta: impl Into<String>,
        position: usize,
        editor_id: &str,
    ) -> Result<()> {
        let op = EditOperation::insert(editor_id, self.id.clone(), position, delta);
        self.apply_edit(&op).map(|_| ())
    }

    // ─── Version history ─────────────────────────────────────────────

    /// Append a snapshot of the current content. Requires `Edit`.
    pub fn save_version(&mut self, description: impl Into<String>, user_id: &str) -> Result<usize> {
        self.require_edit(user_id)?;
        Ok(self.push_version(user_id, description))
    }

    /// Replace content with version `index` verbatim.
    ///
    /// Does not check permission; callers gate this.
    pub fn restore_version(&mut self, index: usize) -> Result<()> {
        let version = self.versions.get(index).ok_or(CollabError::IndexError {
            index,
            len: self.versions.len(),
        })?;
        self.content = version.content.clone();
        self.last_modified = Utc::now();
        self.events.emit(DocumentEvent::ContentChanged {
            content: self.content.clone(),
            editor_id: None,
        });
        Ok(())
    }

    fn push_version(&mut self, editor_id: &str, description: impl Into<String>) -> usize {
        let description = description.into();
        self.versions.push(DocumentVersion {
            content: self.content.clone(),
            editor_id: editor_id.to_string(),
            timestamp: Utc::now(),
            description: description.clone(),
        });
        self.edits_since_version = 0;
        if self.versions.len() > MAX_VERSIONS {
            let excess = self.versions.len() - MAX_VERSIONS;
            self.versions.drain(..excess);
        }
        let index = self.versions.len() - 1;
        self.events.emit(DocumentEvent::VersionSaved { index, description });
        index
    }
}
