//! In-process collaboration: document registry plus an edit dispatch queue.
//!
//! The manager lets several local editor surfaces share one [`Document`]
//! without a network hop. Edits are queued FIFO and re-emitted as
//! [`ManagerEvent::ChangesSynchronized`]; operations whose document is no
//! longer active are dropped during the drain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::Receiver;
use std::sync::PoisonError;

use crate::document::SharedDocument;
use crate::edit::EditOperation;
use crate::error::{CollabError, Result};
use crate::events::EventBus;

/// Notifications emitted by [`CollaborationManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    DocumentJoined { document_id: String, user_id: String },
    DocumentLeft { document_id: String, user_id: String },
    ChangesSynchronized(EditOperation),
    CursorUpdated { document_id: String, user_id: String, position: usize },
    ChatMessageReceived { document_id: String, user_id: String, message: String },
}

/// One active document and the users viewing it.
#[derive(Debug)]
pub struct DocumentSession {
    pub document: SharedDocument,
    pub active_users: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct CollaborationManager {
    active_documents: HashMap<String, DocumentSession>,
    edit_queue: VecDeque<EditOperation>,
    events: EventBus<ManagerEvent>,
}

impl CollaborationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Register `user_id` as active on `document`, creating the session on
    /// first join. Joining twice is a no-op apart from the event.
    pub fn join_document(&mut self, document: SharedDocument, user_id: &str) {
        let document_id = document
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id()
            .to_string();

        self.active_documents
            .entry(document_id.clone())
            .or_insert_with(|| DocumentSession {
                document,
                active_users: HashSet::new(),
            })
            .active_users
            .insert(user_id.to_string());

        log::debug!("{user_id} joined local document {document_id}");
        self.events.emit(ManagerEvent::DocumentJoined {
            document_id,
            user_id: user_id.to_string(),
        });
    }

    /// Remove `user_id` from `document_id`. The session is dropped once its
    /// last user leaves.
    pub fn leave_document(&mut self, document_id: &str, user_id: &str) -> Result<()> {
        let session = self
            .active_documents
            .get_mut(document_id)
            .ok_or_else(|| {
                CollabError::NotFound(format!("document '{document_id}' is not active"))
            })?;

        session.active_users.remove(user_id);
        if session.active_users.is_empty() {
            self.active_documents.remove(document_id);
            log::debug!("Local document {document_id} closed");
        }

        self.events.emit(ManagerEvent::DocumentLeft {
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    /// Queue `op` and drain the queue. Returns how many operations were
    /// re-emitted.
    pub fn synchronize_changes(&mut self, op: EditOperation) -> usize {
        self.edit_queue.push_back(op);

        let mut synchronized = 0;
        while let Some(op) = self.edit_queue.pop_front() {
            if !self.active_documents.contains_key(&op.document_id) {
                log::trace!("Dropping edit for inactive document {}", op.document_id);
                continue;
            }
            self.events.emit(ManagerEvent::ChangesSynchronized(op));
            synchronized += 1;
        }
        synchronized
    }

    pub fn broadcast_cursor_position(&mut self, document_id: &str, user_id: &str, position: usize) {
        self.events.emit(ManagerEvent::CursorUpdated {
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            position,
        });
    }

    pub fn broadcast_chat_message(&mut self, document_id: &str, user_id: &str, message: &str) {
        self.events.emit(ManagerEvent::ChatMessageReceived {
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            message: message.to_string(),
        });
    }

    pub fn document(&self, document_id: &str) -> Option<SharedDocument> {
        self.active_documents.get(document_id).map(|s| s.document.clone())
    }

    pub fn active_users(&self, document_id: &str) -> Option<&HashSet<String>> {
        self.active_documents.get(document_id).map(|s| &s.active_users)
    }

    pub fn is_active(&self, document_id: &str) -> bool {
        self.active_documents.contains_key(document_id)
    }

    pub fn active_document_count(&self) -> usize {
        self.active_documents.len()
    }
}
