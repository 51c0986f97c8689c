//! # codecolab-core: Document model for CodeColab
//!
//! Shared documents with per-user access control, version history and a
//! positional patch algorithm. Nothing in this crate touches the network;
//! the relay and client live in `codecolab-sync`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  EditOperation  ┌──────────────┐  DocumentEvent
//! │ Editor       │ ──────────────► │ Document     │ ──────────────► subscribers
//! │ surface      │                 │ (access-     │
//! └──────┬───────┘                 │  gated)      │
//!        │                         └──────┬───────┘
//!        │ synchronize_changes            │ capture / into_document
//!        ▼                                ▼
//! ┌──────────────────────┐         ┌──────────────┐
//! │ CollaborationManager │         │ Document-    │
//! │ (local FIFO)         │         │ Storage      │
//! └──────────────────────┘         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`access`]: `None < ReadOnly < Edit`
//! - [`document`]: content, access table, version history
//! - [`edit`]: `EditOperation` and [`apply_patch`]
//! - [`manager`]: in-process dispatch for several local editors
//! - [`storage`]: JSON snapshots, file and memory backends
//! - [`user`]: users, cursor colors, directory

pub mod access;
pub mod document;
pub mod edit;
pub mod error;
pub mod events;
pub mod manager;
pub mod storage;
pub mod user;

pub use access::AccessLevel;
pub use document::{
    Document, DocumentEvent, DocumentVersion, SharedDocument, AUTO_SAVE_INTERVAL,
    MAX_VERSIONS,
};
pub use edit::{apply_patch, CursorRemap, EditOperation, PatchOutcome};
pub use error::{CollabError, Result};
pub use events::EventBus;
pub use manager::{CollaborationManager, DocumentSession, ManagerEvent};
pub use storage::{
    DocumentSnapshot, DocumentStorage, FileStorage, MemoryStorage, StorageError,
};
pub use user::{CursorColor, User, UserDirectory, UserKind};
