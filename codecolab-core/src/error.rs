//! Error taxonomy shared by the document model, the local manager and the
//! network layer.
//!
//! Every variant is recoverable: access-control and range violations are
//! returned to the caller as typed failures and leave state untouched.

use std::time::Duration;

use thiserror::Error;

use crate::access::AccessLevel;

/// Errors produced by collaboration operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    /// The acting user does not hold the required access level.
    #[error("user '{user_id}' needs {required} access to document '{document_id}'")]
    PermissionDenied {
        user_id: String,
        document_id: String,
        required: AccessLevel,
    },

    /// The document owner cannot be a share/revoke target.
    #[error("the owner's access to document '{document_id}' cannot be changed")]
    OwnerAccess { document_id: String },

    /// Operation requires a joined document.
    #[error("not joined to a document")]
    NotJoined,

    /// The connection is already joined to a document.
    #[error("already joined to document '{0}'")]
    AlreadyJoined(String),

    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Patch position outside `0..=len` of the base content.
    #[error("position {position} is out of range for content of length {len}")]
    OutOfRange { position: usize, len: usize },

    #[error("not found: {0}")]
    NotFound(String),

    /// Version history index outside the recorded history.
    #[error("version index {index} is out of range ({len} versions recorded)")]
    IndexError { index: usize, len: usize },
}

impl CollabError {
    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Shorthand for a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::ConnectionError(message.into())
    }

    /// Stable snake_case code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied { .. } => "permission_denied",
            Self::OwnerAccess { .. } => "owner_access",
            Self::NotJoined => "not_joined",
            Self::AlreadyJoined(_) => "already_joined",
            Self::ConnectionTimeout(_) => "connection_timeout",
            Self::ConnectionError(_) => "connection_error",
            Self::ProtocolError(_) => "protocol_error",
            Self::OutOfRange { .. } => "out_of_range",
            Self::NotFound(_) => "not_found",
            Self::IndexError { .. } => "index_error",
        }
    }
}

pub type Result<T, E = CollabError> = std::result::Result<T, E>;
