//! JSON wire protocol for the relay.
//!
//! Every frame is a WebSocket text message holding one envelope:
//! ```text
//! { "type": "edit",
//!   "payload": { "userId": "u1", "documentId": "d1",
//!                "position": 2, "insertion": "XY", "deletionLength": 1 } }
//! ```
//!
//! Message types are snake_case, payload fields camelCase. Identity
//! fields sent by a client (`userId`, `username`, `documentId` on
//! edit/cursor/chat) are advisory; the server overwrites them from the
//! session before relaying.

use codecolab_core::{CollabError, EditOperation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One room member as listed in a join acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
}

impl RosterEntry {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), username: username.into() }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum WireMessage {
    // client → server
    Join {
        document_id: String,
        user_id: String,
        #[serde(default)]
        username: String,
    },
    Leave {
        #[serde(default)]
        document_id: String,
        #[serde(default)]
        user_id: String,
    },
    RequestContent {
        #[serde(default)]
        document_id: String,
    },

    // both directions
    Edit(EditOperation),
    Cursor {
        #[serde(default)]
        document_id: String,
        #[serde(default)]
        user_id: String,
        #[serde(default)]
        username: String,
        position: usize,
    },
    Chat {
        #[serde(default)]
        document_id: String,
        #[serde(default)]
        user_id: String,
        #[serde(default)]
        username: String,
        message: String,
    },

    // server → client
    JoinResponse {
        success: bool,
        document_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        users: Vec<RosterEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Left {
        document_id: String,
    },
    Content {
        #[serde(default)]
        document_id: String,
        content: String,
    },
    UserJoined {
        user_id: String,
        #[serde(default)]
        username: String,
    },
    UserLeft {
        user_id: String,
    },
    Error {
        code: String,
        message: String,
    },
}

impl WireMessage {
    pub fn join(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self::Join {
            document_id: document_id.into(),
            user_id: user_id.into(),
            username: username.into(),
        }
    }

    pub fn join_accepted(
        document_id: impl Into<String>,
        content: impl Into<String>,
        users: Vec<RosterEntry>,
    ) -> Self {
        Self::JoinResponse {
            success: true,
            document_id: document_id.into(),
            content: content.into(),
            users,
            code: None,
            error: None,
        }
    }

    pub fn join_rejected(document_id: impl Into<String>, error: &CollabError) -> Self {
        Self::JoinResponse {
            success: false,
            document_id: document_id.into(),
            content: String::new(),
            users: Vec::new(),
            code: Some(error.code().to_string()),
            error: Some(error.to_string()),
        }
    }

    /// Error reply carrying the stable code of `error`.
    pub fn error(error: &CollabError) -> Self {
        Self::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::RequestContent { .. } => "request_content",
            Self::Edit(_) => "edit",
            Self::Cursor { .. } => "cursor",
            Self::Chat { .. } => "chat",
            Self::JoinResponse { .. } => "join_response",
            Self::Left { .. } => "left",
            Self::Content { .. } => "content",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, WireError> {
        serde_json::from_str(text).map_err(WireError::Decode)
    }
}

/// Wire encoding errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unsupported binary frame ({0} bytes)")]
    Binary(usize),
}

impl From<WireError> for CollabError {
    fn from(e: WireError) -> Self {
        CollabError::protocol(e.to_string())
    }
}
