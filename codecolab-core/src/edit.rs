//! Positional edit operations and patch application.
//!
//! An [`EditOperation`] removes `deletion_length` characters starting at
//! `position` and then inserts `insertion` at `position`. Positions and
//! lengths count Unicode scalar values.
//!
//! ```text
//! base      a b c d e f          position = 2, deletion_length = 1
//!               ^ ^
//!               │ └─ removed
//!               └─── "XY" inserted here
//! result    a b X Y d e f
//! ```
//!
//! Concurrent patches are applied in arrival order with no transformation;
//! two peers editing overlapping ranges can diverge.

use serde::{Deserialize, Serialize};

use crate::error::{CollabError, Result};

/// One content change, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub document_id: String,
    pub position: usize,
    #[serde(default)]
    pub insertion: String,
    #[serde(default)]
    pub deletion_length: usize,
}

impl EditOperation {
    pub fn new(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        position: usize,
        insertion: impl Into<String>,
        deletion_length: usize,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            document_id: document_id.into(),
            position,
            insertion: insertion.into(),
            deletion_length,
        }
    }

    /// Pure insertion at `position`.
    pub fn insert(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        position: usize,
        text: impl Into<String>,
    ) -> Self {
        Self::new(user_id, document_id, position, text, 0)
    }

    /// Pure deletion of `length` characters at `position`.
    pub fn delete(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        position: usize,
        length: usize,
    ) -> Self {
        Self::new(user_id, document_id, position, String::new(), length)
    }

    /// Whole-content replacement of `old_content` with `new_content`.
    pub fn replace_all(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        old_content: &str,
        new_content: impl Into<String>,
    ) -> Self {
        Self::new(user_id, document_id, 0, new_content, old_content.chars().count())
    }

    pub fn to_wire(&self) -> serde_json::Value {
        // A struct of strings and integers always serializes.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_wire(value: &serde_json::Value) -> Result<Self> {
        Self::deserialize(value)
            .map_err(|e| CollabError::protocol(format!("invalid edit payload: {e}")))
    }

    pub fn is_noop(&self) -> bool {
        self.insertion.is_empty() && self.deletion_length == 0
    }

    /// Operation that undoes `self` once applied to `base`.
    pub fn inverse(&self, base: &str) -> Result<EditOperation> {
        let len = base.chars().count();
        check_position(self.position, len)?;
        let deleted_len = self.deletion_length.min(len - self.position);
        let deleted: String = base.chars().skip(self.position).take(deleted_len).collect();
        Ok(EditOperation {
            user_id: self.user_id.clone(),
            document_id: self.document_id.clone(),
            position: self.position,
            insertion: deleted,
            deletion_length: self.insertion.chars().count(),
        })
    }
}

/// Maps a local caret offset from pre-patch to post-patch content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRemap {
    pub position: usize,
    /// Deleted length after clamping to the available content.
    pub deleted: usize,
    pub inserted: usize,
}

impl CursorRemap {
    pub fn remap(&self, caret: usize) -> usize {
        if caret <= self.position {
            caret
        } else if caret > self.position + self.deleted {
            caret - self.deleted + self.inserted
        } else {
            self.position + self.inserted
        }
    }
}

/// Result of applying a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    pub content: String,
    pub remap: CursorRemap,
}

/// Apply `op` to `base`.
///
/// Fails with [`CollabError::OutOfRange`] when `op.position` exceeds the
/// base length; the deletion length is clamped to what remains after the
/// position.
pub fn apply_patch(base: &str, op: &EditOperation) -> Result<PatchOutcome> {
    let len = base.chars().count();
    check_position(op.position, len)?;
    let deleted = op.deletion_length.min(len - op.position);

    let start = byte_offset(base, op.position);
    let end = byte_offset(base, op.position + deleted);

    let mut content = String::with_capacity(base.len() - (end - start) + op.insertion.len());
    content.push_str(&base[..start]);
    content.push_str(&op.insertion);
    content.push_str(&base[end..]);

    Ok(PatchOutcome {
        content,
        remap: CursorRemap {
            position: op.position,
            deleted,
            inserted: op.insertion.chars().count(),
        },
    })
}

fn check_position(position: usize, len: usize) -> Result<()> {
    if position > len {
        return Err(CollabError::OutOfRange { position, len });
    }
    Ok(())
}

/// Byte offset of the `chars`-th character, or `text.len()` past the end.
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}
