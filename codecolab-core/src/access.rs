//! Per-user access levels.
//!
//! Levels are totally ordered `None < ReadOnly < Edit` and persist as the
//! integers `0`, `1`, `2`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Permission a user holds on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum AccessLevel {
    #[default]
    None = 0,
    ReadOnly = 1,
    Edit = 2,
}

impl AccessLevel {
    pub fn can_read(self) -> bool {
        self >= AccessLevel::ReadOnly
    }

    pub fn can_edit(self) -> bool {
        self == AccessLevel::Edit
    }
}

impl From<AccessLevel> for u8 {
    fn from(level: AccessLevel) -> Self {
        level as u8
    }
}

impl TryFrom<u8> for AccessLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AccessLevel::None),
            1 => Ok(AccessLevel::ReadOnly),
            2 => Ok(AccessLevel::Edit),
            other => Err(format!("invalid access level {other}")),
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::None => write!(f, "no"),
            AccessLevel::ReadOnly => write!(f, "read-only"),
            AccessLevel::Edit => write!(f, "edit"),
        }
    }
}
