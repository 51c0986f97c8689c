//! Users and the id-keyed user directory.
//!
//! Documents refer to their owner by id only; callers resolve display
//! metadata through [`UserDirectory`] when they need it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// RGBA color used to paint a user's remote caret.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable color derived from a user id.
    ///
    /// Hue lands in `30..330` so no user is painted in error red.
    pub fn from_user_id(user_id: &str) -> Self {
        let hash = user_id
            .chars()
            .fold(0i32, |h, c| h.wrapping_mul(31).wrapping_add(c as i32));
        let hue = hash.rem_euclid(300) + 30;
        let (r, g, b) = hsv_to_rgb(hue as f32, 1.0, 1.0);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }

    /// `#rrggbb` form for terminal and web front-ends.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02x}{:02x}{:02x}", channel(self.r), channel(self.g), channel(self.b))
    }
}

/// HSV to RGB, `h` in degrees.
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let c = v * s;
    let sector = (h / 60.0) % 6.0;
    let x = c * (1.0 - (sector % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match sector as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (r + m, g + m, b + m)
}

/// Account kind. Guests can view and edit shared documents but cannot
/// create or share their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UserKind {
    Registered { email: String },
    Guest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub display_name: String,
    pub kind: UserKind,
    pub cursor_color: CursorColor,
}

impl User {
    pub fn registered(
        id: impl Into<String>,
        display_name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        let kind = UserKind::Registered { email: email.into() };
        Self::with_kind(id.into(), display_name.into(), kind)
    }

    pub fn guest(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self::with_kind(id.into(), display_name.into(), UserKind::Guest)
    }

    fn with_kind(id: String, display_name: String, kind: UserKind) -> Self {
        let cursor_color = CursorColor::from_user_id(&id);
        Self { id, display_name, kind, cursor_color }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self.kind, UserKind::Guest)
    }

    pub fn can_create_documents(&self) -> bool {
        !self.is_guest()
    }

    pub fn can_share_documents(&self) -> bool {
        !self.is_guest()
    }

    pub fn email(&self) -> Option<&str> {
        match &self.kind {
            UserKind::Registered { email } => Some(email),
            UserKind::Guest => None,
        }
    }
}

/// Id-keyed lookup of known users.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: HashMap<String, User>,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a user, returning the previous entry.
    pub fn insert(&mut self, user: User) -> Option<User> {
        self.users.insert(user.id.clone(), user)
    }

    pub fn get(&self, user_id: &str) -> Option<&User> {
        self.users.get(user_id)
    }

    pub fn remove(&mut self, user_id: &str) -> Option<User> {
        self.users.remove(user_id)
    }

    /// Display name for `user_id`, falling back to the id itself.
    pub fn display_name<'a>(&'a self, user_id: &'a str) -> &'a str {
        self.users
            .get(user_id)
            .map(|u| u.display_name.as_str())
            .unwrap_or(user_id)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
