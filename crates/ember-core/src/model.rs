//! Identity records shared across the engine.
//!
//! Users and rooms live in the durable store and are embedded by value in
//! every [`crate::Event`], so filters never chase a reference that might be
//! missing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String-valued tag map. Ordered so serialization is canonical.
pub type Tags = BTreeMap<String, String>;

/// Tags with this prefix are internal and never reach clients.
pub const INTERNAL_TAG_PREFIX: char = '_';

/// Room tag controlling whether unauthenticated visitors get a posting
/// identity.
pub const TAG_ALLOW_GUESTS: &str = "_allow_guests";

/// Remove all internal (`_`-prefixed) tags from a tag map.
pub fn strip_internal_tags(tags: &mut Tags) {
    tags.retain(|k, _| !k.starts_with(INTERNAL_TAG_PREFIX));
}

/// Lenient boolean parse for tag values ("true"/"t"/"1" and friends).
#[must_use]
pub fn tag_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "t" | "true" | "yes" | "y" | "on"
    )
}

/// A chat user.
///
/// Guests have `id == nick` when the room allows guests; otherwise the id is
/// empty and the user is read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable unique identifier (subject claim for authenticated users).
    pub id: String,
    /// Human-visible name.
    pub nick: String,
    /// Preferred language, two-letter lowercase code.
    pub language: String,
    /// Free-form string tags.
    #[serde(default)]
    pub tags: Tags,
    /// Last time the user was seen online.
    #[serde(default = "epoch")]
    pub last_online: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl User {
    /// Create a user with the given id and nick and empty everything else.
    #[must_use]
    pub fn new(id: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nick: nick.into(),
            language: String::new(),
            tags: Tags::new(),
            last_online: DateTime::UNIX_EPOCH,
        }
    }

    /// Whether this session may post (an empty id is read-only).
    #[must_use]
    pub fn can_post(&self) -> bool {
        !self.id.is_empty()
    }

    /// Copy of this user with internal tags removed, safe to expose to
    /// clients.
    #[must_use]
    pub fn public_view(&self) -> Self {
        let mut user = self.clone();
        strip_internal_tags(&mut user.tags);
        user
    }
}

/// A chat room. One hub exists per room for the process lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    /// Owning user, embedded by value.
    pub owner: User,
    #[serde(default)]
    pub tags: Tags,
}

impl Room {
    #[must_use]
    pub fn new(id: impl Into<String>, owner: User) -> Self {
        Self {
            id: id.into(),
            owner,
            tags: Tags::new(),
        }
    }

    /// Whether the room admits guests (`_allow_guests` tag parses true).
    #[must_use]
    pub fn allows_guests(&self) -> bool {
        self.tags
            .get(TAG_ALLOW_GUESTS)
            .is_some_and(|v| tag_truthy(v))
    }
}

/// Reserved source name for events the server itself produces.
pub const SOURCE_MAIN: &str = "main";

/// The origin of an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// The user on whose behalf the event was produced.
    pub user: User,
    /// Empty for human clients, `"main"` for server-originated events, the
    /// plugin name for plugin-originated events.
    #[serde(default)]
    pub plugin_name: String,
}

impl Source {
    /// Source for an event a human client produced.
    #[must_use]
    pub fn client(user: User) -> Self {
        Self {
            user,
            plugin_name: String::new(),
        }
    }

    /// Source for a server-originated event (login notifications, roster
    /// info).
    #[must_use]
    pub fn server(user: User) -> Self {
        Self {
            user,
            plugin_name: SOURCE_MAIN.to_string(),
        }
    }

    /// Source for a plugin-originated event.
    #[must_use]
    pub fn plugin(user: User, plugin_name: impl Into<String>) -> Self {
        Self {
            user,
            plugin_name: plugin_name.into(),
        }
    }
}

/// Declared value type of a [`TagUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagKind {
    String,
    Int,
    Float,
    StringSlice,
    IntSlice,
    FloatSlice,
}

/// A typed, atomic mutation of one tag.
///
/// The expression is evaluated against the current tag map; on success the
/// result is converted to the declared kind and written back. Slice kinds
/// overwrite a single element of the comma-joined value at `index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagUpdate {
    /// Tag key to update.
    pub name: String,
    /// Declared result type.
    #[serde(rename = "type")]
    pub kind: TagKind,
    /// Element position for slice kinds; ignored for scalars.
    #[serde(default)]
    pub index: usize,
    /// Expression evaluated against the tag-update environment.
    pub expression: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_internal_keeps_public_tags() {
        let mut tags = Tags::new();
        tags.insert("_allow_guests".into(), "true".into());
        tags.insert("topic".into(), "rust".into());
        strip_internal_tags(&mut tags);
        assert_eq!(tags.len(), 1);
        assert!(tags.contains_key("topic"));
    }

    #[test]
    fn guest_gate_parses_leniently() {
        let mut room = Room::new("default", User::new("admin", "admin"));
        assert!(!room.allows_guests());
        room.tags.insert(TAG_ALLOW_GUESTS.into(), "TRUE".into());
        assert!(room.allows_guests());
        room.tags.insert(TAG_ALLOW_GUESTS.into(), "0".into());
        assert!(!room.allows_guests());
    }

    #[test]
    fn tag_update_wire_shape() {
        let update = TagUpdate {
            name: "score".into(),
            kind: TagKind::IntSlice,
            index: 1,
            expression: "AsIntSlice(Tags[\"score\"])[1] + 1".into(),
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "int-slice");
        assert_eq!(json["index"], 1);
    }

    #[test]
    fn public_view_hides_internal_tags() {
        let mut user = User::new("u", "u");
        user.tags.insert("_secret".into(), "x".into());
        user.tags.insert("color".into(), "red".into());
        let view = user.public_view();
        assert!(!view.tags.contains_key("_secret"));
        assert!(user.tags.contains_key("_secret"));
    }
}
