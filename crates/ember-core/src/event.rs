//! The uniform transport record.
//!
//! Every client action, plugin emission and timer tick is normalized into an
//! [`Event`]. Events are identified by a deterministic content hash so that
//! replays and retries are idempotent at the persistence layer.

use crate::model::{Room, Source, Tags};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Built-in event kinds. Plugins may introduce further kinds; consumers
/// switch on [`Event::name`].
pub mod kind {
    pub const INFO: &str = "info";
    pub const CHAT: &str = "chat";
    pub const COMMAND: &str = "command";
    pub const USER: &str = "user";
    pub const TRANSLATION: &str = "translation";
}

/// Well-known tag keys by event kind.
pub mod tag {
    /// Chat and command events: the message body.
    pub const MESSAGE: &str = "message";
    /// Chat events: content type of the message body.
    pub const MIME_TYPE: &str = "mime_type";
    /// Command events: the first whitespace-delimited token.
    pub const COMMAND: &str = "command";
    /// Command events: everything after the command token.
    pub const ARGS: &str = "args";
    /// User events: `login` or `logout`.
    pub const ACTION: &str = "action";
}

/// The single transport unit of the event bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// 16-hex-character content hash over all fields except `id` and `sent`.
    pub id: String,
    /// Room the event belongs to, embedded by value.
    pub room: Room,
    /// Origin of the event, embedded by value.
    pub source: Source,
    /// Construction time, UTC. The identity hash covers whole seconds only,
    /// so ids survive stores that keep unix seconds; the sub-second part
    /// orders events created within the same second.
    #[serde(default = "epoch")]
    pub created: DateTime<Utc>,
    /// Persistence time, UTC. Not part of the identity hash.
    #[serde(default = "epoch")]
    pub sent: DateTime<Utc>,
    /// Content language, may be empty.
    #[serde(default)]
    pub language: String,
    /// Event kind, see [`kind`].
    pub name: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub tags: Tags,
    /// True only when emitted from the ring or durable store on a backfill.
    #[serde(default)]
    pub history: bool,
    /// Boolean expression evaluated per recipient; empty means always true.
    #[serde(default)]
    pub target_filter: String,
}

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Event {
    /// Build a new event stamped now and assign its content id.
    ///
    /// Missing references stay zero-valued records, so filters never
    /// dereference a null. Two calls with semantically identical inputs
    /// (after normalization) produce the same id.
    #[must_use]
    pub fn new(
        room: Room,
        source: Source,
        target_filter: impl Into<String>,
        language: impl Into<String>,
        name: impl Into<String>,
        tags: Tags,
    ) -> Self {
        let mut event = Self {
            id: String::new(),
            room,
            source,
            created: Utc::now(),
            sent: DateTime::UNIX_EPOCH,
            language: language.into(),
            name: name.into(),
            tags,
            history: false,
            target_filter: target_filter.into(),
        };
        event.id = event.content_id();
        event
    }

    /// Recompute the content hash from the current field values.
    ///
    /// Covers every field except `id` and `sent`. Tag maps are ordered, so
    /// the encoding is canonical.
    #[must_use]
    pub fn content_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        put_str(&mut hasher, &self.room.id);
        put_user(&mut hasher, &self.room.owner);
        put_tags(&mut hasher, &self.room.tags);
        put_user(&mut hasher, &self.source.user);
        put_str(&mut hasher, &self.source.plugin_name);
        hasher.update(&self.created.timestamp().to_le_bytes());
        put_str(&mut hasher, &self.language);
        put_str(&mut hasher, &self.name);
        put_tags(&mut hasher, &self.tags);
        hasher.update(&[u8::from(self.history)]);
        put_str(&mut hasher, &self.target_filter);

        let digest = hasher.finalize();
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest.as_bytes()[..8]);
        format!("{:016x}", u64::from_le_bytes(word))
    }

    /// Stamp the persistence timestamp. Does not touch the id.
    pub fn mark_sent(&mut self) {
        self.sent = Utc::now();
    }
}

fn put_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn put_tags(hasher: &mut blake3::Hasher, tags: &Tags) {
    hasher.update(&(tags.len() as u64).to_le_bytes());
    for (key, value) in tags {
        put_str(hasher, key);
        put_str(hasher, value);
    }
}

fn put_user(hasher: &mut blake3::Hasher, user: &crate::model::User) {
    put_str(hasher, &user.id);
    put_str(hasher, &user.nick);
    put_str(hasher, &user.language);
    put_tags(hasher, &user.tags);
    hasher.update(&user.last_online.timestamp().to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;

    fn chat(message: &str) -> Event {
        let owner = User::new("admin", "admin");
        let room = Room::new("default", owner);
        let source = Source::client(User::new("alice", "alice"));
        let mut tags = Tags::new();
        tags.insert(tag::MESSAGE.into(), message.into());
        tags.insert(tag::MIME_TYPE.into(), "text/plain".into());
        Event::new(room, source, "", "en", kind::CHAT, tags)
    }

    #[test]
    fn id_is_sixteen_hex_chars() {
        let event = chat("hi");
        assert_eq!(event.id.len(), 16);
        assert!(event.id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn id_is_deterministic_over_content() {
        let event = chat("hi");
        assert_eq!(event.id, event.content_id());

        // Rehashing a rehash changes nothing.
        let mut copy = event.clone();
        copy.id = copy.content_id();
        assert_eq!(copy.id, event.id);
    }

    #[test]
    fn sent_is_not_part_of_the_identity() {
        let mut event = chat("hi");
        let id = event.id.clone();
        event.mark_sent();
        assert_eq!(event.content_id(), id);
    }

    #[test]
    fn content_changes_the_identity() {
        let a = chat("hi");
        let mut b = a.clone();
        b.tags.insert(tag::MESSAGE.into(), "bye".into());
        assert_ne!(a.id, b.content_id());

        let mut c = a.clone();
        c.target_filter = "Target.User.Id == \"bob\"".into();
        assert_ne!(a.id, c.content_id());
    }

    #[test]
    fn id_covers_whole_seconds_of_created() {
        let mut event = chat("hi");
        let id = event.id.clone();
        // Shifting within the same second does not change the identity.
        let secs = event.created.timestamp();
        event.created = DateTime::from_timestamp(secs, 123_456_789).unwrap();
        assert_eq!(event.content_id(), id);
        // Shifting by a whole second does.
        event.created = DateTime::from_timestamp(secs + 1, 0).unwrap();
        assert_ne!(event.content_id(), id);
    }
}
