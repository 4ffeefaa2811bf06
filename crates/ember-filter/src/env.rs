//! Evaluation environments.
//!
//! Once fixed, the shape of these records must not change: filters travel
//! inside persisted events, and history replay has to keep evaluating them.
//! Fields of the embedded `User` are reachable both nested
//! (`Source.User.Id`) and promoted (`Source.Id`), mirroring record
//! embedding; the same goes for `Target.Client.ClientLanguage`.

use crate::value::Value;
use ember_core::{Event, Room, Source, Tags, User};
use std::collections::BTreeMap;

/// A prepared set of variables a program evaluates against.
#[derive(Debug, Clone)]
pub struct Env {
    vars: BTreeMap<String, Value>,
}

/// The recipient half of a target-filter evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Recipient<'a> {
    pub user: &'a User,
    /// The session's normalized language, not the user profile's.
    pub client_language: &'a str,
}

impl Env {
    /// Environment for deciding whether `event` is delivered to a recipient.
    #[must_use]
    pub fn target(room: &Room, source: &Source, recipient: Recipient<'_>, event: &Event) -> Self {
        let mut vars = common_vars(room, source, event);
        vars.insert(
            "Target".to_string(),
            target_value(Some(recipient.user), recipient.client_language),
        );
        Self { vars }
    }

    /// Environment for gating a plugin's view of an event: identical shape
    /// with an empty Target.
    #[must_use]
    pub fn plugin_gate(room: &Room, source: &Source, event: &Event) -> Self {
        let mut vars = common_vars(room, source, event);
        vars.insert("Target".to_string(), target_value(None, ""));
        Self { vars }
    }

    /// Environment for tag-update expressions: just the current tag map.
    #[must_use]
    pub fn tag_update(tags: &Tags) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("Tags".to_string(), tags_value(tags));
        Self { vars }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

fn common_vars(room: &Room, source: &Source, event: &Event) -> BTreeMap<String, Value> {
    let mut vars = BTreeMap::new();
    vars.insert("Room".to_string(), room_value(room));
    vars.insert("Source".to_string(), source_value(source));
    vars.insert("Created".to_string(), Value::Int(event.created.timestamp()));
    vars.insert("Language".to_string(), Value::Str(event.language.clone()));
    vars.insert("Name".to_string(), Value::Str(event.name.clone()));
    vars.insert("Tags".to_string(), tags_value(&event.tags));
    vars
}

fn tags_value(tags: &Tags) -> Value {
    Value::Map(
        tags.iter()
            .map(|(k, v)| (k.clone(), Value::Str(v.clone())))
            .collect(),
    )
}

fn user_fields(user: &User) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    map.insert("Id".to_string(), Value::Str(user.id.clone()));
    map.insert("Nick".to_string(), Value::Str(user.nick.clone()));
    map.insert("Language".to_string(), Value::Str(user.language.clone()));
    map.insert("Tags".to_string(), tags_value(&user.tags));
    map.insert(
        "LastOnline".to_string(),
        Value::Int(user.last_online.timestamp()),
    );
    map
}

fn room_value(room: &Room) -> Value {
    let mut map = BTreeMap::new();
    map.insert("Id".to_string(), Value::Str(room.id.clone()));
    map.insert("Owner".to_string(), Value::Map(user_fields(&room.owner)));
    map.insert("Tags".to_string(), tags_value(&room.tags));
    Value::Map(map)
}

fn source_value(source: &Source) -> Value {
    // Promoted user fields first, then the named records.
    let mut map = user_fields(&source.user);
    map.insert("User".to_string(), Value::Map(user_fields(&source.user)));
    map.insert(
        "PluginName".to_string(),
        Value::Str(source.plugin_name.clone()),
    );
    Value::Map(map)
}

fn target_value(user: Option<&User>, client_language: &str) -> Value {
    let empty = User::default();
    let user = user.unwrap_or(&empty);
    let mut map = user_fields(user);
    map.insert("User".to_string(), Value::Map(user_fields(user)));
    map.insert(
        "ClientLanguage".to_string(),
        Value::Str(client_language.to_string()),
    );
    let mut client = BTreeMap::new();
    client.insert(
        "ClientLanguage".to_string(),
        Value::Str(client_language.to_string()),
    );
    map.insert("Client".to_string(), Value::Map(client));
    Value::Map(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_mirrors_embedding() {
        let mut user = User::new("alice", "Alice");
        user.tags.insert("color".into(), "red".into());
        let source = Source::client(user.clone());
        let room = Room::new("default", User::new("admin", "admin"));
        let event = Event::new(
            room.clone(),
            source.clone(),
            "",
            "en",
            "chat",
            Tags::new(),
        );

        let env = Env::target(
            &room,
            &source,
            Recipient {
                user: &user,
                client_language: "de",
            },
            &event,
        );

        let target = match env.get("Target").unwrap() {
            Value::Map(map) => map,
            other => panic!("target is {other:?}"),
        };
        // Nested and promoted access both resolve.
        assert_eq!(target["Id"], Value::Str("alice".into()));
        assert!(matches!(target["User"], Value::Map(_)));
        assert_eq!(target["ClientLanguage"], Value::Str("de".into()));
        assert!(matches!(target["Client"], Value::Map(_)));
    }

    #[test]
    fn plugin_gate_has_empty_target() {
        let room = Room::new("default", User::new("admin", "admin"));
        let source = Source::client(User::new("alice", "Alice"));
        let event = Event::new(room.clone(), source.clone(), "", "", "chat", Tags::new());
        let env = Env::plugin_gate(&room, &source, &event);
        let target = match env.get("Target").unwrap() {
            Value::Map(map) => map,
            other => panic!("target is {other:?}"),
        };
        assert_eq!(target["Id"], Value::Str(String::new()));
    }
}
