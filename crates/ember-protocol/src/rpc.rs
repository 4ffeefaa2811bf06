//! Plugin RPC frames.
//!
//! The plugin wire is full duplex: both sides send `request` frames and
//! answer with `response` frames carrying the same id. Host-originated
//! calls implement the five plugin operations; plugin-originated calls
//! implement the reverse endpoint handed out by `init_emit_events`.

use crate::handshake::Hello;
use ember_core::{Event, Room, TagUpdate, User};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame on the plugin byte stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcFrame {
    Hello(Hello),
    Request { id: u64, call: Call },
    Response { id: u64, result: Reply },
}

/// Every call either side can make. Direction is enforced by the
/// dispatchers, not the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    // host -> plugin
    /// Declarative schema of the plugin's configuration block.
    GetSpec,
    /// Hand the plugin its configuration; it answers with a cron spec and
    /// an event filter.
    Configure { values: Value },
    /// Fired by the hub's cron driver at the plugin's declared instants.
    Cron { room: Room },
    /// Synchronous event transformation.
    HandleEvents { events: Vec<Event> },
    /// Opens the long-lived reverse stream for one room. Never answered
    /// under normal operation.
    InitEmitEvents { room: Room },

    // plugin -> host
    /// Push events into the room's pipeline.
    EmitEvents { events: Vec<Event> },
    AuthenticateUser { id_token: String, provider: String },
    GetUser { id: String },
    GetRoom { id: String },
    ChangeUserTags { id: String, updates: Vec<TagUpdate> },
    ChangeRoomTags { id: String, updates: Vec<TagUpdate> },
}

/// Response payloads, matched to calls by the request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    /// Generic success for calls with nothing to say.
    Ack,
    Error { message: String },
    Spec { schema: Value },
    Configured { cron_spec: String, event_filter: String },
    Events { events: Vec<Event> },
    User { user: User },
    Room { room: Room },
    TagsChanged { applied: Vec<bool> },
}

impl Reply {
    /// Build an error reply from anything displayable.
    #[must_use]
    pub fn error(err: impl std::fmt::Display) -> Self {
        Reply::Error {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::Tags;

    #[test]
    fn frames_round_trip_as_json() {
        let room = Room::new("default", User::new("admin", "admin"));
        let frame = RpcFrame::Request {
            id: 7,
            call: Call::Cron { room },
        };
        let raw = serde_json::to_string(&frame).unwrap();
        let back: RpcFrame = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn call_tag_is_snake_case() {
        let raw = serde_json::to_value(&Call::HandleEvents {
            events: vec![Event::new(
                Room::default(),
                ember_core::Source::default(),
                "",
                "",
                "chat",
                Tags::new(),
            )],
        })
        .unwrap();
        assert_eq!(raw["call"], "handle_events");
    }

    #[test]
    fn reply_error_helper() {
        let reply = Reply::error("boom");
        assert_eq!(
            reply,
            Reply::Error {
                message: "boom".into()
            }
        );
    }
}
