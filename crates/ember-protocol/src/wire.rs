//! Client-facing websocket frames.
//!
//! Both directions speak a JSON envelope `{ "event": <string>, "data":
//! <json> }`. Outbound, the event kind is promoted into the envelope and
//! pluralized, the `data` is an array of per-event objects, and the
//! `target_filter` is never sent to clients.

use ember_core::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum accepted inbound frame size in bytes.
pub const MAX_INBOUND_FRAME: usize = 4096;

/// Inbound frame names clients may send. Anything else is treated as a
/// generic event.
pub mod inbound {
    pub const LOGIN: &str = "login";
    pub const LOGOUT: &str = "logout";
    pub const CHAT: &str = "chat";
}

/// The JSON envelope exchanged on the websocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl WsFrame {
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// `data` payload of an inbound `chat` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub message: String,
    /// Optional client-supplied target filter.
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub language: String,
}

/// `data` payload of an inbound `login` frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginPayload {
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub language: String,
}

/// `data` payload of any other inbound frame, treated as a generic event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenericPayload {
    #[serde(default)]
    pub target_filter: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub tags: ember_core::Tags,
}

/// Serialize one event for the wire: the event object minus `name` (it
/// becomes the envelope's `event`) and `target_filter` (never shown to
/// clients). Internal (`_`-prefixed) tags on the embedded room and users
/// are stripped too.
#[must_use]
pub fn wire_event(event: &Event) -> Value {
    let mut value = serde_json::to_value(event).unwrap_or(Value::Null);
    if let Value::Object(ref mut map) = value {
        map.remove("name");
        map.remove("target_filter");
        if let Some(room) = map.get_mut("room") {
            strip_internal(&mut room["tags"]);
            strip_internal(&mut room["owner"]["tags"]);
        }
        if let Some(source) = map.get_mut("source") {
            strip_internal(&mut source["user"]["tags"]);
        }
    }
    value
}

fn strip_internal(tags: &mut Value) {
    if let Value::Object(map) = tags {
        map.retain(|key, _| !key.starts_with('_'));
    }
}

/// Group one delivery batch by event kind and build the pluralized frames.
///
/// Frame order follows the first appearance of each kind; event order
/// within a frame follows the batch.
#[must_use]
pub fn batch_frames(events: &[&Event]) -> Vec<WsFrame> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: std::collections::HashMap<&str, Vec<Value>> = std::collections::HashMap::new();
    for event in events {
        let encoded = wire_event(event);
        let group = groups.entry(event.name.as_str()).or_default();
        if group.is_empty() {
            order.push(event.name.as_str());
        }
        group.push(encoded);
    }
    order
        .into_iter()
        .map(|name| {
            let data = groups.remove(name).unwrap_or_default();
            WsFrame::new(format!("{name}s"), Value::Array(data))
        })
        .collect()
}
