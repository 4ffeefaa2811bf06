//! Client sessions.
//!
//! A session is the middleman between one websocket connection and its
//! hub. Three cooperating tasks run per session: the reader (parses frames
//! into events), the writer (sole owner of the socket's write half) and the
//! plugin fan-in (drains this session's plugin channel into the hub's
//! chain). Teardown cascades from the done signal; channels close when the
//! session's last reference drops.

use crate::guest;
use crate::hub::{Hub, PING_PERIOD, PONG_WAIT, WRITE_WAIT};
use axum::extract::ws::{Message, WebSocket};
use ember_core::event::{kind, tag};
use ember_core::{Event, Source, Tags, User};
use ember_filter::{compile, evaluate_target, Recipient};
use ember_protocol::wire::{self, ChatPayload, GenericPayload, LoginPayload};
use ember_protocol::{batch_frames, WsFrame};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const SEND_CHANNEL_SIZE: usize = 1000;
const PLUGIN_CHANNEL_SIZE: usize = 1000;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Normalize to the first two lowercase letters; `en` when too short.
#[must_use]
pub fn normalize_language(language: &str) -> String {
    let lowered: String = language.chars().take(2).collect::<String>().to_lowercase();
    if lowered.chars().count() < 2 {
        "en".to_string()
    } else {
        lowered
    }
}

/// Receiver halves owned by the session's tasks.
pub struct SessionChannels {
    pub event_rx: mpsc::Receiver<Vec<Event>>,
    pub raw_rx: mpsc::Receiver<WsFrame>,
    pub plugin_rx: mpsc::Receiver<Vec<Event>>,
    pub done_rx: watch::Receiver<bool>,
}

/// One connected websocket client.
pub struct Client {
    id: u64,
    hub: Arc<Hub>,
    user: RwLock<User>,
    language: RwLock<String>,
    event_tx: mpsc::Sender<Vec<Event>>,
    raw_tx: mpsc::Sender<WsFrame>,
    plugin_tx: mpsc::Sender<Vec<Event>>,
    done_tx: watch::Sender<bool>,
}

impl Client {
    pub fn new(hub: Arc<Hub>, user: User, language: &str) -> (Arc<Self>, SessionChannels) {
        let (event_tx, event_rx) = mpsc::channel(SEND_CHANNEL_SIZE);
        let (raw_tx, raw_rx) = mpsc::channel(SEND_CHANNEL_SIZE);
        let (plugin_tx, plugin_rx) = mpsc::channel(PLUGIN_CHANNEL_SIZE);
        let (done_tx, done_rx) = watch::channel(false);
        let client = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            hub,
            user: RwLock::new(user),
            language: RwLock::new(normalize_language(language)),
            event_tx,
            raw_tx,
            plugin_tx,
            done_tx,
        });
        (
            client,
            SessionChannels {
                event_rx,
                raw_rx,
                plugin_rx,
                done_rx,
            },
        )
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    #[must_use]
    pub fn user(&self) -> User {
        self.user.read().expect("user lock poisoned").clone()
    }

    pub fn set_user(&self, user: User) {
        *self.user.write().expect("user lock poisoned") = user;
    }

    #[must_use]
    pub fn language(&self) -> String {
        self.language.read().expect("language lock poisoned").clone()
    }

    pub fn set_language(&self, language: &str) {
        *self.language.write().expect("language lock poisoned") = normalize_language(language);
    }

    /// User and session language in one snapshot, for filter environments.
    #[must_use]
    pub fn identity(&self) -> (User, String) {
        (self.user(), self.language())
    }

    /// Queue events for this socket; the writer filters and batches them.
    pub async fn send_events(&self, events: Vec<Event>) {
        let _ = self.event_tx.send(events).await;
    }

    /// Queue a pre-built frame, bypassing filters.
    pub async fn send_frame(&self, frame: WsFrame) {
        let _ = self.raw_tx.send(frame).await;
    }

    /// Queue events for this session's plugin fan-in.
    pub async fn send_to_plugins(&self, events: Vec<Event>) {
        let _ = self.plugin_tx.send(events).await;
    }

    /// Wake the done signal; the writer and plugin fan-in exit on it.
    pub fn shutdown(&self) {
        let _ = self.done_tx.send(true);
    }
}

/// The single writer task: everything that touches the socket's write half
/// goes through here. Applies per-event target filters against this
/// client's environment, groups by event name and emits pluralized batch
/// frames; pings on a ticker strictly faster than the peer's pong wait.
pub async fn write_loop(
    client: Arc<Client>,
    mut sink: SplitSink<WebSocket, Message>,
    mut event_rx: mpsc::Receiver<Vec<Event>>,
    mut raw_rx: mpsc::Receiver<WsFrame>,
    mut done_rx: watch::Receiver<bool>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = done_rx.changed() => {
                debug!(client = client.id(), "done signal, exiting write loop");
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            maybe_events = event_rx.recv() => {
                let Some(events) = maybe_events else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                if !write_events(&client, &mut sink, events).await {
                    break;
                }
            }
            maybe_frame = raw_rx.recv() => {
                let Some(frame) = maybe_frame else { break };
                if !write_frame(&mut sink, &frame).await {
                    break;
                }
            }
            _ = ping.tick() => {
                let deadline = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new())));
                match deadline.await {
                    Ok(Ok(())) => {}
                    _ => {
                        info!(client = client.id(), "could not send ping, exiting write loop");
                        break;
                    }
                }
            }
        }
    }
}

/// Filter, group, encode and send one batch. Returns false when the socket
/// is gone.
async fn write_events(
    client: &Arc<Client>,
    sink: &mut SplitSink<WebSocket, Message>,
    events: Vec<Event>,
) -> bool {
    let room = client.hub().room();
    let (user, language) = client.identity();
    let recipient = Recipient {
        user: &user,
        client_language: &language,
    };

    let mut deliver: Vec<&Event> = Vec::with_capacity(events.len());
    for event in &events {
        if event.target_filter.is_empty() {
            deliver.push(event);
            continue;
        }
        let accepted = match compile(&event.target_filter) {
            Ok(program) => {
                evaluate_target(Some(&program), &room, &event.source, recipient, event)
            }
            Err(err) => {
                warn!(filter = %event.target_filter, error = %err, "could not compile filter");
                false
            }
        };
        if accepted {
            deliver.push(event);
        }
    }

    for frame in batch_frames(&deliver) {
        if !write_frame(sink, &frame).await {
            return false;
        }
    }
    true
}

async fn write_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &WsFrame) -> bool {
    let Ok(text) = serde_json::to_string(frame) else {
        warn!("could not encode frame");
        return true;
    };
    matches!(
        tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(text))).await,
        Ok(Ok(()))
    )
}

/// Drain this session's plugin channel into the hub's chain, carrying an
/// empty skip set.
pub async fn plugin_loop(
    client: Arc<Client>,
    mut plugin_rx: mpsc::Receiver<Vec<Event>>,
    mut done_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = done_rx.changed() => {
                debug!(client = client.id(), "done signal, exiting plugin loop");
                break;
            }
            maybe_events = plugin_rx.recv() => {
                let Some(events) = maybe_events else { break };
                Arc::clone(client.hub())
                    .handle_plugins(events, std::collections::HashSet::new())
                    .await;
            }
        }
    }
}

/// The reader task: parses inbound frames, enforces the pong deadline, and
/// turns client actions into events. Returns when the socket closes, the
/// deadline passes, or a frame does not parse.
pub async fn read_loop(client: Arc<Client>, mut stream: SplitStream<WebSocket>) {
    loop {
        let next = tokio::time::timeout(PONG_WAIT, stream.next()).await;
        let message = match next {
            Err(_) => {
                info!(client = client.id(), "read deadline passed, closing session");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                debug!(client = client.id(), error = %err, "websocket read failed");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            // Pings and pongs refresh the deadline by arriving; axum
            // answers pings on its own.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return,
            Message::Binary(_) => {
                warn!(client = client.id(), "binary frame on a text protocol, closing");
                return;
            }
        };

        let frame: WsFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(client = client.id(), error = %err, "malformed frame, closing");
                return;
            }
        };

        if !dispatch_frame(&client, frame).await {
            return;
        }
    }
}

/// Handle one inbound frame. Returns false to close the session.
async fn dispatch_frame(client: &Arc<Client>, frame: WsFrame) -> bool {
    let hub = client.hub();
    let room = hub.room();

    match frame.event.as_str() {
        wire::inbound::LOGOUT => {
            if client.user().can_post() {
                let previous = client.user();
                client.set_user(guest::guest_user(&room));

                let mut tags = Tags::new();
                tags.insert(tag::ACTION.into(), "logout".into());
                let event = Event::new(
                    room,
                    Source::server(previous),
                    "",
                    "",
                    kind::USER,
                    tags,
                );
                hub.broadcast(vec![event.clone()]).await;
                client.send_to_plugins(vec![event]).await;
            }
            true
        }

        wire::inbound::LOGIN => {
            let payload: LoginPayload = match serde_json::from_value(frame.data) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(client = client.id(), error = %err, "malformed login frame, closing");
                    return false;
                }
            };
            handle_login(client, payload).await
        }

        wire::inbound::CHAT => {
            if reject_unauthenticated(client).await {
                return true;
            }
            let payload: ChatPayload = match serde_json::from_value(frame.data) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(client = client.id(), error = %err, "malformed chat frame, closing");
                    return false;
                }
            };
            handle_chat(client, payload).await;
            true
        }

        // Anything else is a generic event stamped with this session as
        // source.
        other => {
            if reject_unauthenticated(client).await {
                return true;
            }
            let payload: GenericPayload = match serde_json::from_value(frame.data) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(client = client.id(), error = %err, "malformed event frame, closing");
                    return false;
                }
            };
            let event = Event::new(
                client.hub().room(),
                Source::client(client.user()),
                payload.target_filter,
                payload.language,
                other,
                payload.tags,
            );
            let events = vec![event];
            client.hub().append_history(events.clone()).await;
            client.hub().broadcast(events.clone()).await;
            client.send_to_plugins(events).await;
            true
        }
    }
}

/// While a session has no user id, posting is answered with a
/// self-addressed reminder and the input is consumed.
async fn reject_unauthenticated(client: &Arc<Client>) -> bool {
    let user = client.user();
    if user.can_post() {
        return false;
    }
    let filter = format!(
        "Target.User.Nick == {}",
        serde_json::to_string(&user.nick).unwrap_or_else(|_| "\"\"".into())
    );
    let mut tags = Tags::new();
    tags.insert(tag::MESSAGE.into(), "Please log in to post a message!".into());
    let event = Event::new(
        client.hub().room(),
        Source::client(user),
        filter,
        "en",
        kind::CHAT,
        tags,
    );
    let events = vec![event];
    client.send_events(events.clone()).await;
    client.send_to_plugins(events).await;
    true
}

async fn handle_login(client: &Arc<Client>, payload: LoginPayload) -> bool {
    let hub = client.hub();
    let mut send_history = false;

    if !payload.id_token.is_empty() && !payload.provider.is_empty() {
        let user_id = match crate::auth::authenticate(
            &payload.id_token,
            &payload.provider,
            &hub.config().oidc,
        )
        .await
        {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(client = client.id(), error = %err, "could not authenticate");
                String::new()
            }
        };
        if !user_id.is_empty() {
            let user = match load_or_create_user(hub, &user_id).await {
                Ok(user) => user,
                Err(()) => return false,
            };
            if !user.language.is_empty() {
                client.set_language(&user.language);
            }
            client.set_user(user);
            send_history = true;
        }
    }

    if payload.language.len() > 1 && client.user().can_post() {
        client.set_language(&payload.language);
        send_history = true;
    }

    if send_history {
        client.send_events(hub.history_snapshot()).await;
    }
    true
}

/// Reload the user from the store, creating it on NotFound. `Err` closes
/// the session (the store is reachable but misbehaving).
async fn load_or_create_user(hub: &Arc<Hub>, user_id: &str) -> Result<User, ()> {
    let mut user = User::new(user_id, user_id);
    user.language = "en".to_string();
    user.last_online = chrono::Utc::now();

    let Some(store) = hub.store() else {
        return Ok(user);
    };
    match store.get_user(user_id).await {
        Ok(found) => Ok(found.public_view()),
        Err(err) if err.is_not_found() => {
            if let Err(err) = store.store_user(&user).await {
                warn!(user = user_id, error = %err, "could not store user");
                return Err(());
            }
            Ok(user)
        }
        Err(err) => {
            warn!(user = user_id, error = %err, "could not load user");
            Err(())
        }
    }
}

async fn handle_chat(client: &Arc<Client>, payload: ChatPayload) {
    let hub = client.hub();
    let room = hub.room();
    let user = client.user();
    let source = Source::client(user.clone());

    let mut tags = Tags::new();
    tags.insert(tag::MESSAGE.into(), payload.message.clone());
    tags.insert(tag::MIME_TYPE.into(), "text/plain".into());

    let events = if payload.message.starts_with('/') {
        // Slash input becomes a command event addressed back to its
        // sender, optionally narrowed further by the client's own filter.
        let mut fields = payload.message.split_whitespace();
        let command = fields.next().unwrap_or("/").to_string();
        let args = fields.collect::<Vec<_>>().join(" ");

        tags.insert("original_target_filter".into(), payload.filter.clone());
        tags.insert(tag::COMMAND.into(), command);
        tags.insert(tag::ARGS.into(), args);

        let own = format!(
            "Target.User.Id == {}",
            serde_json::to_string(&user.id).unwrap_or_else(|_| "\"\"".into())
        );
        let filter = if payload.filter.is_empty() {
            own
        } else {
            format!("({}) && {}", payload.filter, own)
        };
        vec![Event::new(
            room,
            source,
            filter,
            payload.language,
            kind::COMMAND,
            tags,
        )]
    } else {
        vec![Event::new(
            room,
            source,
            payload.filter,
            payload.language,
            kind::CHAT,
            tags,
        )]
    };

    hub.append_history(events.clone()).await;
    hub.broadcast(events.clone()).await;
    client.send_to_plugins(events).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_normalization() {
        assert_eq!(normalize_language("de-DE"), "de");
        assert_eq!(normalize_language("EN"), "en");
        assert_eq!(normalize_language("f"), "en");
        assert_eq!(normalize_language(""), "en");
        assert_eq!(normalize_language("pt-BR"), "pt");
    }
}
