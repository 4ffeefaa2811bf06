//! End-to-end tests: a real server on a random port, real websocket
//! clients, and in-process plugins speaking the full RPC protocol over an
//! in-memory duplex.

use async_trait::async_trait;
use ember_core::{Event, Room, Source};
use ember_filter::compile;
use ember_plugin::{serve_with, EventHandler, HostClient, PluginHandle};
use ember_server::hub::{PluginMap, PluginSpec};
use ember_server::{serve_on, AppState, Config, HostBridge, Registry};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A test plugin deriving one event per chat event it sees.
struct DerivePlugin {
    name: &'static str,
    out_name: &'static str,
    out_filter: &'static str,
}

#[async_trait]
impl EventHandler for DerivePlugin {
    async fn get_spec(&self) -> anyhow::Result<Value> {
        Ok(json!({}))
    }

    async fn configure(&self, _values: Value) -> anyhow::Result<(String, String)> {
        Ok((String::new(), String::new()))
    }

    async fn cron(&self, _room: Room) -> anyhow::Result<Vec<Event>> {
        Ok(Vec::new())
    }

    async fn handle_events(&self, events: Vec<Event>) -> anyhow::Result<Vec<Event>> {
        Ok(events
            .iter()
            .filter(|event| event.name == "chat")
            .map(|event| {
                let mut tags = event.tags.clone();
                tags.insert("derived_by".into(), self.name.to_string());
                Event::new(
                    event.room.clone(),
                    Source::plugin(event.source.user.clone(), self.name),
                    self.out_filter,
                    event.language.clone(),
                    self.out_name,
                    tags,
                )
            })
            .collect())
    }

    async fn init_emit_events(&self, _room: Room, _host: HostClient) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

async fn connect_plugin(
    name: &str,
    handler: Arc<DerivePlugin>,
    event_filter: &str,
    bridge: Arc<HostBridge>,
) -> PluginSpec {
    let (host_side, plugin_side) = tokio::io::duplex(64 * 1024);
    let (host_read, host_write) = tokio::io::split(host_side);
    let (plugin_read, plugin_write) = tokio::io::split(plugin_side);
    tokio::spawn(async move {
        let _ = serve_with(plugin_read, plugin_write, handler).await;
    });
    let handle = PluginHandle::connect(name, host_read, host_write, bridge)
        .await
        .expect("plugin handshake");
    PluginSpec {
        name: name.to_string(),
        handle,
        cron_spec: String::new(),
        event_filter: if event_filter.is_empty() {
            None
        } else {
            Some(compile(event_filter).expect("event filter compiles"))
        },
    }
}

/// Start a full server with the given plugins; returns its address.
async fn start_server(history_size: usize, plugin_defs: Vec<(Arc<DerivePlugin>, &str)>) -> SocketAddr {
    let mut cfg = Config::default();
    cfg.history.history_size = history_size;
    let cfg = Arc::new(cfg);

    let registry = Registry::new();
    let bridge = Arc::new(HostBridge::new(
        Arc::clone(&registry),
        None,
        Arc::clone(&cfg),
    ));

    let mut plugins = HashMap::new();
    for (handler, filter) in plugin_defs {
        let name = handler.name;
        let spec = connect_plugin(name, handler, filter, Arc::clone(&bridge)).await;
        plugins.insert(name.to_string(), spec);
    }
    let plugins: PluginMap = Arc::new(plugins);

    registry
        .bootstrap(Arc::clone(&cfg), None, plugins)
        .await
        .expect("bootstrap");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = Arc::new(AppState { registry, cfg });
    tokio::spawn(async move {
        let _ = serve_on(listener, state).await;
    });
    addr
}

async fn connect(addr: SocketAddr, query: &str) -> Ws {
    let url = format!("ws://{addr}/chat/default{query}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    ws
}

async fn send_frame(ws: &mut Ws, event: &str, data: Value) {
    let frame = json!({"event": event, "data": data});
    ws.send(Message::Text(frame.to_string())).await.expect("send");
}

/// Read frames until one named `want` arrives; panics after the deadline.
async fn recv_named(ws: &mut Ws, want: &str) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let message = tokio::time::timeout(deadline, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for `{want}` frame"))
            .expect("stream ended")
            .expect("read failed");
        let Message::Text(text) = message else { continue };
        let frame: Value = serde_json::from_str(&text).expect("frame is json");
        if frame["event"] == want {
            return frame["data"].clone();
        }
    }
}

/// Assert no frame named `never` shows up within the window.
async fn assert_silent(ws: &mut Ws, never: &str, window: Duration) {
    let end = tokio::time::Instant::now() + window;
    loop {
        let remaining = end.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(&text).expect("frame is json");
                assert_ne!(frame["event"], never, "unexpected `{never}` frame: {text}");
            }
            Ok(Some(_)) => {}
        }
    }
}

#[tokio::test]
async fn guest_broadcast() {
    let addr = start_server(100, Vec::new()).await;
    let mut a = connect(addr, "").await;

    send_frame(&mut a, "chat", json!({"message": "hi"})).await;
    let data = recv_named(&mut a, "chats").await;

    let events = data.as_array().expect("chats data is an array");
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event["tags"]["message"], "hi");
    assert!(event["source"]["user"]["nick"]
        .as_str()
        .unwrap()
        .ends_with("(guest)"));
    // The kind travels in the envelope; the filter never leaves the hub.
    assert!(event.get("name").is_none());
    assert!(event.get("target_filter").is_none());
    assert_eq!(event["id"].as_str().unwrap().len(), 16);
}

#[tokio::test]
async fn target_filter_selects_recipients() {
    let addr = start_server(100, Vec::new()).await;
    let mut a = connect(addr, "?language=en").await;
    let mut b = connect(addr, "?language=de").await;

    send_frame(
        &mut a,
        "chat",
        json!({
            "message": "secret",
            "filter": "Target.Client.ClientLanguage == \"de\""
        }),
    )
    .await;

    let data = recv_named(&mut b, "chats").await;
    assert_eq!(data[0]["tags"]["message"], "secret");

    // The sender's language is `en`; the filter denies its own socket.
    assert_silent(&mut a, "chats", Duration::from_millis(400)).await;
    send_frame(&mut a, "chat", json!({"message": "public"})).await;
    let data = recv_named(&mut a, "chats").await;
    assert_eq!(data[0]["tags"]["message"], "public");
}

#[tokio::test]
async fn command_routing_stays_with_the_sender() {
    let addr = start_server(100, Vec::new()).await;
    let mut a = connect(addr, "").await;
    let mut b = connect(addr, "").await;

    send_frame(&mut a, "chat", json!({"message": "/help"})).await;
    let data = recv_named(&mut a, "commands").await;
    assert_eq!(data[0]["tags"]["command"], "/help");
    assert_eq!(data[0]["tags"]["args"], "");

    assert_silent(&mut b, "commands", Duration::from_millis(400)).await;

    // Arguments survive tokenization.
    send_frame(&mut a, "chat", json!({"message": "/roll 2 d6"})).await;
    let data = recv_named(&mut a, "commands").await;
    assert_eq!(data[0]["tags"]["command"], "/roll");
    assert_eq!(data[0]["tags"]["args"], "2 d6");
}

#[tokio::test]
async fn plugin_derives_translations_for_matching_language() {
    let translator = Arc::new(DerivePlugin {
        name: "translate",
        out_name: "translation",
        out_filter: "Target.Client.ClientLanguage startsWith \"de\"",
    });
    let addr = start_server(100, vec![(translator, "Name == \"chat\"")]).await;

    let mut a = connect(addr, "?language=en").await;
    let mut b = connect(addr, "?language=de").await;

    send_frame(&mut a, "chat", json!({"message": "hello"})).await;

    let data = recv_named(&mut b, "translations").await;
    assert_eq!(data[0]["tags"]["message"], "hello");
    assert_eq!(data[0]["tags"]["derived_by"], "translate");
    assert_eq!(data[0]["source"]["plugin_name"], "translate");

    assert_silent(&mut a, "translations", Duration::from_millis(400)).await;
}

#[tokio::test]
async fn history_backfill_carries_the_last_ring() {
    let addr = start_server(3, Vec::new()).await;
    let mut a = connect(addr, "").await;

    for n in 0..4 {
        send_frame(&mut a, "chat", json!({"message": n.to_string()})).await;
        let data = recv_named(&mut a, "chats").await;
        assert_eq!(data[0]["tags"]["message"], n.to_string());
    }
    // Give the history channel a moment to commit the last batch.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut c = connect(addr, "").await;
    let data = recv_named(&mut c, "chats").await;
    let events = data.as_array().expect("chats data is an array");
    assert_eq!(events.len(), 3);
    let messages: Vec<&str> = events
        .iter()
        .map(|e| e["tags"]["message"].as_str().unwrap())
        .collect();
    assert_eq!(messages, ["1", "2", "3"]);
    assert!(events.iter().all(|e| e["history"] == true));
}

#[tokio::test]
async fn echo_plugins_do_not_cascade() {
    // Both plugins echo every *user* chat; their gates ignore
    // plugin-originated events, so one user message yields exactly one
    // derivation per plugin.
    let p1 = Arc::new(DerivePlugin {
        name: "p1",
        out_name: "chat",
        out_filter: "",
    });
    let p2 = Arc::new(DerivePlugin {
        name: "p2",
        out_name: "chat",
        out_filter: "",
    });
    let gate = "Name == \"chat\" && Source.PluginName == \"\"";
    let addr = start_server(100, vec![(p1, gate), (p2, gate)]).await;

    let mut a = connect(addr, "").await;
    send_frame(&mut a, "chat", json!({"message": "ping"})).await;

    let mut derived_by = Vec::new();
    while derived_by.len() < 2 {
        let data = recv_named(&mut a, "chats").await;
        for event in data.as_array().unwrap() {
            if let Some(plugin) = event["tags"]["derived_by"].as_str() {
                derived_by.push(plugin.to_string());
            }
        }
    }
    derived_by.sort();
    assert_eq!(derived_by, ["p1", "p2"]);

    // And then the room goes quiet: no further echoes of echoes.
    assert_silent(&mut a, "chats", Duration::from_millis(500)).await;
}

#[tokio::test]
async fn skip_set_terminates_unconditional_echoes() {
    // No gates at all: each plugin echoes chats as chats. The skip set
    // still guarantees a finite cascade: p1's echo is seen by p2 and vice
    // versa, but never by its own producer again.
    let p1 = Arc::new(DerivePlugin {
        name: "p1",
        out_name: "chat",
        out_filter: "",
    });
    let p2 = Arc::new(DerivePlugin {
        name: "p2",
        out_name: "chat",
        out_filter: "",
    });
    let addr = start_server(100, vec![(p1, ""), (p2, "")]).await;

    let mut a = connect(addr, "").await;
    send_frame(&mut a, "chat", json!({"message": "ping"})).await;

    // 1 original + p1(c) + p2(c) + p2(p1's echo) + p1(p2's echo).
    let mut seen = 0;
    while seen < 5 {
        let data = recv_named(&mut a, "chats").await;
        seen += data.as_array().unwrap().len();
    }
    assert_eq!(seen, 5);
    assert_silent(&mut a, "chats", Duration::from_millis(500)).await;
}

#[tokio::test]
async fn unknown_room_is_rejected() {
    let addr = start_server(100, Vec::new()).await;
    let err = tokio_tungstenite::connect_async(format!("ws://{addr}/chat/nosuchroom"))
        .await
        .expect_err("unknown room must refuse the upgrade");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 400);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn guests_cannot_post_when_room_forbids_it() {
    // A registry whose default room does not allow guests.
    let cfg = Arc::new(Config::default());
    let registry = Registry::new();
    let store: Arc<dyn ember_core::Store> = Arc::new(ember_storage::MemoryStore::new());
    let admin = ember_core::User::new("admin", "admin");
    store.store_user(&admin).await.unwrap();
    let room = ember_core::Room::new("default", admin);
    store.store_room(&room).await.unwrap();
    registry
        .bootstrap(Arc::clone(&cfg), Some(store), Arc::new(HashMap::new()))
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(AppState { registry, cfg });
    tokio::spawn(async move {
        let _ = serve_on(listener, state).await;
    });

    let mut a = connect(addr, "").await;
    send_frame(&mut a, "chat", json!({"message": "hi"})).await;

    let data = recv_named(&mut a, "chats").await;
    assert_eq!(data[0]["tags"]["message"], "Please log in to post a message!");
}
