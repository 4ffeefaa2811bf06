//! HTTP/websocket surface.
//!
//! This module handles the connection lifecycle: room resolution from the
//! URL, query-string authentication, the HTTP upgrade, and the
//! orchestration of the three session tasks.

use crate::config::Config;
use crate::guest;
use crate::hub::{Hub, MAX_MESSAGE_SIZE};
use crate::registry::{valid_room_id, Registry};
use crate::session::{self, Client};
use anyhow::Result;
use axum::extract::ws::WebSocket;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use ember_core::event::{kind, tag};
use ember_core::{Event, Source, Tags, User};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub registry: Arc<Registry>,
    pub cfg: Arc<Config>,
}

/// Build the application router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat/:room", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve on an already-bound listener (tests bind port 0 and read the
/// address back).
///
/// # Errors
///
/// Returns an error when the accept loop fails.
pub async fn serve_on(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}

/// Bind the configured address and serve.
///
/// # Errors
///
/// Returns an error when the address cannot be bound.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.cfg.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    info!("websocket endpoint: ws://{}/chat/{{room}}", addr);
    serve_on(listener, state).await
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Websocket upgrade handler: resolve the room, authenticate the optional
/// query token, then hand the socket to the session orchestration.
async fn ws_handler(
    Path(room): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !valid_room_id(&room) {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(hub) = state.registry.get(&room) else {
        debug!(room = %room, "room not found");
        return StatusCode::BAD_REQUEST.into_response();
    };

    let id_token = params.get("id_token").cloned().unwrap_or_default();
    let provider = params.get("provider").cloned().unwrap_or_default();
    let language = params.get("language").cloned().unwrap_or_default();

    let user_id = if !id_token.is_empty() && !provider.is_empty() {
        match crate::auth::authenticate(&id_token, &provider, &state.cfg.oidc).await {
            Ok(user_id) => user_id,
            Err(err) => {
                warn!(error = %err, "could not authenticate");
                String::new()
            }
        }
    } else {
        String::new()
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, hub, user_id, language))
}

/// Load the connecting user: a guest when unauthenticated, otherwise the
/// stored user (created on first sight). `None` aborts the connection.
async fn resolve_user(hub: &Arc<Hub>, user_id: &str) -> Option<User> {
    let room = hub.room();
    if user_id.is_empty() {
        return Some(guest::guest_user(&room));
    }

    let mut user = User::new(user_id, user_id);
    user.language = "en".to_string();
    match hub.store() {
        None => {}
        Some(store) => match store.get_user(user_id).await {
            Ok(found) => user = found,
            Err(err) if err.is_not_found() => {
                user.last_online = chrono::Utc::now();
                if let Err(err) = store.store_user(&user).await {
                    error!(user = user_id, error = %err, "could not store user");
                    return None;
                }
            }
            Err(err) => {
                error!(user = user_id, error = %err, "could not load user");
                return None;
            }
        },
    }
    Some(user.public_view())
}

/// Per-connection orchestration: register with the hub, start the writer
/// and plugin fan-in, push the login notification and the history
/// backfill, then read until the socket dies.
async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, user_id: String, language: String) {
    let Some(user) = resolve_user(&hub, &user_id).await else {
        return;
    };
    debug!(user = %user.nick, "websocket connected");

    let (sink, stream) = socket.split();
    let (client, channels) = Client::new(Arc::clone(&hub), user.clone(), &language);

    // Block until the hub has the client in its set, so the broadcasts
    // below reach the new client too.
    hub.register(Arc::clone(&client)).await;

    let writer = tokio::spawn(session::write_loop(
        Arc::clone(&client),
        sink,
        channels.event_rx,
        channels.raw_rx,
        channels.done_rx.clone(),
    ));
    let plugins = tokio::spawn(session::plugin_loop(
        Arc::clone(&client),
        channels.plugin_rx,
        channels.done_rx,
    ));

    if user.can_post() {
        let mut tags = Tags::new();
        tags.insert(tag::ACTION.into(), "login".into());
        let event = Event::new(
            hub.room(),
            Source::server(user),
            "",
            "",
            kind::USER,
            tags,
        );
        hub.broadcast(vec![event.clone()]).await;
        client.send_to_plugins(vec![event]).await;
    }
    client.send_events(hub.history_snapshot()).await;

    session::read_loop(Arc::clone(&client), stream).await;

    client.shutdown();
    hub.unregister(client.id()).await;
    let _ = writer.await;
    let _ = plugins.await;
    debug!(client = client.id(), "websocket disconnected");
}
