//! Plugin-side runtime.
//!
//! A plugin binary implements [`EventHandler`] and hands it to [`serve`],
//! which speaks the plugin protocol on stdin/stdout until the host goes
//! away. Reverse calls into the host go through the [`HostClient`] passed
//! to `init_emit_events`.

use crate::peer::{self, Dispatcher, Peer};
use crate::PluginError;
use async_trait::async_trait;
use bytes::BytesMut;
use ember_core::{Event, Room, TagUpdate, User};
use ember_protocol::rpc::{Call, Reply, RpcFrame};
use ember_protocol::Hello;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

/// The contract a plugin implements.
///
/// Errors are reported back to the host, which logs and drops the affected
/// events; they never take the hub down.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Declarative schema of this plugin's configuration block.
    async fn get_spec(&self) -> anyhow::Result<Value>;

    /// Receive the configuration block; answer `(cron_spec, event_filter)`,
    /// either possibly empty.
    async fn configure(&self, values: Value) -> anyhow::Result<(String, String)>;

    /// Called at the instants matched by the declared cron spec.
    async fn cron(&self, room: Room) -> anyhow::Result<Vec<Event>>;

    /// Called with every event batch passing the declared event filter.
    async fn handle_events(&self, events: Vec<Event>) -> anyhow::Result<Vec<Event>>;

    /// The long-lived reverse stream. Hold on to `host` and emit events at
    /// will; return only when done with the room (normally never).
    async fn init_emit_events(&self, room: Room, host: HostClient) -> anyhow::Result<()>;
}

/// Reverse endpoint into the host, available once `init_emit_events` has
/// been called for a room.
#[derive(Clone)]
pub struct HostClient {
    peer: Arc<Peer>,
}

impl HostClient {
    /// Push events into the room's pipeline. The emitting plugin is
    /// excluded when the chain re-runs.
    pub async fn emit_events(&self, events: Vec<Event>) -> Result<(), PluginError> {
        match self.peer.call(Call::EmitEvents { events }).await? {
            Reply::Ack => Ok(()),
            other => Err(PluginError::unexpected("ack", &other)),
        }
    }

    pub async fn authenticate_user(
        &self,
        id_token: impl Into<String>,
        provider: impl Into<String>,
    ) -> Result<User, PluginError> {
        let call = Call::AuthenticateUser {
            id_token: id_token.into(),
            provider: provider.into(),
        };
        match self.peer.call(call).await? {
            Reply::User { user } => Ok(user),
            other => Err(PluginError::unexpected("user", &other)),
        }
    }

    pub async fn get_user(&self, id: impl Into<String>) -> Result<User, PluginError> {
        match self.peer.call(Call::GetUser { id: id.into() }).await? {
            Reply::User { user } => Ok(user),
            other => Err(PluginError::unexpected("user", &other)),
        }
    }

    pub async fn get_room(&self, id: impl Into<String>) -> Result<Room, PluginError> {
        match self.peer.call(Call::GetRoom { id: id.into() }).await? {
            Reply::Room { room } => Ok(room),
            other => Err(PluginError::unexpected("room", &other)),
        }
    }

    pub async fn change_user_tags(
        &self,
        id: impl Into<String>,
        updates: Vec<TagUpdate>,
    ) -> Result<Vec<bool>, PluginError> {
        let call = Call::ChangeUserTags {
            id: id.into(),
            updates,
        };
        match self.peer.call(call).await? {
            Reply::TagsChanged { applied } => Ok(applied),
            other => Err(PluginError::unexpected("tags-changed", &other)),
        }
    }

    pub async fn change_room_tags(
        &self,
        id: impl Into<String>,
        updates: Vec<TagUpdate>,
    ) -> Result<Vec<bool>, PluginError> {
        let call = Call::ChangeRoomTags {
            id: id.into(),
            updates,
        };
        match self.peer.call(call).await? {
            Reply::TagsChanged { applied } => Ok(applied),
            other => Err(PluginError::unexpected("tags-changed", &other)),
        }
    }
}

struct RuntimeDispatcher<H> {
    handler: Arc<H>,
    peer: Arc<Peer>,
}

impl<H> RuntimeDispatcher<H> {
    fn host_client(&self) -> HostClient {
        HostClient {
            peer: Arc::clone(&self.peer),
        }
    }
}

#[async_trait]
impl<H: EventHandler + 'static> Dispatcher for RuntimeDispatcher<H> {
    async fn dispatch(&self, call: Call) -> Reply {
        match call {
            Call::GetSpec => match self.handler.get_spec().await {
                Ok(schema) => Reply::Spec { schema },
                Err(err) => Reply::error(err),
            },
            Call::Configure { values } => match self.handler.configure(values).await {
                Ok((cron_spec, event_filter)) => Reply::Configured {
                    cron_spec,
                    event_filter,
                },
                Err(err) => Reply::error(err),
            },
            Call::Cron { room } => match self.handler.cron(room).await {
                Ok(events) => Reply::Events { events },
                Err(err) => Reply::error(err),
            },
            Call::HandleEvents { events } => match self.handler.handle_events(events).await {
                Ok(events) => Reply::Events { events },
                Err(err) => Reply::error(err),
            },
            Call::InitEmitEvents { room } => {
                let host = self.host_client();
                // Holds the request open for the stream's lifetime; the
                // host sees a reply only when the stream ends.
                match self.handler.init_emit_events(room, host).await {
                    Ok(()) => Reply::Ack,
                    Err(err) => Reply::error(err),
                }
            }
            other => {
                warn!(call = ?other, "host sent a reverse call");
                Reply::error("not a plugin-side call")
            }
        }
    }
}

/// Serve a plugin on stdin/stdout. Returns when the host disconnects.
///
/// # Errors
///
/// Fails when the handshake is refused or the transport breaks during it.
pub async fn serve<H: EventHandler + 'static>(handler: Arc<H>) -> Result<(), PluginError> {
    serve_with(tokio::io::stdin(), tokio::io::stdout(), handler).await
}

/// Serve a plugin over an arbitrary transport. Used by tests with an
/// in-memory duplex.
pub async fn serve_with<R, W, H>(
    mut reader: R,
    mut writer: W,
    handler: Arc<H>,
) -> Result<(), PluginError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    H: EventHandler + 'static,
{
    let mut buf = BytesMut::with_capacity(4096);

    // The host speaks first.
    let frame = peer::read_frame::<_, RpcFrame>(&mut reader, &mut buf)
        .await?
        .ok_or(PluginError::Closed)?;
    match frame {
        RpcFrame::Hello(hello) if Hello::current().accepts(&hello) => {}
        RpcFrame::Hello(hello) => {
            return Err(PluginError::Handshake(format!(
                "incompatible host (version {})",
                hello.version
            )));
        }
        _ => return Err(PluginError::Handshake("first frame was not a hello".into())),
    }
    peer::write_frame(&mut writer, &RpcFrame::Hello(Hello::current())).await?;

    let (peer, outbound) = peer::channel_peer();
    let dispatcher = Arc::new(RuntimeDispatcher {
        handler,
        peer: Arc::clone(&peer),
    });
    let closed = peer::spawn_io(
        reader,
        writer,
        buf,
        peer,
        outbound,
        dispatcher as Arc<dyn Dispatcher>,
        "host".to_string(),
    );

    // The io tasks own the connection from here; return when it ends.
    let _ = closed.await;
    Ok(())
}
