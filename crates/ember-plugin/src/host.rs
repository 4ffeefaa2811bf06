//! Host side of the plugin port.
//!
//! The hub host launches each plugin as a child process and speaks
//! length-prefixed JSON over its stdio. One connection serves every room;
//! the long-lived reverse stream is opened once per (plugin, room) and the
//! supervisor restarts it with back-off when it ends.

use crate::peer::{self, Dispatcher, Peer};
use crate::PluginError;
use async_trait::async_trait;
use bytes::BytesMut;
use ember_core::{Event, Room};
use ember_protocol::rpc::{Call, Reply};
use ember_protocol::Hello;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{info, warn};

/// Serves the reverse endpoint plugins call back into.
///
/// The implementation knows which plugin is calling, so events it emits
/// re-enter the pipeline with that plugin excluded.
#[async_trait]
pub trait HostCallbacks: Send + Sync {
    async fn handle(&self, plugin_name: &str, call: Call) -> Reply;
}

struct HostDispatcher {
    plugin_name: String,
    callbacks: Arc<dyn HostCallbacks>,
}

#[async_trait]
impl Dispatcher for HostDispatcher {
    async fn dispatch(&self, call: Call) -> Reply {
        match call {
            // Only reverse calls may originate from a plugin.
            Call::EmitEvents { .. }
            | Call::AuthenticateUser { .. }
            | Call::GetUser { .. }
            | Call::GetRoom { .. }
            | Call::ChangeUserTags { .. }
            | Call::ChangeRoomTags { .. } => {
                self.callbacks.handle(&self.plugin_name, call).await
            }
            other => {
                warn!(plugin = %self.plugin_name, call = ?other, "plugin sent a host-side call");
                Reply::error("not a reverse call")
            }
        }
    }
}

/// A connected plugin. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct PluginHandle {
    name: String,
    peer: Arc<Peer>,
}

impl PluginHandle {
    /// Launch `command` via the shell and handshake with it on stdio.
    ///
    /// # Errors
    ///
    /// Fails when the process cannot be spawned or the handshake is
    /// refused.
    pub async fn launch(
        name: impl Into<String>,
        command: &str,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> Result<Self, PluginError> {
        let name = name.into();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or(PluginError::Closed)?;
        let stdout = child.stdout.take().ok_or(PluginError::Closed)?;

        let exit_name = name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(plugin = %exit_name, %status, "plugin process exited"),
                Err(err) => warn!(plugin = %exit_name, error = %err, "plugin process wait failed"),
            }
        });

        Self::connect(name, stdout, stdin, callbacks).await
    }

    /// Handshake over an arbitrary transport. Used directly by tests with
    /// an in-memory duplex.
    pub async fn connect<R, W>(
        name: impl Into<String>,
        mut reader: R,
        mut writer: W,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> Result<Self, PluginError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let mut buf = BytesMut::with_capacity(4096);

        // Host speaks first; the plugin answers with its own hello.
        peer::write_frame(&mut writer, &ember_protocol::RpcFrame::Hello(Hello::current())).await?;
        let frame = peer::read_frame::<_, ember_protocol::RpcFrame>(&mut reader, &mut buf)
            .await?
            .ok_or(PluginError::Closed)?;
        match frame {
            ember_protocol::RpcFrame::Hello(hello) if Hello::current().accepts(&hello) => {}
            ember_protocol::RpcFrame::Hello(hello) => {
                return Err(PluginError::Handshake(format!(
                    "incompatible plugin (version {})",
                    hello.version
                )));
            }
            _ => {
                return Err(PluginError::Handshake(
                    "first frame was not a hello".into(),
                ));
            }
        }

        let dispatcher = Arc::new(HostDispatcher {
            plugin_name: name.clone(),
            callbacks,
        });
        let (peer, outbound) = peer::channel_peer();
        let _closed = peer::spawn_io(
            reader,
            writer,
            buf,
            Arc::clone(&peer),
            outbound,
            dispatcher,
            name.clone(),
        );
        info!(plugin = %name, "plugin connected");
        Ok(Self { name, peer })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declarative schema of the plugin's configuration block.
    pub async fn get_spec(&self) -> Result<Value, PluginError> {
        match self.peer.call(Call::GetSpec).await? {
            Reply::Spec { schema } => Ok(schema),
            other => Err(PluginError::unexpected("spec", &other)),
        }
    }

    /// Hand over configuration; returns `(cron_spec, event_filter)`, either
    /// possibly empty.
    pub async fn configure(&self, values: Value) -> Result<(String, String), PluginError> {
        match self.peer.call(Call::Configure { values }).await? {
            Reply::Configured {
                cron_spec,
                event_filter,
            } => Ok((cron_spec, event_filter)),
            other => Err(PluginError::unexpected("configured", &other)),
        }
    }

    /// Invoked by the cron driver; returns events to inject.
    pub async fn cron(&self, room: &Room) -> Result<Vec<Event>, PluginError> {
        match self.peer.call(Call::Cron { room: room.clone() }).await? {
            Reply::Events { events } => Ok(events),
            Reply::Ack => Ok(Vec::new()),
            other => Err(PluginError::unexpected("events", &other)),
        }
    }

    /// Synchronous event transformation; returns derived events.
    pub async fn handle_events(&self, events: Vec<Event>) -> Result<Vec<Event>, PluginError> {
        match self.peer.call(Call::HandleEvents { events }).await? {
            Reply::Events { events } => Ok(events),
            Reply::Ack => Ok(Vec::new()),
            other => Err(PluginError::unexpected("events", &other)),
        }
    }

    /// Open the reverse stream for `room`. Blocks for the lifetime of the
    /// stream — under normal operation it never returns; any return means
    /// the supervisor should back off and retry.
    pub async fn init_emit_events(&self, room: &Room) -> Result<(), PluginError> {
        match self
            .peer
            .call(Call::InitEmitEvents { room: room.clone() })
            .await?
        {
            Reply::Ack => Ok(()),
            other => Err(PluginError::unexpected("ack", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{serve_with, EventHandler, HostClient};
    use ember_core::{Source, Tags, User};

    struct EchoPlugin;

    #[async_trait]
    impl EventHandler for EchoPlugin {
        async fn get_spec(&self) -> anyhow::Result<Value> {
            Ok(serde_json::json!({"block": "echo"}))
        }

        async fn configure(&self, _values: Value) -> anyhow::Result<(String, String)> {
            Ok((String::new(), "Name == \"chat\"".to_string()))
        }

        async fn cron(&self, _room: Room) -> anyhow::Result<Vec<Event>> {
            Ok(Vec::new())
        }

        async fn handle_events(&self, events: Vec<Event>) -> anyhow::Result<Vec<Event>> {
            Ok(events
                .into_iter()
                .map(|event| {
                    let mut tags = event.tags.clone();
                    tags.insert("echoed".into(), "true".into());
                    Event::new(
                        event.room,
                        Source::plugin(event.source.user, "echo"),
                        "",
                        event.language,
                        event.name,
                        tags,
                    )
                })
                .collect())
        }

        async fn init_emit_events(&self, _room: Room, _host: HostClient) -> anyhow::Result<()> {
            // Hold the stream open forever, like a real plugin would.
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct NoCallbacks;

    #[async_trait]
    impl HostCallbacks for NoCallbacks {
        async fn handle(&self, _plugin_name: &str, _call: Call) -> Reply {
            Reply::error("unused in this test")
        }
    }

    async fn connected_pair() -> PluginHandle {
        let (host_side, plugin_side) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (plugin_read, plugin_write) = tokio::io::split(plugin_side);

        tokio::spawn(async move {
            let _ = serve_with(plugin_read, plugin_write, Arc::new(EchoPlugin)).await;
        });

        PluginHandle::connect("echo", host_read, host_write, Arc::new(NoCallbacks))
            .await
            .expect("handshake")
    }

    #[tokio::test]
    async fn spec_and_configure_round_trip() {
        let handle = connected_pair().await;
        let spec = handle.get_spec().await.unwrap();
        assert_eq!(spec["block"], "echo");

        let (cron_spec, event_filter) = handle.configure(serde_json::json!({})).await.unwrap();
        assert!(cron_spec.is_empty());
        assert_eq!(event_filter, "Name == \"chat\"");
    }

    #[tokio::test]
    async fn handle_events_transforms() {
        let handle = connected_pair().await;
        let room = Room::new("default", User::new("admin", "admin"));
        let event = Event::new(
            room,
            Source::client(User::new("alice", "alice")),
            "",
            "en",
            "chat",
            Tags::new(),
        );
        let derived = handle.handle_events(vec![event]).await.unwrap();
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0].tags["echoed"], "true");
        assert_eq!(derived[0].source.plugin_name, "echo");
    }

    #[tokio::test]
    async fn init_emit_events_blocks_until_stream_dies() {
        let handle = connected_pair().await;
        let room = Room::new("default", User::new("admin", "admin"));
        let pending = handle.init_emit_events(&room);
        // The stream stays open; the call must not resolve.
        let outcome =
            tokio::time::timeout(std::time::Duration::from_millis(100), pending).await;
        assert!(outcome.is_err(), "reverse stream ended unexpectedly");
    }
}
