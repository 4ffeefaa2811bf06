//! # ember-plugin
//!
//! Out-of-process plugin port for the Ember chat engine.
//!
//! Plugins are separate processes speaking length-prefixed JSON frames over
//! stdio (see `ember-protocol`). The only extension point in the engine is
//! this RPC boundary — there are no in-process event handler interfaces.
//!
//! - **Host side**: [`PluginHandle`] launches a plugin, performs the
//!   handshake and exposes the five operations. Reverse calls the plugin
//!   makes are served through [`HostCallbacks`].
//! - **Plugin side**: implement [`EventHandler`] and hand it to [`serve`].

mod host;
mod peer;
mod runtime;

pub use host::{HostCallbacks, PluginHandle};
pub use runtime::{serve, serve_with, EventHandler, HostClient};

use ember_protocol::rpc::Reply;
use thiserror::Error;

/// Failures of the plugin transport or of a remote call.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ember_protocol::ProtocolError),

    #[error("plugin handshake failed: {0}")]
    Handshake(String),

    /// The remote side answered with an error reply.
    #[error("plugin call failed: {0}")]
    Remote(String),

    /// The connection is gone; the supervisor should restart it.
    #[error("plugin connection closed")]
    Closed,

    #[error("unexpected reply: wanted {expected}, got {got}")]
    Unexpected {
        expected: &'static str,
        got: &'static str,
    },
}

impl PluginError {
    pub(crate) fn unexpected(expected: &'static str, got: &Reply) -> Self {
        let got = match got {
            Reply::Ack => "ack",
            Reply::Error { .. } => "error",
            Reply::Spec { .. } => "spec",
            Reply::Configured { .. } => "configured",
            Reply::Events { .. } => "events",
            Reply::User { .. } => "user",
            Reply::Room { .. } => "room",
            Reply::TagsChanged { .. } => "tags-changed",
        };
        PluginError::Unexpected { expected, got }
    }
}
