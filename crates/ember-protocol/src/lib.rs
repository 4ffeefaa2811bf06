//! # ember-protocol
//!
//! Wire protocol definitions for the Ember chat engine.
//!
//! Two surfaces share this crate:
//!
//! - **Websocket frames** - the JSON `{event, data}` envelope clients
//!   speak, including the pluralized outbound batches
//! - **Plugin RPC** - length-prefixed JSON frames between the hub host and
//!   out-of-process plugins, plus the magic-cookie handshake
//!
//! ## Example
//!
//! ```rust
//! use ember_protocol::{codec, RpcFrame, Hello};
//!
//! let frame = RpcFrame::Hello(Hello::current());
//! let encoded = codec::encode(&frame).unwrap();
//! let mut buf = bytes::BytesMut::from(&encoded[..]);
//! let decoded: RpcFrame = codec::decode_from(&mut buf).unwrap().unwrap();
//! ```

pub mod codec;
pub mod handshake;
pub mod rpc;
pub mod wire;

pub use codec::ProtocolError;
pub use handshake::{Hello, Version, MAGIC_COOKIE, PROTOCOL_VERSION};
pub use rpc::{Call, Reply, RpcFrame};
pub use wire::{batch_frames, wire_event, WsFrame, MAX_INBOUND_FRAME};
