//! Shared request/response machinery.
//!
//! Host and plugin ends of the wire are symmetric: each side issues
//! `request` frames with fresh ids, answers the peer's requests, and routes
//! incoming `response` frames to whoever is waiting on that id.

use crate::PluginError;
use async_trait::async_trait;
use bytes::BytesMut;
use ember_protocol::codec;
use ember_protocol::rpc::{Call, Reply, RpcFrame};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Answers the peer's incoming calls.
#[async_trait]
pub(crate) trait Dispatcher: Send + Sync {
    async fn dispatch(&self, call: Call) -> Reply;
}

/// One end of a plugin connection.
pub(crate) struct Peer {
    tx: mpsc::Sender<RpcFrame>,
    pending: Mutex<Option<HashMap<u64, oneshot::Sender<Reply>>>>,
    next_id: AtomicU64,
}

/// Create a peer and the outbound queue its writer task will drain.
pub(crate) fn channel_peer() -> (Arc<Peer>, mpsc::Receiver<RpcFrame>) {
    let (tx, rx) = mpsc::channel(64);
    (
        Arc::new(Peer {
            tx,
            pending: Mutex::new(Some(HashMap::new())),
            next_id: AtomicU64::new(1),
        }),
        rx,
    )
}

impl Peer {
    /// Issue a call and wait for the peer's reply.
    pub(crate) async fn call(&self, call: Call) -> Result<Reply, PluginError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            match pending.as_mut() {
                Some(map) => {
                    map.insert(id, reply_tx);
                }
                None => return Err(PluginError::Closed),
            }
        }

        if self
            .tx
            .send(RpcFrame::Request { id, call })
            .await
            .is_err()
        {
            self.take_pending(id);
            return Err(PluginError::Closed);
        }

        match reply_rx.await {
            Ok(Reply::Error { message }) => Err(PluginError::Remote(message)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(PluginError::Closed),
        }
    }

    async fn respond(&self, id: u64, result: Reply) {
        let _ = self.tx.send(RpcFrame::Response { id, result }).await;
    }

    fn complete(&self, id: u64, result: Reply) {
        if let Some(sender) = self.take_pending(id) {
            let _ = sender.send(result);
        } else {
            debug!(id, "response for unknown request id");
        }
    }

    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<Reply>> {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .as_mut()
            .and_then(|map| map.remove(&id))
    }

    /// Drop every waiter; their `call` futures resolve to `Closed`.
    fn fail_all(&self) {
        self.pending.lock().expect("pending lock poisoned").take();
    }
}

/// Read one length-prefixed frame, buffering partial reads. `Ok(None)` is a
/// clean end of stream.
pub(crate) async fn read_frame<R, T>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<T>, PluginError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        if let Some(frame) = codec::decode_from(buf)? {
            return Ok(Some(frame));
        }
        let n = reader.read_buf(buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(PluginError::Protocol(codec::ProtocolError::Invalid(
                "stream ended mid-frame".into(),
            )));
        }
    }
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), PluginError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = codec::encode(frame)?;
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Wire up a connected, handshaken transport: a writer task draining the
/// outbound queue and a reader task routing responses and dispatching the
/// peer's requests. The returned receiver resolves when the stream ends.
pub(crate) fn spawn_io<R, W>(
    mut reader: R,
    mut writer: W,
    mut buf: BytesMut,
    peer: Arc<Peer>,
    mut rx: mpsc::Receiver<RpcFrame>,
    dispatcher: Arc<dyn Dispatcher>,
    label: String,
) -> oneshot::Receiver<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (closed_tx, closed_rx) = oneshot::channel();

    let writer_label = label.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = write_frame(&mut writer, &frame).await {
                warn!(plugin = %writer_label, error = %err, "plugin stream write failed");
                break;
            }
        }
    });

    let reader_peer = peer;
    tokio::spawn(async move {
        loop {
            match read_frame::<_, RpcFrame>(&mut reader, &mut buf).await {
                Ok(Some(RpcFrame::Response { id, result })) => {
                    reader_peer.complete(id, result);
                }
                Ok(Some(RpcFrame::Request { id, call })) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let peer = Arc::clone(&reader_peer);
                    tokio::spawn(async move {
                        let reply = dispatcher.dispatch(call).await;
                        peer.respond(id, reply).await;
                    });
                }
                Ok(Some(RpcFrame::Hello(_))) => {
                    debug!(plugin = %label, "unexpected hello after handshake");
                }
                Ok(None) => {
                    debug!(plugin = %label, "plugin stream closed");
                    break;
                }
                Err(err) => {
                    warn!(plugin = %label, error = %err, "plugin stream read failed");
                    break;
                }
            }
        }
        reader_peer.fail_all();
        let _ = closed_tx.send(());
    });

    closed_rx
}
