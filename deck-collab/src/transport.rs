//! Duplex transports keyed by room.
//!
//! A [`Connector`] opens a [`TransportHandle`]: an outbound message sender
//! and an inbound message receiver bound to one room. Transports are dumb
//! pipes. The handshake, compression and presence all live above them in
//! [`crate::connection`], so any connector can be swapped in.
//!
//! - [`WsConnector`]: WebSocket client to a [`crate::server::SyncServer`]
//! - [`LocalConnector`]: in-process session on a [`RoomHub`]

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Result, SyncError};
use crate::protocol::{PeerInfo, SyncMessage};
use crate::server::RoomHub;

/// Channel depth in both directions.
const CHANNEL_CAPACITY: usize = 256;

/// Creates transports. Only the connection pool calls this.
pub trait Connector: Send + Sync {
    fn connect(&self, room: &str, peer: &PeerInfo) -> BoxFuture<'static, Result<TransportHandle>>;
}

/// A live transport bound to one room.
///
/// The inbound stream ends when the remote side goes away. Dropping the
/// handle closes the transport.
pub struct TransportHandle {
    room: String,
    outgoing: mpsc::Sender<SyncMessage>,
    incoming: Option<mpsc::Receiver<SyncMessage>>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn new(
        room: impl Into<String>,
        outgoing: mpsc::Sender<SyncMessage>,
        incoming: mpsc::Receiver<SyncMessage>,
        close_tx: oneshot::Sender<()>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            room: room.into(),
            outgoing,
            incoming: Some(incoming),
            close_tx: Some(close_tx),
            task: Some(task),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// A sender for outbound messages.
    pub fn sender(&self) -> mpsc::Sender<SyncMessage> {
        self.outgoing.clone()
    }

    pub async fn send(&self, msg: SyncMessage) -> Result<()> {
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| SyncError::Transport(format!("transport for {} closed", self.room)))
    }

    /// Take the inbound receiver (can only be called once).
    pub fn take_incoming(&mut self) -> Option<mpsc::Receiver<SyncMessage>> {
        self.incoming.take()
    }

    /// Close the transport and wait for its task to finish.
    pub async fn close(mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Transport task for {} failed: {e}", self.room);
            }
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// WebSocket transport to a sync server.
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    /// `server_url` like `ws://127.0.0.1:9090`; the room is appended as a path.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self, room: &str, peer: &PeerInfo) -> BoxFuture<'static, Result<TransportHandle>> {
        let url = format!("{}/{}", self.server_url, room);
        let room = room.to_string();
        let peer_id = peer.peer_id;

        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
            let (mut ws_writer, mut ws_reader) = ws_stream.split();
            log::debug!("Connected to {url}");

            let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(CHANNEL_CAPACITY);
            let (close_tx, mut close_rx) = oneshot::channel::<()>();

            let task_room = room.clone();
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut close_rx => {
                            let _ = ws_writer.send(Message::Close(None)).await;
                            break;
                        }

                        out = out_rx.recv() => match out {
                            Some(msg) => match msg.encode() {
                                Ok(encoded) => {
                                    if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => log::warn!("Failed to encode message for {task_room}: {e}"),
                            },
                            None => {
                                let _ = ws_writer.send(Message::Close(None)).await;
                                break;
                            }
                        },

                        msg = ws_reader.next() => match msg {
                            Some(Ok(Message::Binary(data))) => {
                                if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                    // Skip our own messages
                                    if sync_msg.peer_id == peer_id {
                                        continue;
                                    }
                                    if in_tx.send(sync_msg).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                            _ => {}
                        },
                    }
                }
                log::debug!("WebSocket transport for {task_room} closed");
            });

            Ok(TransportHandle::new(room, out_tx, in_rx, close_tx, task))
        })
    }
}

/// In-process transport driving a [`RoomHub`] session directly.
#[derive(Clone)]
pub struct LocalConnector {
    hub: Arc<RoomHub>,
}

impl LocalConnector {
    pub fn new(hub: Arc<RoomHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }
}

impl Connector for LocalConnector {
    fn connect(&self, room: &str, _peer: &PeerInfo) -> BoxFuture<'static, Result<TransportHandle>> {
        let hub = self.hub.clone();
        let room = room.to_string();

        Box::pin(async move {
            let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(CHANNEL_CAPACITY);
            let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(CHANNEL_CAPACITY);
            let (hub_tx, hub_rx) = mpsc::channel::<SyncMessage>(CHANNEL_CAPACITY);
            let (close_tx, mut close_rx) = oneshot::channel::<()>();

            let session = tokio::spawn(async move { hub.serve_session(hub_rx, in_tx).await });

            // Forward until closed, then end the session and wait for the leave
            let task = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut close_rx => break,
                        out = out_rx.recv() => match out {
                            Some(msg) => {
                                if hub_tx.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
                drop(hub_tx);
                let _ = session.await;
            });

            Ok(TransportHandle::new(room, out_tx, in_rx, close_tx, task))
        })
    }
}
