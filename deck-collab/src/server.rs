//! Room-based sync hub and its WebSocket front end.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── deck-1-master ── Yrs Doc ── BroadcastGroup
//!             ├── serve_session ─────┤
//! Client B ──┘                      └── deck-1-shard-0 ── Yrs Doc ── BroadcastGroup
//!                                                  │
//!                                       ┌──────────┼───────────┐
//!                                       ▼          ▼           ▼
//!                                    Client A   Client B    Client C
//! ```
//!
//! Each room maintains:
//! - A Yrs `Doc` holding the authoritative state
//! - A `BroadcastGroup` for fan-out to connected peers
//!
//! [`RoomHub`] is transport agnostic: a session is a pair of message
//! channels. [`SyncServer`] bridges WebSocket connections onto sessions;
//! [`crate::transport::LocalConnector`] does the same in-process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use crate::broadcast::BroadcastGroup;
use crate::compressor::decode_frame_body;
use crate::document::apply_update_v1;
use crate::error::{Result, SyncError};
use crate::presence::AwarenessMessage;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// Room: authoritative Yrs doc + broadcast group.
struct HubRoom {
    doc: parking_lot::Mutex<Doc>,
    group: BroadcastGroup,
}

impl HubRoom {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            doc: parking_lot::Mutex::new(Doc::new()),
            group: BroadcastGroup::new(broadcast_capacity),
        }
    }

    fn apply(&self, room: &str, update: &[u8]) -> bool {
        let doc = self.doc.lock();
        match apply_update_v1(&doc, update) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Rejected update for room {room}: {e}");
                false
            }
        }
    }

    fn state_vector(&self) -> Vec<u8> {
        let doc = self.doc.lock();
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector)?;
        let doc = self.doc.lock();
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }
}

/// In-memory authority for every room.
pub struct RoomHub {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, Arc<HubRoom>>>,
    stats: RwLock<ServerStats>,
}

impl RoomHub {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            stats: RwLock::new(ServerStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    async fn room(&self, room: &str) -> Option<Arc<HubRoom>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Add a peer to a room, creating the room on first use.
    pub async fn join(
        &self,
        room: &str,
        info: PeerInfo,
    ) -> std::result::Result<broadcast::Receiver<Arc<SyncMessage>>, ProtocolError> {
        let (hub_room, room_count) = {
            let mut rooms = self.rooms.write().await;
            let hub_room = rooms
                .entry(room.to_string())
                .or_insert_with(|| Arc::new(HubRoom::new(self.config.broadcast_capacity)))
                .clone();
            (hub_room, rooms.len())
        };

        if hub_room.group.peer_count().await >= self.config.max_peers_per_room {
            log::warn!("Room {room} is full, rejecting {}", info.peer_id);
            return Err(ProtocolError::RoomFull(room.to_string()));
        }

        let rx = hub_room.group.add_peer(info.clone()).await;
        hub_room.group.broadcast(SyncMessage::peer_joined(room, &info));

        self.stats.write().await.active_rooms = room_count;
        log::info!("Peer {} ({}) joined room {room}", info.name, info.peer_id);
        Ok(rx)
    }

    /// Remove a peer and tell the rest of the room.
    pub async fn leave(&self, room: &str, peer_id: Uuid) {
        if let Some(hub_room) = self.room(room).await {
            if hub_room.group.remove_peer(&peer_id).await.is_some() {
                hub_room.group.broadcast(SyncMessage::peer_left(peer_id, room));
                log::info!("Peer {peer_id} left room {room}");
            }
        }
    }

    /// Process one message from a joined peer. Returns direct replies.
    pub async fn handle(&self, room: &str, msg: SyncMessage) -> Vec<SyncMessage> {
        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += msg.payload.len() as u64;
        }

        let Some(hub_room) = self.room(room).await else {
            log::debug!("Message for unknown room {room}");
            return Vec::new();
        };

        match msg.msg_type {
            MessageType::Update => {
                if hub_room.apply(room, &msg.payload) {
                    hub_room.group.broadcast(msg);
                }
                Vec::new()
            }

            MessageType::CompressedUpdate => {
                let update = msg
                    .compressed_parts()
                    .map_err(SyncError::from)
                    .and_then(|(secondary, body)| decode_frame_body(body, secondary));
                match update {
                    Ok(update) => {
                        if hub_room.apply(room, &update) {
                            hub_room.group.broadcast(msg);
                        }
                    }
                    Err(e) => log::warn!("Dropping bad frame for room {room}: {e}"),
                }
                Vec::new()
            }

            MessageType::SyncStep1 => match hub_room.diff(&msg.payload) {
                Ok(diff) => vec![
                    SyncMessage::sync_step2(Uuid::nil(), room, diff),
                    SyncMessage::sync_step1(Uuid::nil(), room, hub_room.state_vector()),
                ],
                Err(e) => {
                    log::warn!("Bad state vector from {} in room {room}: {e}", msg.peer_id);
                    Vec::new()
                }
            },

            MessageType::SyncStep2 => {
                // The peer's offline changes; everyone else needs them too
                if msg.payload != [0, 0] && hub_room.apply(room, &msg.payload) {
                    hub_room
                        .group
                        .broadcast(SyncMessage::update(msg.peer_id, room, msg.clock, msg.payload));
                }
                Vec::new()
            }

            MessageType::Awareness => {
                if let Ok(awareness) = AwarenessMessage::decode(&msg.payload) {
                    match &awareness {
                        AwarenessMessage::Join { state, .. } => {
                            log::debug!("Presence: {} joined room {room}", state.display_name);
                        }
                        AwarenessMessage::Leave { peer_id } => {
                            log::debug!("Presence: {peer_id} left room {room}");
                        }
                        AwarenessMessage::Cursor { .. } => {
                            log::trace!("Presence: cursor update in room {room}");
                        }
                        AwarenessMessage::Selection { peer_id, .. } => {
                            log::trace!("Presence: {peer_id} changed selection in room {room}");
                        }
                    }
                }
                hub_room.group.broadcast(msg);
                Vec::new()
            }

            MessageType::Ping => vec![SyncMessage::pong(Uuid::nil())],

            _ => {
                log::debug!("Unhandled message type: {:?}", msg.msg_type);
                Vec::new()
            }
        }
    }

    /// Drive one peer session over a pair of channels.
    ///
    /// The first message must be `PeerJoined`. The session ends when
    /// `inbound` closes or `outbound` is dropped; the peer then leaves.
    pub async fn serve_session(
        &self,
        mut inbound: mpsc::Receiver<SyncMessage>,
        outbound: mpsc::Sender<SyncMessage>,
    ) {
        self.connection_opened().await;

        let mut session: Option<(String, Uuid)> = None;
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<SyncMessage>>> = None;

        'session: loop {
            tokio::select! {
                msg = inbound.recv() => {
                    let Some(msg) = msg else { break };

                    if msg.msg_type == MessageType::PeerJoined {
                        if session.is_some() {
                            log::warn!("Duplicate join from {}", msg.peer_id);
                            continue;
                        }
                        let info = msg.peer_info().unwrap_or_else(|_| {
                            PeerInfo::with_id(msg.peer_id, msg.peer_id.to_string(), "Anonymous")
                        });
                        match self.join(&msg.room, info).await {
                            Ok(rx) => {
                                session = Some((msg.room.clone(), msg.peer_id));
                                broadcast_rx = Some(rx);
                            }
                            Err(e) => {
                                log::warn!("Join rejected: {e}");
                                break;
                            }
                        }
                        continue;
                    }

                    let Some((room, _)) = &session else {
                        log::debug!("Ignoring {:?} before join", msg.msg_type);
                        continue;
                    };
                    for reply in self.handle(room, msg).await {
                        if outbound.send(reply).await.is_err() {
                            break 'session;
                        }
                    }
                }

                msg = recv_broadcast(&mut broadcast_rx) => {
                    let own_id = session.as_ref().map(|(_, id)| *id);
                    match msg {
                        Ok(msg) => {
                            // Don't echo back to sender
                            if Some(msg.peer_id) == own_id {
                                continue;
                            }
                            if outbound.send((*msg).clone()).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {own_id:?} lagged by {n} messages, resending state");
                            if let Some((room, _)) = &session {
                                if let Some(hub_room) = self.room(room).await {
                                    let empty = StateVector::default().encode_v1();
                                    if let Ok(state) = hub_room.diff(&empty) {
                                        let catch_up = SyncMessage::sync_step2(Uuid::nil(), room, state);
                                        if outbound.send(catch_up).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        if let Some((room, peer_id)) = session {
            self.leave(&room, peer_id).await;
        }
        self.connection_closed().await;
    }

    async fn connection_opened(&self) {
        let mut s = self.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    async fn connection_closed(&self) {
        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn peer_count(&self, room: &str) -> usize {
        match self.room(room).await {
            Some(r) => r.group.peer_count().await,
            None => 0,
        }
    }

    /// Full authoritative state of a room as one update.
    pub async fn room_state(&self, room: &str) -> Option<Vec<u8>> {
        let hub_room = self.room(room).await?;
        hub_room.diff(&StateVector::default().encode_v1()).ok()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }
}

async fn recv_broadcast(
    rx: &mut Option<broadcast::Receiver<Arc<SyncMessage>>>,
) -> std::result::Result<Arc<SyncMessage>, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        // No broadcast receiver yet; wait forever
        None => std::future::pending().await,
    }
}

/// WebSocket front end for a [`RoomHub`].
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<RoomHub>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(RoomHub::new(config.clone()));
        Self { config, hub }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(stream: TcpStream, addr: SocketAddr, hub: Arc<RoomHub>) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        let (in_tx, in_rx) = mpsc::channel::<SyncMessage>(256);
        let (out_tx, mut out_rx) = mpsc::channel::<SyncMessage>(256);
        let session = tokio::spawn(async move { hub.serve_session(in_rx, out_tx).await });

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => {
                            if in_tx.send(sync_msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },

                out = out_rx.recv() => match out {
                    Some(sync_msg) => {
                        let encoded = sync_msg.encode()?;
                        if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        drop(in_tx);
        if let Err(e) = session.await {
            log::error!("Session task for {addr} failed: {e}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{get_string, ShardDoc};
    use yrs::Map;

    fn update_setting(key: &str, value: &str) -> Vec<u8> {
        let doc = ShardDoc::new();
        let (_, update) = doc
            .transact_local(|txn, roots| {
                roots.meta.insert(txn, key.to_string(), value.to_string());
                Ok(())
            })
            .unwrap();
        update
    }

    #[tokio::test]
    async fn test_join_creates_room() {
        let hub = RoomHub::with_defaults();
        let _rx = hub.join("deck-master", PeerInfo::new("a", "Alice")).await.unwrap();
        assert_eq!(hub.room_count().await, 1);
        assert_eq!(hub.peer_count("deck-master").await, 1);
        assert_eq!(hub.stats().await.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_room_full() {
        let hub = RoomHub::new(ServerConfig {
            max_peers_per_room: 1,
            ..ServerConfig::default()
        });
        let _rx = hub.join("r", PeerInfo::new("a", "Alice")).await.unwrap();
        let err = hub.join("r", PeerInfo::new("b", "Bob")).await.unwrap_err();
        assert!(matches!(err, ProtocolError::RoomFull(_)));
    }

    #[tokio::test]
    async fn test_update_applied_and_broadcast() {
        let hub = RoomHub::with_defaults();
        let alice = PeerInfo::new("a", "Alice");
        let bob = PeerInfo::new("b", "Bob");
        let _a = hub.join("r", alice.clone()).await.unwrap();
        let mut b = hub.join("r", bob).await.unwrap();

        let update = update_setting("name", "Deck");
        let replies = hub
            .handle("r", SyncMessage::update(alice.peer_id, "r", 1, update.clone()))
            .await;
        assert!(replies.is_empty());

        // Skip Bob's own join notification
        let mut got = b.recv().await.unwrap();
        while got.msg_type != MessageType::Update {
            got = b.recv().await.unwrap();
        }
        assert_eq!(got.payload, update);

        let replica = ShardDoc::new();
        replica.apply_update(&hub.room_state("r").await.unwrap()).unwrap();
        let name = replica.read(|txn, roots| get_string(&roots.meta, txn, "name"));
        assert_eq!(name.as_deref(), Some("Deck"));
    }

    #[tokio::test]
    async fn test_sync_step1_replies_with_diff_and_vector() {
        let hub = RoomHub::with_defaults();
        let alice = PeerInfo::new("a", "Alice");
        let _a = hub.join("r", alice.clone()).await.unwrap();
        hub.handle("r", SyncMessage::update(alice.peer_id, "r", 1, update_setting("k", "v")))
            .await;

        let fresh = ShardDoc::new();
        let replies = hub
            .handle("r", SyncMessage::sync_step1(alice.peer_id, "r", fresh.state_vector()))
            .await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].msg_type, MessageType::SyncStep2);
        assert_eq!(replies[1].msg_type, MessageType::SyncStep1);

        fresh.apply_update(&replies[0].payload).unwrap();
        let value = fresh.read(|txn, roots| get_string(&roots.meta, txn, "k"));
        assert_eq!(value.as_deref(), Some("v"));
        assert_eq!(replies[1].payload, fresh.state_vector());
    }

    #[tokio::test]
    async fn test_bad_update_not_broadcast() {
        let hub = RoomHub::with_defaults();
        let alice = PeerInfo::new("a", "Alice");
        let _a = hub.join("r", alice.clone()).await.unwrap();
        let mut b = hub.join("r", PeerInfo::new("b", "Bob")).await.unwrap();

        hub.handle("r", SyncMessage::update(alice.peer_id, "r", 1, vec![0xFF, 0xEE]))
            .await;
        hub.handle("r", SyncMessage::ping(alice.peer_id)).await;

        // Only the join notification was broadcast
        let got = b.recv().await.unwrap();
        assert_eq!(got.msg_type, MessageType::PeerJoined);
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_join_and_leave() {
        let hub = Arc::new(RoomHub::with_defaults());
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let task = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.serve_session(in_rx, out_tx).await })
        };

        let alice = PeerInfo::new("a", "Alice");
        in_tx.send(SyncMessage::peer_joined("r", &alice)).await.unwrap();
        in_tx.send(SyncMessage::ping(alice.peer_id)).await.unwrap();
        let pong = out_rx.recv().await.unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(hub.peer_count("r").await, 1);

        drop(in_tx);
        task.await.unwrap();
        assert_eq!(hub.peer_count("r").await, 0);
        assert_eq!(hub.stats().await.active_connections, 0);
    }
}
