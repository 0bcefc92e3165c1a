//! One live connection to a room: a shard document, its transport, the
//! outbound batcher and the room's presence.
//!
//! ```text
//!                 ┌────────────── SyncConnection ──────────────┐
//! ShardDoc ─sink─►│ batcher ──CompressedUpdate──► transport ───┼──► hub
//!     ▲           │                                            │
//!     └─apply─────│ pump ◄──── SyncStep1/2, Update, ◄──────────┼─── hub
//!                 │   └──► PresenceRoom        Awareness, …    │
//!                 └────────────────────────────────────────────┘
//! ```
//!
//! Handshake on open: `PeerJoined`, `SyncStep1(local vector)`, presence
//! `Join`. The connection counts as synced once the hub's `SyncStep2`
//! has been applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use deck_core::PresenceState;

use crate::compressor::{apply_compressed_update, spawn_batcher, BatcherHandle, CompressorStats, DeltaCompressor};
use crate::config::SyncConfig;
use crate::context::Identity;
use crate::document::ShardDoc;
use crate::error::{Result, SyncError};
use crate::presence::{AwarenessMessage, PresenceRoom};
use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::transport::{Connector, TransportHandle};

/// Events from one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Initial sync with the hub finished
    Synced,
    /// The transport went away
    Disconnected,
    /// A remote update was applied to the document
    RemoteChange,
    /// The remote presence list changed
    UsersChanged,
}

/// A live room connection. Created and destroyed only by the pool.
pub struct SyncConnection {
    room: String,
    peer: PeerInfo,
    doc: Arc<ShardDoc>,
    outgoing: mpsc::Sender<SyncMessage>,
    transport: Mutex<Option<TransportHandle>>,
    batcher: BatcherHandle,
    presence: Arc<Mutex<PresenceRoom>>,
    events: broadcast::Sender<ConnectionEvent>,
    synced: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
    created_at: Instant,
}

impl SyncConnection {
    /// Connect to `room` and start the handshake.
    ///
    /// Returns as soon as the transport is up; use [`Self::wait_synced`] to
    /// wait for the initial state.
    pub async fn open(
        connector: &dyn Connector,
        room: &str,
        identity: &Identity,
        config: &SyncConfig,
    ) -> Result<Arc<Self>> {
        let peer = PeerInfo::new(identity.actor_id.clone(), identity.display_name.clone());
        let mut transport = connector.connect(room, &peer).await?;
        let incoming = transport
            .take_incoming()
            .ok_or_else(|| SyncError::Transport("transport has no inbound stream".into()))?;
        let outgoing = transport.sender();

        let doc = Arc::new(ShardDoc::new());
        let (change_tx, change_rx) = mpsc::unbounded_channel();
        doc.set_sink(change_tx);

        let mut compressor = DeltaCompressor::new(config.compressor.clone());
        compressor.initialize(&doc)?;
        let batcher = spawn_batcher(compressor, change_rx, outgoing.clone(), peer.peer_id, room.to_string());

        let local = PresenceState {
            color: identity.color.clone(),
            ..PresenceState::new(identity.actor_id.clone(), identity.display_name.clone())
        };
        let presence = Arc::new(Mutex::new(PresenceRoom::new(peer.peer_id, local)));

        let (events, _) = broadcast::channel(64);
        let (synced_tx, synced) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(true));

        let join = presence.lock().join_message();
        transport.send(SyncMessage::peer_joined(room, &peer)).await?;
        transport
            .send(SyncMessage::sync_step1(peer.peer_id, room, doc.state_vector()))
            .await?;
        transport.send(awareness(&peer, room, &join)?).await?;

        let pump = Pump {
            room: room.to_string(),
            peer: peer.clone(),
            doc: doc.clone(),
            outgoing: outgoing.clone(),
            presence: presence.clone(),
            events: events.clone(),
            synced: synced_tx,
            connected: connected.clone(),
        };
        let pump = tokio::spawn(pump.run(incoming));

        log::info!("Opened connection {} to room {room}", peer.peer_id);

        Ok(Arc::new(Self {
            room: room.to_string(),
            peer,
            doc,
            outgoing,
            transport: Mutex::new(Some(transport)),
            batcher,
            presence,
            events,
            synced,
            connected,
            pump: Mutex::new(Some(pump)),
            created_at: Instant::now(),
        }))
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Connection id; also the owner id recorded on locks.
    pub fn id(&self) -> Uuid {
        self.peer.peer_id
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn doc(&self) -> &Arc<ShardDoc> {
        &self.doc
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Wait until the initial sync finished. Returns false on timeout or
    /// disconnect.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.synced.clone();
        let synced = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|synced| *synced)).await,
            Ok(Ok(_))
        );
        synced
    }

    /// Push every pending local change to the transport.
    pub async fn flush(&self) -> Result<()> {
        self.batcher.flush().await
    }

    pub fn compressor_stats(&self) -> CompressorStats {
        self.batcher.stats()
    }

    /// Update the local cursor; throttled to 30fps.
    pub async fn update_cursor(&self, slide_id: &str, x: f64, y: f64) -> Result<()> {
        let msg = self.presence.lock().update_local_cursor(slide_id, x, y);
        match msg {
            Some(msg) => self.send_awareness(&msg).await,
            None => Ok(()),
        }
    }

    pub async fn update_selection(&self, slide_id: &str, component_ids: Vec<String>) -> Result<()> {
        let msg = self.presence.lock().update_local_selection(slide_id, component_ids);
        self.send_awareness(&msg).await
    }

    /// Presence of every remote peer in the room.
    pub fn users(&self) -> Vec<PresenceState> {
        self.presence.lock().users()
    }

    pub fn users_on_slide(&self, slide_id: &str) -> Vec<PresenceState> {
        self.presence.lock().users_on_slide(slide_id)
    }

    async fn send_awareness(&self, msg: &AwarenessMessage) -> Result<()> {
        let frame = awareness(&self.peer, &self.room, msg)?;
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| SyncError::Transport(format!("transport for {} closed", self.room)))
    }

    /// Flush, say goodbye and tear the transport down.
    pub async fn close(&self) {
        let leave = self.presence.lock().leave_message();
        if self.is_connected() {
            if let Err(e) = self.send_awareness(&leave).await {
                log::debug!("Could not announce leave on {}: {e}", self.room);
            }
        }
        self.batcher.shutdown().await;

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                log::error!("Pump task for {} failed: {e}", self.room);
            }
        }
        log::info!("Closed connection {} to room {}", self.peer.peer_id, self.room);
    }
}

fn awareness(peer: &PeerInfo, room: &str, msg: &AwarenessMessage) -> Result<SyncMessage> {
    let payload = msg.encode().map_err(SyncError::Serialization)?;
    Ok(SyncMessage::awareness(peer.peer_id, room, 0, payload))
}

/// Inbound side of a connection.
struct Pump {
    room: String,
    peer: PeerInfo,
    doc: Arc<ShardDoc>,
    outgoing: mpsc::Sender<SyncMessage>,
    presence: Arc<Mutex<PresenceRoom>>,
    events: broadcast::Sender<ConnectionEvent>,
    synced: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
}

impl Pump {
    async fn run(self, mut incoming: mpsc::Receiver<SyncMessage>) {
        while let Some(msg) = incoming.recv().await {
            if msg.peer_id == self.peer.peer_id {
                continue;
            }
            self.handle(msg).await;
        }

        self.connected.store(false, Ordering::Release);
        let _ = self.events.send(ConnectionEvent::Disconnected);
        log::debug!("Inbound stream for {} ended", self.room);
    }

    async fn handle(&self, msg: SyncMessage) {
        match msg.msg_type {
            MessageType::SyncStep2 => {
                self.apply(self.doc.apply_update(&msg.payload));
                if !*self.synced.borrow() {
                    let _ = self.synced.send(true);
                    let _ = self.events.send(ConnectionEvent::Synced);
                    log::debug!("Room {} synced", self.room);
                }
            }

            MessageType::Update => self.apply(self.doc.apply_update(&msg.payload)),

            MessageType::CompressedUpdate => match msg.compressed_parts() {
                Ok((secondary, body)) => self.apply(apply_compressed_update(&self.doc, body, secondary)),
                Err(e) => log::warn!("Malformed frame in {}: {e}", self.room),
            },

            MessageType::SyncStep1 => match self.doc.encode_diff(&msg.payload) {
                Ok(diff) => {
                    let reply = SyncMessage::sync_step2(self.peer.peer_id, &self.room, diff);
                    if self.outgoing.send(reply).await.is_err() {
                        log::debug!("Transport for {} closed during sync", self.room);
                    }
                }
                Err(e) => log::warn!("Bad state vector in {}: {e}", self.room),
            },

            MessageType::Awareness => self.handle_awareness(&msg.payload).await,

            MessageType::PeerLeft => {
                if self.presence.lock().remove_peer(&msg.peer_id) {
                    let _ = self.events.send(ConnectionEvent::UsersChanged);
                }
            }

            MessageType::PeerJoined | MessageType::Pong => {
                log::trace!("{:?} from {} in {}", msg.msg_type, msg.peer_id, self.room);
            }

            _ => log::debug!("Unhandled message type: {:?}", msg.msg_type),
        }
    }

    fn apply(&self, result: Result<()>) {
        match result {
            Ok(()) => {
                let _ = self.events.send(ConnectionEvent::RemoteChange);
            }
            Err(e) => log::warn!("Skipping remote update in {}: {e}", self.room),
        }
    }

    async fn handle_awareness(&self, payload: &[u8]) {
        let msg = match AwarenessMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Bad awareness payload in {}: {e}", self.room);
                return;
            }
        };

        let (change, announce) = {
            let mut presence = self.presence.lock();
            let change = presence.handle_message(&msg);
            let announce = change.announce.then(|| presence.join_message());
            (change, announce)
        };

        if let Some(join) = announce {
            match awareness(&self.peer, &self.room, &join) {
                Ok(frame) => {
                    let _ = self.outgoing.send(frame).await;
                }
                Err(e) => log::warn!("Could not encode presence: {e}"),
            }
        }
        if change.changed {
            let _ = self.events.send(ConnectionEvent::UsersChanged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::get_string;
    use crate::server::RoomHub;
    use crate::transport::LocalConnector;
    use yrs::Map;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.compressor.max_batch_delay_ms = 10;
        config
    }

    async fn recv_until(
        rx: &mut broadcast::Receiver<ConnectionEvent>,
        want: ConnectionEvent,
    ) -> bool {
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(ev) if ev == want => return true,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => return false,
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait).await.unwrap_or(false)
    }

    #[tokio::test]
    async fn test_two_connections_converge() {
        let hub = Arc::new(RoomHub::with_defaults());
        let connector = LocalConnector::new(hub.clone());
        let config = config();

        let a = SyncConnection::open(&connector, "r", &Identity::new("alice", "Alice"), &config)
            .await
            .unwrap();
        let b = SyncConnection::open(&connector, "r", &Identity::new("bob", "Bob"), &config)
            .await
            .unwrap();
        assert!(a.wait_synced(Duration::from_secs(2)).await);
        assert!(b.wait_synced(Duration::from_secs(2)).await);

        let mut b_events = b.subscribe();
        a.doc()
            .transact_local(|txn, roots| {
                roots.meta.insert(txn, "name", "Deck".to_string());
                Ok(())
            })
            .unwrap();
        a.flush().await.unwrap();

        assert!(recv_until(&mut b_events, ConnectionEvent::RemoteChange).await);
        let name = b.doc().read(|txn, roots| get_string(&roots.meta, txn, "name"));
        assert_eq!(name.as_deref(), Some("Deck"));
        assert_eq!(a.compressor_stats().frames, 1);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_late_joiner_receives_state_and_presence() {
        let hub = Arc::new(RoomHub::with_defaults());
        let connector = LocalConnector::new(hub.clone());
        let config = config();

        let a = SyncConnection::open(&connector, "r", &Identity::new("alice", "Alice"), &config)
            .await
            .unwrap();
        assert!(a.wait_synced(Duration::from_secs(2)).await);
        a.doc()
            .transact_local(|txn, roots| {
                roots.meta.insert(txn, "name", "Early".to_string());
                Ok(())
            })
            .unwrap();
        a.flush().await.unwrap();

        let b = SyncConnection::open(&connector, "r", &Identity::new("bob", "Bob"), &config)
            .await
            .unwrap();
        let mut b_events = b.subscribe();
        assert!(b.wait_synced(Duration::from_secs(2)).await);
        let name = b.doc().read(|txn, roots| get_string(&roots.meta, txn, "name"));
        assert_eq!(name.as_deref(), Some("Early"));

        // Alice answers Bob's join with her own presence
        if b.users().is_empty() {
            assert!(recv_until(&mut b_events, ConnectionEvent::UsersChanged).await);
        }
        assert_eq!(b.users()[0].actor_id, "alice");

        let mut b_events = b.subscribe();
        a.close().await;
        assert!(recv_until(&mut b_events, ConnectionEvent::UsersChanged).await);
        assert!(b.users().is_empty());
        b.close().await;
    }

    #[tokio::test]
    async fn test_close_marks_disconnected() {
        let hub = Arc::new(RoomHub::with_defaults());
        let connector = LocalConnector::new(hub.clone());
        let conn = SyncConnection::open(&connector, "r", &Identity::new("alice", "Alice"), &config())
            .await
            .unwrap();
        assert!(conn.is_connected());
        conn.close().await;
        assert!(!conn.is_connected());
        assert_eq!(hub.peer_count("r").await, 0);
    }
}
