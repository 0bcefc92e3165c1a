//! Binary protocol for room-scoped CRDT synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len+utf8 │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Handshake per room:
//! ```text
//! client ── PeerJoined ─────────────► hub
//! client ── SyncStep1(sv) ──────────► hub
//! client ◄─ SyncStep2(diff) ───────── hub
//! client ◄─ SyncStep1(hub sv) ─────── hub
//! client ── SyncStep2(diff) ────────► hub
//! ```
//! After the handshake, document changes travel as `CompressedUpdate`
//! frames produced by the delta compressor.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the other side for what we are missing
    SyncStep1 = 1,
    /// Yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Raw yrs update (v1 encoding)
    Update = 3,
    /// Batched delta from the compressor: flag byte + body
    CompressedUpdate = 4,
    /// Presence update (cursor/selection/identity)
    Awareness = 5,
    /// Peer joined notification; first message on every connection
    PeerJoined = 6,
    /// Peer left notification
    PeerLeft = 7,
    /// Heartbeat ping
    Ping = 8,
    /// Heartbeat pong
    Pong = 9,
}

/// Identity of one connection in a room.
///
/// `peer_id` is unique per connection; `actor_id` is the human behind it and
/// may appear on several connections (one per loaded shard).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub actor_id: String,
    pub name: String,
    /// CSS hex color for cursor/selection rendering
    pub color: String,
}

impl PeerInfo {
    pub fn new(actor_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), actor_id, name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, actor_id: impl Into<String>, name: impl Into<String>) -> Self {
        let actor_id = actor_id.into();
        let color = deck_core::presence::color_for_actor(&actor_id);
        Self {
            peer_id,
            actor_id,
            name: name.into(),
            color,
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Per-connection send counter
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn build(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    /// Create a raw update message.
    pub fn update(peer_id: Uuid, room: &str, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::build(MessageType::Update, peer_id, room, clock, yrs_update)
    }

    /// Create a compressed update frame.
    ///
    /// The first payload byte records whether the body went through the
    /// secondary (LZ4) pass.
    pub fn compressed_update(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        body: &[u8],
        secondary_compressed: bool,
    ) -> Self {
        let mut payload = Vec::with_capacity(body.len() + 1);
        payload.push(u8::from(secondary_compressed));
        payload.extend_from_slice(body);
        Self::build(MessageType::CompressedUpdate, peer_id, room, clock, payload)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::build(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, room: &str, state_diff: Vec<u8>) -> Self {
        Self::build(MessageType::SyncStep2, peer_id, room, 0, state_diff)
    }

    /// Create an awareness message carrying an encoded presence payload.
    pub fn awareness(peer_id: Uuid, room: &str, clock: u64, presence: Vec<u8>) -> Self {
        Self::build(MessageType::Awareness, peer_id, room, clock, presence)
    }

    /// Create a peer joined notification.
    pub fn peer_joined(room: &str, info: &PeerInfo) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self::build(MessageType::PeerJoined, info.peer_id, room, 0, payload)
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::build(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::build(MessageType::Ping, peer_id, "", 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::build(MessageType::Pong, peer_id, "", 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse peer info payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }

    /// Split a compressed update into `(secondary_compressed, body)`.
    pub fn compressed_parts(&self) -> Result<(bool, &[u8]), ProtocolError> {
        if self.msg_type != MessageType::CompressedUpdate {
            return Err(ProtocolError::InvalidMessageType);
        }
        match self.payload.split_first() {
            Some((flag, body)) => Ok((*flag != 0, body)),
            None => Err(ProtocolError::DeserializationError("empty compressed frame".into())),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
    #[error("Room {0} is full")]
    RoomFull(String),
}
