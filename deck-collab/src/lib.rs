//! # deck-collab: Sharded real-time sync for presentation decks
//!
//! Splits a deck into independently synced CRDT shards, keeps a bounded
//! pool of room connections, batches and compresses outbound deltas and
//! arbitrates per-component edit locks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ DocumentShardOrchestrator    │  visibility, lazy load / LRU unload
//! │  master ─┬─ shard-0 … N      │
//! └──────────┼───────────────────┘
//!            ▼
//! ┌──────────────────┐   ┌─────────────┐
//! │ ShardManager     │──►│ LockManager │  leases in the shard doc
//! │ (CRUD, presence) │   └─────────────┘
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐   ┌──────────────────┐      ┌────────────┐
//! │ ConnectionPool   │──►│ SyncConnection   │─────►│ RoomHub /  │
//! │ (bounded, LRU)   │   │ doc + batcher    │  ws  │ SyncServer │
//! └──────────────────┘   └──────────────────┘      └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`]: Shard assignment, visibility and residency
//! - [`shard`]: Slide/component CRUD over one shard document
//! - [`lock`]: Lease table with request/approve/deny
//! - [`pool`]: Bounded room-keyed connection pool
//! - [`connection`]: One room connection: handshake, pump, presence
//! - [`compressor`]: Delta batching with LZ4 secondary compression
//! - [`document`]: yrs document wrapper and deck schema
//! - [`protocol`]: Binary wire protocol (bincode-encoded SyncMessage)
//! - [`transport`]: WebSocket and in-process transports
//! - [`server`]: Room hub and WebSocket sync server
//! - [`presence`]: Awareness messages and remote presence
//! - [`context`]: Explicit runtime context (config, identity, pool, events)

pub mod broadcast;
pub mod compressor;
pub mod config;
pub mod connection;
pub mod context;
pub mod document;
pub mod error;
pub mod events;
pub mod lock;
pub mod orchestrator;
pub mod pool;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod shard;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use compressor::{
    apply_compressed_update, spawn_batcher, BatcherHandle, CompressedUpdate, CompressionStats,
    CompressorStats, DeltaCompressor,
};
pub use config::{CompressorConfig, PoolConfig, ShardConfig, SyncConfig, LOCK_TTL};
pub use connection::{ConnectionEvent, SyncConnection};
pub use context::{CollabContext, Identity};
pub use document::ShardDoc;
pub use error::{Result, SyncError};
pub use events::{DeckEvent, PoolEvent};
pub use lock::{Lock, LockHolder, LockManager, LockRequest, LockResult};
pub use orchestrator::{DocumentShardOrchestrator, LoadMode, ShardInfo, ShardState};
pub use pool::{ConnectionPool, PoolStatus};
pub use presence::{AwarenessMessage, PresenceRoom};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use server::{RoomHub, ServerConfig, ServerStats, SyncServer};
pub use shard::ShardManager;
pub use transport::{Connector, LocalConnector, TransportHandle, WsConnector};
