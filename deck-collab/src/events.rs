//! Typed event streams.
//!
//! Consumers subscribe once through [`crate::CollabContext::subscribe`] and
//! receive every [`DeckEvent`]; the pool publishes its own [`PoolEvent`]
//! stream for observability.

use uuid::Uuid;

use deck_core::PresenceState;

use crate::lock::{Lock, LockRequest};

/// Everything the UI layer renders indicators from.
#[derive(Debug, Clone, PartialEq)]
pub enum DeckEvent {
    /// A room finished its initial sync.
    Connected { room: String },
    Disconnected { room: String },
    /// Remote presence in a room changed; carries the new snapshot.
    UsersChanged {
        room: String,
        users: Vec<PresenceState>,
    },
    /// A shard was attached to a new connection, so local edits carry a new
    /// peer id.
    ClientIdChanged { room: String, client_id: Uuid },

    LockAcquired { lock: Lock },
    LockReleased {
        slide_id: String,
        component_id: String,
        forced: bool,
    },
    /// Someone asked for a lock the local connection holds. Only delivered
    /// to the owner.
    LockRequested { request: LockRequest },
    LocksChanged { room: String },
    LockRequestsChanged { room: String },

    ShardLoaded { shard_id: usize, room: String },
    ShardUnloaded { shard_id: usize, room: String },
    ShardError { shard_id: usize, error: String },
}

/// Connection pool lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    ConnectionCreated { room: String, connection_id: Uuid },
    ConnectionReleased { room: String, connection_id: Uuid },
    ConnectionDestroyed { room: String, connection_id: Uuid },
}

impl PoolEvent {
    pub fn room(&self) -> &str {
        match self {
            PoolEvent::ConnectionCreated { room, .. }
            | PoolEvent::ConnectionReleased { room, .. }
            | PoolEvent::ConnectionDestroyed { room, .. } => room,
        }
    }
}
