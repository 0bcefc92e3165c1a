//! Presence protocol: who is on which slide, where their cursor is and what
//! they have selected.
//!
//! ```text
//! ShardManager::update_cursor()
//!       │  (rate-limited: 30fps)
//!       ▼
//! AwarenessMessage::Cursor { … }
//!       │
//!       ▼   (SyncMessage::Awareness, room broadcast)
//! Remote PresenceRoom::handle_message()
//!       │
//!       ▼
//! DeckEvent::UsersChanged
//! ```
//!
//! Presence is ephemeral. A peer that joins late learns about the others
//! because every peer answers an unknown `Join` with its own `Join`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use deck_core::{now_millis, CursorPosition, PresenceState, SelectionState};

/// Awareness messages carried in `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Full presence snapshot; sent on connect and in reply to a newcomer.
    Join { peer_id: Uuid, state: PresenceState },

    Leave { peer_id: Uuid },

    /// High frequency, rate-limited to 30fps.
    Cursor { peer_id: Uuid, cursor: CursorPosition },

    /// Sent only when the selection changes.
    Selection { peer_id: Uuid, selection: Option<SelectionState> },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }

    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { peer_id, .. } => *peer_id,
            AwarenessMessage::Leave { peer_id } => *peer_id,
            AwarenessMessage::Cursor { peer_id, .. } => *peer_id,
            AwarenessMessage::Selection { peer_id, .. } => *peer_id,
        }
    }
}

/// Result of applying a remote awareness message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceChange {
    /// The visible user list changed
    pub changed: bool,
    /// A previously unknown peer joined; answer with our own `Join`
    pub announce: bool,
}

struct RemotePeer {
    state: PresenceState,
    last_seen: Instant,
}

/// Presence state for one room: the local actor plus every remote peer.
pub struct PresenceRoom {
    local_peer: Uuid,
    local: PresenceState,
    peers: HashMap<Uuid, RemotePeer>,
    last_cursor_broadcast: Option<Instant>,
    cursor_broadcast_interval: Duration,
    idle_timeout: Duration,
}

impl PresenceRoom {
    pub fn new(local_peer: Uuid, local: PresenceState) -> Self {
        Self {
            local_peer,
            local,
            peers: HashMap::new(),
            last_cursor_broadcast: None,
            cursor_broadcast_interval: Duration::from_millis(33),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Create with custom broadcast interval (for testing).
    pub fn with_interval(local_peer: Uuid, local: PresenceState, interval: Duration) -> Self {
        let mut room = Self::new(local_peer, local);
        room.cursor_broadcast_interval = interval;
        room
    }

    /// Apply an awareness message received from the room.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> PresenceChange {
        if msg.peer_id() == self.local_peer {
            return PresenceChange::default();
        }

        let now = Instant::now();
        match msg {
            AwarenessMessage::Join { peer_id, state } => {
                let announce = !self.peers.contains_key(peer_id);
                self.peers.insert(
                    *peer_id,
                    RemotePeer { state: state.clone(), last_seen: now },
                );
                PresenceChange { changed: true, announce }
            }

            AwarenessMessage::Leave { peer_id } => PresenceChange {
                changed: self.peers.remove(peer_id).is_some(),
                announce: false,
            },

            AwarenessMessage::Cursor { peer_id, cursor } => match self.peers.get_mut(peer_id) {
                Some(peer) => {
                    peer.last_seen = now;
                    // Reject stale updates
                    let stale = peer
                        .state
                        .cursor
                        .as_ref()
                        .is_some_and(|c| c.timestamp > cursor.timestamp);
                    if stale {
                        return PresenceChange::default();
                    }
                    peer.state.cursor = Some(cursor.clone());
                    peer.state.last_update = cursor.timestamp;
                    PresenceChange { changed: true, announce: false }
                }
                // Cursor from a peer whose Join we missed; it will re-announce
                None => PresenceChange::default(),
            },

            AwarenessMessage::Selection { peer_id, selection } => match self.peers.get_mut(peer_id) {
                Some(peer) => {
                    peer.last_seen = now;
                    peer.state.selection = selection.clone();
                    peer.state.last_update = now_millis();
                    PresenceChange { changed: true, announce: false }
                }
                None => PresenceChange::default(),
            },
        }
    }

    /// Drop a peer whose connection left the room.
    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    /// Update the local cursor. Returns a message unless throttled.
    pub fn update_local_cursor(&mut self, slide_id: &str, x: f64, y: f64) -> Option<AwarenessMessage> {
        let cursor = CursorPosition {
            slide_id: slide_id.to_string(),
            x,
            y,
            timestamp: now_millis(),
        };
        self.local.cursor = Some(cursor.clone());
        self.local.last_update = cursor.timestamp;

        let now = Instant::now();
        if let Some(last) = self.last_cursor_broadcast {
            if now.duration_since(last) < self.cursor_broadcast_interval {
                return None;
            }
        }
        self.last_cursor_broadcast = Some(now);

        Some(AwarenessMessage::Cursor {
            peer_id: self.local_peer,
            cursor,
        })
    }

    /// Update the local selection. An empty id list clears it.
    pub fn update_local_selection(&mut self, slide_id: &str, component_ids: Vec<String>) -> AwarenessMessage {
        let selection = if component_ids.is_empty() {
            None
        } else {
            Some(SelectionState {
                slide_id: slide_id.to_string(),
                component_ids,
            })
        };
        self.local.selection = selection.clone();
        self.local.last_update = now_millis();
        AwarenessMessage::Selection {
            peer_id: self.local_peer,
            selection,
        }
    }

    pub fn join_message(&self) -> AwarenessMessage {
        AwarenessMessage::Join {
            peer_id: self.local_peer,
            state: self.local.clone(),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave { peer_id: self.local_peer }
    }

    /// Presence of every remote peer.
    pub fn users(&self) -> Vec<PresenceState> {
        let mut users: Vec<PresenceState> = self.peers.values().map(|p| p.state.clone()).collect();
        users.sort_by(|a, b| a.actor_id.cmp(&b.actor_id));
        users
    }

    /// Remote peers whose cursor or selection is on `slide_id`.
    pub fn users_on_slide(&self, slide_id: &str) -> Vec<PresenceState> {
        self.users()
            .into_iter()
            .filter(|u| u.slide_id() == Some(slide_id))
            .collect()
    }

    pub fn local_state(&self) -> &PresenceState {
        &self.local
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remove peers that have been silent for longer than the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}
