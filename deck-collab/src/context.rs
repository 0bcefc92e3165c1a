//! Explicit runtime context.
//!
//! One [`CollabContext`] per editing session owns the configuration, the
//! local identity, the connection pool and the deck event channel. It is
//! passed by reference to every constructor instead of living in a global.

use std::sync::Arc;

use tokio::sync::broadcast;

use deck_core::presence::color_for_actor;

use crate::config::SyncConfig;
use crate::events::DeckEvent;
use crate::pool::ConnectionPool;
use crate::transport::Connector;

/// Deck events buffered per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 1024;

/// Who the local actor is, as shown to other actors.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub actor_id: String,
    pub display_name: String,
    pub color: String,
}

impl Identity {
    pub fn new(actor_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let actor_id = actor_id.into();
        let color = color_for_actor(&actor_id);
        Self {
            actor_id,
            display_name: display_name.into(),
            color,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

pub struct CollabContext {
    config: SyncConfig,
    identity: Identity,
    pool: Arc<ConnectionPool>,
    events: broadcast::Sender<DeckEvent>,
}

impl CollabContext {
    pub fn new(config: SyncConfig, identity: Identity, connector: Arc<dyn Connector>) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(config.clone(), identity.clone(), connector));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            identity,
            pool,
            events,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Subscribe to every deck event published in this context.
    pub fn subscribe(&self) -> broadcast::Receiver<DeckEvent> {
        self.events.subscribe()
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<DeckEvent> {
        self.events.clone()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: DeckEvent) {
        let _ = self.events.send(event);
    }

    /// Start background maintenance (the pool's idle sweep).
    pub fn start(&self) {
        self.pool.start();
    }

    /// Destroy every pooled connection. Orchestrators must be shut down first
    /// if their pending edits should be flushed.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        log::info!("Collab context for {} shut down", self.identity.actor_id);
    }
}
