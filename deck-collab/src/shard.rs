//! One attached shard: CRUD over its document, its lock table and the
//! presence of its room.
//!
//! Every mutation is a single `transact_local` call, so remote and local
//! observers see multi-field edits atomically. Committed updates reach the
//! connection's batcher through the document's change sink.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;
use yrs::{Array, Map};

use deck_core::{
    is_base_element_id, now_millis, ComponentPatch, ComponentRecord, DeckMetadata, MetadataPatch,
    PresenceState, SlideData, SlidePatch, SlideRecord,
};

use crate::connection::{ConnectionEvent, SyncConnection};
use crate::context::CollabContext;
use crate::document::{array_strings, get_json, get_string, put_json, ShardDoc};
use crate::error::{Result, SyncError};
use crate::events::DeckEvent;
use crate::lock::{Lock, LockManager, LockRequest, LockResult};

/// Manager for one loaded shard (master or content).
pub struct ShardManager {
    room: String,
    conn: Arc<SyncConnection>,
    locks: Arc<LockManager>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShardManager {
    /// Attach to a pooled connection and start forwarding its events.
    pub fn attach(conn: Arc<SyncConnection>, ctx: &CollabContext) -> Arc<Self> {
        let room = conn.room().to_string();
        let events = ctx.event_sender();
        let locks = Arc::new(LockManager::new(
            conn.doc().clone(),
            room.clone(),
            ctx.identity().clone(),
            conn.id(),
            events.clone(),
        ));

        let rx = conn.subscribe();
        let already_synced = conn.is_synced();
        if already_synced {
            let _ = events.send(DeckEvent::Connected { room: room.clone() });
            locks.reconcile();
        }

        let forwarder = tokio::spawn(forward_events(
            rx,
            conn.clone(),
            locks.clone(),
            events,
            already_synced,
        ));

        let sweep_locks = locks.clone();
        let period = ctx.config().lock_sweep_interval();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sweep_locks.sweep_expired();
            }
        });

        Arc::new(Self {
            room,
            conn,
            locks,
            tasks: Mutex::new(vec![forwarder, sweeper]),
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn connection(&self) -> &Arc<SyncConnection> {
        &self.conn
    }

    /// Peer id the shard's edits are attributed to.
    pub fn client_id(&self) -> Uuid {
        self.conn.id()
    }

    pub fn doc(&self) -> &Arc<ShardDoc> {
        self.conn.doc()
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Push pending local edits to the transport.
    pub async fn flush(&self) -> Result<()> {
        self.conn.flush().await
    }

    /// Release own locks, flush and stop background tasks. The connection
    /// itself goes back to the pool through the caller.
    pub async fn detach(&self) {
        self.locks.release_all_own();
        if let Err(e) = self.flush().await {
            log::warn!("Flush on detach of {} failed: {e}", self.room);
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    // --- slides -----------------------------------------------------------

    /// Store a slide and its components. The slide's component order is
    /// taken from `data.components`.
    pub fn add_slide(&self, data: SlideData) -> Result<()> {
        let SlideData { mut slide, components } = data;
        slide.component_ids = components.iter().map(|c| c.id.clone()).collect();

        self.doc().transact_local(|txn, roots| {
            if roots.slides.get(&*txn, &slide.id).is_some() {
                return Err(SyncError::InvalidOperation(format!("slide {} already exists", slide.id)));
            }
            if let Some(dup) = components.iter().find(|c| roots.components.get(&*txn, &c.id).is_some()) {
                return Err(SyncError::InvalidOperation(format!("component {} already exists", dup.id)));
            }
            let slide_json = serde_json::to_string(&slide)?;
            let component_json = components
                .iter()
                .map(|c| -> Result<(String, String)> { Ok((c.id.clone(), serde_json::to_string(c)?)) })
                .collect::<Result<Vec<_>>>()?;

            roots.slides.insert(txn, slide.id.clone(), slide_json);
            for (id, json) in component_json {
                roots.components.insert(txn, id, json);
            }
            Ok(())
        })?;
        log::debug!("Added slide {} to {}", slide.id, self.room);
        Ok(())
    }

    pub fn update_slide(&self, slide_id: &str, patch: &SlidePatch) -> Result<()> {
        self.doc().transact_local(|txn, roots| {
            let mut slide: SlideRecord = get_json(&roots.slides, &*txn, slide_id)
                .ok_or_else(|| SyncError::UnknownSlide(slide_id.to_string()))?;
            patch.apply(&mut slide);
            put_json(&roots.slides, txn, slide_id, &slide)
        })?;
        Ok(())
    }

    /// Remove a slide with its components, force-releasing its locks.
    pub fn remove_slide(&self, slide_id: &str) -> Result<()> {
        self.doc().transact_local(|txn, roots| {
            let slide: SlideRecord = get_json(&roots.slides, &*txn, slide_id)
                .ok_or_else(|| SyncError::UnknownSlide(slide_id.to_string()))?;
            for id in &slide.component_ids {
                roots.components.remove(txn, id);
            }
            roots.slides.remove(txn, slide_id);
            Ok(())
        })?;
        for lock in self.locks.get_locks_for_slide(slide_id) {
            self.locks.release_lock(slide_id, &lock.component_id, true);
        }
        log::debug!("Removed slide {slide_id} from {}", self.room);
        Ok(())
    }

    /// Ids of the slides stored in this shard, sorted.
    pub fn slide_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .doc()
            .read(|txn, roots| roots.slides.keys(txn).map(|k| k.to_string()).collect());
        ids.sort();
        ids
    }

    /// A slide with its components in slide order. Dangling component ids
    /// are skipped.
    pub fn get_slide_data(&self, slide_id: &str) -> Option<SlideData> {
        self.doc().read(|txn, roots| -> Option<SlideData> {
            let slide: SlideRecord = get_json(&roots.slides, txn, slide_id)?;
            let components = slide
                .component_ids
                .iter()
                .filter_map(|id| get_json::<ComponentRecord, _>(&roots.components, txn, id))
                .collect();
            Some(SlideData { slide, components })
        })
    }

    // --- components -------------------------------------------------------

    /// Insert a component into a slide at `index` (appended when `None` or
    /// past the end).
    pub fn add_component(&self, slide_id: &str, component: ComponentRecord, index: Option<usize>) -> Result<()> {
        self.doc().transact_local(|txn, roots| {
            let mut slide: SlideRecord = get_json(&roots.slides, &*txn, slide_id)
                .ok_or_else(|| SyncError::UnknownSlide(slide_id.to_string()))?;
            if roots.components.get(&*txn, &component.id).is_some() {
                return Err(SyncError::InvalidOperation(format!(
                    "component {} already exists",
                    component.id
                )));
            }
            let at = index.unwrap_or(usize::MAX).min(slide.component_ids.len());
            slide.component_ids.insert(at, component.id.clone());

            let slide_json = serde_json::to_string(&slide)?;
            let component_json = serde_json::to_string(&component)?;
            roots.components.insert(txn, component.id.clone(), component_json);
            roots.slides.insert(txn, slide_id.to_string(), slide_json);
            Ok(())
        })?;
        Ok(())
    }

    pub fn update_component(&self, slide_id: &str, component_id: &str, patch: &ComponentPatch) -> Result<()> {
        self.doc().transact_local(|txn, roots| {
            let slide: SlideRecord = get_json(&roots.slides, &*txn, slide_id)
                .ok_or_else(|| SyncError::UnknownSlide(slide_id.to_string()))?;
            if !slide.component_ids.iter().any(|id| id == component_id) {
                return Err(SyncError::UnknownComponent(component_id.to_string()));
            }
            let mut component: ComponentRecord = get_json(&roots.components, &*txn, component_id)
                .ok_or_else(|| SyncError::UnknownComponent(component_id.to_string()))?;
            patch.apply(&mut component);
            put_json(&roots.components, txn, component_id, &component)
        })?;
        Ok(())
    }

    /// Remove a component from a slide. Base elements are refused.
    pub fn remove_component(&self, slide_id: &str, component_id: &str) -> Result<()> {
        let existing: Option<ComponentRecord> = self
            .doc()
            .read(|txn, roots| get_json(&roots.components, txn, component_id));
        let protected = is_base_element_id(component_id) || existing.as_ref().is_some_and(|c| c.is_base_element());
        if protected {
            log::warn!("Refusing to remove base element {component_id} from {slide_id}");
            return Err(SyncError::ProtectedComponent(component_id.to_string()));
        }

        self.doc().transact_local(|txn, roots| {
            let mut slide: SlideRecord = get_json(&roots.slides, &*txn, slide_id)
                .ok_or_else(|| SyncError::UnknownSlide(slide_id.to_string()))?;
            let before = slide.component_ids.len();
            slide.component_ids.retain(|id| id != component_id);
            if slide.component_ids.len() == before {
                return Err(SyncError::UnknownComponent(component_id.to_string()));
            }
            let slide_json = serde_json::to_string(&slide)?;
            roots.components.remove(txn, component_id);
            roots.slides.insert(txn, slide_id.to_string(), slide_json);
            Ok(())
        })?;
        self.locks.release_lock(slide_id, component_id, true);
        Ok(())
    }

    // --- master shard -----------------------------------------------------

    pub fn deck_metadata(&self) -> Option<DeckMetadata> {
        self.doc().read(|txn, roots| -> Option<DeckMetadata> {
            let field = |key: &str| get_string(&roots.meta, txn, key);
            let number = |key: &str| field(key).and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
            Some(DeckMetadata {
                deck_id: field("deck_id")?,
                name: field("name").unwrap_or_default(),
                version: number("version"),
                size: number("size"),
                last_modified: number("last_modified"),
            })
        })
    }

    /// Write initial metadata if the master has none yet.
    pub fn ensure_metadata(&self, deck_id: &str) -> Result<DeckMetadata> {
        if let Some(meta) = self.deck_metadata() {
            return Ok(meta);
        }
        let meta = DeckMetadata::new(deck_id, deck_id);
        self.doc().transact_local(|txn, roots| {
            roots.meta.insert(txn, "deck_id", meta.deck_id.clone());
            roots.meta.insert(txn, "name", meta.name.clone());
            roots.meta.insert(txn, "version", meta.version.to_string());
            roots.meta.insert(txn, "size", meta.size.to_string());
            roots.meta.insert(txn, "last_modified", meta.last_modified.to_string());
            Ok(())
        })?;
        Ok(meta)
    }

    /// Apply a metadata patch; bumps the version.
    pub fn update_deck_metadata(&self, patch: &MetadataPatch) -> Result<DeckMetadata> {
        let mut meta = self
            .deck_metadata()
            .ok_or_else(|| SyncError::InvalidOperation("deck has no metadata".into()))?;
        if let Some(name) = &patch.name {
            meta.name = name.clone();
        }
        meta.version += 1;
        meta.last_modified = now_millis();

        self.doc().transact_local(|txn, roots| {
            roots.meta.insert(txn, "name", meta.name.clone());
            roots.meta.insert(txn, "version", meta.version.to_string());
            roots.meta.insert(txn, "last_modified", meta.last_modified.to_string());
            Ok(())
        })?;
        Ok(meta)
    }

    pub fn slide_order(&self) -> Vec<String> {
        self.doc().read(|txn, roots| array_strings(&roots.slide_order, txn))
    }

    /// Insert a slide id into the deck order (appended when `index` is
    /// `None` or past the end).
    pub fn insert_slide_ref(&self, slide_id: &str, index: Option<usize>) -> Result<()> {
        self.doc().transact_local(|txn, roots| {
            let order = array_strings(&roots.slide_order, &*txn);
            if order.iter().any(|id| id == slide_id) {
                return Err(SyncError::InvalidOperation(format!("slide {slide_id} already in deck")));
            }
            let at = index.unwrap_or(usize::MAX).min(order.len());
            roots.slide_order.insert(txn, at as u32, slide_id.to_string());
            roots.meta.insert(txn, "size", (order.len() + 1).to_string());
            roots.meta.insert(txn, "last_modified", now_millis().to_string());
            Ok(())
        })?;
        Ok(())
    }

    /// Drop a slide id from the deck order and its assignment. Returns
    /// false if it was not in the deck.
    pub fn remove_slide_ref(&self, slide_id: &str) -> Result<bool> {
        let (removed, _) = self.doc().transact_local(|txn, roots| {
            let order = array_strings(&roots.slide_order, &*txn);
            let Some(at) = order.iter().position(|id| id == slide_id) else {
                return Ok(false);
            };
            roots.slide_order.remove(txn, at as u32);
            roots.assignments.remove(txn, slide_id);
            roots.meta.insert(txn, "size", (order.len() - 1).to_string());
            roots.meta.insert(txn, "last_modified", now_millis().to_string());
            Ok(true)
        })?;
        Ok(removed)
    }

    /// Move a slide to `new_index` in the deck order (clamped).
    pub fn move_slide(&self, slide_id: &str, new_index: usize) -> Result<()> {
        self.doc().transact_local(|txn, roots| {
            let order = array_strings(&roots.slide_order, &*txn);
            let from = order
                .iter()
                .position(|id| id == slide_id)
                .ok_or_else(|| SyncError::UnknownSlide(slide_id.to_string()))?;
            let to = new_index.min(order.len() - 1);
            if from == to {
                return Ok(());
            }
            roots.slide_order.remove(txn, from as u32);
            roots.slide_order.insert(txn, to as u32, slide_id.to_string());
            roots.meta.insert(txn, "last_modified", now_millis().to_string());
            Ok(())
        })?;
        Ok(())
    }

    /// Recorded slide → shard index assignments.
    pub fn assignments(&self) -> HashMap<String, usize> {
        self.doc().read(|txn, roots| {
            let keys: Vec<String> = roots.assignments.keys(txn).map(|k| k.to_string()).collect();
            keys.into_iter()
                .filter_map(|k| -> Option<(String, usize)> {
                    let shard = get_string(&roots.assignments, txn, &k)?.parse::<usize>().ok()?;
                    Some((k, shard))
                })
                .collect()
        })
    }

    /// Record assignments that are not recorded yet. Existing entries are
    /// never moved.
    pub fn record_assignments(&self, assignments: &[(String, usize)]) -> Result<usize> {
        let (written, _) = self.doc().transact_local(|txn, roots| {
            let mut written = 0;
            for (slide_id, shard) in assignments {
                if roots.assignments.get(&*txn, slide_id).is_none() {
                    roots.assignments.insert(txn, slide_id.clone(), shard.to_string());
                    written += 1;
                }
            }
            Ok(written)
        })?;
        Ok(written)
    }

    // --- presence ---------------------------------------------------------

    pub async fn update_cursor(&self, slide_id: &str, x: f64, y: f64) -> Result<()> {
        self.conn.update_cursor(slide_id, x, y).await
    }

    pub async fn update_selection(&self, slide_id: &str, component_ids: Vec<String>) -> Result<()> {
        self.conn.update_selection(slide_id, component_ids).await
    }

    pub fn users(&self) -> Vec<PresenceState> {
        self.conn.users()
    }

    pub fn users_on_slide(&self, slide_id: &str) -> Vec<PresenceState> {
        self.conn.users_on_slide(slide_id)
    }

    // --- locks ------------------------------------------------------------

    pub fn request_lock(&self, slide_id: &str, component_id: &str) -> LockResult {
        self.locks.request_lock(slide_id, component_id)
    }

    pub fn release_lock(&self, slide_id: &str, component_id: &str, force: bool) -> bool {
        self.locks.release_lock(slide_id, component_id, force)
    }

    pub fn extend_lock(&self, slide_id: &str, component_id: &str) -> bool {
        self.locks.extend_lock(slide_id, component_id)
    }

    pub fn approve_lock_request(&self, slide_id: &str, component_id: &str, requester_id: &str) -> bool {
        self.locks.approve_lock_request(slide_id, component_id, requester_id)
    }

    pub fn deny_lock_request(&self, slide_id: &str, component_id: &str, requester_id: &str) -> bool {
        self.locks.deny_lock_request(slide_id, component_id, requester_id)
    }

    pub fn is_component_locked(&self, slide_id: &str, component_id: &str) -> bool {
        self.locks.is_component_locked(slide_id, component_id)
    }

    pub fn get_component_lock(&self, slide_id: &str, component_id: &str) -> Option<Lock> {
        self.locks.get_component_lock(slide_id, component_id)
    }

    pub fn get_locks_for_slide(&self, slide_id: &str) -> Vec<Lock> {
        self.locks.get_locks_for_slide(slide_id)
    }

    pub fn pending_requests_for_me(&self) -> Vec<LockRequest> {
        self.locks.pending_requests_for_me()
    }

    pub fn heartbeat_locks(&self) -> usize {
        self.locks.heartbeat()
    }
}

/// Translate connection events into deck events until the connection goes
/// away or the shard is detached.
async fn forward_events(
    mut rx: broadcast::Receiver<ConnectionEvent>,
    conn: Arc<SyncConnection>,
    locks: Arc<LockManager>,
    events: broadcast::Sender<DeckEvent>,
    mut connected: bool,
) {
    let room = conn.room().to_string();
    loop {
        match rx.recv().await {
            Ok(ConnectionEvent::Synced) => {
                if !connected {
                    connected = true;
                    let _ = events.send(DeckEvent::Connected { room: room.clone() });
                }
                locks.reconcile();
            }
            Ok(ConnectionEvent::RemoteChange) => locks.reconcile(),
            Ok(ConnectionEvent::UsersChanged) => {
                let _ = events.send(DeckEvent::UsersChanged {
                    room: room.clone(),
                    users: conn.users(),
                });
            }
            Ok(ConnectionEvent::Disconnected) => {
                let _ = events.send(DeckEvent::Disconnected { room: room.clone() });
                break;
            }
            Err(RecvError::Lagged(n)) => {
                log::warn!("Event forwarder for {room} lagged by {n}");
                locks.reconcile();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
