//! Document shard orchestration.
//!
//! A deck is split into a master shard (metadata, slide order, recorded
//! assignments) and content shards of `slides_per_shard` contiguous slides.
//! Content shards are loaded lazily when one of their slides is needed and
//! unloaded again when too many are resident:
//!
//! ```text
//! unassigned ──initialize──► NotLoaded ──load──► Loading ──► Loaded
//!                                ▲                  │          │
//!                                └──── failure ─────┘          │ idle / capacity
//!                                                              ▼
//!                                     load ◄──────────────  Unloaded
//! ```
//!
//! Shards holding a visible slide are never evicted. A slide keeps its
//! shard for its whole lifetime; there is no rebalancing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use deck_core::{
    ComponentPatch, ComponentRecord, DeckMetadata, MetadataPatch, PresenceState, SlideData, SlidePatch,
};

use crate::context::CollabContext;
use crate::error::{Result, SyncError};
use crate::events::DeckEvent;
use crate::lock::{Lock, LockRequest, LockResult};
use crate::pool::ConnectionPool;
use crate::shard::ShardManager;

/// How [`DocumentShardOrchestrator::set_visible_slides`] waits for loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Wait for every visible shard
    Sync,
    /// Wait for the first slide's shard, load the rest in the background
    PrioritizeCurrent,
    /// Return immediately
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    NotLoaded,
    Loading,
    Loaded,
    Unloaded,
}

impl ShardState {
    pub fn is_loading(self) -> bool {
        self == ShardState::Loading
    }

    pub fn is_loaded(self) -> bool {
        self == ShardState::Loaded
    }
}

/// Snapshot of one shard for introspection.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardInfo {
    pub shard_id: usize,
    pub room: String,
    pub slide_ids: Vec<String>,
    pub state: ShardState,
    pub visible: bool,
}

struct ShardEntry {
    room: String,
    slide_ids: Vec<String>,
    state: ShardState,
    last_accessed: Instant,
    manager: Option<Arc<ShardManager>>,
    /// Flips to true when the in-flight load finishes, either way
    loading: Option<watch::Receiver<bool>>,
}

#[derive(Default)]
struct Layout {
    shards: Vec<ShardEntry>,
    slide_to_shard: HashMap<String, usize>,
    visible: HashSet<String>,
}

impl Layout {
    fn ensure_shard(&mut self, deck_id: &str, shard_id: usize) {
        while self.shards.len() <= shard_id {
            let id = self.shards.len();
            self.shards.push(ShardEntry {
                room: shard_room(deck_id, id),
                slide_ids: Vec::new(),
                state: ShardState::NotLoaded,
                last_accessed: Instant::now(),
                manager: None,
                loading: None,
            });
        }
    }

    fn place(&mut self, slide_id: &str, shard_id: usize) {
        if let Some(shard) = self.shards.get_mut(shard_id) {
            shard.slide_ids.push(slide_id.to_string());
            self.slide_to_shard.insert(slide_id.to_string(), shard_id);
        }
    }

    /// The shard new slides go to: the last one while it has room.
    fn fill_target(&self, slides_per_shard: usize) -> usize {
        match self.shards.last() {
            Some(last) if last.slide_ids.len() < slides_per_shard => self.shards.len() - 1,
            _ => self.shards.len(),
        }
    }

    fn is_visible(&self, shard_id: usize) -> bool {
        self.shards[shard_id]
            .slide_ids
            .iter()
            .any(|id| self.visible.contains(id))
    }

    fn loaded_count(&self) -> usize {
        self.shards.iter().filter(|s| s.state.is_loaded()).count()
    }

    /// Least recently used loaded shard without a visible slide.
    fn eviction_candidate(&self, exclude: Option<usize>) -> Option<usize> {
        (0..self.shards.len())
            .filter(|&i| self.shards[i].state.is_loaded() && Some(i) != exclude && !self.is_visible(i))
            .min_by_key(|&i| self.shards[i].last_accessed)
    }
}

pub fn master_room(deck_id: &str) -> String {
    format!("{deck_id}-master")
}

pub fn shard_room(deck_id: &str, shard_id: usize) -> String {
    format!("{deck_id}-shard-{shard_id}")
}

enum LoadStep {
    Ready(Arc<ShardManager>),
    Wait(Option<watch::Receiver<bool>>),
    Start(watch::Sender<bool>, String),
}

/// The `Loading` claim on a shard. Dropped without [`Self::finish`] (the
/// load future was cancelled), it puts the shard back to `NotLoaded` and
/// wakes anyone waiting on it.
struct LoadClaim<'a> {
    inner: &'a Inner,
    shard_id: usize,
    done: Option<watch::Sender<bool>>,
}

impl LoadClaim<'_> {
    fn finish(mut self, result: &Result<Arc<ShardManager>>) {
        self.settle(result.as_ref().ok());
    }

    fn settle(&mut self, manager: Option<&Arc<ShardManager>>) {
        let Some(done) = self.done.take() else {
            return;
        };
        {
            let mut layout = self.inner.layout.lock();
            if let Some(entry) = layout.shards.get_mut(self.shard_id) {
                entry.loading = None;
                match manager {
                    Some(manager) => {
                        entry.state = ShardState::Loaded;
                        entry.manager = Some(manager.clone());
                        entry.last_accessed = Instant::now();
                    }
                    None => entry.state = ShardState::NotLoaded,
                }
            }
        }
        let _ = done.send(true);
    }
}

impl Drop for LoadClaim<'_> {
    fn drop(&mut self) {
        if self.done.is_some() {
            log::debug!("Load of shard {} cancelled", self.shard_id);
            self.settle(None);
        }
    }
}

/// A pooled connection checked out for a shard. Dropped while still held,
/// it is handed back to the pool in the background.
struct Checkout {
    pool: Arc<ConnectionPool>,
    room: String,
    held: bool,
}

impl Checkout {
    fn new(pool: &Arc<ConnectionPool>, room: &str) -> Self {
        Self {
            pool: pool.clone(),
            room: room.to_string(),
            held: true,
        }
    }

    /// The connection now belongs to an attached shard.
    fn keep(mut self) {
        self.held = false;
    }

    async fn release(mut self) {
        self.held = false;
        self.pool.release(&self.room).await;
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to return connection for {}", self.room);
            return;
        };
        let pool = self.pool.clone();
        let room = std::mem::take(&mut self.room);
        runtime.spawn(async move { pool.release(&room).await });
    }
}

struct Inner {
    ctx: Arc<CollabContext>,
    deck_id: String,
    master: Mutex<Option<Arc<ShardManager>>>,
    layout: Mutex<Layout>,
    unload_task: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Root of the sync core: owns the master shard and every content shard
/// of one deck. Cheap to clone.
#[derive(Clone)]
pub struct DocumentShardOrchestrator {
    inner: Arc<Inner>,
}

impl DocumentShardOrchestrator {
    /// An orchestrator with no master shard attached. Slides must be
    /// assigned with [`Self::initialize`].
    pub fn new(ctx: Arc<CollabContext>, deck_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                deck_id: deck_id.into(),
                master: Mutex::new(None),
                layout: Mutex::new(Layout::default()),
                unload_task: Mutex::new(None),
                background: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Connect to the deck's master shard and assign every slide it lists.
    ///
    /// The master connection stays checked out of the pool until
    /// [`Self::shutdown`].
    pub async fn open(ctx: Arc<CollabContext>, deck_id: impl Into<String>) -> Result<Self> {
        let orchestrator = Self::new(ctx, deck_id);
        let inner = &orchestrator.inner;
        let room = master_room(&inner.deck_id);

        let conn = inner.ctx.pool().acquire(&room).await?;
        if !conn.wait_synced(inner.ctx.config().sync_timeout()).await {
            inner.ctx.pool().release(&room).await;
            return Err(SyncError::Transport(format!("initial sync of {room} timed out")));
        }
        let master = ShardManager::attach(conn, &inner.ctx);
        master.ensure_metadata(&inner.deck_id)?;
        *inner.master.lock() = Some(master);

        orchestrator.sync_from_master()?;
        log::info!(
            "Opened deck {} with {} shard(s)",
            inner.deck_id,
            inner.layout.lock().shards.len()
        );
        Ok(orchestrator)
    }

    pub fn deck_id(&self) -> &str {
        &self.inner.deck_id
    }

    fn master(&self) -> Result<Arc<ShardManager>> {
        self.inner
            .master
            .lock()
            .clone()
            .ok_or_else(|| SyncError::InvalidOperation("master shard is not open".into()))
    }

    // --- assignment -------------------------------------------------------

    /// Assign every not yet assigned slide id to a shard: contiguous groups
    /// of `slides_per_shard`, in declared order. Shards are created as
    /// groups fill. Returns the new assignments, which are also recorded in
    /// the master shard when one is open.
    pub fn initialize(&self, slide_ids: &[String]) -> Vec<(String, usize)> {
        let assigned = self.assign(slide_ids, &HashMap::new());
        self.record(&assigned);
        assigned
    }

    fn assign(&self, slide_ids: &[String], recorded: &HashMap<String, usize>) -> Vec<(String, usize)> {
        let per_shard = self.inner.ctx.config().shards.slides_per_shard.max(1);
        let mut layout = self.inner.layout.lock();
        let mut assigned = Vec::new();

        for slide_id in slide_ids {
            if layout.slide_to_shard.contains_key(slide_id) {
                continue;
            }
            match recorded.get(slide_id) {
                Some(&shard_id) => {
                    layout.ensure_shard(&self.inner.deck_id, shard_id);
                    layout.place(slide_id, shard_id);
                }
                None => {
                    let shard_id = layout.fill_target(per_shard);
                    layout.ensure_shard(&self.inner.deck_id, shard_id);
                    layout.place(slide_id, shard_id);
                    assigned.push((slide_id.clone(), shard_id));
                }
            }
        }
        assigned
    }

    fn record(&self, assigned: &[(String, usize)]) {
        if assigned.is_empty() {
            return;
        }
        let Ok(master) = self.master() else { return };
        if let Err(e) = master.record_assignments(assigned) {
            log::warn!("Could not record shard assignments: {e}");
        }
    }

    /// Pick up slides other actors added since the last look at the master.
    pub fn sync_from_master(&self) -> Result<()> {
        let master = self.master()?;
        let order = master.slide_order();
        let recorded = master.assignments();
        let assigned = self.assign(&order, &recorded);
        self.record(&assigned);
        Ok(())
    }

    /// Shard owning `slide_id`, consulting the master for unknown ids.
    pub fn shard_for_slide(&self, slide_id: &str) -> Option<usize> {
        if let Some(&id) = self.inner.layout.lock().slide_to_shard.get(slide_id) {
            return Some(id);
        }
        if self.sync_from_master().is_err() {
            return None;
        }
        self.inner.layout.lock().slide_to_shard.get(slide_id).copied()
    }

    // --- loading ----------------------------------------------------------

    /// Mark `slide_ids` visible (pinned against eviction) and load their
    /// shards according to `mode`. Load failures are reported as
    /// `ShardError` events.
    pub async fn set_visible_slides(&self, slide_ids: &[String], mode: LoadMode) {
        self.inner.layout.lock().visible = slide_ids.iter().cloned().collect();

        let mut shard_ids = Vec::new();
        for slide_id in slide_ids {
            match self.shard_for_slide(slide_id) {
                Some(id) if !shard_ids.contains(&id) => shard_ids.push(id),
                Some(_) => {}
                None => log::warn!("Visible slide {slide_id} has no shard"),
            }
        }

        match mode {
            LoadMode::Sync => {
                join_all(shard_ids.iter().map(|&id| self.load_shard(id))).await;
            }
            LoadMode::PrioritizeCurrent => {
                let mut rest = shard_ids.into_iter();
                if let Some(first) = rest.next() {
                    let _ = self.load_shard(first).await;
                }
                for id in rest {
                    self.spawn_load(id);
                }
            }
            LoadMode::Async => {
                for id in shard_ids {
                    self.spawn_load(id);
                }
            }
        }
    }

    fn spawn_load(&self, shard_id: usize) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _ = this.load_shard(shard_id).await;
        });
        let mut background = self.inner.background.lock();
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    /// Load (or touch) the shard owning `slide_id`.
    pub async fn load_document_for_slide(&self, slide_id: &str) -> Result<Arc<ShardManager>> {
        let shard_id = self
            .shard_for_slide(slide_id)
            .ok_or_else(|| SyncError::UnknownSlide(slide_id.to_string()))?;
        self.load_shard(shard_id).await.map_err(|e| match e {
            SyncError::ShardLoadFailed { .. } => SyncError::ShardUnavailable {
                slide_id: slide_id.to_string(),
            },
            e => e,
        })
    }

    /// Loaded: touch and return. Loading: wait for that load. Otherwise
    /// acquire a pooled connection, attach and mark loaded.
    pub async fn load_shard(&self, shard_id: usize) -> Result<Arc<ShardManager>> {
        let step = {
            let mut layout = self.inner.layout.lock();
            let entry = layout
                .shards
                .get_mut(shard_id)
                .ok_or_else(|| SyncError::InvalidOperation(format!("no shard {shard_id}")))?;
            match (entry.state, entry.manager.clone()) {
                (ShardState::Loaded, Some(manager)) => {
                    entry.last_accessed = Instant::now();
                    LoadStep::Ready(manager)
                }
                (ShardState::Loading, _) => LoadStep::Wait(entry.loading.clone()),
                _ => {
                    let (tx, rx) = watch::channel(false);
                    entry.state = ShardState::Loading;
                    entry.loading = Some(rx);
                    LoadStep::Start(tx, entry.room.clone())
                }
            }
        };

        match step {
            LoadStep::Ready(manager) => Ok(manager),
            LoadStep::Wait(rx) => {
                if let Some(mut rx) = rx {
                    let _ = rx.wait_for(|done| *done).await;
                }
                let layout = self.inner.layout.lock();
                match &layout.shards[shard_id] {
                    ShardEntry {
                        state: ShardState::Loaded,
                        manager: Some(manager),
                        ..
                    } => Ok(manager.clone()),
                    _ => Err(SyncError::ShardLoadFailed { shard_id }),
                }
            }
            LoadStep::Start(done, room) => {
                let claim = LoadClaim {
                    inner: &self.inner,
                    shard_id,
                    done: Some(done),
                };
                let result = self.attach_shard(shard_id, &room).await;
                claim.finish(&result);

                match &result {
                    Ok(manager) => {
                        log::info!("Loaded shard {shard_id} ({room})");
                        self.inner.ctx.emit(DeckEvent::ShardLoaded {
                            shard_id,
                            room: room.clone(),
                        });
                        self.inner.ctx.emit(DeckEvent::ClientIdChanged {
                            room,
                            client_id: manager.client_id(),
                        });
                    }
                    Err(e) => {
                        log::warn!("Failed to load shard {shard_id} ({room}): {e}");
                        self.inner.ctx.emit(DeckEvent::ShardError {
                            shard_id,
                            error: e.to_string(),
                        });
                    }
                }
                result
            }
        }
    }

    async fn attach_shard(&self, shard_id: usize, room: &str) -> Result<Arc<ShardManager>> {
        let pool = self.inner.ctx.pool();
        if !pool.has_free_slot() {
            let victim = self.inner.layout.lock().eviction_candidate(Some(shard_id));
            if let Some(victim) = victim {
                log::debug!("Pool full, unloading shard {victim} for shard {shard_id}");
                self.unload_shard(victim).await;
            }
        }

        let conn = pool.acquire(room).await?;
        let checkout = Checkout::new(pool, room);
        if !conn.wait_synced(self.inner.ctx.config().sync_timeout()).await {
            checkout.release().await;
            return Err(SyncError::Transport(format!("initial sync of {room} timed out")));
        }
        checkout.keep();
        Ok(ShardManager::attach(conn, &self.inner.ctx))
    }

    /// Detach a loaded shard (flushing its edits) and return its connection
    /// to the pool. Returns false if it was not loaded.
    pub async fn unload_shard(&self, shard_id: usize) -> bool {
        let taken = {
            let mut layout = self.inner.layout.lock();
            match layout.shards.get_mut(shard_id) {
                Some(entry) if entry.state.is_loaded() => {
                    entry.state = ShardState::Unloaded;
                    entry.manager.take().map(|m| (m, entry.room.clone()))
                }
                _ => None,
            }
        };
        let Some((manager, room)) = taken else {
            return false;
        };

        let checkout = Checkout::new(self.inner.ctx.pool(), &room);
        manager.detach().await;
        checkout.release().await;
        log::info!("Unloaded shard {shard_id} ({room})");
        self.inner.ctx.emit(DeckEvent::ShardUnloaded { shard_id, room });
        true
    }

    /// Evict least recently used, non-visible shards until at most
    /// `max_loaded_documents` are loaded. Returns how many were evicted.
    pub async fn unload_idle_documents(&self) -> usize {
        let max = self.inner.ctx.config().shards.max_loaded_documents;
        let mut evicted = 0;
        loop {
            let victim = {
                let layout = self.inner.layout.lock();
                if layout.loaded_count() <= max {
                    break;
                }
                layout.eviction_candidate(None)
            };
            match victim {
                Some(id) => {
                    if self.unload_shard(id).await {
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        evicted
    }

    /// The loaded manager for a slide, loading on demand. Failures are
    /// logged and yield `None`.
    async fn with_shard(&self, slide_id: &str) -> Option<Arc<ShardManager>> {
        match self.load_document_for_slide(slide_id).await {
            Ok(manager) => Some(manager),
            Err(e) => {
                log::warn!("Slide {slide_id} unavailable: {e}");
                None
            }
        }
    }

    // --- per-slide operations ---------------------------------------------

    pub async fn get_slide_data(&self, slide_id: &str) -> Option<SlideData> {
        self.with_shard(slide_id).await?.get_slide_data(slide_id)
    }

    pub async fn update_slide(&self, slide_id: &str, patch: &SlidePatch) -> bool {
        let Some(shard) = self.with_shard(slide_id).await else {
            return false;
        };
        log_failure(shard.update_slide(slide_id, patch), "update_slide", slide_id)
    }

    pub async fn add_component(&self, slide_id: &str, component: ComponentRecord, index: Option<usize>) -> bool {
        let Some(shard) = self.with_shard(slide_id).await else {
            return false;
        };
        log_failure(shard.add_component(slide_id, component, index), "add_component", slide_id)
    }

    pub async fn update_component(&self, slide_id: &str, component_id: &str, patch: &ComponentPatch) -> bool {
        let Some(shard) = self.with_shard(slide_id).await else {
            return false;
        };
        log_failure(
            shard.update_component(slide_id, component_id, patch),
            "update_component",
            slide_id,
        )
    }

    pub async fn remove_component(&self, slide_id: &str, component_id: &str) -> bool {
        let Some(shard) = self.with_shard(slide_id).await else {
            return false;
        };
        log_failure(
            shard.remove_component(slide_id, component_id),
            "remove_component",
            slide_id,
        )
    }

    pub async fn update_cursor(&self, slide_id: &str, x: f64, y: f64) {
        if let Some(shard) = self.with_shard(slide_id).await {
            if let Err(e) = shard.update_cursor(slide_id, x, y).await {
                log::warn!("Cursor update on {slide_id} failed: {e}");
            }
        }
    }

    pub async fn update_selection(&self, slide_id: &str, component_ids: Vec<String>) {
        if let Some(shard) = self.with_shard(slide_id).await {
            if let Err(e) = shard.update_selection(slide_id, component_ids).await {
                log::warn!("Selection update on {slide_id} failed: {e}");
            }
        }
    }

    /// Remote users whose presence is on `slide_id`.
    pub async fn users_for_slide(&self, slide_id: &str) -> Vec<PresenceState> {
        match self.with_shard(slide_id).await {
            Some(shard) => shard.users_on_slide(slide_id),
            None => Vec::new(),
        }
    }

    // --- locks ------------------------------------------------------------

    pub async fn request_lock(&self, slide_id: &str, component_id: &str) -> LockResult {
        match self.with_shard(slide_id).await {
            Some(shard) => shard.request_lock(slide_id, component_id),
            None => LockResult {
                granted: false,
                current_lock_holder: None,
                error: Some(format!("shard for slide {slide_id} is unavailable")),
            },
        }
    }

    pub async fn release_lock(&self, slide_id: &str, component_id: &str, force: bool) -> bool {
        match self.with_shard(slide_id).await {
            Some(shard) => shard.release_lock(slide_id, component_id, force),
            None => false,
        }
    }

    pub async fn extend_lock(&self, slide_id: &str, component_id: &str) -> bool {
        match self.with_shard(slide_id).await {
            Some(shard) => shard.extend_lock(slide_id, component_id),
            None => false,
        }
    }

    pub async fn approve_lock_request(&self, slide_id: &str, component_id: &str, requester_id: &str) -> bool {
        match self.with_shard(slide_id).await {
            Some(shard) => shard.approve_lock_request(slide_id, component_id, requester_id),
            None => false,
        }
    }

    pub async fn deny_lock_request(&self, slide_id: &str, component_id: &str, requester_id: &str) -> bool {
        match self.with_shard(slide_id).await {
            Some(shard) => shard.deny_lock_request(slide_id, component_id, requester_id),
            None => false,
        }
    }

    pub async fn is_component_locked(&self, slide_id: &str, component_id: &str) -> bool {
        match self.with_shard(slide_id).await {
            Some(shard) => shard.is_component_locked(slide_id, component_id),
            None => false,
        }
    }

    pub async fn get_component_lock(&self, slide_id: &str, component_id: &str) -> Option<Lock> {
        self.with_shard(slide_id).await?.get_component_lock(slide_id, component_id)
    }

    pub async fn get_locks_for_slide(&self, slide_id: &str) -> Vec<Lock> {
        match self.with_shard(slide_id).await {
            Some(shard) => shard.get_locks_for_slide(slide_id),
            None => Vec::new(),
        }
    }

    /// Requests waiting on locks held here, across loaded shards.
    pub fn pending_lock_requests(&self) -> Vec<LockRequest> {
        self.loaded_managers()
            .iter()
            .flat_map(|m| m.pending_requests_for_me())
            .collect()
    }

    /// Extend every lock held here on loaded shards.
    pub fn heartbeat_locks(&self) -> usize {
        self.loaded_managers().iter().map(|m| m.heartbeat_locks()).sum()
    }

    /// Push pending edits of the master and every loaded shard now.
    pub async fn flush(&self) -> Result<()> {
        let mut managers = self.loaded_managers();
        if let Ok(master) = self.master() {
            managers.push(master);
        }
        for manager in managers {
            manager.flush().await?;
        }
        Ok(())
    }

    fn loaded_managers(&self) -> Vec<Arc<ShardManager>> {
        self.inner
            .layout
            .lock()
            .shards
            .iter()
            .filter_map(|s| s.manager.clone())
            .collect()
    }

    // --- deck-level operations --------------------------------------------

    pub fn deck_metadata(&self) -> Option<DeckMetadata> {
        self.master().ok()?.deck_metadata()
    }

    pub fn update_deck_metadata(&self, patch: &MetadataPatch) -> Result<DeckMetadata> {
        self.master()?.update_deck_metadata(patch)
    }

    pub fn slide_order(&self) -> Vec<String> {
        match self.master() {
            Ok(master) => master.slide_order(),
            Err(_) => Vec::new(),
        }
    }

    /// Add a slide at `index` in the deck order. It goes to the last shard
    /// while that has room, otherwise to a new shard. Returns the shard id.
    pub async fn add_slide(&self, data: SlideData, index: Option<usize>) -> Result<usize> {
        let master = self.master()?;
        let slide_id = data.slide.id.clone();
        if self.shard_for_slide(&slide_id).is_some() {
            return Err(SyncError::InvalidOperation(format!("slide {slide_id} already exists")));
        }

        let shard_id = {
            let per_shard = self.inner.ctx.config().shards.slides_per_shard.max(1);
            let mut layout = self.inner.layout.lock();
            let shard_id = layout.fill_target(per_shard);
            layout.ensure_shard(&self.inner.deck_id, shard_id);
            layout.place(&slide_id, shard_id);
            shard_id
        };

        let added = match self.load_shard(shard_id).await {
            Ok(shard) => shard.add_slide(data),
            Err(e) => Err(e),
        };
        if let Err(e) = added {
            self.forget_slide(&slide_id);
            return Err(e);
        }

        master.record_assignments(&[(slide_id.clone(), shard_id)])?;
        master.insert_slide_ref(&slide_id, index)?;
        log::debug!("Added slide {slide_id} to shard {shard_id}");
        Ok(shard_id)
    }

    /// Remove a slide's content and drop it from the deck order.
    pub async fn remove_slide(&self, slide_id: &str) -> Result<()> {
        let master = self.master()?;
        let shard = self
            .with_shard(slide_id)
            .await
            .ok_or_else(|| SyncError::ShardUnavailable {
                slide_id: slide_id.to_string(),
            })?;
        shard.remove_slide(slide_id)?;
        master.remove_slide_ref(slide_id)?;
        self.forget_slide(slide_id);
        Ok(())
    }

    pub fn move_slide(&self, slide_id: &str, new_index: usize) -> Result<()> {
        self.master()?.move_slide(slide_id, new_index)
    }

    fn forget_slide(&self, slide_id: &str) {
        let mut layout = self.inner.layout.lock();
        if let Some(shard_id) = layout.slide_to_shard.remove(slide_id) {
            layout.shards[shard_id].slide_ids.retain(|id| id != slide_id);
        }
        layout.visible.remove(slide_id);
    }

    // --- introspection ----------------------------------------------------

    pub fn shard_states(&self) -> Vec<ShardInfo> {
        let layout = self.inner.layout.lock();
        layout
            .shards
            .iter()
            .enumerate()
            .map(|(shard_id, s)| ShardInfo {
                shard_id,
                room: s.room.clone(),
                slide_ids: s.slide_ids.clone(),
                state: s.state,
                visible: layout.is_visible(shard_id),
            })
            .collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.inner.layout.lock().loaded_count()
    }

    pub fn visible_slides(&self) -> Vec<String> {
        let mut visible: Vec<String> = self.inner.layout.lock().visible.iter().cloned().collect();
        visible.sort();
        visible
    }

    // --- lifecycle --------------------------------------------------------

    /// Spawn the periodic idle-shard unload.
    pub fn start(&self) {
        let mut task = self.inner.unload_task.lock();
        if task.is_some() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let period = self.inner.ctx.config().shards.unload_interval();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let evicted = DocumentShardOrchestrator { inner }.unload_idle_documents().await;
                if evicted > 0 {
                    log::debug!("Idle unload evicted {evicted} shard(s)");
                }
            }
        }));
    }

    /// Unload every shard (flushing pending edits), release the master and
    /// stop background tasks. The pool itself stays up.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.unload_task.lock().take() {
            task.abort();
        }
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }

        let loaded: Vec<usize> = {
            let layout = self.inner.layout.lock();
            (0..layout.shards.len())
                .filter(|&i| layout.shards[i].state.is_loaded())
                .collect()
        };
        for shard_id in loaded {
            self.unload_shard(shard_id).await;
        }

        let master = self.inner.master.lock().take();
        if let Some(master) = master {
            master.detach().await;
            self.inner.ctx.pool().release(master.room()).await;
        }
        log::info!("Closed deck {}", self.inner.deck_id);
    }
}

fn log_failure(result: Result<()>, op: &str, slide_id: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            log::warn!("{op} on slide {slide_id} failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::context::Identity;
    use crate::server::RoomHub;
    use crate::transport::LocalConnector;

    fn context(configure: impl FnOnce(&mut SyncConfig)) -> Arc<CollabContext> {
        let mut config = SyncConfig::default();
        configure(&mut config);
        let connector = Arc::new(LocalConnector::new(Arc::new(RoomHub::with_defaults())));
        CollabContext::new(config, Identity::new("alice", "Alice"), connector)
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("s{i}")).collect()
    }

    #[test]
    fn test_initialize_groups_contiguously() {
        let ctx = context(|c| c.shards.slides_per_shard = 3);
        let orch = DocumentShardOrchestrator::new(ctx, "deck");

        let assigned = orch.initialize(&ids(7));
        assert_eq!(assigned.len(), 7);
        let states = orch.shard_states();
        assert_eq!(states.len(), 3);
        assert_eq!(states[0].slide_ids, vec!["s0", "s1", "s2"]);
        assert_eq!(states[2].slide_ids, vec!["s6"]);
        assert_eq!(states[1].room, "deck-shard-1");
        assert!(states.iter().all(|s| s.state == ShardState::NotLoaded));

        // Already assigned ids keep their shard
        assert!(orch.initialize(&ids(8)).iter().all(|(id, shard)| id == "s7" && *shard == 2));
    }

    #[tokio::test]
    async fn test_loaded_shard_is_reused() {
        let ctx = context(|c| c.shards.slides_per_shard = 2);
        let orch = DocumentShardOrchestrator::new(ctx.clone(), "deck");
        orch.initialize(&ids(4));

        let a = orch.load_document_for_slide("s0").await.unwrap();
        let b = orch.load_document_for_slide("s1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(orch.loaded_count(), 1);
        assert!(matches!(
            orch.load_document_for_slide("nope").await,
            Err(SyncError::UnknownSlide(_))
        ));

        orch.shutdown().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_one_connection() {
        let ctx = context(|c| c.shards.slides_per_shard = 2);
        let orch = DocumentShardOrchestrator::new(ctx.clone(), "deck");
        orch.initialize(&ids(2));
        let mut pool_events = ctx.pool().subscribe();

        let (a, b) = tokio::join!(
            orch.load_document_for_slide("s0"),
            orch.load_document_for_slide("s1")
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert!(matches!(pool_events.try_recv(), Ok(crate::events::PoolEvent::ConnectionCreated { .. })));
        assert!(pool_events.try_recv().is_err());

        orch.shutdown().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_unload_flushes_and_releases() {
        let ctx = context(|c| c.shards.slides_per_shard = 1);
        let orch = DocumentShardOrchestrator::new(ctx.clone(), "deck");
        orch.initialize(&ids(1));
        let mut events = ctx.subscribe();

        orch.load_document_for_slide("s0").await.unwrap();
        assert!(orch.unload_shard(0).await);
        assert!(!orch.unload_shard(0).await);
        assert_eq!(orch.shard_states()[0].state, ShardState::Unloaded);
        assert!(!ctx.pool().is_in_use("deck-shard-0"));

        let mut saw_unloaded = false;
        while let Ok(ev) = events.try_recv() {
            saw_unloaded |= matches!(ev, DeckEvent::ShardUnloaded { shard_id: 0, .. });
        }
        assert!(saw_unloaded);

        orch.shutdown().await;
        ctx.shutdown().await;
    }
}
