//! Bounded pool of room connections.
//!
//! ```text
//! acquire(room)
//!   ├─ idle entry for room      → mark in use, return it
//!   ├─ live < max_connections   → reserve a slot, open a new connection
//!   ├─ idle entry of other room → destroy the LRU one, open in its slot
//!   └─ otherwise                → queue (FIFO) until a release frees one
//! ```
//!
//! There is at most one connection per room. "Live" counts in-use, idle and
//! in-flight creations, so capacity holds even while a transport is still
//! connecting. Transport errors reach the caller of `acquire` unchanged and
//! are never retried here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::connection::SyncConnection;
use crate::context::Identity;
use crate::error::{Result, SyncError};
use crate::events::PoolEvent;
use crate::transport::Connector;

/// Snapshot returned by [`ConnectionPool::status`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStatus {
    /// Connections currently handed out
    pub active: usize,
    pub idle: usize,
    /// Connections still being opened
    pub creating: usize,
    /// Callers waiting for a connection
    pub queued: usize,
    /// Age of the oldest live connection
    pub oldest_age_ms: u64,
}

struct Entry {
    conn: Arc<SyncConnection>,
    in_use: bool,
    last_used: Instant,
    usage_count: u64,
}

/// What a queued caller is woken up with.
enum Grant {
    /// An idle connection for its room, already marked in use
    Connection(Arc<SyncConnection>),
    /// A reserved slot; the caller opens the connection itself
    Slot,
}

struct Waiter {
    id: u64,
    room: String,
    tx: oneshot::Sender<Grant>,
}

/// Result of the synchronous admission decision.
enum Admission {
    Ready(Arc<SyncConnection>),
    Create { evicted: Option<Arc<SyncConnection>> },
    Wait { id: u64, rx: oneshot::Receiver<Grant> },
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Entry>,
    creating: HashSet<String>,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
}

impl PoolState {
    fn live(&self) -> usize {
        self.entries.len() + self.creating.len()
    }

    fn has_waiter_for(&self, room: &str) -> bool {
        self.waiters.iter().any(|w| w.room == room)
    }

    /// Remove and return the least recently used idle entry.
    fn evict_lru_idle(&mut self) -> Option<Arc<SyncConnection>> {
        let room = self
            .entries
            .iter()
            .filter(|(_, e)| !e.in_use)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(room, _)| room.clone())?;
        self.entries.remove(&room).map(|e| e.conn)
    }

    /// Hand freed capacity to queued callers, oldest first.
    ///
    /// Idle connections go to waiters for their own room before any slot is
    /// reclaimed; a waiter whose room is busy (in use or being created)
    /// keeps waiting without blocking waiters behind it. Returns the idle
    /// connections destroyed to make room.
    fn dispatch(&mut self, max_connections: usize) -> Vec<Arc<SyncConnection>> {
        self.waiters.retain(|w| !w.tx.is_closed());

        // Idle connections to same-room waiters
        let mut i = 0;
        while i < self.waiters.len() {
            let room = self.waiters[i].room.clone();
            let idle = self.entries.get(&room).is_some_and(|e| !e.in_use);
            if idle {
                if let Some(waiter) = self.waiters.remove(i) {
                    if let Some(entry) = self.entries.get_mut(&room) {
                        entry.in_use = true;
                        entry.last_used = Instant::now();
                        entry.usage_count += 1;
                        if waiter.tx.send(Grant::Connection(entry.conn.clone())).is_err() {
                            entry.in_use = false;
                        }
                    }
                }
                continue;
            }
            i += 1;
        }

        // Slots for rooms with no connection at all
        let mut evicted = Vec::new();
        let mut i = 0;
        while i < self.waiters.len() {
            let room = self.waiters[i].room.clone();
            if self.entries.contains_key(&room) || self.creating.contains(&room) {
                i += 1;
                continue;
            }
            if self.live() >= max_connections {
                match self.evict_lru_idle() {
                    Some(conn) => evicted.push(conn),
                    None => break,
                }
            }
            if let Some(waiter) = self.waiters.remove(i) {
                self.creating.insert(room.clone());
                if waiter.tx.send(Grant::Slot).is_err() {
                    self.creating.remove(&room);
                }
            }
        }
        evicted
    }
}

/// Bounded, room-keyed set of live connections.
pub struct ConnectionPool {
    config: SyncConfig,
    identity: Identity,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    events: broadcast::Sender<PoolEvent>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(config: SyncConfig, identity: Identity, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            identity,
            connector,
            state: Mutex::new(PoolState::default()),
            events,
            cleanup_task: Mutex::new(None),
        }
    }

    pub fn max_connections(&self) -> usize {
        self.config.pool.max_connections
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Get a connection for `room`, waiting for capacity if needed.
    ///
    /// Waits at most `pool.acquire_timeout_ms` when configured, forever
    /// otherwise.
    pub async fn acquire(&self, room: &str) -> Result<Arc<SyncConnection>> {
        self.acquire_timeout(room, self.config.pool.acquire_timeout()).await
    }

    /// [`Self::acquire`] with an explicit queue timeout.
    ///
    /// Cancel safe: dropping the future gives back a reserved slot or a
    /// connection granted while it was queued.
    pub async fn acquire_timeout(&self, room: &str, timeout: Option<Duration>) -> Result<Arc<SyncConnection>> {
        let admission = self.admit(room)?;
        let (id, rx) = match admission {
            Admission::Ready(conn) => {
                log::debug!("Reusing idle connection for {room}");
                return Ok(conn);
            }
            Admission::Create { evicted } => {
                let reservation = Reservation::new(self, room);
                if let Some(conn) = evicted {
                    self.destroy_connection(conn).await;
                }
                return self.create(reservation).await;
            }
            Admission::Wait { id, rx } => (id, rx),
        };

        log::debug!("Pool at capacity, queueing acquire for {room}");
        let mut queued = Queued {
            pool: self,
            id,
            room,
            rx,
            done: false,
        };
        let grant = match timeout {
            None => (&mut queued.rx).await.ok(),
            Some(limit) => match tokio::time::timeout(limit, &mut queued.rx).await {
                Ok(grant) => grant.ok(),
                Err(_) => {
                    let still_queued = {
                        let mut state = self.state.lock();
                        let before = state.waiters.len();
                        state.waiters.retain(|w| w.id != id);
                        state.waiters.len() != before
                    };
                    if still_queued {
                        queued.done = true;
                        log::warn!("Timed out waiting for a connection to {room}");
                        return Err(SyncError::AcquireTimeout { room: room.to_string() });
                    }
                    // Granted between the deadline and the lock
                    queued.rx.try_recv().ok()
                }
            },
        };
        queued.done = true;

        match grant {
            Some(Grant::Connection(conn)) => Ok(conn),
            Some(Grant::Slot) => self.create(Reservation::new(self, room)).await,
            None => Err(SyncError::PoolClosed),
        }
    }

    /// Synchronous admission decision, taken under the state lock.
    fn admit(&self, room: &str) -> Result<Admission> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SyncError::PoolClosed);
        }

        let queued_ahead = state.has_waiter_for(room);
        let idle = state
            .entries
            .get(room)
            .filter(|e| !e.in_use)
            .map(|e| e.conn.is_connected());

        match idle {
            Some(true) if !queued_ahead => {
                if let Some(entry) = state.entries.get_mut(room) {
                    entry.in_use = true;
                    entry.last_used = Instant::now();
                    entry.usage_count += 1;
                    return Ok(Admission::Ready(entry.conn.clone()));
                }
            }
            Some(false) if !queued_ahead => {
                log::info!("Replacing disconnected connection for {room}");
                let stale = state.entries.remove(room).map(|e| e.conn);
                state.creating.insert(room.to_string());
                return Ok(Admission::Create { evicted: stale });
            }
            _ => {}
        }

        let busy = state.entries.contains_key(room) || state.creating.contains(room);
        if !busy && !queued_ahead {
            if state.live() < self.config.pool.max_connections {
                state.creating.insert(room.to_string());
                return Ok(Admission::Create { evicted: None });
            }
            if let Some(conn) = state.evict_lru_idle() {
                log::debug!("Evicting idle connection for {} to admit {room}", conn.room());
                state.creating.insert(room.to_string());
                return Ok(Admission::Create { evicted: Some(conn) });
            }
        }

        let id = state.next_waiter;
        state.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            id,
            room: room.to_string(),
            tx,
        });
        Ok(Admission::Wait { id, rx })
    }

    /// Open a connection in a slot already reserved in `creating`.
    async fn create(&self, reservation: Reservation<'_>) -> Result<Arc<SyncConnection>> {
        let room = reservation.room;
        let opened = SyncConnection::open(self.connector.as_ref(), room, &self.identity, &self.config).await;

        enum Outcome {
            Registered(Arc<SyncConnection>),
            Failed(SyncError, Vec<Arc<SyncConnection>>),
            Closed(Arc<SyncConnection>),
        }

        reservation.disarm();
        let outcome = {
            let mut state = self.state.lock();
            state.creating.remove(room);
            match opened {
                Ok(conn) if state.closed => Outcome::Closed(conn),
                Ok(conn) => {
                    state.entries.insert(
                        room.to_string(),
                        Entry {
                            conn: conn.clone(),
                            in_use: true,
                            last_used: Instant::now(),
                            usage_count: 1,
                        },
                    );
                    Outcome::Registered(conn)
                }
                // The reserved slot is free again
                Err(e) => Outcome::Failed(e, state.dispatch(self.config.pool.max_connections)),
            }
        };

        match outcome {
            Outcome::Registered(conn) => {
                log::info!("Created connection {} for room {room}", conn.id());
                let _ = self.events.send(PoolEvent::ConnectionCreated {
                    room: room.to_string(),
                    connection_id: conn.id(),
                });
                Ok(conn)
            }
            Outcome::Failed(e, evicted) => {
                log::warn!("Failed to open connection for {room}: {e}");
                for conn in evicted {
                    self.destroy_connection(conn).await;
                }
                Err(e)
            }
            Outcome::Closed(conn) => {
                conn.close().await;
                Err(SyncError::PoolClosed)
            }
        }
    }

    /// Return the connection for `room` to the idle set, or hand it straight
    /// to the next caller queued for that room.
    pub async fn release(&self, room: &str) {
        let (connection_id, evicted) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(room) else {
                log::debug!("Release of unknown room {room}");
                return;
            };
            if !entry.in_use {
                return;
            }
            entry.in_use = false;
            entry.last_used = Instant::now();
            let connection_id = entry.conn.id();
            let evicted = state.dispatch(self.config.pool.max_connections);
            (connection_id, evicted)
        };

        let _ = self.events.send(PoolEvent::ConnectionReleased {
            room: room.to_string(),
            connection_id,
        });
        for conn in evicted {
            self.destroy_connection(conn).await;
        }
    }

    /// Destroy idle connections past the idle timeout, and idle ones whose
    /// transport has gone away. Returns how many were destroyed.
    pub async fn cleanup_idle(&self) -> usize {
        let idle_timeout = self.config.pool.idle_timeout();
        let victims = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| {
                    !e.in_use && (now.duration_since(e.last_used) > idle_timeout || !e.conn.is_connected())
                })
                .map(|(room, _)| room.clone())
                .collect();
            let mut victims: Vec<_> = expired
                .iter()
                .filter_map(|room| state.entries.remove(room).map(|e| e.conn))
                .collect();
            if !victims.is_empty() {
                victims.extend(state.dispatch(self.config.pool.max_connections));
            }
            victims
        };

        let count = victims.len();
        for conn in victims {
            self.destroy_connection(conn).await;
        }
        if count > 0 {
            log::debug!("Idle sweep destroyed {count} connection(s)");
        }
        count
    }

    async fn destroy_connection(&self, conn: Arc<SyncConnection>) {
        destroy(conn, &self.events).await;
    }

    /// Destroy connections from a context that cannot await.
    fn destroy_detached(&self, conns: Vec<Arc<SyncConnection>>) {
        if conns.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("No runtime to close {} evicted connection(s)", conns.len());
            return;
        };
        let events = self.events.clone();
        runtime.spawn(async move {
            for conn in conns {
                destroy(conn, &events).await;
            }
        });
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        let now = Instant::now();
        let active = state.entries.values().filter(|e| e.in_use).count();
        let oldest_age_ms = state
            .entries
            .values()
            .map(|e| now.duration_since(e.conn.created_at()).as_millis() as u64)
            .max()
            .unwrap_or(0);
        PoolStatus {
            active,
            idle: state.entries.len() - active,
            creating: state.creating.len(),
            queued: state.waiters.len(),
            oldest_age_ms,
        }
    }

    /// How many times the connection for `room` has been handed out.
    pub fn usage_count(&self, room: &str) -> Option<u64> {
        self.state.lock().entries.get(room).map(|e| e.usage_count)
    }

    pub fn is_in_use(&self, room: &str) -> bool {
        self.state.lock().entries.get(room).is_some_and(|e| e.in_use)
    }

    /// True if `acquire` for a room without a connection would not queue.
    pub fn has_free_slot(&self) -> bool {
        let state = self.state.lock();
        state.live() < self.config.pool.max_connections || state.entries.values().any(|e| !e.in_use)
    }

    /// Spawn the periodic idle sweep.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.cleanup_task.lock();
        if task.is_some() {
            return;
        }
        let pool: Weak<Self> = Arc::downgrade(self);
        let period = self.config.pool.cleanup_interval();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.cleanup_idle().await;
            }
        }));
    }

    /// Destroy every connection and fail every queued caller with
    /// [`SyncError::PoolClosed`].
    pub async fn shutdown(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }
        let conns: Vec<_> = {
            let mut state = self.state.lock();
            state.closed = true;
            // Dropping the senders wakes every waiter with PoolClosed
            state.waiters.clear();
            state.entries.drain().map(|(_, e)| e.conn).collect()
        };
        for conn in conns {
            self.destroy_connection(conn).await;
        }
        log::info!("Connection pool shut down");
    }
}

async fn destroy(conn: Arc<SyncConnection>, events: &broadcast::Sender<PoolEvent>) {
    conn.close().await;
    log::info!("Destroyed connection {} for room {}", conn.id(), conn.room());
    let _ = events.send(PoolEvent::ConnectionDestroyed {
        room: conn.room().to_string(),
        connection_id: conn.id(),
    });
}

/// A slot reserved in `creating`. Dropped before the connection is
/// registered, it frees the slot for the next waiter.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    room: &'a str,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a ConnectionPool, room: &'a str) -> Self {
        Self { pool, room, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let evicted = {
            let mut state = self.pool.state.lock();
            state.creating.remove(self.room);
            state.dispatch(self.pool.config.pool.max_connections)
        };
        log::debug!("Abandoned connection attempt for {}", self.room);
        self.pool.destroy_detached(evicted);
    }
}

/// A caller waiting in the queue. Dropped early, it leaves the queue and
/// returns whatever it was granted in the meantime.
struct Queued<'a> {
    pool: &'a ConnectionPool,
    id: u64,
    room: &'a str,
    rx: oneshot::Receiver<Grant>,
    done: bool,
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.rx.close();
        let grant = self.rx.try_recv().ok();
        let max_connections = self.pool.config.pool.max_connections;
        let evicted = {
            let mut state = self.pool.state.lock();
            state.waiters.retain(|w| w.id != self.id);
            match grant {
                Some(Grant::Slot) => {
                    state.creating.remove(self.room);
                    state.dispatch(max_connections)
                }
                Some(Grant::Connection(_)) => {
                    if let Some(entry) = state.entries.get_mut(self.room) {
                        entry.in_use = false;
                        entry.last_used = Instant::now();
                    }
                    state.dispatch(max_connections)
                }
                None => Vec::new(),
            }
        };
        log::debug!("Abandoned queued acquire for {}", self.room);
        self.pool.destroy_detached(evicted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerInfo;
    use crate::server::RoomHub;
    use crate::transport::{LocalConnector, TransportHandle};
    use futures_util::future::BoxFuture;

    /// Local transport that takes `delay` to come up.
    struct SlowConnector {
        inner: LocalConnector,
        delay: Duration,
    }

    impl Connector for SlowConnector {
        fn connect(&self, room: &str, peer: &PeerInfo) -> BoxFuture<'static, Result<TransportHandle>> {
            let delay = self.delay;
            let connecting = self.inner.connect(room, peer);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                connecting.await
            })
        }
    }

    fn pool(max_connections: usize) -> Arc<ConnectionPool> {
        let mut config = SyncConfig::default();
        config.pool.max_connections = max_connections;
        let connector = Arc::new(LocalConnector::new(Arc::new(RoomHub::with_defaults())));
        Arc::new(ConnectionPool::new(config, Identity::new("alice", "Alice"), connector))
    }

    #[tokio::test]
    async fn test_reuses_idle_connection() {
        let pool = pool(1);
        let a = pool.acquire("room-A").await.unwrap();
        pool.release("room-A").await;
        let b = pool.acquire("room-A").await.unwrap();

        assert_eq!(a.id(), b.id());
        assert_eq!(pool.usage_count("room-A"), Some(2));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_hands_over_to_same_room_waiter() {
        let pool = pool(1);
        let first = pool.acquire("room-A").await.unwrap();
        let mut events = pool.subscribe();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("room-A").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.status().queued, 1);

        pool.release("room-A").await;
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(first.id(), second.id());
        assert!(pool.is_in_use("room-A"));
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::ConnectionReleased { .. }));
        assert!(events.try_recv().is_err());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_at_capacity_evicts_lru_idle_of_other_room() {
        let pool = pool(2);
        pool.acquire("a").await.unwrap();
        pool.acquire("b").await.unwrap();
        pool.release("a").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.release("b").await;

        pool.acquire("c").await.unwrap();
        let status = pool.status();
        assert_eq!(status.active, 1);
        assert_eq!(status.idle, 1);
        assert!(pool.usage_count("a").is_none());
        assert!(pool.usage_count("b").is_some());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let pool = pool(1);
        pool.acquire("a").await.unwrap();

        let Err(err) = pool
            .acquire_timeout("b", Some(Duration::from_millis(20)))
            .await
        else {
            panic!("acquire should time out while the only slot is busy");
        };
        assert!(matches!(err, SyncError::AcquireTimeout { .. }));
        assert_eq!(pool.status().queued, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters() {
        let pool = pool(1);
        pool.acquire("a").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("b").await })
        };
        tokio::task::yield_now().await;

        pool.shutdown().await;
        assert!(matches!(waiter.await.unwrap(), Err(SyncError::PoolClosed)));
        assert!(matches!(pool.acquire("a").await, Err(SyncError::PoolClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_destroys_only_expired_idle() {
        let pool = pool(3);
        pool.acquire("a").await.unwrap();
        pool.acquire("b").await.unwrap();
        pool.release("a").await;

        tokio::time::advance(Duration::from_millis(60_001)).await;
        assert_eq!(pool.cleanup_idle().await, 1);
        let status = pool.status();
        assert_eq!(status.active, 1);
        assert_eq!(status.idle, 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_create_frees_its_slot() {
        let mut config = SyncConfig::default();
        config.pool.max_connections = 1;
        let connector = Arc::new(SlowConnector {
            inner: LocalConnector::new(Arc::new(RoomHub::with_defaults())),
            delay: Duration::from_millis(100),
        });
        let pool = ConnectionPool::new(config, Identity::new("alice", "Alice"), connector);

        let cancelled = tokio::time::timeout(Duration::from_millis(10), pool.acquire("a")).await;
        assert!(cancelled.is_err());
        assert_eq!(pool.status().creating, 0);

        let conn = pool
            .acquire_timeout("b", Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(conn.room(), "b");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_waiter_hands_back_its_grant() {
        let pool = pool(1);
        pool.acquire("a").await.unwrap();

        let mut waiting = Box::pin(pool.acquire("a"));
        assert!(tokio::time::timeout(Duration::from_millis(10), &mut waiting).await.is_err());
        assert_eq!(pool.status().queued, 1);

        // Granted to the waiter, which then goes away without looking
        pool.release("a").await;
        drop(waiting);

        let status = pool.status();
        assert_eq!(status.active, 0);
        assert_eq!(status.idle, 1);
        assert_eq!(status.queued, 0);
        assert!(pool.acquire("a").await.is_ok());
        pool.shutdown().await;
    }
}
