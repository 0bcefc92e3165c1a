//! Lease-based component locks.
//!
//! The lease table lives in the shard document (`locks` and
//! `lock_requests`), so every actor in the room sees the same holders.
//! Only this module writes those maps.
//!
//! ```text
//! unlocked ──request──► locked(owner) ──release / expiry──► unlocked
//!                           │    ▲
//!          other requests   │    │ deny
//!                           ▼    │
//!                  locked(owner, pending) ──approve──► unlocked
//! ```
//!
//! Approval is a courtesy release: the requester has to request again.
//! Leases expire `LOCK_TTL` after the last grant or extension; an expired
//! lease counts as unlocked even before the sweep removes it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;
use yrs::{Map, TransactionMut};

use deck_core::now_millis;

use crate::config::LOCK_TTL;
use crate::context::Identity;
use crate::document::{all_json, get_json, put_json, Roots, ShardDoc};
use crate::events::DeckEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub slide_id: String,
    pub component_id: String,
    pub owner_actor_id: String,
    pub owner_connection_id: Uuid,
    pub owner_display_name: String,
    pub owner_color: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl Lock {
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    pub fn holder(&self) -> LockHolder {
        LockHolder {
            actor_id: self.owner_actor_id.clone(),
            connection_id: self.owner_connection_id,
            display_name: self.owner_display_name.clone(),
            color: self.owner_color.clone(),
        }
    }
}

/// Identity of whoever holds a lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockHolder {
    pub actor_id: String,
    pub connection_id: Uuid,
    pub display_name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRequest {
    pub component_id: String,
    pub slide_id: String,
    pub requester_actor_id: String,
    pub requester_display_name: String,
    pub timestamp: u64,
}

/// Outcome of [`LockManager::request_lock`]. A conflict is not an error.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LockResult {
    pub granted: bool,
    pub current_lock_holder: Option<LockHolder>,
    pub error: Option<String>,
}

impl LockResult {
    fn granted() -> Self {
        Self {
            granted: true,
            ..Default::default()
        }
    }

    fn held_by(lock: &Lock) -> Self {
        Self {
            granted: false,
            current_lock_holder: Some(lock.holder()),
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            granted: false,
            current_lock_holder: None,
            error: Some(error.to_string()),
        }
    }
}

/// Ids may contain the separator, so each one carries its length.
fn lock_key(slide_id: &str, component_id: &str) -> String {
    format!("{}:{slide_id}:{}:{component_id}", slide_id.len(), component_id.len())
}

fn request_key(slide_id: &str, component_id: &str, requester: &str) -> String {
    format!("{}:{requester}", lock_key(slide_id, component_id))
}

/// Remove every request recorded against one lock key.
fn clear_requests(roots: &Roots, txn: &mut TransactionMut, slide_id: &str, component_id: &str) {
    let prefix = format!("{}:", lock_key(slide_id, component_id));
    let keys: Vec<String> = roots
        .lock_requests
        .keys(&*txn)
        .filter(|k| k.starts_with(&prefix))
        .map(|k| k.to_string())
        .collect();
    for key in keys {
        roots.lock_requests.remove(txn, &key);
    }
}

/// Last lease/request tables seen by `reconcile`.
#[derive(Default)]
struct Observed {
    locks: HashMap<String, Lock>,
    requests: HashSet<String>,
}

enum Claim {
    Granted(Lock),
    Extended,
    Held(Lock),
}

/// Lease table for one shard, acting on behalf of one local connection.
pub struct LockManager {
    doc: Arc<ShardDoc>,
    room: String,
    identity: Identity,
    connection_id: Uuid,
    ttl: Duration,
    events: broadcast::Sender<DeckEvent>,
    observed: Mutex<Observed>,
}

impl LockManager {
    pub fn new(
        doc: Arc<ShardDoc>,
        room: impl Into<String>,
        identity: Identity,
        connection_id: Uuid,
        events: broadcast::Sender<DeckEvent>,
    ) -> Self {
        Self::with_ttl(doc, room, identity, connection_id, events, LOCK_TTL)
    }

    /// Same as [`Self::new`] with a custom lease length.
    pub fn with_ttl(
        doc: Arc<ShardDoc>,
        room: impl Into<String>,
        identity: Identity,
        connection_id: Uuid,
        events: broadcast::Sender<DeckEvent>,
        ttl: Duration,
    ) -> Self {
        Self {
            doc,
            room: room.into(),
            identity,
            connection_id,
            ttl,
            events,
            observed: Mutex::new(Observed::default()),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    fn emit(&self, event: DeckEvent) {
        let _ = self.events.send(event);
    }

    fn owns(&self, lock: &Lock) -> bool {
        lock.owner_connection_id == self.connection_id
    }

    /// Ask for the lock on a component.
    ///
    /// Unlocked (or expired): granted. Held by this connection: the lease is
    /// extended and the call reports granted. Held by someone else: a request
    /// is recorded for the owner and the holder is returned.
    pub fn request_lock(&self, slide_id: &str, component_id: &str) -> LockResult {
        let now = now_millis();
        let key = lock_key(slide_id, component_id);

        let claim = self.doc.transact_local(|txn, roots| {
            let existing: Option<Lock> = get_json(&roots.locks, &*txn, &key);
            match existing {
                Some(lock) if !lock.is_expired_at(now) && !self.owns(&lock) => {
                    let request = LockRequest {
                        component_id: component_id.to_string(),
                        slide_id: slide_id.to_string(),
                        requester_actor_id: self.identity.actor_id.clone(),
                        requester_display_name: self.identity.display_name.clone(),
                        timestamp: now,
                    };
                    let rkey = request_key(slide_id, component_id, &self.identity.actor_id);
                    put_json(&roots.lock_requests, txn, &rkey, &request)?;
                    Ok(Claim::Held(lock))
                }
                Some(mut lock) if !lock.is_expired_at(now) => {
                    lock.expires_at = now + self.ttl_ms();
                    put_json(&roots.locks, txn, &key, &lock)?;
                    Ok(Claim::Extended)
                }
                _ => {
                    let lock = Lock {
                        slide_id: slide_id.to_string(),
                        component_id: component_id.to_string(),
                        owner_actor_id: self.identity.actor_id.clone(),
                        owner_connection_id: self.connection_id,
                        owner_display_name: self.identity.display_name.clone(),
                        owner_color: self.identity.color.clone(),
                        acquired_at: now,
                        expires_at: now + self.ttl_ms(),
                    };
                    put_json(&roots.locks, txn, &key, &lock)?;
                    Ok(Claim::Granted(lock))
                }
            }
        });

        let result = match claim {
            Ok((Claim::Granted(lock), _)) => {
                log::debug!("Lock granted on {key} in {}", self.room);
                self.emit(DeckEvent::LockAcquired { lock });
                LockResult::granted()
            }
            Ok((Claim::Extended, _)) => LockResult::granted(),
            Ok((Claim::Held(lock), _)) => {
                log::debug!("Lock on {key} held by {}; request recorded", lock.owner_actor_id);
                LockResult::held_by(&lock)
            }
            Err(e) => {
                log::warn!("Lock request on {key} failed: {e}");
                LockResult::failed(e)
            }
        };
        self.reconcile();
        result
    }

    /// Release a lock. Succeeds when there is nothing to release, when this
    /// connection owns the lock, or when `force` is set.
    pub fn release_lock(&self, slide_id: &str, component_id: &str, force: bool) -> bool {
        let now = now_millis();
        let key = lock_key(slide_id, component_id);

        let released = self.doc.transact_local(|txn, roots| {
            let existing: Option<Lock> = get_json(&roots.locks, &*txn, &key);
            match existing {
                None => Ok(Some(None)),
                Some(lock) if force || self.owns(&lock) || lock.is_expired_at(now) => {
                    roots.locks.remove(txn, &key);
                    clear_requests(roots, txn, slide_id, component_id);
                    Ok(Some(Some(!self.owns(&lock))))
                }
                Some(_) => Ok(None),
            }
        });

        let ok = match released {
            Ok((Some(Some(forced)), _)) => {
                self.emit(DeckEvent::LockReleased {
                    slide_id: slide_id.to_string(),
                    component_id: component_id.to_string(),
                    forced,
                });
                true
            }
            Ok((Some(None), _)) => true,
            Ok((None, _)) => false,
            Err(e) => {
                log::warn!("Releasing {key} failed: {e}");
                false
            }
        };
        self.reconcile();
        ok
    }

    /// Refresh the lease. Only the owner may extend.
    pub fn extend_lock(&self, slide_id: &str, component_id: &str) -> bool {
        let now = now_millis();
        let key = lock_key(slide_id, component_id);
        let extended = self.doc.transact_local(|txn, roots| {
            let existing: Option<Lock> = get_json(&roots.locks, &*txn, &key);
            match existing {
                Some(mut lock) if self.owns(&lock) => {
                    lock.expires_at = now + self.ttl_ms();
                    put_json(&roots.locks, txn, &key, &lock)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        });
        matches!(extended, Ok((true, _)))
    }

    /// Extend every lock this connection holds. Returns how many.
    pub fn heartbeat(&self) -> usize {
        let now = now_millis();
        let extended = self.doc.transact_local(|txn, roots| {
            let own: Vec<(String, Lock)> = all_json::<Lock, _>(&roots.locks, &*txn)
                .into_iter()
                .filter(|(_, lock)| self.owns(lock) && !lock.is_expired_at(now))
                .collect();
            for (key, mut lock) in own.iter().cloned() {
                lock.expires_at = now + self.ttl_ms();
                put_json(&roots.locks, txn, &key, &lock)?;
            }
            Ok(own.len())
        });
        match extended {
            Ok((n, _)) => n,
            Err(e) => {
                log::warn!("Lock heartbeat failed in {}: {e}", self.room);
                0
            }
        }
    }

    /// Approve a pending request: the owner's lock is released and the
    /// request discarded. The requester must request again.
    pub fn approve_lock_request(&self, slide_id: &str, component_id: &str, requester_id: &str) -> bool {
        let key = lock_key(slide_id, component_id);
        let approved = self.doc.transact_local(|txn, roots| {
            let existing: Option<Lock> = get_json(&roots.locks, &*txn, &key);
            match existing {
                Some(lock) if self.owns(&lock) => {
                    roots.locks.remove(txn, &key);
                    roots
                        .lock_requests
                        .remove(txn, &request_key(slide_id, component_id, requester_id));
                    Ok(true)
                }
                _ => Ok(false),
            }
        });

        let ok = matches!(approved, Ok((true, _)));
        if ok {
            log::debug!("Approved {requester_id} on {key}");
            self.emit(DeckEvent::LockReleased {
                slide_id: slide_id.to_string(),
                component_id: component_id.to_string(),
                forced: true,
            });
        }
        self.reconcile();
        ok
    }

    /// Discard a pending request and keep the lock.
    pub fn deny_lock_request(&self, slide_id: &str, component_id: &str, requester_id: &str) -> bool {
        let key = lock_key(slide_id, component_id);
        let rkey = request_key(slide_id, component_id, requester_id);
        let denied = self.doc.transact_local(|txn, roots| {
            let existing: Option<Lock> = get_json(&roots.locks, &*txn, &key);
            let owned = existing.is_some_and(|lock| self.owns(&lock));
            if !owned || roots.lock_requests.get(&*txn, &rkey).is_none() {
                return Ok(false);
            }
            roots.lock_requests.remove(txn, &rkey);
            Ok(true)
        });
        let ok = matches!(denied, Ok((true, _)));
        self.reconcile();
        ok
    }

    /// Force-release every expired lock and drop requests older than one
    /// lease. Returns the released `(slide_id, component_id)` pairs.
    pub fn sweep_expired(&self) -> Vec<(String, String)> {
        let now = now_millis();
        let ttl = self.ttl_ms();

        let swept = self.doc.transact_local(|txn, roots| {
            let expired: Vec<(String, Lock)> = all_json::<Lock, _>(&roots.locks, &*txn)
                .into_iter()
                .filter(|(_, lock)| lock.is_expired_at(now))
                .collect();
            for (key, _) in &expired {
                roots.locks.remove(txn, key);
            }

            let stale: Vec<String> = all_json::<LockRequest, _>(&roots.lock_requests, &*txn)
                .into_iter()
                .filter(|(_, req)| req.timestamp + ttl <= now)
                .map(|(key, _)| key)
                .collect();
            for key in &stale {
                roots.lock_requests.remove(txn, key);
            }

            Ok(expired
                .into_iter()
                .map(|(_, lock)| (lock.slide_id, lock.component_id))
                .collect::<Vec<_>>())
        });

        let released = match swept {
            Ok((released, _)) => released,
            Err(e) => {
                log::warn!("Lock sweep failed in {}: {e}", self.room);
                Vec::new()
            }
        };
        for (slide_id, component_id) in &released {
            log::debug!("Lock on {slide_id}:{component_id} expired");
            self.emit(DeckEvent::LockReleased {
                slide_id: slide_id.clone(),
                component_id: component_id.clone(),
                forced: true,
            });
        }
        self.reconcile();
        released
    }

    /// Release everything this connection holds.
    pub fn release_all_own(&self) -> usize {
        let released = self.doc.transact_local(|txn, roots| {
            let own: Vec<(String, Lock)> = all_json::<Lock, _>(&roots.locks, &*txn)
                .into_iter()
                .filter(|(_, lock)| self.owns(lock))
                .collect();
            for (key, lock) in &own {
                roots.locks.remove(txn, key);
                clear_requests(roots, txn, &lock.slide_id, &lock.component_id);
            }
            Ok(own.into_iter().map(|(_, lock)| lock).collect::<Vec<_>>())
        });

        let released = match released {
            Ok((released, _)) => released,
            Err(e) => {
                log::warn!("Releasing own locks in {} failed: {e}", self.room);
                Vec::new()
            }
        };
        for lock in &released {
            self.emit(DeckEvent::LockReleased {
                slide_id: lock.slide_id.clone(),
                component_id: lock.component_id.clone(),
                forced: false,
            });
        }
        self.reconcile();
        released.len()
    }

    /// The live (unexpired) lock on a component.
    pub fn get_component_lock(&self, slide_id: &str, component_id: &str) -> Option<Lock> {
        let now = now_millis();
        let key = lock_key(slide_id, component_id);
        self.doc
            .read(|txn, roots| get_json::<Lock, _>(&roots.locks, txn, &key))
            .filter(|lock| !lock.is_expired_at(now))
    }

    pub fn is_component_locked(&self, slide_id: &str, component_id: &str) -> bool {
        self.get_component_lock(slide_id, component_id).is_some()
    }

    /// Live locks on one slide, ordered by component id.
    pub fn get_locks_for_slide(&self, slide_id: &str) -> Vec<Lock> {
        let now = now_millis();
        let mut locks: Vec<Lock> = self
            .doc
            .read(|txn, roots| all_json::<Lock, _>(&roots.locks, &*txn))
            .into_iter()
            .map(|(_, lock)| lock)
            .filter(|lock| lock.slide_id == slide_id && !lock.is_expired_at(now))
            .collect();
        locks.sort_by(|a, b| a.component_id.cmp(&b.component_id));
        locks
    }

    /// Requests waiting on locks this connection owns, oldest first.
    pub fn pending_requests_for_me(&self) -> Vec<LockRequest> {
        let now = now_millis();
        let (locks, requests) = self.doc.read(|txn, roots| {
            (
                all_json::<Lock, _>(&roots.locks, &*txn),
                all_json::<LockRequest, _>(&roots.lock_requests, &*txn),
            )
        });
        let owned: HashSet<String> = locks
            .into_iter()
            .filter(|(_, lock)| self.owns(lock) && !lock.is_expired_at(now))
            .map(|(key, _)| key)
            .collect();
        let mut pending: Vec<LockRequest> = requests
            .into_iter()
            .map(|(_, req)| req)
            .filter(|req| owned.contains(&lock_key(&req.slide_id, &req.component_id)))
            .collect();
        pending.sort_by_key(|req| req.timestamp);
        pending
    }

    /// Diff the lease and request tables against the last snapshot and
    /// publish what changed. Called after every local lock operation and
    /// every applied remote update.
    pub fn reconcile(&self) {
        let (locks, requests) = self.doc.read(|txn, roots| {
            (
                all_json::<Lock, _>(&roots.locks, &*txn),
                all_json::<LockRequest, _>(&roots.lock_requests, &*txn),
            )
        });
        let locks: HashMap<String, Lock> = locks.into_iter().collect();
        let request_keys: HashSet<String> = requests.iter().map(|(key, _)| key.clone()).collect();

        let mut observed = self.observed.lock();
        let locks_changed = observed.locks != locks;
        let requests_changed = observed.requests != request_keys;

        let new_for_me: Vec<LockRequest> = requests
            .into_iter()
            .filter(|(key, _)| !observed.requests.contains(key))
            .map(|(_, req)| req)
            .filter(|req| {
                locks
                    .get(&lock_key(&req.slide_id, &req.component_id))
                    .is_some_and(|lock| self.owns(lock))
            })
            .collect();

        observed.locks = locks;
        observed.requests = request_keys;
        drop(observed);

        if locks_changed {
            self.emit(DeckEvent::LocksChanged { room: self.room.clone() });
        }
        if requests_changed {
            self.emit(DeckEvent::LockRequestsChanged { room: self.room.clone() });
        }
        for request in new_for_me {
            self.emit(DeckEvent::LockRequested { request });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(doc: &Arc<ShardDoc>, actor: &str, events: &broadcast::Sender<DeckEvent>) -> LockManager {
        LockManager::new(
            doc.clone(),
            "deck-shard-0",
            Identity::new(actor, actor.to_uppercase()),
            Uuid::new_v4(),
            events.clone(),
        )
    }

    /// Two actors sharing one replica stand in for two synced replicas.
    fn pair() -> (LockManager, LockManager, broadcast::Receiver<DeckEvent>) {
        let doc = Arc::new(ShardDoc::new());
        let (events, rx) = broadcast::channel(64);
        (manager(&doc, "a", &events), manager(&doc, "b", &events), rx)
    }

    fn drain(rx: &mut broadcast::Receiver<DeckEvent>) -> Vec<DeckEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_mutual_exclusion() {
        let (a, b, _rx) = pair();
        assert!(a.request_lock("slide-1", "comp-9").granted);

        let denied = b.request_lock("slide-1", "comp-9");
        assert!(!denied.granted);
        let holder = denied.current_lock_holder.unwrap();
        assert_eq!(holder.actor_id, "a");
        assert_eq!(holder.connection_id, a.connection_id());

        // Own lock again is an extension, not a conflict
        assert!(a.request_lock("slide-1", "comp-9").granted);
    }

    #[test]
    fn test_release_then_rerequest() {
        let (a, b, _rx) = pair();
        assert!(a.request_lock("slide-1", "comp-9").granted);
        assert!(!b.request_lock("slide-1", "comp-9").granted);

        assert!(!b.release_lock("slide-1", "comp-9", false));
        assert!(a.release_lock("slide-1", "comp-9", false));
        assert!(b.request_lock("slide-1", "comp-9").granted);
        assert_eq!(b.get_component_lock("slide-1", "comp-9").unwrap().owner_actor_id, "b");
        // Nothing to release is a successful no-op
        assert!(a.release_lock("slide-1", "comp-x", false));
    }

    #[test]
    fn test_request_notifies_owner_only() {
        let doc = Arc::new(ShardDoc::new());
        let (a_events, mut a_rx) = broadcast::channel(64);
        let (b_events, mut b_rx) = broadcast::channel(64);
        let a = manager(&doc, "a", &a_events);
        let b = manager(&doc, "b", &b_events);

        a.request_lock("s", "c");
        b.request_lock("s", "c");
        a.reconcile();

        let a_seen = drain(&mut a_rx);
        assert!(a_seen
            .iter()
            .any(|ev| matches!(ev, DeckEvent::LockRequested { request } if request.requester_actor_id == "b")));
        assert!(!drain(&mut b_rx)
            .iter()
            .any(|ev| matches!(ev, DeckEvent::LockRequested { .. })));
        assert_eq!(a.pending_requests_for_me().len(), 1);
        assert!(b.pending_requests_for_me().is_empty());
    }

    #[test]
    fn test_approve_releases_without_transfer() {
        let (a, b, mut rx) = pair();
        a.request_lock("s", "c");
        b.request_lock("s", "c");
        drain(&mut rx);

        assert!(!b.approve_lock_request("s", "c", "b"));
        assert!(a.approve_lock_request("s", "c", "b"));
        assert!(!a.is_component_locked("s", "c"));
        assert!(a.pending_requests_for_me().is_empty());
        assert!(drain(&mut rx).contains(&DeckEvent::LockReleased {
            slide_id: "s".into(),
            component_id: "c".into(),
            forced: true,
        }));

        assert!(b.request_lock("s", "c").granted);
    }

    #[test]
    fn test_deny_keeps_lock() {
        let (a, b, _rx) = pair();
        a.request_lock("s", "c");
        b.request_lock("s", "c");

        assert!(a.deny_lock_request("s", "c", "b"));
        assert!(!a.deny_lock_request("s", "c", "b"));
        assert!(a.pending_requests_for_me().is_empty());
        assert_eq!(a.get_component_lock("s", "c").unwrap().owner_actor_id, "a");
    }

    #[test]
    fn test_extend_owner_only() {
        let (a, b, _rx) = pair();
        a.request_lock("s", "c");
        let before = a.get_component_lock("s", "c").unwrap().expires_at;
        assert!(!b.extend_lock("s", "c"));
        assert!(a.extend_lock("s", "c"));
        assert!(a.get_component_lock("s", "c").unwrap().expires_at >= before);
        assert_eq!(a.heartbeat(), 1);
        assert_eq!(b.heartbeat(), 0);
    }

    #[tokio::test]
    async fn test_expired_lock_is_swept() {
        let doc = Arc::new(ShardDoc::new());
        let (events, mut rx) = broadcast::channel(64);
        let a = LockManager::with_ttl(
            doc.clone(),
            "r",
            Identity::new("a", "A"),
            Uuid::new_v4(),
            events.clone(),
            Duration::from_millis(20),
        );
        let b = manager(&doc, "b", &events);

        assert!(a.request_lock("s", "c").granted);
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Expired counts as unlocked before the sweep
        assert!(!a.is_component_locked("s", "c"));
        drain(&mut rx);

        let swept = b.sweep_expired();
        assert_eq!(swept, vec![("s".to_string(), "c".to_string())]);
        assert!(drain(&mut rx).contains(&DeckEvent::LockReleased {
            slide_id: "s".into(),
            component_id: "c".into(),
            forced: true,
        }));
        assert!(b.request_lock("s", "c").granted);
    }

    #[test]
    fn test_release_all_own() {
        let (a, b, _rx) = pair();
        a.request_lock("s1", "c1");
        a.request_lock("s2", "c2");
        b.request_lock("s1", "c3");

        assert_eq!(a.release_all_own(), 2);
        assert!(b.is_component_locked("s1", "c3"));
        assert!(a.get_locks_for_slide("s1").iter().all(|l| l.owner_actor_id == "b"));
    }

    #[test]
    fn test_ids_containing_separator_stay_distinct() {
        let (a, b, _rx) = pair();
        assert!(b.request_lock("s:c", "x").granted);
        assert!(!a.request_lock("s:c", "x").granted);

        // Releasing an unrelated lock keeps the pending request
        assert!(b.request_lock("s", "c").granted);
        assert!(b.release_lock("s", "c", false));
        assert_eq!(b.pending_requests_for_me().len(), 1);

        assert!(a.request_lock("s", "c:x").granted);
        assert_eq!(b.get_component_lock("s:c", "x").unwrap().owner_actor_id, "b");
        assert_eq!(a.get_component_lock("s", "c:x").unwrap().owner_actor_id, "a");
    }
}
