//! CRDT document wrapper for one shard.
//!
//! A [`ShardDoc`] owns a yrs `Doc` and the root collections of the deck
//! schema:
//!
//! ```text
//! master shard                     content shard
//! ┌──────────────────────────┐     ┌──────────────────────────────┐
//! │ meta        (map)        │     │ slides        (map → JSON)   │
//! │ slide_order (array)      │     │ components    (map → JSON)   │
//! │ assignments (map)        │     │ locks         (map → JSON)   │
//! └──────────────────────────┘     │ lock_requests (map → JSON)   │
//!                                  └──────────────────────────────┘
//! ```
//!
//! Records are stored as JSON strings, one map entry per record. All access
//! goes through a mutex that is never held across an `.await`; local edits go
//! through [`ShardDoc::transact_local`]. Every committed change, local or
//! remote, is pushed to the change sink in commit order while the lock is
//! still held; the outbound compressor consumes that stream.

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut,
    Update,
};

use crate::error::{Result, SyncError};

/// Root collections of the deck schema.
pub struct Roots {
    pub meta: MapRef,
    pub slide_order: ArrayRef,
    pub assignments: MapRef,
    pub slides: MapRef,
    pub components: MapRef,
    pub locks: MapRef,
    pub lock_requests: MapRef,
}

impl Roots {
    fn new(doc: &Doc) -> Self {
        Self {
            meta: doc.get_or_insert_map("meta"),
            slide_order: doc.get_or_insert_array("slide_order"),
            assignments: doc.get_or_insert_map("assignments"),
            slides: doc.get_or_insert_map("slides"),
            components: doc.get_or_insert_map("components"),
            locks: doc.get_or_insert_map("locks"),
            lock_requests: doc.get_or_insert_map("lock_requests"),
        }
    }
}

/// Encoding of a transaction that changed nothing.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// A committed change, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub enum DocChange {
    Local(Vec<u8>),
    Remote(Vec<u8>),
}

struct Inner {
    doc: Doc,
    roots: Roots,
    sink: Option<mpsc::UnboundedSender<DocChange>>,
}

impl Inner {
    fn emit(&mut self, change: DocChange) {
        if let Some(sink) = &self.sink {
            if sink.send(change).is_err() {
                self.sink = None;
            }
        }
    }
}

/// One shard's CRDT document.
pub struct ShardDoc {
    inner: Mutex<Inner>,
}

impl ShardDoc {
    pub fn new() -> Self {
        let doc = Doc::new();
        let roots = Roots::new(&doc);
        Self {
            inner: Mutex::new(Inner { doc, roots, sink: None }),
        }
    }

    /// Route every subsequent committed change to `sink`.
    pub fn set_sink(&self, sink: mpsc::UnboundedSender<DocChange>) {
        self.inner.lock().sink = Some(sink);
    }

    /// Run a local edit in one transaction and return its encoded update.
    ///
    /// `f` must validate before it writes: yrs has no rollback, so an error
    /// returned after a write would still commit the partial change.
    pub fn transact_local<R>(
        &self,
        f: impl FnOnce(&mut TransactionMut, &Roots) -> Result<R>,
    ) -> Result<(R, Vec<u8>)> {
        let mut inner = self.inner.lock();
        let (result, update) = {
            let mut txn = inner.doc.transact_mut();
            let result = f(&mut txn, &inner.roots)?;
            (result, txn.encode_update_v1())
        };
        if update != EMPTY_UPDATE {
            inner.emit(DocChange::Local(update.clone()));
        }
        Ok((result, update))
    }

    /// Read-only access.
    pub fn read<R>(&self, f: impl FnOnce(&yrs::Transaction, &Roots) -> R) -> R {
        let inner = self.inner.lock();
        let txn = inner.doc.transact();
        f(&txn, &inner.roots)
    }

    /// Apply an encoded (v1) update received from elsewhere.
    pub fn apply_update(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        apply_update_v1(&inner.doc, bytes)?;
        inner.emit(DocChange::Remote(bytes.to_vec()));
        Ok(())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.read(|txn, _| txn.state_vector().encode_v1())
    }

    /// Encode everything the holder of `state_vector` is missing.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector)?;
        Ok(self.read(|txn, _| txn.encode_state_as_update_v1(&sv)))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.read(|txn, _| txn.encode_state_as_update_v1(&StateVector::default()))
    }
}

impl Default for ShardDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode and apply a v1 update to a raw yrs doc.
pub fn apply_update_v1(doc: &Doc, bytes: &[u8]) -> Result<()> {
    let update = Update::decode_v1(bytes)?;
    let mut txn = doc.transact_mut();
    txn.apply_update(update)
        .map_err(|e| SyncError::Encoding(e.to_string()))
}

/// Read a string entry of a map.
pub fn get_string<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key) {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

/// Read and deserialize a JSON record stored under `key`.
///
/// A record that fails to parse is logged and treated as absent.
pub fn get_json<T: DeserializeOwned, R: ReadTxn>(map: &MapRef, txn: &R, key: &str) -> Option<T> {
    let raw = get_string(map, txn, key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Skipping malformed record {key}: {e}");
            None
        }
    }
}

/// Serialize `value` as JSON and store it under `key`.
pub fn put_json<T: Serialize>(map: &MapRef, txn: &mut TransactionMut, key: &str, value: &T) -> Result<()> {
    let json = serde_json::to_string(value)?;
    map.insert(txn, key.to_string(), json);
    Ok(())
}

/// All JSON records of a map, keyed by entry key.
pub fn all_json<T: DeserializeOwned, R: ReadTxn>(map: &MapRef, txn: &R) -> Vec<(String, T)> {
    let keys: Vec<String> = map.keys(txn).map(|k| k.to_string()).collect();
    keys.into_iter()
        .filter_map(|k| get_json(map, txn, &k).map(|v| (k, v)))
        .collect()
}

/// All string items of an array, in order.
pub fn array_strings<T: ReadTxn>(array: &ArrayRef, txn: &T) -> Vec<String> {
    array
        .iter(txn)
        .filter_map(|item| match item {
            Out::Any(Any::String(s)) => Some(s.to_string()),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck_core::SlideRecord;

    #[test]
    fn test_transact_local_returns_update() {
        let doc = ShardDoc::new();
        let (_, update) = doc
            .transact_local(|txn, roots| {
                put_json(&roots.slides, txn, "s1", &SlideRecord::new("s1", "Intro"))
            })
            .unwrap();
        assert!(!update.is_empty());

        let slide: Option<SlideRecord> = doc.read(|txn, roots| get_json(&roots.slides, txn, "s1"));
        assert_eq!(slide.unwrap().title, "Intro");
    }

    #[test]
    fn test_update_converges_on_other_replica() {
        let a = ShardDoc::new();
        let b = ShardDoc::new();

        let (_, update) = a
            .transact_local(|txn, roots| {
                roots.slide_order.push_back(txn, "s1".to_string());
                roots.slide_order.push_back(txn, "s2".to_string());
                Ok(())
            })
            .unwrap();
        b.apply_update(&update).unwrap();

        let order = b.read(|txn, roots| array_strings(&roots.slide_order, txn));
        assert_eq!(order, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn test_encode_diff_against_state_vector() {
        let a = ShardDoc::new();
        let b = ShardDoc::new();

        a.transact_local(|txn, roots| {
            roots.meta.insert(txn, "name", "Deck".to_string());
            Ok(())
        })
        .unwrap();

        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_update(&diff).unwrap();
        let name = b.read(|txn, roots| get_string(&roots.meta, txn, "name"));
        assert_eq!(name.as_deref(), Some("Deck"));
    }

    #[test]
    fn test_sink_sees_changes_in_commit_order() {
        let a = ShardDoc::new();
        let b = ShardDoc::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_sink(tx);

        let (_, remote) = a
            .transact_local(|txn, roots| {
                roots.meta.insert(txn, "name", "Deck".to_string());
                Ok(())
            })
            .unwrap();
        b.apply_update(&remote).unwrap();
        let (_, local) = b
            .transact_local(|txn, roots| {
                roots.meta.insert(txn, "name", "Renamed".to_string());
                Ok(())
            })
            .unwrap();
        // Validation-only transaction emits nothing
        b.transact_local(|_, _| Ok(())).unwrap();

        assert_eq!(rx.try_recv().unwrap(), DocChange::Remote(remote));
        assert_eq!(rx.try_recv().unwrap(), DocChange::Local(local));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_apply_garbage_is_encoding_error() {
        let doc = ShardDoc::new();
        let err = doc.apply_update(&[0xFF, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, SyncError::Encoding(_)));
    }

    #[test]
    fn test_malformed_json_is_absent() {
        let doc = ShardDoc::new();
        doc.transact_local(|txn, roots| {
            roots.slides.insert(txn, "s1", "{not json".to_string());
            Ok(())
        })
        .unwrap();
        let slide: Option<SlideRecord> = doc.read(|txn, roots| get_json(&roots.slides, txn, "s1"));
        assert!(slide.is_none());
    }
}
