//! Key-value store contract and an in-memory transactional implementation.
//!
//! The replication core only ever talks to storage through [`Reader`] and
//! [`Writer`]. Everything that needs atomicity across several stores (block
//! write + key write + head updates) runs inside a [`Txn`], which hands out
//! one [`Namespaced`] view per logical store.

use crate::error::{CoreError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A single `(key, value)` pair yielded by a prefix scan.
pub type KeyValue = (Vec<u8>, Vec<u8>);

/// Cursor over a prefix scan, in byte-lexicographic key order.
///
/// Dropping the iterator releases it, on every exit path.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KeyValue>> + 'a>;

/// Read half of the store contract.
pub trait Reader {
    /// Get the value stored under `key`, or `CoreError::NotFound`.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    /// Check whether `key` holds a value.
    fn has(&self, key: &[u8]) -> Result<bool>;

    /// Scan every key starting with `prefix`.
    fn iter_prefix(&self, prefix: &[u8]) -> Result<KvIter<'_>>;
}

/// Write half of the store contract.
pub trait Writer {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Remove `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<()>;
}

/// Convenience bound for stores that can both read and write.
pub trait ReaderWriter: Reader + Writer {}

impl<T: Reader + Writer + ?Sized> ReaderWriter for T {}

impl<T: Reader + ?Sized> Reader for &T {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        (**self).get(key)
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        (**self).has(key)
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<KvIter<'_>> {
        (**self).iter_prefix(prefix)
    }
}

impl<T: Writer + ?Sized> Writer for &T {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        (**self).delete(key)
    }
}

impl<T: Reader + ?Sized> Reader for Arc<T> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        (**self).get(key)
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        (**self).has(key)
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<KvIter<'_>> {
        (**self).iter_prefix(prefix)
    }
}

impl<T: Writer + ?Sized> Writer for Arc<T> {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        (**self).set(key, value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        (**self).delete(key)
    }
}

/// A view over another store where every key lives under a fixed prefix.
#[derive(Clone, Debug)]
pub struct Namespaced<S> {
    inner: S,
    prefix: Vec<u8>,
}

impl<S> Namespaced<S> {
    pub fn new(inner: S, prefix: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.prefix.len() + key.len());
        full.extend_from_slice(&self.prefix);
        full.extend_from_slice(key);
        full
    }
}

impl<S: Clone> Namespaced<S> {
    /// Nest a further prefix below this namespace.
    pub fn child(&self, sub: &[u8]) -> Namespaced<S> {
        Namespaced {
            inner: self.inner.clone(),
            prefix: self.full_key(sub),
        }
    }
}

impl<S: Reader> Reader for Namespaced<S> {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.inner.get(&self.full_key(key))
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        self.inner.has(&self.full_key(key))
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<KvIter<'_>> {
        let strip = self.prefix.len();
        let iter = self.inner.iter_prefix(&self.full_key(prefix))?;
        Ok(Box::new(iter.map(move |item| {
            item.map(|(key, value)| (key[strip..].to_vec(), value))
        })))
    }
}

impl<S: Writer> Writer for Namespaced<S> {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.set(&self.full_key(key), value)
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(&self.full_key(key))
    }
}

/// Prefixes of the logical stores carved out of one root store.
pub const DATASTORE_PREFIX: &[u8] = b"/data";
pub const HEADSTORE_PREFIX: &[u8] = b"/heads";
pub const BLOCKSTORE_PREFIX: &[u8] = b"/blocks";
pub const ENCSTORE_PREFIX: &[u8] = b"/enc";

#[derive(Clone, Debug)]
struct VersionedValue {
    /// `None` is a tombstone kept so that deletes participate in conflict detection.
    value: Option<Vec<u8>>,
    version: u64,
}

#[derive(Debug, Default)]
struct RootState {
    entries: BTreeMap<Vec<u8>, VersionedValue>,
    version: u64,
}

impl RootState {
    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn live(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.entries.get(key).and_then(|v| v.value.as_ref())
    }

    fn scan(&self, prefix: &[u8]) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter_map(|(k, v)| v.value.as_ref().map(|value| (k.clone(), value.clone())))
            .collect()
    }
}

/// In-memory root store with per-key versions.
///
/// Clones share the same underlying map. Direct writes are visible
/// immediately; writes through a [`Txn`] become visible on commit.
#[derive(Clone, Debug, Default)]
pub struct MemoryRootStore {
    state: Arc<RwLock<RootState>>,
    next_txn_id: Arc<AtomicU64>,
}

impl MemoryRootStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new optimistic transaction over this store.
    pub fn new_txn(&self) -> Txn {
        let start_version = self.state.read().version;
        Txn {
            id: self.next_txn_id.fetch_add(1, Ordering::SeqCst) + 1,
            root: self.clone(),
            start_version,
            state: Arc::new(Mutex::new(TxnState::default())),
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.state
            .read()
            .entries
            .values()
            .filter(|v| v.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Reader for MemoryRootStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.state
            .read()
            .live(key)
            .cloned()
            .ok_or_else(|| CoreError::not_found(key))
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.state.read().live(key).is_some())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<KvIter<'_>> {
        let snapshot = self.state.read().scan(prefix);
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}

impl Writer for MemoryRootStore {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let version = state.bump();
        state.entries.insert(
            key.to_vec(),
            VersionedValue {
                value: Some(value.to_vec()),
                version,
            },
        );
        Ok(())
    }

    /// Deletes leave a versioned tombstone rather than removing the entry, so
    /// a transaction that read the key before the delete still sees a newer
    /// version at commit and fails with `TxnConflict`. Tombstones are never
    /// reclaimed.
    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let version = state.bump();
        state
            .entries
            .insert(key.to_vec(), VersionedValue { value: None, version });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TxnState {
    /// Pending writes; `None` marks a pending delete.
    pending: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    reads: BTreeSet<Vec<u8>>,
    finished: bool,
}

/// An optimistic transaction over a [`MemoryRootStore`].
///
/// Reads see the transaction's own pending writes on top of the root.
/// [`Txn::commit`] fails with `TxnConflict` if any key this transaction read
/// or wrote was changed in the root after the transaction began.
#[derive(Clone, Debug)]
pub struct Txn {
    id: u64,
    root: MemoryRootStore,
    start_version: u64,
    state: Arc<Mutex<TxnState>>,
}

impl Txn {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn root(&self) -> &MemoryRootStore {
        &self.root
    }

    pub fn datastore(&self) -> Namespaced<Txn> {
        Namespaced::new(self.clone(), DATASTORE_PREFIX)
    }

    pub fn headstore(&self) -> Namespaced<Txn> {
        Namespaced::new(self.clone(), HEADSTORE_PREFIX)
    }

    pub fn blockstore(&self) -> Namespaced<Txn> {
        Namespaced::new(self.clone(), BLOCKSTORE_PREFIX)
    }

    pub fn encstore(&self) -> Namespaced<Txn> {
        Namespaced::new(self.clone(), ENCSTORE_PREFIX)
    }

    /// Apply every pending write to the root atomically.
    pub fn commit(&self) -> Result<()> {
        let mut txn = self.state.lock();
        if txn.finished {
            return Err(CoreError::TxnFinished);
        }

        let mut root = self.root.state.write();
        let conflict = txn
            .reads
            .iter()
            .chain(txn.pending.keys())
            .find(|key| {
                root.entries
                    .get(*key)
                    .is_some_and(|entry| entry.version > self.start_version)
            })
            .map(|key| String::from_utf8_lossy(key).into_owned());
        if let Some(key) = conflict {
            txn.finished = true;
            return Err(CoreError::TxnConflict { key });
        }

        let version = root.bump();
        for (key, value) in std::mem::take(&mut txn.pending) {
            root.entries.insert(key, VersionedValue { value, version });
        }
        txn.finished = true;
        tracing::trace!(txn = self.id, version, "transaction committed");
        Ok(())
    }

    /// Drop every pending write.
    pub fn discard(&self) {
        let mut txn = self.state.lock();
        txn.pending.clear();
        txn.finished = true;
    }

    fn ensure_open(state: &TxnState) -> Result<()> {
        if state.finished {
            Err(CoreError::TxnFinished)
        } else {
            Ok(())
        }
    }
}

impl Reader for Txn {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut txn = self.state.lock();
        Self::ensure_open(&txn)?;
        if let Some(pending) = txn.pending.get(key) {
            return pending.clone().ok_or_else(|| CoreError::not_found(key));
        }
        txn.reads.insert(key.to_vec());
        self.root.get(key)
    }

    fn has(&self, key: &[u8]) -> Result<bool> {
        let mut txn = self.state.lock();
        Self::ensure_open(&txn)?;
        if let Some(pending) = txn.pending.get(key) {
            return Ok(pending.is_some());
        }
        txn.reads.insert(key.to_vec());
        self.root.has(key)
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<KvIter<'_>> {
        let mut txn = self.state.lock();
        Self::ensure_open(&txn)?;
        let mut merged = self.root.state.read().scan(prefix);
        for (key, value) in txn
            .pending
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match value {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        txn.reads.extend(merged.keys().cloned());
        Ok(Box::new(merged.into_iter().map(Ok)))
    }
}

impl Writer for Txn {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut txn = self.state.lock();
        Self::ensure_open(&txn)?;
        txn.pending.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut txn = self.state.lock();
        Self::ensure_open(&txn)?;
        txn.pending.insert(key.to_vec(), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_get_set_delete() {
        let store = MemoryRootStore::new();
        store.set(b"a", b"1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), b"1");
        assert!(store.has(b"a").unwrap());

        store.delete(b"a").unwrap();
        assert!(!store.has(b"a").unwrap());
        assert!(store.get(b"a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_prefix_scan_is_ordered() {
        let store = MemoryRootStore::new();
        store.set(b"/p/c", b"3").unwrap();
        store.set(b"/p/a", b"1").unwrap();
        store.set(b"/q/z", b"9").unwrap();
        store.set(b"/p/b", b"2").unwrap();

        let keys: Vec<_> = store
            .iter_prefix(b"/p/")
            .unwrap()
            .map(|kv| kv.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"/p/a".to_vec(), b"/p/b".to_vec(), b"/p/c".to_vec()]);
    }

    #[test]
    fn test_namespaced_strips_prefix() {
        let store = MemoryRootStore::new();
        let heads = Namespaced::new(store.clone(), b"/heads".to_vec());
        heads.set(b"/doc/1", b"x").unwrap();

        assert!(store.has(b"/heads/doc/1").unwrap());
        let keys: Vec<_> = heads
            .iter_prefix(b"/doc")
            .unwrap()
            .map(|kv| kv.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"/doc/1".to_vec()]);
    }

    #[test]
    fn test_txn_isolation_until_commit() {
        let root = MemoryRootStore::new();
        let txn = root.new_txn();
        txn.set(b"k", b"v").unwrap();

        assert_eq!(txn.get(b"k").unwrap(), b"v");
        assert!(!root.has(b"k").unwrap());

        txn.commit().unwrap();
        assert_eq!(root.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_txn_discard_drops_writes() {
        let root = MemoryRootStore::new();
        let txn = root.new_txn();
        txn.set(b"k", b"v").unwrap();
        txn.discard();

        assert!(!root.has(b"k").unwrap());
        assert_eq!(txn.get(b"k"), Err(CoreError::TxnFinished));
    }

    #[test]
    fn test_txn_pending_delete_hides_root_value() {
        let root = MemoryRootStore::new();
        root.set(b"/p/a", b"1").unwrap();
        root.set(b"/p/b", b"2").unwrap();

        let txn = root.new_txn();
        txn.delete(b"/p/a").unwrap();
        txn.set(b"/p/c", b"3").unwrap();

        let keys: Vec<_> = txn
            .iter_prefix(b"/p/")
            .unwrap()
            .map(|kv| kv.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"/p/b".to_vec(), b"/p/c".to_vec()]);
    }

    #[test]
    fn test_concurrent_txns_conflict() {
        let root = MemoryRootStore::new();
        root.set(b"head", b"0").unwrap();

        let a = root.new_txn();
        let b = root.new_txn();
        assert!(a.has(b"head").unwrap());
        assert!(b.has(b"head").unwrap());

        a.delete(b"head").unwrap();
        a.set(b"head-a", b"1").unwrap();
        b.delete(b"head").unwrap();
        b.set(b"head-b", b"1").unwrap();

        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(CoreError::TxnConflict { .. })));
        assert!(root.has(b"head-a").unwrap());
        assert!(!root.has(b"head-b").unwrap());
    }

    #[test]
    fn test_delete_after_read_conflicts() {
        let root = MemoryRootStore::new();
        root.set(b"head", b"0").unwrap();

        let txn = root.new_txn();
        assert_eq!(txn.get(b"head").unwrap(), b"0".to_vec());
        root.delete(b"head").unwrap();
        txn.set(b"head-next", b"1").unwrap();

        assert!(matches!(txn.commit(), Err(CoreError::TxnConflict { .. })));
        assert!(!root.has(b"head").unwrap());
        assert!(!root.has(b"head-next").unwrap());
    }

    #[test]
    fn test_disjoint_txns_both_commit() {
        let root = MemoryRootStore::new();
        let a = root.new_txn();
        let b = root.new_txn();
        a.set(b"doc-a", b"1").unwrap();
        b.set(b"doc-b", b"1").unwrap();

        a.commit().unwrap();
        b.commit().unwrap();
        assert_eq!(root.len(), 2);
    }
}
