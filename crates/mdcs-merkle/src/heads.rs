//! The set of current DAG tips of one headstore namespace.
//!
//! Each tip is a key `{namespace}/{cid}` whose value is the tip's height as
//! an unsigned varint.

use crate::error::{MerkleError, Result};
use crate::link::{parse_cid, Cid};
use mdcs_core::encoding::{decode_uvarint, encode_uvarint};
use mdcs_core::keys::HeadStoreKey;
use mdcs_core::store::{Reader, Writer};
use mdcs_core::Context;
use mdcs_core::Result as CoreResult;

#[derive(Clone, Debug)]
pub struct HeadSet<S> {
    store: S,
    namespace: HeadStoreKey,
}

impl<S> HeadSet<S> {
    pub fn new(store: S, namespace: HeadStoreKey) -> Self {
        Self { store, namespace }
    }

    pub fn namespace(&self) -> &HeadStoreKey {
        &self.namespace
    }

    fn key(&self, cid: &Cid) -> Vec<u8> {
        self.namespace.with_cid(&cid.to_string())
    }
}

impl<S: Reader> HeadSet<S> {
    pub fn is_head(&self, cid: &Cid) -> CoreResult<bool> {
        self.store.has(&self.key(cid))
    }

    /// Current tips sorted by CID bytes, with the greatest height among them.
    ///
    /// An empty namespace yields `([], 0)`.
    pub fn list(&self, ctx: &Context) -> Result<(Vec<Cid>, u64)> {
        let prefix = self.namespace.prefix();
        let iter = self
            .store
            .iter_prefix(prefix.as_bytes())
            .map_err(MerkleError::GettingHeads)?;

        let mut heads = Vec::new();
        let mut max_height = 0;
        for item in iter {
            ctx.check()?;
            let (key, value) = item.map_err(MerkleError::GettingHeads)?;
            let key = String::from_utf8_lossy(&key).into_owned();
            let cid = parse_cid(key.trim_start_matches(prefix.as_str()))?;
            let height = decode_uvarint(&value).map_err(|source| MerkleError::DecodingHeight {
                key: key.clone(),
                source,
            })?;
            max_height = max_height.max(height);
            heads.push(cid);
        }
        heads.sort_by(|a, b| a.to_bytes().cmp(&b.to_bytes()));
        Ok((heads, max_height))
    }
}

impl<S: Writer> HeadSet<S> {
    /// Upsert a tip.
    pub fn write(&self, cid: &Cid, height: u64) -> CoreResult<()> {
        self.store.set(&self.key(cid), &encode_uvarint(height))
    }

    /// Remove `old` and add `new` at `height`.
    ///
    /// The two writes are not atomic on their own; callers run them inside a
    /// transaction and discard it if either fails.
    pub fn replace(&self, old: &Cid, new: &Cid, height: u64) -> CoreResult<()> {
        self.store.delete(&self.key(old))?;
        self.write(new, height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::compute_cid;
    use mdcs_core::{CoreError, MemoryRootStore};

    fn heads(store: &MemoryRootStore) -> HeadSet<MemoryRootStore> {
        HeadSet::new(store.clone(), HeadStoreKey::doc("bae-1", "1"))
    }

    #[test]
    fn test_empty_namespace() {
        let store = MemoryRootStore::new();
        let (list, height) = heads(&store).list(&Context::new()).unwrap();
        assert!(list.is_empty());
        assert_eq!(height, 0);
    }

    #[test]
    fn test_write_and_list() {
        let store = MemoryRootStore::new();
        let set = heads(&store);
        let a = compute_cid(b"a").unwrap();
        let b = compute_cid(b"b").unwrap();

        set.write(&a, 3).unwrap();
        set.write(&b, 5).unwrap();
        set.write(&a, 4).unwrap();

        let (list, height) = set.list(&Context::new()).unwrap();
        let mut expected = vec![a, b];
        expected.sort_by_key(|c| c.to_bytes());
        assert_eq!(list, expected);
        assert_eq!(height, 5);
        assert!(set.is_head(&a).unwrap());
    }

    #[test]
    fn test_replace() {
        let store = MemoryRootStore::new();
        let set = heads(&store);
        let a = compute_cid(b"a").unwrap();
        let b = compute_cid(b"b").unwrap();

        set.write(&a, 1).unwrap();
        set.replace(&a, &b, 2).unwrap();
        assert!(!set.is_head(&a).unwrap());
        assert_eq!(set.list(&Context::new()).unwrap(), (vec![b], 2));
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let store = MemoryRootStore::new();
        let field = heads(&store);
        let other = HeadSet::new(store.clone(), HeadStoreKey::doc("bae-1", "10"));
        other.write(&compute_cid(b"x").unwrap(), 7).unwrap();

        assert!(field.list(&Context::new()).unwrap().0.is_empty());
    }

    #[test]
    fn test_corrupt_height() {
        let store = MemoryRootStore::new();
        let set = heads(&store);
        let a = compute_cid(b"a").unwrap();
        store
            .set(&HeadStoreKey::doc("bae-1", "1").with_cid(&a.to_string()), &[0x80])
            .unwrap();

        let err = set.list(&Context::new()).unwrap_err();
        assert!(matches!(err, MerkleError::DecodingHeight { .. }));
    }

    #[test]
    fn test_list_checks_cancellation() {
        let store = MemoryRootStore::new();
        let set = heads(&store);
        set.write(&compute_cid(b"a").unwrap(), 1).unwrap();

        let ctx = Context::new();
        ctx.cancel();
        assert!(matches!(set.list(&ctx), Err(MerkleError::Core(CoreError::Cancelled))));
    }
}
