//! Per-block UTXO diffs and the restore walk.
//!
//! `diff(X)` applied to the UTXO set of X's diff child (or to the virtual
//! block's full set when X has none) yields X's past UTXO. Restoring X stacks
//! the diffs along the diff-child pointers and composes them top down.

use std::collections::{HashMap, HashSet};

use super::{DiffUtxoSet, FullUtxoSet, UtxoDiff};
use crate::core::codec::{CodecError, Decodable, Encodable, Reader};
use crate::core::hash::Hash;
use crate::error::DagError;
use crate::storage::{Bucket, DbTransaction, Storage, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUtxoDiffData {
    pub diff: UtxoDiff,
    pub diff_child: Option<Hash>,
}

/// has_diff_child(bool) || [child hash] || diff
impl Encodable for BlockUtxoDiffData {
    fn encode(&self, buf: &mut Vec<u8>) {
        match &self.diff_child {
            Some(child) => {
                buf.push(1);
                buf.extend_from_slice(&child.0);
            }
            None => buf.push(0),
        }
        self.diff.encode(buf);
    }
}

impl Decodable for BlockUtxoDiffData {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let diff_child = if r.read_bool()? { Some(r.read_hash()?) } else { None };
        let diff = UtxoDiff::decode(r)?;
        Ok(BlockUtxoDiffData { diff, diff_child })
    }
}

#[derive(Debug, Default)]
pub struct UtxoDiffStore {
    loaded: HashMap<Hash, BlockUtxoDiffData>,
    dirty: HashSet<Hash>,
}

impl UtxoDiffStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every stored diff.
    pub fn load(storage: &Storage) -> Result<Self, StorageError> {
        let mut loaded = HashMap::new();
        for (key, value) in storage.scan(Bucket::UtxoDiffs)? {
            let hash = Hash::from_slice(&key)
                .ok_or_else(|| StorageError::SerializeError("bad utxo-diff key".into()))?;
            loaded.insert(hash, BlockUtxoDiffData::from_bytes(&value)?);
        }
        Ok(UtxoDiffStore { loaded, dirty: HashSet::new() })
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.loaded.contains_key(hash)
    }

    pub fn diff_data(&self, hash: &Hash) -> Option<&BlockUtxoDiffData> {
        self.loaded.get(hash)
    }

    pub fn diff_child(&self, hash: &Hash) -> Option<Hash> {
        self.loaded.get(hash).and_then(|d| d.diff_child)
    }

    pub fn set_block_diff(&mut self, hash: Hash, diff: UtxoDiff) {
        self.loaded.entry(hash).or_default().diff = diff;
        self.dirty.insert(hash);
    }

    pub fn set_block_diff_child(&mut self, hash: Hash, child: Hash) {
        self.loaded.entry(hash).or_default().diff_child = Some(child);
        self.dirty.insert(hash);
    }

    /// The UTXO set `hash` was accepted against, as a layer over `virtual_utxo`.
    pub fn restore_utxo<'a>(&self, hash: &Hash, virtual_utxo: &'a FullUtxoSet) -> Result<DiffUtxoSet<'a>, DagError> {
        let mut stack: Vec<&UtxoDiff> = Vec::new();
        let mut current = Some(*hash);
        while let Some(h) = current {
            let data = self
                .loaded
                .get(&h)
                .ok_or_else(|| DagError::Assert(format!("no utxo diff data for block {h}")))?;
            stack.push(&data.diff);
            current = data.diff_child;
        }

        let mut composed = UtxoDiff::new();
        for diff in stack.iter().rev() {
            composed = composed.with_diff(diff)?;
        }
        Ok(DiffUtxoSet::new(virtual_utxo, composed))
    }

    pub fn flush(&mut self, tx: &mut DbTransaction) {
        for hash in self.dirty.drain() {
            if let Some(data) = self.loaded.get(&hash) {
                tx.put(Bucket::UtxoDiffs, &hash.0, data.to_bytes());
            }
        }
    }

    /// Forget unflushed changes; used when a commit is abandoned.
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::OutPoint;
    use crate::utxo::{UtxoEntry, UtxoSet};

    fn op(n: u8) -> OutPoint {
        OutPoint::new(Hash([n; 32]), 0)
    }

    fn entry(n: u64) -> UtxoEntry {
        UtxoEntry::new(n, vec![], 0, false)
    }

    #[test]
    fn test_diff_data_layout() {
        let mut data = BlockUtxoDiffData::default();
        assert_eq!(data.to_bytes(), vec![0, 0, 0]);
        data.diff_child = Some(Hash([7; 32]));
        data.diff.to_add.insert(op(1), entry(5));
        let bytes = data.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..33], &[7; 32]);
        assert_eq!(BlockUtxoDiffData::from_bytes(&bytes).unwrap(), data);
    }

    #[test]
    fn test_restore_walks_diff_children() {
        // virtual: {1, 2}; child C: virtual minus 2; block B: C plus 3
        let mut virtual_utxo = FullUtxoSet::new();
        virtual_utxo.insert(op(1), entry(1));
        virtual_utxo.insert(op(2), entry(2));

        let child = Hash([0xc; 32]);
        let block = Hash([0xb; 32]);

        let mut store = UtxoDiffStore::new();
        let mut child_diff = UtxoDiff::new();
        child_diff.remove_entry(op(2), entry(2)).unwrap();
        store.set_block_diff(child, child_diff);

        let mut block_diff = UtxoDiff::new();
        block_diff.add_entry(op(3), entry(3)).unwrap();
        store.set_block_diff(block, block_diff);
        store.set_block_diff_child(block, child);

        let restored = store.restore_utxo(&block, &virtual_utxo).unwrap();
        assert!(restored.contains(&op(1)));
        assert!(!restored.contains(&op(2)));
        assert!(restored.contains(&op(3)));

        assert!(store.restore_utxo(&Hash([0xee; 32]), &virtual_utxo).is_err());
    }

    #[test]
    fn test_flush_writes_dirty_once() {
        let storage = Storage::temporary().unwrap();
        let mut store = UtxoDiffStore::new();
        store.set_block_diff(Hash([1; 32]), UtxoDiff::new());
        store.set_block_diff_child(Hash([1; 32]), Hash([2; 32]));

        let mut tx = storage.begin();
        store.flush(&mut tx);
        assert_eq!(tx.len(), 1);
        storage.commit(tx).unwrap();

        let mut tx = storage.begin();
        store.flush(&mut tx);
        assert!(tx.is_empty());

        let reloaded = UtxoDiffStore::load(&storage).unwrap();
        assert_eq!(reloaded.diff_child(&Hash([1; 32])), Some(Hash([2; 32])));
    }
}
