use std::collections::{HashMap, HashSet};

use crate::core::hash::Hash;
use crate::crypto::multiset::Multiset;
use crate::storage::{Bucket, DbTransaction, Storage, StorageError};

/// Multiset of each block's past UTXO, keyed by block hash.
#[derive(Debug, Default)]
pub struct MultisetStore {
    loaded: HashMap<Hash, Multiset>,
    new_entries: HashSet<Hash>,
}

impl MultisetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(storage: &Storage) -> Result<Self, StorageError> {
        let mut loaded = HashMap::new();
        for (key, value) in storage.scan(Bucket::Multisets)? {
            let hash = Hash::from_slice(&key)
                .ok_or_else(|| StorageError::SerializeError("bad multiset key".into()))?;
            let ms = Multiset::deserialize(&value).map_err(|e| StorageError::SerializeError(e.to_string()))?;
            loaded.insert(hash, ms);
        }
        Ok(MultisetStore { loaded, new_entries: HashSet::new() })
    }

    pub fn get(&self, hash: &Hash) -> Option<Multiset> {
        self.loaded.get(hash).copied()
    }

    pub fn set(&mut self, hash: Hash, ms: Multiset) {
        self.loaded.insert(hash, ms);
        self.new_entries.insert(hash);
    }

    pub fn flush(&mut self, tx: &mut DbTransaction) {
        for hash in self.new_entries.drain() {
            if let Some(ms) = self.loaded.get(&hash) {
                tx.put(Bucket::Multisets, &hash.0, ms.serialize().to_vec());
            }
        }
    }

    pub fn clear_dirty(&mut self) {
        self.new_entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiset_store_persists() {
        let storage = Storage::temporary().unwrap();
        let mut store = MultisetStore::new();
        let mut ms = Multiset::new();
        ms.add_element(b"utxo");
        store.set(Hash([1; 32]), ms);
        store.set(Hash([2; 32]), Multiset::new());

        let mut tx = storage.begin();
        store.flush(&mut tx);
        storage.commit(tx).unwrap();

        let reloaded = MultisetStore::load(&storage).unwrap();
        assert_eq!(reloaded.get(&Hash([1; 32])), Some(ms));
        assert_eq!(reloaded.get(&Hash([2; 32])), Some(Multiset::new()));
        assert_eq!(reloaded.get(&Hash([3; 32])), None);
    }
}
