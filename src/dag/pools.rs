//! Blocks waiting outside the DAG: orphans (missing parents) and delayed
//! blocks (timestamp too far in the future).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::core::hash::Hash;
use crate::core::params::{MAX_ORPHAN_BLOCKS, ORPHAN_EXPIRATION_MS};
use crate::core::types::Block;

// ─── Orphans ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct OrphanBlock {
    block: Arc<Block>,
    expiration: i64,
}

#[derive(Debug, Default)]
pub struct OrphanPool {
    orphans: HashMap<Hash, OrphanBlock>,
    /// parent hash → orphans naming it as a parent
    prev_orphans: HashMap<Hash, Vec<Hash>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.orphans.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.orphans.get(hash).map(|o| o.block.clone())
    }

    /// Orphans that name `parent` among their parents.
    pub fn children_of(&self, parent: &Hash) -> Vec<Hash> {
        self.prev_orphans.get(parent).cloned().unwrap_or_default()
    }

    /// Add an orphan, first dropping expired ones. When the pool is full the
    /// newest orphan (by timestamp) goes, unless the new block is newer still,
    /// in which case it is not added. Returns whether it was added.
    pub fn add(&mut self, block: Arc<Block>, now_ms: i64) -> bool {
        let expired: Vec<Hash> = self.orphans.iter().filter(|(_, o)| now_ms > o.expiration).map(|(h, _)| *h).collect();
        for hash in expired {
            tracing::debug!("🗑️ Orphan {} expired", hash.short());
            self.remove(&hash);
        }

        if self.orphans.len() + 1 > MAX_ORPHAN_BLOCKS {
            let newest = self
                .orphans
                .iter()
                .max_by_key(|(hash, o)| (o.block.header.timestamp, **hash))
                .map(|(hash, o)| (*hash, o.block.header.timestamp));
            if let Some((newest_hash, newest_ts)) = newest {
                if block.header.timestamp > newest_ts {
                    return false;
                }
                self.remove(&newest_hash);
            }
        }

        let hash = block.hash();
        for parent in &block.header.parent_hashes {
            let waiting = self.prev_orphans.entry(*parent).or_default();
            if !waiting.contains(&hash) {
                waiting.push(hash);
            }
        }
        self.orphans.insert(hash, OrphanBlock { block, expiration: now_ms + ORPHAN_EXPIRATION_MS });
        true
    }

    pub fn remove(&mut self, hash: &Hash) -> Option<Arc<Block>> {
        let orphan = self.orphans.remove(hash)?;
        for parent in &orphan.block.header.parent_hashes {
            if let Some(waiting) = self.prev_orphans.get_mut(parent) {
                waiting.retain(|h| h != hash);
                if waiting.is_empty() {
                    self.prev_orphans.remove(parent);
                }
            }
        }
        Some(orphan.block)
    }

    /// The first missing ancestor reached by following orphan parents.
    pub fn orphan_root(&self, hash: &Hash) -> Hash {
        let mut root = *hash;
        let mut visited = HashSet::new();
        let mut current = *hash;
        while let Some(orphan) = self.orphans.get(&current) {
            if !visited.insert(current) {
                break;
            }
            root = current;
            match orphan.block.header.parent_hashes.iter().find(|p| self.orphans.contains_key(p)) {
                Some(parent) => current = *parent,
                None => {
                    // all parents outside the pool; the first one is the missing link
                    if let Some(parent) = orphan.block.header.parent_hashes.first() {
                        root = *parent;
                    }
                    break;
                }
            }
        }
        root
    }
}

// ─── Delayed ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DelayedPool {
    blocks: HashMap<Hash, (Arc<Block>, i64)>,
    queue: BinaryHeap<Reverse<(i64, Hash)>>,
}

impl DelayedPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// When a delayed block becomes processable, in ms.
    pub fn process_time(&self, hash: &Hash) -> Option<i64> {
        self.blocks.get(hash).map(|(_, t)| *t)
    }

    pub fn add(&mut self, block: Arc<Block>, process_time: i64) {
        let hash = block.hash();
        self.queue.push(Reverse((process_time, hash)));
        self.blocks.insert(hash, (block, process_time));
    }

    /// Pop the earliest block whose process time has come.
    pub fn pop_due(&mut self, now_ms: i64) -> Option<Arc<Block>> {
        while let Some(Reverse((time, hash))) = self.queue.peek().copied() {
            if time > now_ms {
                return None;
            }
            self.queue.pop();
            if let Some((block, _)) = self.blocks.remove(&hash) {
                return Some(block);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{BlockHeader, Transaction};

    fn block(parents: Vec<Hash>, timestamp: i64, nonce: u64) -> Arc<Block> {
        Arc::new(Block {
            header: BlockHeader {
                version: 1,
                parent_hashes: parents,
                hash_merkle_root: Hash::ZERO,
                accepted_id_merkle_root: Hash::ZERO,
                utxo_commitment: Hash::ZERO,
                timestamp,
                bits: 0x207fffff,
                nonce,
            },
            transactions: vec![Transaction::new_coinbase(vec![], vec![])],
        })
    }

    #[test]
    fn test_orphans_indexed_by_parent() {
        let mut pool = OrphanPool::new();
        let missing = Hash([9; 32]);
        let a = block(vec![missing], 10, 0);
        let b = block(vec![a.hash()], 11, 0);
        assert!(pool.add(a.clone(), 0));
        assert!(pool.add(b.clone(), 0));
        assert_eq!(pool.children_of(&missing), vec![a.hash()]);
        assert_eq!(pool.orphan_root(&b.hash()), missing);

        pool.remove(&a.hash());
        assert!(pool.children_of(&missing).is_empty());
        assert!(!pool.contains(&a.hash()));
        assert!(pool.contains(&b.hash()));
    }

    #[test]
    fn test_orphans_expire() {
        let mut pool = OrphanPool::new();
        let old = block(vec![Hash([1; 32])], 10, 0);
        pool.add(old.clone(), 0);
        pool.add(block(vec![Hash([1; 32])], 10, 1), ORPHAN_EXPIRATION_MS + 1);
        assert!(!pool.contains(&old.hash()));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_full_pool_evicts_newest() {
        let mut pool = OrphanPool::new();
        for i in 0..MAX_ORPHAN_BLOCKS as u64 {
            assert!(pool.add(block(vec![Hash([1; 32])], 100 + i as i64, i), 0));
        }
        let newest = block(vec![Hash([1; 32])], 100 + MAX_ORPHAN_BLOCKS as i64 - 1, MAX_ORPHAN_BLOCKS as u64 - 1);

        // newer than everything in the pool: rejected
        assert!(!pool.add(block(vec![Hash([1; 32])], 10_000, 999), 0));
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);

        // older: the newest orphan makes room
        assert!(pool.add(block(vec![Hash([1; 32])], 1, 1_000), 0));
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);
        assert!(!pool.contains(&newest.hash()));
    }

    #[test]
    fn test_delayed_pops_in_time_order() {
        let mut pool = DelayedPool::new();
        let late = block(vec![], 0, 1);
        let early = block(vec![], 0, 2);
        pool.add(late.clone(), 200);
        pool.add(early.clone(), 100);
        assert_eq!(pool.process_time(&late.hash()), Some(200));
        assert!(pool.pop_due(50).is_none());
        assert_eq!(pool.pop_due(150).map(|b| b.hash()), Some(early.hash()));
        assert!(pool.pop_due(150).is_none());
        assert_eq!(pool.pop_due(250).map(|b| b.hash()), Some(late.hash()));
        assert!(pool.is_empty());
    }
}
