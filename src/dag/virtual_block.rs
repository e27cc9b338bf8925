use std::collections::HashSet;

use super::block_index::BlockIndex;
use super::block_node::GhostdagData;
use super::ghostdag;
use super::reachability::ReachabilityTree;
use crate::core::hash::Hash;
use crate::error::DagError;

/// Blocks that left and joined the selected-parent chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainUpdates {
    /// From the old selected tip down to (excluding) the fork point.
    pub removed: Vec<Hash>,
    /// From just above the fork point up to the new selected tip.
    pub added: Vec<Hash>,
}

/// The synthetic block whose parents are the DAG tips.
#[derive(Debug, Default)]
pub struct VirtualBlock {
    tips: Vec<Hash>,
    ghostdag: GhostdagData,
    chain_set: HashSet<Hash>,
    /// Genesis first.
    chain: Vec<Hash>,
}

impl VirtualBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current tips, sorted.
    pub fn tips(&self) -> &[Hash] {
        &self.tips
    }

    pub fn ghostdag(&self) -> &GhostdagData {
        &self.ghostdag
    }

    pub fn selected_parent(&self) -> Option<Hash> {
        self.ghostdag.selected_parent
    }

    pub fn blue_score(&self) -> u64 {
        self.ghostdag.blue_score
    }

    pub fn chain_contains(&self, hash: &Hash) -> bool {
        self.chain_set.contains(hash)
    }

    pub fn selected_parent_chain(&self) -> &[Hash] {
        &self.chain
    }

    /// Replace the tips wholesale and recompute everything derived from them.
    pub fn set_tips(
        &mut self,
        index: &BlockIndex,
        reachability: &ReachabilityTree,
        k: u8,
        mut tips: Vec<Hash>,
    ) -> Result<ChainUpdates, DagError> {
        tips.sort();
        tips.dedup();
        let (data, _) = ghostdag::ghostdag(index, reachability, k, &tips)?;
        self.tips = tips;
        self.ghostdag = data;
        match self.ghostdag.selected_parent {
            Some(sp) => self.update_selected_parent_chain(index, sp),
            None => Ok(ChainUpdates::default()),
        }
    }

    /// `node` becomes a tip and its parents stop being tips.
    pub fn add_tip(
        &mut self,
        index: &BlockIndex,
        reachability: &ReachabilityTree,
        k: u8,
        node: &Hash,
    ) -> Result<ChainUpdates, DagError> {
        let parents = index.lookup(node).ok_or(DagError::UnknownBlock(*node))?.parents().to_vec();
        let mut tips: Vec<Hash> = self.tips.iter().copied().filter(|t| !parents.contains(t)).collect();
        tips.push(*node);
        self.set_tips(index, reachability, k, tips)
    }

    fn update_selected_parent_chain(&mut self, index: &BlockIndex, new_selected: Hash) -> Result<ChainUpdates, DagError> {
        let mut added = Vec::new();
        let mut current = Some(new_selected);
        while let Some(hash) = current {
            if self.chain_set.contains(&hash) {
                break;
            }
            added.push(hash);
            current = index.lookup(&hash).ok_or(DagError::UnknownBlock(hash))?.selected_parent();
        }

        let keep = match current {
            Some(fork) => {
                self.chain
                    .iter()
                    .rposition(|h| *h == fork)
                    .ok_or_else(|| DagError::Assert("chain set and chain slice disagree".into()))?
                    + 1
            }
            None => 0,
        };

        let removed: Vec<Hash> = self.chain.drain(keep..).rev().collect();
        for hash in &removed {
            self.chain_set.remove(hash);
        }
        added.reverse();
        for hash in &added {
            self.chain_set.insert(*hash);
            self.chain.push(*hash);
        }
        Ok(ChainUpdates { removed, added })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BlockHeader;
    use crate::dag::block_node::BlockNode;

    fn h(n: u8) -> Hash {
        Hash([n; 32])
    }

    struct Fixture {
        index: BlockIndex,
        reachability: ReachabilityTree,
    }

    impl Fixture {
        fn new() -> Self {
            let mut f = Fixture { index: BlockIndex::new(), reachability: ReachabilityTree::new() };
            f.insert(h(0), &[], GhostdagData::default());
            f.reachability.add_genesis(h(0)).unwrap();
            f
        }

        fn insert(&mut self, hash: Hash, parents: &[Hash], data: GhostdagData) {
            let header = BlockHeader {
                version: 1,
                parent_hashes: parents.to_vec(),
                hash_merkle_root: Hash::ZERO,
                accepted_id_merkle_root: Hash::ZERO,
                utxo_commitment: Hash::ZERO,
                timestamp: 0,
                bits: 0,
                nonce: 0,
            };
            let mut node = BlockNode::new(header, data, 0);
            node.hash = hash;
            self.index.add(node);
        }

        fn add(&mut self, hash: Hash, parents: &[Hash]) {
            let (data, anticone) = ghostdag::ghostdag(&self.index, &self.reachability, 3, parents).unwrap();
            let sp = data.selected_parent.unwrap();
            self.insert(hash, parents, data);
            self.reachability.add_block(hash, sp, &anticone).unwrap();
        }
    }

    #[test]
    fn test_chain_follows_heaviest_tip() {
        let mut f = Fixture::new();
        let mut v = VirtualBlock::new();
        let updates = v.set_tips(&f.index, &f.reachability, 3, vec![h(0)]).unwrap();
        assert_eq!(updates.added, vec![h(0)]);

        f.add(h(1), &[h(0)]);
        let updates = v.add_tip(&f.index, &f.reachability, 3, &h(1)).unwrap();
        assert_eq!(updates, ChainUpdates { removed: vec![], added: vec![h(1)] });
        assert_eq!(v.tips(), &[h(1)]);

        // a side branch that overtakes
        f.add(h(2), &[h(0)]);
        let updates = v.add_tip(&f.index, &f.reachability, 3, &h(2)).unwrap();
        // equal scores: smaller hash stays selected
        assert!(updates.added.is_empty());
        assert_eq!(v.tips(), &[h(1), h(2)]);

        f.add(h(3), &[h(2)]);
        let updates = v.add_tip(&f.index, &f.reachability, 3, &h(3)).unwrap();
        assert_eq!(updates.removed, vec![h(1)]);
        assert_eq!(updates.added, vec![h(2), h(3)]);
        assert_eq!(v.selected_parent_chain(), &[h(0), h(2), h(3)]);
        assert!(v.chain_contains(&h(2)));
        assert!(!v.chain_contains(&h(1)));
    }

    #[test]
    fn test_virtual_blue_score_counts_tips() {
        let mut f = Fixture::new();
        f.add(h(1), &[h(0)]);
        f.add(h(2), &[h(0)]);
        let mut v = VirtualBlock::new();
        v.set_tips(&f.index, &f.reachability, 3, vec![h(2), h(1)]).unwrap();
        assert_eq!(v.selected_parent(), Some(h(1)));
        assert_eq!(v.blue_score(), 3);
    }
}
