//! PHANTOM blue-set selection (GHOSTDAG).
//!
//! The selected parent is the parent with the highest blue score, the smaller
//! hash winning ties. Blocks in the selected parent's anticone are then visited
//! in (blue score, hash) order and colored blue when the K-cluster condition
//! still holds: the candidate's anticone within the blue set has at most K
//! blocks, and no blue block's anticone grows past K by adding it.

use std::collections::{HashMap, HashSet, VecDeque};

use super::block_index::BlockIndex;
use super::block_node::GhostdagData;
use super::reachability::ReachabilityTree;
use crate::core::hash::Hash;
use crate::error::DagError;

fn node_data<'a>(index: &'a BlockIndex, hash: &Hash) -> Result<&'a GhostdagData, DagError> {
    index.lookup(hash).map(|n| &n.ghostdag).ok_or(DagError::UnknownBlock(*hash))
}

/// The parent with the highest blue score; ties go to the smaller hash.
pub fn find_selected_parent(index: &BlockIndex, parents: &[Hash]) -> Result<Option<Hash>, DagError> {
    let mut best: Option<(u64, Hash)> = None;
    for parent in parents {
        let score = node_data(index, parent)?.blue_score;
        best = match best {
            Some((best_score, best_hash)) if best_score > score || (best_score == score && best_hash < *parent) => {
                Some((best_score, best_hash))
            }
            _ => Some((score, *parent)),
        };
    }
    Ok(best.map(|(_, hash)| hash))
}

/// Blocks in the past of a block with `parents` that are outside the past of
/// `selected_parent` (and are not the selected parent itself).
pub fn selected_parent_anticone(
    index: &BlockIndex,
    reachability: &ReachabilityTree,
    parents: &[Hash],
    selected_parent: &Hash,
) -> Result<Vec<Hash>, DagError> {
    let mut anticone = Vec::new();
    let mut visited: HashSet<Hash> = HashSet::new();
    let mut queue: VecDeque<Hash> = VecDeque::new();
    for parent in parents {
        if parent != selected_parent && visited.insert(*parent) {
            queue.push_back(*parent);
        }
    }

    while let Some(current) = queue.pop_front() {
        if reachability.is_ancestor_of(&current, selected_parent)? {
            continue;
        }
        anticone.push(current);
        let node = index.lookup(&current).ok_or(DagError::UnknownBlock(current))?;
        for parent in node.parents() {
            if visited.insert(*parent) {
                queue.push_back(*parent);
            }
        }
    }
    Ok(anticone)
}

/// Anticone size of `block` within the blue set, as seen from `context`.
fn blue_anticone_size(index: &BlockIndex, block: &Hash, context: &GhostdagData) -> Result<u8, DagError> {
    let mut current = context;
    loop {
        if let Some(size) = current.blues_anticone_sizes.get(block) {
            return Ok(*size);
        }
        let sp = current
            .selected_parent
            .ok_or_else(|| DagError::Assert(format!("{block} is not in the blue set of its context")))?;
        current = node_data(index, &sp)?;
    }
}

/// Whether `candidate` may join the blues of `new_block`. On success returns
/// the candidate's blue anticone size and the blues whose anticone it enters.
fn check_blue_candidate(
    index: &BlockIndex,
    reachability: &ReachabilityTree,
    k: u8,
    new_block: &GhostdagData,
    candidate: &Hash,
) -> Result<Option<(u8, HashMap<Hash, u8>)>, DagError> {
    if new_block.blues.len() == k as usize + 1 {
        return Ok(None);
    }

    let mut anticone_size: u16 = 0;
    let mut entered: HashMap<Hash, u8> = HashMap::new();

    let mut chain_hash: Option<Hash> = None;
    let mut chain_block = Some(new_block);
    while let Some(data) = chain_block {
        // every remaining blue is in the candidate's past
        if let Some(hash) = chain_hash {
            if reachability.is_ancestor_of(&hash, candidate)? {
                break;
            }
        }

        for blue in &data.blues {
            if reachability.is_ancestor_of(blue, candidate)? {
                continue;
            }
            let size = blue_anticone_size(index, blue, new_block)?;
            entered.insert(*blue, size);
            anticone_size += 1;
            if anticone_size > k as u16 || size == k {
                return Ok(None);
            }
        }

        chain_hash = data.selected_parent;
        chain_block = match chain_hash {
            Some(sp) => Some(node_data(index, &sp)?),
            None => None,
        };
    }
    Ok(Some((anticone_size as u8, entered)))
}

/// Ghostdag data of a block with `parents`, plus the selected parent's anticone
/// within the block's past.
pub fn ghostdag(
    index: &BlockIndex,
    reachability: &ReachabilityTree,
    k: u8,
    parents: &[Hash],
) -> Result<(GhostdagData, Vec<Hash>), DagError> {
    let Some(selected_parent) = find_selected_parent(index, parents)? else {
        return Ok((GhostdagData::default(), Vec::new()));
    };

    let anticone = selected_parent_anticone(index, reachability, parents, &selected_parent)?;
    let mut candidates: Vec<(u64, Hash)> = anticone
        .iter()
        .map(|h| node_data(index, h).map(|d| (d.blue_score, *h)))
        .collect::<Result<_, _>>()?;
    candidates.sort();

    let mut data = GhostdagData {
        selected_parent: Some(selected_parent),
        blues: vec![selected_parent],
        blue_score: 0,
        blues_anticone_sizes: HashMap::from([(selected_parent, 0)]),
    };

    for (_, candidate) in candidates {
        if let Some((size, entered)) = check_blue_candidate(index, reachability, k, &data, &candidate)? {
            data.blues.push(candidate);
            data.blues_anticone_sizes.insert(candidate, size);
            for (blue, blue_size) in entered {
                data.blues_anticone_sizes.insert(blue, blue_size + 1);
            }
        }
    }

    data.blue_score = node_data(index, &selected_parent)?.blue_score + data.blues.len() as u64;
    Ok((data, anticone))
}

/// Stand-in data for blocks with an invalid ancestor: they never get colored,
/// but still need a selected parent and a score to sit in the index.
pub fn lightweight_ghostdag(index: &BlockIndex, parents: &[Hash]) -> Result<GhostdagData, DagError> {
    let Some(selected_parent) = find_selected_parent(index, parents)? else {
        return Ok(GhostdagData::default());
    };
    let blue_score = node_data(index, &selected_parent)?.blue_score + 1;
    Ok(GhostdagData {
        selected_parent: Some(selected_parent),
        blues: vec![selected_parent],
        blue_score,
        blues_anticone_sizes: HashMap::from([(selected_parent, 0)]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BlockHeader;
    use crate::dag::block_node::BlockNode;

    fn h(n: u8) -> Hash {
        Hash([n; 32])
    }

    struct Builder {
        index: BlockIndex,
        reachability: ReachabilityTree,
        k: u8,
    }

    impl Builder {
        fn new(k: u8) -> Self {
            let mut b = Builder { index: BlockIndex::new(), reachability: ReachabilityTree::new(), k };
            b.insert(h(0), &[], GhostdagData::default());
            b.reachability.add_genesis(h(0)).unwrap();
            b
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
            // test hashes are chosen, not derived
            node.hash = hash;
            self.index.add(node);
        }

        fn add(&mut self, hash: Hash, parents: &[Hash]) -> GhostdagData {
            let (data, anticone) = ghostdag(&self.index, &self.reachability, self.k, parents).unwrap();
            let sp = data.selected_parent.unwrap();
            self.insert(hash, parents, data.clone());
            self.reachability.add_block(hash, sp, &anticone).unwrap();
            data
        }
    }

    #[test]
    fn test_chain_scores() {
        let mut b = Builder::new(3);
        let d1 = b.add(h(1), &[h(0)]);
        let d2 = b.add(h(2), &[h(1)]);
        assert_eq!(d1.blue_score, 1);
        assert_eq!(d2.blue_score, 2);
        assert_eq!(d2.blues, vec![h(1)]);
    }

    #[test]
    fn test_selected_parent_tie_prefers_smaller_hash() {
        let mut b = Builder::new(3);
        b.add(h(1), &[h(0)]);
        b.add(h(2), &[h(0)]);
        let d = b.add(h(3), &[h(1), h(2)]);
        assert_eq!(d.selected_parent, Some(h(1)));
        assert_eq!(d.blues, vec![h(1), h(2)]);
        assert_eq!(d.blue_score, 3);
    }

    #[test]
    fn test_k_limits_blue_anticone() {
        // three parallel blocks merged: with K=1 only one sibling can be blue
        let mut b = Builder::new(1);
        b.add(h(1), &[h(0)]);
        b.add(h(2), &[h(0)]);
        b.add(h(3), &[h(0)]);
        let d = b.add(h(4), &[h(1), h(2), h(3)]);
        assert_eq!(d.selected_parent, Some(h(1)));
        assert_eq!(d.blues, vec![h(1), h(2)]);
        assert_eq!(d.blue_score, 3);

        let mut wide = Builder::new(2);
        wide.add(h(1), &[h(0)]);
        wide.add(h(2), &[h(0)]);
        wide.add(h(3), &[h(0)]);
        let d = wide.add(h(4), &[h(1), h(2), h(3)]);
        assert_eq!(d.blues.len(), 3);
    }

    #[test]
    fn test_anticone_excludes_selected_parent_past() {
        //  0 - 1 - 2
        //   \     /
        //    3 --+      block 4 merges 2 and 3
        let mut b = Builder::new(3);
        b.add(h(1), &[h(0)]);
        b.add(h(2), &[h(1)]);
        b.add(h(3), &[h(0)]);
        let anticone = selected_parent_anticone(&b.index, &b.reachability, &[h(2), h(3)], &h(2)).unwrap();
        assert_eq!(anticone, vec![h(3)]);
        let d = b.add(h(4), &[h(2), h(3)]);
        assert_eq!(d.selected_parent, Some(h(2)));
        assert_eq!(d.blue_score, 4);
    }

    #[test]
    fn test_blue_score_is_selected_parent_plus_blues() {
        let mut b = Builder::new(2);
        b.add(h(1), &[h(0)]);
        b.add(h(2), &[h(0)]);
        b.add(h(3), &[h(1), h(2)]);
        b.add(h(4), &[h(2)]);
        b.add(h(5), &[h(3), h(4)]);
        for n in 1..=5 {
            let node = b.index.lookup(&h(n)).unwrap();
            let sp = node.ghostdag.selected_parent.unwrap();
            let sp_score = b.index.lookup(&sp).unwrap().ghostdag.blue_score;
            assert_eq!(node.ghostdag.blue_score, sp_score + node.ghostdag.blues.len() as u64);
        }
    }

    #[test]
    fn test_lightweight_data() {
        let mut b = Builder::new(3);
        b.add(h(1), &[h(0)]);
        let data = lightweight_ghostdag(&b.index, &[h(1)]).unwrap();
        assert_eq!(data.blue_score, 2);
        assert_eq!(data.selected_parent, Some(h(1)));
    }
}
