//! Reachability: constant-time ancestry queries over the DAG.
//!
//! The selected-parent relation forms a spanning tree. Every tree node owns an
//! interval; a node's interval contains those of its whole subtree, and its own
//! last slot is never handed to a child. Tree ancestry is interval containment.
//!
//! DAG ancestry that the tree misses is covered by each node's future covering
//! set: blocks in the node's future that are outside its subtree, kept sorted by
//! interval start with no member inside another's subtree. `b` is in the future
//! of `a` iff `a`'s interval contains `b`'s, or some member of `a`'s future
//! covering set contains `b`'s. Only the member with the largest start not
//! above `b.start` can.
//!
//! New children take the first half of the space left after the last sibling.
//! When nothing is left, the lowest tree ancestor whose interval can hold its
//! whole subtree lays that subtree out again.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::hash::Hash;
use crate::error::DagError;
use crate::storage::{Bucket, DbTransaction, Storage, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Interval { start, end }
    }

    pub fn size(&self) -> u64 {
        if self.end < self.start {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachabilityData {
    pub interval: Interval,
    pub tree_parent: Option<Hash>,
    pub children: Vec<Hash>,
    pub future_covering_set: Vec<Hash>,
}

#[derive(Debug)]
pub struct ReachabilityTree {
    nodes: HashMap<Hash, ReachabilityData>,
    dirty: HashSet<Hash>,
    root_interval: Interval,
}

impl Default for ReachabilityTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ReachabilityTree {
    pub fn new() -> Self {
        Self::with_root_interval(Interval::new(1, u64::MAX - 1))
    }

    /// A tree whose root gets `root_interval`. Small intervals force reindexing.
    pub fn with_root_interval(root_interval: Interval) -> Self {
        ReachabilityTree { nodes: HashMap::new(), dirty: HashSet::new(), root_interval }
    }

    pub fn load(storage: &Storage) -> Result<Self, StorageError> {
        let mut tree = Self::new();
        for (key, value) in storage.scan(Bucket::Reachability)? {
            let hash = Hash::from_slice(&key)
                .ok_or_else(|| StorageError::SerializeError("bad reachability key".into()))?;
            let data: ReachabilityData =
                bincode::deserialize(&value).map_err(|e| StorageError::SerializeError(e.to_string()))?;
            tree.nodes.insert(hash, data);
        }
        Ok(tree)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn data(&self, hash: &Hash) -> Result<&ReachabilityData, DagError> {
        self.nodes
            .get(hash)
            .ok_or_else(|| DagError::Reachability(format!("no reachability data for {hash}")))
    }

    fn data_mut(&mut self, hash: &Hash) -> Result<&mut ReachabilityData, DagError> {
        self.nodes
            .get_mut(hash)
            .ok_or_else(|| DagError::Reachability(format!("no reachability data for {hash}")))
    }

    pub fn interval(&self, hash: &Hash) -> Result<Interval, DagError> {
        Ok(self.data(hash)?.interval)
    }

    pub fn add_genesis(&mut self, genesis: Hash) -> Result<(), DagError> {
        if !self.nodes.is_empty() {
            return Err(DagError::Reachability("genesis added to a non-empty tree".into()));
        }
        self.nodes.insert(
            genesis,
            ReachabilityData {
                interval: self.root_interval,
                tree_parent: None,
                children: Vec::new(),
                future_covering_set: Vec::new(),
            },
        );
        self.dirty.insert(genesis);
        Ok(())
    }

    /// Add `node` as a tree child of `selected_parent`, and record it in the
    /// future covering set of every block in the selected parent's anticone.
    pub fn add_block(&mut self, node: Hash, selected_parent: Hash, selected_parent_anticone: &[Hash]) -> Result<(), DagError> {
        if self.nodes.contains_key(&node) {
            return Err(DagError::Reachability(format!("{node} already has reachability data")));
        }

        let parent = self.data(&selected_parent)?;
        let alloc_start = match parent.children.last() {
            Some(last) => self.data(last)?.interval.end + 1,
            None => parent.interval.start,
        };
        // the parent's own slot is its last one
        let alloc_end = parent.interval.end;

        self.nodes.insert(
            node,
            ReachabilityData {
                interval: Interval::new(1, 0),
                tree_parent: Some(selected_parent),
                children: Vec::new(),
                future_covering_set: Vec::new(),
            },
        );
        self.data_mut(&selected_parent)?.children.push(node);
        self.dirty.insert(node);
        self.dirty.insert(selected_parent);

        if alloc_start < alloc_end {
            let remaining = alloc_end - alloc_start;
            let size = remaining.div_ceil(2);
            self.data_mut(&node)?.interval = Interval::new(alloc_start, alloc_start + size - 1);
        } else {
            self.reindex(selected_parent)?;
        }

        for block in selected_parent_anticone {
            self.insert_to_future_covering_set(*block, node)?;
        }
        Ok(())
    }

    /// Sizes of every subtree under `root`, reusing sizes already in `sizes`.
    fn count_subtree(&self, root: Hash, sizes: &mut HashMap<Hash, u64>) -> Result<(), DagError> {
        let mut stack = vec![(root, false)];
        while let Some((hash, expanded)) = stack.pop() {
            if sizes.contains_key(&hash) {
                continue;
            }
            let data = self.data(&hash)?;
            if expanded {
                let mut total = 1u64;
                for child in &data.children {
                    total += sizes.get(child).copied().unwrap_or(0);
                }
                sizes.insert(hash, total);
            } else {
                stack.push((hash, true));
                for child in &data.children {
                    stack.push((*child, false));
                }
            }
        }
        Ok(())
    }

    fn reindex(&mut self, from: Hash) -> Result<(), DagError> {
        let mut sizes = HashMap::new();
        let mut root = from;
        loop {
            self.count_subtree(root, &mut sizes)?;
            let data = self.data(&root)?;
            if data.interval.size() >= sizes[&root] {
                break;
            }
            root = data
                .tree_parent
                .ok_or_else(|| DagError::Reachability("reachability root interval exhausted".into()))?;
        }

        tracing::debug!("🌳 Reindexing reachability subtree of {} ({} nodes)", root.short(), sizes[&root]);

        let mut stack = vec![root];
        while let Some(hash) = stack.pop() {
            let data = self.data(&hash)?;
            if data.children.is_empty() {
                continue;
            }
            let interval = data.interval;
            let children = data.children.clone();

            let needed: u128 = children.iter().map(|c| sizes[c] as u128).sum();
            let available = interval.size() as u128 - 1;
            let half_slack = (available - needed) / 2;

            let mut cursor = interval.start;
            for child in children {
                let child_size = sizes[&child] as u128;
                let share = half_slack * child_size / needed;
                let size = (child_size + share) as u64;
                self.data_mut(&child)?.interval = Interval::new(cursor, cursor + size - 1);
                self.dirty.insert(child);
                cursor += size;
                stack.push(child);
            }
        }
        Ok(())
    }

    fn insert_to_future_covering_set(&mut self, owner: Hash, node: Hash) -> Result<(), DagError> {
        let node_interval = self.interval(&node)?;
        let owner_data = self.data(&owner)?;
        if owner_data.interval.contains(&node_interval) {
            return Ok(());
        }

        let fcs = &owner_data.future_covering_set;
        let pos = self.search_future_covering_set(fcs, &node_interval)?;
        if pos > 0 && self.interval(&fcs[pos - 1])?.contains(&node_interval) {
            return Ok(());
        }

        self.data_mut(&owner)?.future_covering_set.insert(pos, node);
        self.dirty.insert(owner);
        Ok(())
    }

    /// Index of the first member whose interval starts after `target.start`.
    fn search_future_covering_set(&self, fcs: &[Hash], target: &Interval) -> Result<usize, DagError> {
        let (mut lo, mut hi) = (0usize, fcs.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.interval(&fcs[mid])?.start <= target.start {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Whether `a` is `b` or a selected-parent-tree ancestor of it.
    pub fn is_tree_ancestor_of(&self, a: &Hash, b: &Hash) -> Result<bool, DagError> {
        Ok(self.interval(a)?.contains(&self.interval(b)?))
    }

    /// Whether `a` is `b` or in its past.
    pub fn is_ancestor_of(&self, a: &Hash, b: &Hash) -> Result<bool, DagError> {
        let a_data = self.data(a)?;
        let b_interval = self.interval(b)?;
        if a_data.interval.contains(&b_interval) {
            return Ok(true);
        }
        let fcs = &a_data.future_covering_set;
        let pos = self.search_future_covering_set(fcs, &b_interval)?;
        Ok(pos > 0 && self.interval(&fcs[pos - 1])?.contains(&b_interval))
    }

    /// Whether `a` is strictly in the past of `b`.
    pub fn is_in_past(&self, a: &Hash, b: &Hash) -> Result<bool, DagError> {
        Ok(a != b && self.is_ancestor_of(a, b)?)
    }

    pub fn flush(&mut self, tx: &mut DbTransaction) -> Result<(), DagError> {
        for hash in self.dirty.drain() {
            if let Some(data) = self.nodes.get(&hash) {
                let bytes = bincode::serialize(data).map_err(|e| StorageError::SerializeError(e.to_string()))?;
                tx.put(Bucket::Reachability, &hash.0, bytes);
            }
        }
        Ok(())
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn h(n: u32) -> Hash {
        let mut bytes = [0u8; 32];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        Hash(bytes)
    }

    /// A DAG given as parent lists; node 0 is genesis, the first parent is the
    /// selected one.
    struct TestDag {
        parents: Vec<Vec<u32>>,
    }

    impl TestDag {
        fn past(&self, node: u32) -> HashSet<u32> {
            let mut seen = HashSet::new();
            let mut stack: Vec<u32> = self.parents[node as usize].clone();
            while let Some(n) = stack.pop() {
                if seen.insert(n) {
                    stack.extend(self.parents[n as usize].iter().copied());
                }
            }
            seen
        }

        fn build(&self, tree: &mut ReachabilityTree) {
            tree.add_genesis(h(0)).unwrap();
            for node in 1..self.parents.len() as u32 {
                let sp = self.parents[node as usize][0];
                let sp_past = self.past(sp);
                let anticone: Vec<Hash> = self
                    .past(node)
                    .into_iter()
                    .filter(|b| *b != sp && !sp_past.contains(b))
                    .map(h)
                    .collect();
                tree.add_block(h(node), h(sp), &anticone).unwrap();
            }
        }

        fn check(&self, tree: &ReachabilityTree) {
            for b in 0..self.parents.len() as u32 {
                let past = self.past(b);
                for a in 0..self.parents.len() as u32 {
                    let expected = a == b || past.contains(&a);
                    assert_eq!(tree.is_ancestor_of(&h(a), &h(b)).unwrap(), expected, "is_ancestor_of({a}, {b})");
                    assert_eq!(tree.is_in_past(&h(a), &h(b)).unwrap(), expected && a != b);
                }
            }
        }
    }

    #[test]
    fn test_chain_intervals_nest() {
        let mut tree = ReachabilityTree::new();
        let dag = TestDag { parents: vec![vec![], vec![0], vec![1], vec![2]] };
        dag.build(&mut tree);
        for i in 0..3 {
            assert!(tree.interval(&h(i)).unwrap().contains(&tree.interval(&h(i + 1)).unwrap()));
        }
        dag.check(&tree);
    }

    #[test]
    fn test_diamond_uses_future_covering_set() {
        //    0
        //   / \
        //  1   2
        //   \ /
        //    3   (selected parent 1)
        let dag = TestDag { parents: vec![vec![], vec![0], vec![0], vec![1, 2]] };
        let mut tree = ReachabilityTree::new();
        dag.build(&mut tree);
        assert!(!tree.is_tree_ancestor_of(&h(2), &h(3)).unwrap());
        assert!(tree.is_ancestor_of(&h(2), &h(3)).unwrap());
        assert!(!tree.is_ancestor_of(&h(1), &h(2)).unwrap());
        dag.check(&tree);
    }

    #[test]
    fn test_reindex_on_exhaustion() {
        // room for only a handful of halvings
        let mut tree = ReachabilityTree::with_root_interval(Interval::new(1, 64));
        let mut parents = vec![vec![]];
        for i in 1..40u32 {
            parents.push(vec![i - 1]);
        }
        // siblings hanging off an early chain block
        for _ in 0..10 {
            parents.push(vec![3]);
        }
        let dag = TestDag { parents };
        dag.build(&mut tree);
        dag.check(&tree);
    }

    #[test]
    fn test_exhausted_root_is_an_error() {
        let mut tree = ReachabilityTree::with_root_interval(Interval::new(1, 2));
        tree.add_genesis(h(0)).unwrap();
        tree.add_block(h(1), h(0), &[]).unwrap();
        assert!(matches!(tree.add_block(h(2), h(1), &[]), Err(DagError::Reachability(_))));
    }

    #[test]
    fn test_random_dags_match_bfs() {
        let mut rng = StdRng::seed_from_u64(7);
        for round in 0..5 {
            let mut parents: Vec<Vec<u32>> = vec![vec![]];
            for node in 1..60u32 {
                let count = rng.gen_range(1..=3.min(node as usize));
                let mut ps: Vec<u32> = Vec::new();
                while ps.len() < count {
                    let lo = node.saturating_sub(8);
                    let p = rng.gen_range(lo..node);
                    if !ps.contains(&p) {
                        ps.push(p);
                    }
                }
                parents.push(ps);
            }
            let dag = TestDag { parents };
            // a tight root interval on odd rounds exercises reindexing
            let mut tree = if round % 2 == 1 {
                ReachabilityTree::with_root_interval(Interval::new(1, 256))
            } else {
                ReachabilityTree::new()
            };
            dag.build(&mut tree);
            dag.check(&tree);
        }
    }

    #[test]
    fn test_flush_and_load() {
        let storage = Storage::temporary().unwrap();
        let dag = TestDag { parents: vec![vec![], vec![0], vec![0], vec![1, 2]] };
        let mut tree = ReachabilityTree::new();
        dag.build(&mut tree);

        let mut tx = storage.begin();
        tree.flush(&mut tx).unwrap();
        storage.commit(tx).unwrap();

        let loaded = ReachabilityTree::load(&storage).unwrap();
        assert_eq!(loaded.len(), 4);
        dag.check(&loaded);
    }
}
