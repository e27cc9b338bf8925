use std::collections::{HashMap, HashSet};

use super::block_node::{BlockNode, BlockStatus};
use crate::core::codec::{CodecError, Decodable, Encodable, Reader};
use crate::core::hash::Hash;
use crate::core::types::BlockHeader;
use crate::storage::{block_index_key, Bucket, DbTransaction, Storage, StorageError};

/// Hash → node map that owns every block the DAG knows.
#[derive(Debug, Default)]
pub struct BlockIndex {
    nodes: HashMap<Hash, BlockNode>,
    dirty: HashSet<Hash>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, hash: &Hash) -> Option<&BlockNode> {
        self.nodes.get(hash)
    }

    pub fn lookup_mut(&mut self, hash: &Hash) -> Option<&mut BlockNode> {
        self.nodes.get_mut(hash)
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.nodes.contains_key(hash)
    }

    /// Insert `node` unless its hash is already present. Either way the stored
    /// node is marked dirty.
    pub fn add(&mut self, node: BlockNode) -> &BlockNode {
        let hash = node.hash;
        self.dirty.insert(hash);
        self.nodes.entry(hash).or_insert(node)
    }

    pub fn status(&self, hash: &Hash) -> BlockStatus {
        self.nodes.get(hash).map(|n| n.status).unwrap_or_default()
    }

    /// OR `flags` into the node's status.
    pub fn set_status_flags(&mut self, hash: &Hash, flags: BlockStatus) {
        if let Some(node) = self.nodes.get_mut(hash) {
            node.status |= flags;
            self.dirty.insert(*hash);
        }
    }

    pub fn known_valid(&self, hash: &Hash) -> bool {
        self.status(hash).known_valid()
    }

    pub fn known_invalid(&self, hash: &Hash) -> bool {
        self.status(hash).known_invalid()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockNode> {
        self.nodes.values()
    }

    /// Write header and status of every dirty node.
    pub fn flush(&mut self, tx: &mut DbTransaction) {
        for hash in self.dirty.drain() {
            if let Some(node) = self.nodes.get(&hash) {
                let mut value = node.header.to_bytes();
                value.push(node.status.bits());
                tx.put(Bucket::BlockIndex, &block_index_key(node.height, &hash), value);
            }
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

/// One stored index record: the header and its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub header: BlockHeader,
    pub status: BlockStatus,
}

impl Decodable for IndexRecord {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(r)?;
        let status = BlockStatus::from_bits_truncate(r.read_u8()?);
        Ok(IndexRecord { header, status })
    }
}

/// Every stored record, parents before children.
pub fn load_index_records(storage: &Storage) -> Result<Vec<IndexRecord>, StorageError> {
    storage
        .scan(Bucket::BlockIndex)?
        .into_iter()
        .map(|(_, value)| IndexRecord::from_bytes(&value).map_err(StorageError::from))
        .collect()
}
