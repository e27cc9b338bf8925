use std::collections::HashMap;
use std::fmt;

use crate::core::hash::Hash;
use crate::core::types::BlockHeader;

bitflags::bitflags! {
    /// Validation progress of a block. Flags are only ever added.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BlockStatus: u8 {
        const DATA_STORED = 1 << 0;
        const VALID = 1 << 1;
        const VALIDATE_FAILED = 1 << 2;
        const INVALID_ANCESTOR = 1 << 3;
        const FINALIZED = 1 << 4;
    }
}

impl BlockStatus {
    pub fn known_valid(self) -> bool {
        self.contains(BlockStatus::VALID)
    }

    pub fn known_invalid(self) -> bool {
        self.intersects(BlockStatus::VALIDATE_FAILED | BlockStatus::INVALID_ANCESTOR)
    }
}

/// PHANTOM data of one block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GhostdagData {
    /// `None` only for genesis.
    pub selected_parent: Option<Hash>,
    /// Selected parent first, then the blue anticone candidates in visit order.
    pub blues: Vec<Hash>,
    pub blue_score: u64,
    /// Size of each blue's anticone within the blue set, as seen from this block.
    pub blues_anticone_sizes: HashMap<Hash, u8>,
}

/// A block as held by the index.
#[derive(Debug, Clone)]
pub struct BlockNode {
    pub hash: Hash,
    pub header: BlockHeader,
    pub children: Vec<Hash>,
    pub ghostdag: GhostdagData,
    /// Longest parent path to genesis; orders the index on disk.
    pub height: u32,
    pub status: BlockStatus,
}

impl BlockNode {
    pub fn new(header: BlockHeader, ghostdag: GhostdagData, height: u32) -> Self {
        BlockNode {
            hash: header.hash(),
            header,
            children: Vec::new(),
            ghostdag,
            height,
            status: BlockStatus::empty(),
        }
    }

    pub fn parents(&self) -> &[Hash] {
        &self.header.parent_hashes
    }

    pub fn selected_parent(&self) -> Option<Hash> {
        self.ghostdag.selected_parent
    }

    pub fn blue_score(&self) -> u64 {
        self.ghostdag.blue_score
    }

    pub fn blues(&self) -> &[Hash] {
        &self.ghostdag.blues
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    pub fn bits(&self) -> u32 {
        self.header.bits
    }

    pub fn is_genesis(&self) -> bool {
        self.header.is_genesis()
    }

    pub fn is_finalized(&self) -> bool {
        self.status.contains(BlockStatus::FINALIZED)
    }

    pub fn add_child(&mut self, child: Hash) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }
}

impl fmt::Display for BlockNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (blue score {})", self.hash.short(), self.ghostdag.blue_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(!BlockStatus::DATA_STORED.known_valid());
        assert!((BlockStatus::DATA_STORED | BlockStatus::VALID).known_valid());
        assert!(BlockStatus::VALIDATE_FAILED.known_invalid());
        assert!(BlockStatus::INVALID_ANCESTOR.known_invalid());
        assert!(!BlockStatus::FINALIZED.known_invalid());
        assert_eq!(BlockStatus::from_bits_truncate(0b1_0011), BlockStatus::DATA_STORED | BlockStatus::VALID | BlockStatus::FINALIZED);
    }
}
