use std::collections::{HashMap, HashSet};

use super::{decode_outpoint, encode_outpoint, UtxoCollection, UtxoEntry, UtxoError};
use crate::core::codec::{write_vlq, CodecError, Decodable, Encodable, Reader};
use crate::core::types::OutPoint;

/// Entries to add and to remove, relative to some base set.
///
/// An outpoint may appear in both collections only with entries that differ
/// (in practice: in blue score).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoDiff {
    pub to_add: UtxoCollection,
    pub to_remove: UtxoCollection,
}

/// Where one (outpoint, entry) pair appears in a diff.
#[derive(Clone, Copy)]
struct Membership {
    added: bool,
    removed: bool,
}

impl Membership {
    fn of(diff: &UtxoDiff, outpoint: &OutPoint, entry: &UtxoEntry) -> Self {
        Membership {
            added: diff.to_add.get(outpoint) == Some(entry),
            removed: diff.to_remove.get(outpoint) == Some(entry),
        }
    }
}

impl UtxoDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Every distinct pair mentioned by either diff.
    fn pairs<'a>(a: &'a UtxoDiff, b: &'a UtxoDiff) -> Vec<(&'a OutPoint, &'a UtxoEntry)> {
        let mut seen: HashSet<(&OutPoint, &UtxoEntry)> = HashSet::new();
        let mut pairs = Vec::new();
        for collection in [&a.to_add, &a.to_remove, &b.to_add, &b.to_remove] {
            for pair in collection.iter() {
                if seen.insert(pair) {
                    pairs.push(pair);
                }
            }
        }
        pairs
    }

    /// The diff `d` such that applying `d` after `self` equals applying `other`.
    /// Both diffs must be relative to the same base.
    pub fn diff_from(&self, other: &UtxoDiff) -> Result<UtxoDiff, UtxoError> {
        let mut result = UtxoDiff::new();
        for (outpoint, entry) in Self::pairs(self, other) {
            let this = Membership::of(self, outpoint, entry);
            let that = Membership::of(other, outpoint, entry);

            if (this.added && that.removed) || (this.removed && that.added) {
                return Err(UtxoError::Conflict(format!(
                    "{outpoint} is added by one diff and removed by the other"
                )));
            }

            let in_base = this.removed || that.removed;
            let in_this = this.added || (in_base && !this.removed);
            let in_that = that.added || (in_base && !that.removed);

            if in_this && !in_that {
                insert_unique(&mut result.to_remove, outpoint, entry)?;
            } else if in_that && !in_this {
                insert_unique(&mut result.to_add, outpoint, entry)?;
            }
        }
        Ok(result)
    }

    /// Composition: `self` applied first, then `other`.
    pub fn with_diff(&self, other: &UtxoDiff) -> Result<UtxoDiff, UtxoError> {
        let mut result = UtxoDiff::new();
        for (outpoint, entry) in Self::pairs(self, other) {
            let first = Membership::of(self, outpoint, entry);
            let second = Membership::of(other, outpoint, entry);

            let in_base = if first.removed {
                true
            } else if first.added {
                false
            } else {
                second.removed
            };
            let after_first = first.added || (in_base && !first.removed);

            if second.removed && !after_first {
                return Err(UtxoError::Conflict(format!("{outpoint} is removed but was never present")));
            }
            if second.added && after_first {
                return Err(UtxoError::Conflict(format!("{outpoint} is added twice")));
            }

            let after_second = second.added || (after_first && !second.removed);
            if in_base && !after_second {
                insert_unique(&mut result.to_remove, outpoint, entry)?;
            } else if !in_base && after_second {
                insert_unique(&mut result.to_add, outpoint, entry)?;
            }
        }
        Ok(result)
    }

    /// Record an added entry, cancelling a matching removal.
    pub fn add_entry(&mut self, outpoint: OutPoint, entry: UtxoEntry) -> Result<(), UtxoError> {
        if self.to_remove.get(&outpoint) == Some(&entry) {
            self.to_remove.remove(&outpoint);
            return Ok(());
        }
        if self.to_add.contains_key(&outpoint) {
            return Err(UtxoError::Conflict(format!("{outpoint} is added twice")));
        }
        self.to_add.insert(outpoint, entry);
        Ok(())
    }

    /// Record a removed entry, cancelling a matching addition.
    pub fn remove_entry(&mut self, outpoint: OutPoint, entry: UtxoEntry) -> Result<(), UtxoError> {
        if self.to_add.get(&outpoint) == Some(&entry) {
            self.to_add.remove(&outpoint);
            return Ok(());
        }
        if self.to_remove.contains_key(&outpoint) {
            return Err(UtxoError::Conflict(format!("{outpoint} is removed twice")));
        }
        self.to_remove.insert(outpoint, entry);
        Ok(())
    }
}

fn insert_unique(collection: &mut HashMap<OutPoint, UtxoEntry>, outpoint: &OutPoint, entry: &UtxoEntry) -> Result<(), UtxoError> {
    match collection.get(outpoint) {
        Some(existing) if existing != entry => Err(UtxoError::Conflict(format!(
            "{outpoint} would hold two entries in the result"
        ))),
        _ => {
            collection.insert(*outpoint, entry.clone());
            Ok(())
        }
    }
}

fn encode_collection(collection: &UtxoCollection, buf: &mut Vec<u8>) {
    let mut sorted: Vec<_> = collection.iter().collect();
    sorted.sort_by_key(|(outpoint, _)| **outpoint);
    write_vlq(buf, sorted.len() as u64);
    for (outpoint, entry) in sorted {
        encode_outpoint(outpoint, buf);
        entry.encode(buf);
    }
}

fn decode_collection(r: &mut Reader<'_>) -> Result<UtxoCollection, CodecError> {
    let count = r.read_count()?;
    let mut collection = HashMap::with_capacity(count);
    for _ in 0..count {
        let outpoint = decode_outpoint(r)?;
        let entry = UtxoEntry::decode(r)?;
        if collection.insert(outpoint, entry).is_some() {
            return Err(CodecError::Invalid(format!("outpoint {outpoint} listed twice")));
        }
    }
    Ok(collection)
}

/// vlq(#to_add) entries || vlq(#to_remove) entries, each sorted by outpoint.
impl Encodable for UtxoDiff {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_collection(&self.to_add, buf);
        encode_collection(&self.to_remove, buf);
    }
}

impl Decodable for UtxoDiff {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let to_add = decode_collection(r)?;
        let to_remove = decode_collection(r)?;
        Ok(UtxoDiff { to_add, to_remove })
    }
}
