//! Layered unspent-output sets.
//!
//! A [`FullUtxoSet`] is a plain collection. A [`DiffUtxoSet`] borrows a full
//! set and overlays a [`UtxoDiff`]; it is what past-UTXO computation works on,
//! and what gets melded back into the virtual block's full set on connect.
//!
//! The diff algebra treats an (outpoint, entry) pair as the unit. Two entries of
//! one outpoint that differ only in blue score are different pairs, so a diff may
//! remove one and add the other: that is how an output's acceptance score moves.

pub mod diff;
pub mod diff_store;
pub mod multiset_store;

use std::collections::HashMap;

use crate::core::codec::{write_vlq, CodecError, Decodable, Encodable, Reader};
use crate::core::types::{OutPoint, Transaction};
use crate::crypto::multiset::Multiset;

pub use diff::UtxoDiff;

/// Blue score of an entry whose transaction has not been accepted yet.
pub const UNACCEPTED_BLUE_SCORE: u64 = u64::MAX;

const FLAG_COINBASE: u8 = 1 << 0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UtxoError {
    #[error("diff conflict: {0}")]
    Conflict(String),
    #[error("outpoint {0} is not in the set")]
    Missing(OutPoint),
    #[error("outpoint {0} is already in the set")]
    Duplicate(OutPoint),
    #[error("diff is relative to a different base set")]
    BaseMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UtxoEntry {
    pub amount: u64,
    pub script_pub_key: Vec<u8>,
    pub block_blue_score: u64,
    pub is_coinbase: bool,
}

impl UtxoEntry {
    pub fn new(amount: u64, script_pub_key: Vec<u8>, block_blue_score: u64, is_coinbase: bool) -> Self {
        UtxoEntry { amount, script_pub_key, block_blue_score, is_coinbase }
    }

    pub fn is_unaccepted(&self) -> bool {
        self.block_blue_score == UNACCEPTED_BLUE_SCORE
    }

    fn flags(&self) -> u8 {
        if self.is_coinbase {
            FLAG_COINBASE
        } else {
            0
        }
    }
}

/// blue_score(u64) || flags(u8) || amount(u64) || vlq(len) script_pub_key
impl Encodable for UtxoEntry {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.block_blue_score.to_le_bytes());
        buf.push(self.flags());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        crate::core::codec::write_var_bytes(buf, &self.script_pub_key);
    }
}

impl Decodable for UtxoEntry {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let block_blue_score = r.read_u64()?;
        let flags = r.read_u8()?;
        let amount = r.read_u64()?;
        let script_pub_key = r.read_var_bytes()?;
        Ok(UtxoEntry { amount, script_pub_key, block_blue_score, is_coinbase: flags & FLAG_COINBASE != 0 })
    }
}

/// Outpoint as stored: tx id || vlq(index).
pub fn encode_outpoint(outpoint: &OutPoint, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&outpoint.tx_id.0);
    write_vlq(buf, outpoint.index as u64);
}

pub fn decode_outpoint(r: &mut Reader<'_>) -> Result<OutPoint, CodecError> {
    let tx_id = r.read_hash()?;
    let index = r.read_vlq()?;
    let index = u32::try_from(index).map_err(|_| CodecError::Invalid(format!("outpoint index {index} overflows")))?;
    Ok(OutPoint { tx_id, index })
}

pub fn outpoint_key(outpoint: &OutPoint) -> Vec<u8> {
    let mut buf = Vec::with_capacity(40);
    encode_outpoint(outpoint, &mut buf);
    buf
}

/// The multiset element committing to one unspent output.
pub fn multiset_element(outpoint: &OutPoint, entry: &UtxoEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64 + entry.script_pub_key.len());
    encode_outpoint(outpoint, &mut buf);
    entry.encode(&mut buf);
    buf
}

pub type UtxoCollection = HashMap<OutPoint, UtxoEntry>;

/// Operations shared by full and layered sets.
pub trait UtxoSet {
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry>;

    fn contains(&self, outpoint: &OutPoint) -> bool {
        self.get(outpoint).is_some()
    }

    /// Spend the inputs of `tx` and add its outputs at `blue_score`.
    /// `Ok(false)` when an input is missing; nothing is changed then.
    fn add_tx(&mut self, tx: &Transaction, blue_score: u64) -> Result<bool, UtxoError>;

    /// This set with `diff` applied on top.
    fn with_diff(&self, diff: &UtxoDiff) -> Result<DiffUtxoSet<'_>, UtxoError>;

    /// The diff that turns this set into `other`. Both must share a base.
    fn diff_from(&self, other: &DiffUtxoSet<'_>) -> Result<UtxoDiff, UtxoError>;
}

// ─── Full set ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullUtxoSet {
    entries: UtxoCollection,
}

impl FullUtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_collection(entries: UtxoCollection) -> Self {
        FullUtxoSet { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UtxoEntry)> {
        self.entries.iter()
    }

    pub fn insert(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.entries.insert(outpoint, entry);
    }

    pub fn remove(&mut self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.entries.remove(outpoint)
    }

    /// Apply `diff` in place. Every removed outpoint must be present.
    pub fn meld(&mut self, diff: &UtxoDiff) -> Result<(), UtxoError> {
        for outpoint in diff.to_remove.keys() {
            if self.entries.remove(outpoint).is_none() {
                return Err(UtxoError::Missing(*outpoint));
            }
        }
        for (outpoint, entry) in &diff.to_add {
            self.entries.insert(*outpoint, entry.clone());
        }
        Ok(())
    }

    /// Multiset over every entry.
    pub fn multiset(&self) -> Multiset {
        let mut ms = Multiset::new();
        for (outpoint, entry) in &self.entries {
            ms.add_element(&multiset_element(outpoint, entry));
        }
        ms
    }
}

impl UtxoSet for FullUtxoSet {
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.entries.get(outpoint).cloned()
    }

    fn contains(&self, outpoint: &OutPoint) -> bool {
        self.entries.contains_key(outpoint)
    }

    fn add_tx(&mut self, tx: &Transaction, blue_score: u64) -> Result<bool, UtxoError> {
        if !tx.inputs.iter().all(|i| self.entries.contains_key(&i.previous_outpoint)) {
            return Ok(false);
        }
        for input in &tx.inputs {
            self.entries.remove(&input.previous_outpoint);
        }
        let tx_id = tx.id();
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(tx_id, index as u32);
            if self.entries.contains_key(&outpoint) {
                return Err(UtxoError::Duplicate(outpoint));
            }
            let entry = UtxoEntry::new(output.value, output.script_pub_key.clone(), blue_score, tx.is_coinbase());
            self.entries.insert(outpoint, entry);
        }
        Ok(true)
    }

    fn with_diff(&self, diff: &UtxoDiff) -> Result<DiffUtxoSet<'_>, UtxoError> {
        Ok(DiffUtxoSet { base: self, diff: diff.clone() })
    }

    fn diff_from(&self, other: &DiffUtxoSet<'_>) -> Result<UtxoDiff, UtxoError> {
        if !std::ptr::eq(self, other.base) {
            return Err(UtxoError::BaseMismatch);
        }
        Ok(other.diff.clone())
    }
}

// ─── Layered set ─────────────────────────────────────────────────────

/// A full set seen through a diff.
#[derive(Debug, Clone)]
pub struct DiffUtxoSet<'a> {
    base: &'a FullUtxoSet,
    diff: UtxoDiff,
}

impl<'a> DiffUtxoSet<'a> {
    pub fn new(base: &'a FullUtxoSet, diff: UtxoDiff) -> Self {
        DiffUtxoSet { base, diff }
    }

    pub fn base(&self) -> &'a FullUtxoSet {
        self.base
    }

    pub fn diff(&self) -> &UtxoDiff {
        &self.diff
    }

    pub fn into_diff(self) -> UtxoDiff {
        self.diff
    }

    fn same_base(&self, other: &DiffUtxoSet<'_>) -> bool {
        std::ptr::eq(self.base, other.base)
    }
}

impl UtxoSet for DiffUtxoSet<'_> {
    fn get(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        if let Some(entry) = self.diff.to_add.get(outpoint) {
            return Some(entry.clone());
        }
        if self.diff.to_remove.contains_key(outpoint) {
            return None;
        }
        self.base.get(outpoint)
    }

    fn add_tx(&mut self, tx: &Transaction, blue_score: u64) -> Result<bool, UtxoError> {
        let mut spent = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            match self.get(&input.previous_outpoint) {
                Some(entry) => spent.push((input.previous_outpoint, entry)),
                None => return Ok(false),
            }
        }

        for (outpoint, entry) in spent {
            self.diff.remove_entry(outpoint, entry)?;
        }
        let tx_id = tx.id();
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(tx_id, index as u32);
            if self.contains(&outpoint) {
                return Err(UtxoError::Duplicate(outpoint));
            }
            let entry = UtxoEntry::new(output.value, output.script_pub_key.clone(), blue_score, tx.is_coinbase());
            self.diff.add_entry(outpoint, entry)?;
        }
        Ok(true)
    }

    fn with_diff(&self, diff: &UtxoDiff) -> Result<DiffUtxoSet<'_>, UtxoError> {
        Ok(DiffUtxoSet { base: self.base, diff: self.diff.with_diff(diff)? })
    }

    fn diff_from(&self, other: &DiffUtxoSet<'_>) -> Result<UtxoDiff, UtxoError> {
        if !self.same_base(other) {
            return Err(UtxoError::BaseMismatch);
        }
        self.diff.diff_from(&other.diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::Hash;
    use crate::core::types::{TxInput, TxOutput};

    fn op(n: u8, index: u32) -> OutPoint {
        OutPoint::new(Hash([n; 32]), index)
    }

    fn entry(amount: u64, blue_score: u64) -> UtxoEntry {
        UtxoEntry::new(amount, vec![0x51], blue_score, false)
    }

    fn spend(outpoints: &[OutPoint], values: &[u64]) -> Transaction {
        Transaction::new_native(
            outpoints
                .iter()
                .map(|o| TxInput { previous_outpoint: *o, signature_script: vec![], sequence: u64::MAX })
                .collect(),
            values.iter().map(|v| TxOutput { value: *v, script_pub_key: vec![0x51] }).collect(),
            0,
        )
    }

    #[test]
    fn test_entry_layout() {
        let e = UtxoEntry::new(5, vec![0xaa], 7, true);
        let bytes = e.to_bytes();
        assert_eq!(&bytes[..8], &7u64.to_le_bytes());
        assert_eq!(bytes[8], FLAG_COINBASE);
        assert_eq!(&bytes[9..17], &5u64.to_le_bytes());
        assert_eq!(&bytes[17..], &[1, 0xaa]);
        assert_eq!(UtxoEntry::from_bytes(&bytes).unwrap(), e);
    }

    #[test]
    fn test_full_add_tx_missing_input() {
        let mut set = FullUtxoSet::new();
        set.insert(op(1, 0), entry(10, 0));
        let tx = spend(&[op(1, 0), op(2, 0)], &[5]);
        assert!(!set.add_tx(&tx, 3).unwrap());
        assert!(set.contains(&op(1, 0)));

        let tx = spend(&[op(1, 0)], &[5]);
        assert!(set.add_tx(&tx, 3).unwrap());
        assert!(!set.contains(&op(1, 0)));
        assert_eq!(set.get(&OutPoint::new(tx.id(), 0)).unwrap().block_blue_score, 3);
    }

    #[test]
    fn test_diff_set_layers_over_base() {
        let mut base = FullUtxoSet::new();
        base.insert(op(1, 0), entry(10, 0));
        base.insert(op(2, 0), entry(20, 0));

        let mut layered = DiffUtxoSet::new(&base, UtxoDiff::new());
        let tx = spend(&[op(1, 0)], &[4, 6]);
        assert!(layered.add_tx(&tx, 5).unwrap());

        assert!(layered.get(&op(1, 0)).is_none());
        assert!(layered.get(&op(2, 0)).is_some());
        assert_eq!(layered.get(&OutPoint::new(tx.id(), 1)).unwrap().amount, 6);
        // base untouched until meld
        assert!(base.contains(&op(1, 0)));

        let diff = layered.into_diff();
        let mut melded = base.clone();
        melded.meld(&diff).unwrap();
        assert_eq!(melded.len(), 3);
        assert!(!melded.contains(&op(1, 0)));
    }

    #[test]
    fn test_add_tx_rejects_existing_output() {
        let tx = spend(&[op(1, 0)], &[1]);
        let mut base = FullUtxoSet::new();
        base.insert(op(1, 0), entry(1, 0));
        base.insert(OutPoint::new(tx.id(), 0), entry(1, 0));
        let mut layered = DiffUtxoSet::new(&base, UtxoDiff::new());
        assert!(matches!(layered.add_tx(&tx, 1), Err(UtxoError::Duplicate(_))));
    }

    #[test]
    fn test_meld_requires_removed_outpoints() {
        let mut base = FullUtxoSet::new();
        let mut diff = UtxoDiff::new();
        diff.remove_entry(op(9, 0), entry(1, 0)).unwrap();
        assert!(matches!(base.meld(&diff), Err(UtxoError::Missing(_))));
    }

    #[test]
    fn test_diff_from_between_layers() {
        let mut base = FullUtxoSet::new();
        base.insert(op(1, 0), entry(10, 0));

        let before = DiffUtxoSet::new(&base, UtxoDiff::new());
        let mut after = before.clone();
        let tx = spend(&[op(1, 0)], &[9]);
        assert!(after.add_tx(&tx, 2).unwrap());

        let delta = before.diff_from(&after).unwrap();
        let rebuilt = before.with_diff(&delta).unwrap();
        assert_eq!(rebuilt.diff(), after.diff());

        let other_base = FullUtxoSet::new();
        let foreign = DiffUtxoSet::new(&other_base, UtxoDiff::new());
        assert!(matches!(before.diff_from(&foreign), Err(UtxoError::BaseMismatch)));
    }

    #[test]
    fn test_full_set_multiset_matches_incremental() {
        let mut set = FullUtxoSet::new();
        set.insert(op(1, 0), entry(10, 0));
        set.insert(op(2, 3), entry(20, 4));

        let mut ms = Multiset::new();
        ms.add_element(&multiset_element(&op(2, 3), &entry(20, 4)));
        ms.add_element(&multiset_element(&op(1, 0), &entry(10, 0)));
        assert_eq!(set.multiset(), ms);
    }
}
