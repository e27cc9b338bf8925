//! Past UTXO of a block and which of its blues' transactions it accepts.
//!
//! The selected parent's past UTXO is restored from the diff store, then the
//! blues are replayed in order. The selected parent's coinbase is accepted;
//! every other blue's coinbase is not. A non-coinbase transaction is accepted
//! exactly when all of its inputs are present at that point of the replay.

use super::block_node::GhostdagData;
use super::DagCore;
use crate::core::hash::Hash;
use crate::core::types::{merkle_root, OutPoint, Transaction};
use crate::crypto::multiset::Multiset;
use crate::error::DagError;
use crate::utxo::{multiset_element, UtxoDiff, UtxoEntry, UtxoSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAcceptanceData {
    pub tx: Transaction,
    pub is_accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTxsAcceptanceData {
    pub block_hash: Hash,
    pub tx_acceptance_data: Vec<TxAcceptanceData>,
}

/// One entry per blue, in blue order.
pub type MultiBlockTxsAcceptanceData = Vec<BlockTxsAcceptanceData>;

pub fn find_acceptance_data<'a>(
    acceptance: &'a MultiBlockTxsAcceptanceData,
    block_hash: &Hash,
) -> Option<&'a BlockTxsAcceptanceData> {
    acceptance.iter().find(|a| a.block_hash == *block_hash)
}

/// Merkle root over the ids of every accepted transaction, sorted by id.
pub fn accepted_id_merkle_root(acceptance: &MultiBlockTxsAcceptanceData) -> Hash {
    let mut ids: Vec<Hash> = acceptance
        .iter()
        .flat_map(|block| block.tx_acceptance_data.iter())
        .filter(|data| data.is_accepted)
        .map(|data| data.tx.id())
        .collect();
    ids.sort();
    merkle_root(&ids)
}

/// A block's past UTXO, as a diff over the virtual block's full set.
#[derive(Debug, Clone)]
pub struct PastUtxo {
    pub diff: UtxoDiff,
    pub acceptance: MultiBlockTxsAcceptanceData,
    pub multiset: Multiset,
}

impl DagCore {
    pub(super) fn past_utxo(&self, ghostdag: &GhostdagData) -> Result<PastUtxo, DagError> {
        let Some(selected_parent) = ghostdag.selected_parent else {
            // genesis: nothing precedes it
            let mut diff = UtxoDiff::new();
            for (outpoint, entry) in self.virtual_utxo.iter() {
                diff.remove_entry(*outpoint, entry.clone())?;
            }
            return Ok(PastUtxo { diff, acceptance: Vec::new(), multiset: Multiset::new() });
        };

        let mut utxo = self.diff_store.restore_utxo(&selected_parent, &self.virtual_utxo)?;
        let mut multiset = self
            .multiset_store
            .get(&selected_parent)
            .ok_or_else(|| DagError::Assert(format!("no multiset for block {selected_parent}")))?;

        let mut acceptance = Vec::with_capacity(ghostdag.blues.len());
        for (i, blue) in ghostdag.blues.iter().enumerate() {
            let block = self.storage.get_block(blue)?.ok_or(DagError::UnknownBlock(*blue))?;
            let is_selected_parent = i == 0;

            let mut tx_acceptance_data = Vec::with_capacity(block.transactions.len());
            for tx in block.transactions {
                let is_accepted = if tx.is_coinbase() && !is_selected_parent {
                    false
                } else {
                    let spent: Option<Vec<(OutPoint, UtxoEntry)>> = tx
                        .inputs
                        .iter()
                        .map(|input| utxo.get(&input.previous_outpoint).map(|e| (input.previous_outpoint, e)))
                        .collect();
                    match spent {
                        Some(spent) if utxo.add_tx(&tx, ghostdag.blue_score)? => {
                            apply_to_multiset(&mut multiset, &tx, &spent, ghostdag.blue_score);
                            true
                        }
                        _ => false,
                    }
                };
                tx_acceptance_data.push(TxAcceptanceData { tx, is_accepted });
            }
            acceptance.push(BlockTxsAcceptanceData { block_hash: *blue, tx_acceptance_data });
        }

        Ok(PastUtxo { diff: utxo.into_diff(), acceptance, multiset })
    }
}

fn apply_to_multiset(multiset: &mut Multiset, tx: &Transaction, spent: &[(OutPoint, UtxoEntry)], blue_score: u64) {
    for (outpoint, entry) in spent {
        multiset.remove_element(&multiset_element(outpoint, entry));
    }
    let tx_id = tx.id();
    for (index, output) in tx.outputs.iter().enumerate() {
        let outpoint = OutPoint::new(tx_id, index as u32);
        let entry = UtxoEntry::new(output.value, output.script_pub_key.clone(), blue_score, tx.is_coinbase());
        multiset.add_element(&multiset_element(&outpoint, &entry));
    }
}
