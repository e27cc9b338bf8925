//! Absolute lock times and relative sequence locks.

use super::DagCore;
use crate::core::hash::Hash;
use crate::core::params::{
    LOCK_TIME_THRESHOLD, MAX_TX_IN_SEQUENCE_NUM, SEQUENCE_LOCK_TIME_DISABLED, SEQUENCE_LOCK_TIME_GRANULARITY,
    SEQUENCE_LOCK_TIME_IS_SECONDS, SEQUENCE_LOCK_TIME_MASK,
};
use crate::core::types::Transaction;
use crate::error::DagError;
use crate::utxo::{DiffUtxoSet, UtxoSet};

/// Whether `tx` may be included at `blue_score` / `block_time_ms`.
///
/// Lock times below the threshold are blue scores, the rest are milliseconds.
/// Inputs that all carry the max sequence make any lock time final.
pub fn is_finalized_transaction(tx: &Transaction, blue_score: u64, block_time_ms: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let limit = if tx.lock_time < LOCK_TIME_THRESHOLD { blue_score as i128 } else { block_time_ms as i128 };
    if (tx.lock_time as i128) < limit {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == MAX_TX_IN_SEQUENCE_NUM)
}

/// Earliest median time and blue score, exclusive, at which a transaction's
/// relative locks are satisfied. -1 means no lock of that kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLock {
    pub milliseconds: i64,
    pub blue_score: i64,
}

impl SequenceLock {
    pub fn none() -> Self {
        SequenceLock { milliseconds: -1, blue_score: -1 }
    }

    pub fn is_active(&self, block_blue_score: u64, median_time_ms: i64) -> bool {
        self.milliseconds < median_time_ms && self.blue_score < block_blue_score as i64
    }
}

impl DagCore {
    /// Sequence lock of `tx` spending outputs of `past`, evaluated for the
    /// block `node`.
    pub(super) fn calc_sequence_lock(
        &self,
        node: &Hash,
        tx: &Transaction,
        past: &DiffUtxoSet<'_>,
    ) -> Result<SequenceLock, DagError> {
        let mut lock = SequenceLock::none();
        if tx.is_coinbase() {
            return Ok(lock);
        }

        for input in &tx.inputs {
            let sequence = input.sequence;
            if sequence & SEQUENCE_LOCK_TIME_DISABLED != 0 {
                continue;
            }
            let entry = past.get(&input.previous_outpoint).ok_or_else(|| {
                DagError::Assert(format!("sequence lock of missing outpoint {}", input.previous_outpoint))
            })?;
            let input_blue_score =
                if entry.is_unaccepted() { self.virtual_block.blue_score() } else { entry.block_blue_score };
            let relative = (sequence & SEQUENCE_LOCK_TIME_MASK) as i64;

            if sequence & SEQUENCE_LOCK_TIME_IS_SECONDS != 0 {
                // median time of the first chain block at or below the input's score
                let mut current = self.node(node)?;
                while let Some(selected_parent) = current.selected_parent() {
                    let parent = self.node(&selected_parent)?;
                    if parent.blue_score() <= input_blue_score {
                        break;
                    }
                    current = parent;
                }
                let median = self.past_median_time(&current.ghostdag)?;
                let time_lock = median + ((relative << SEQUENCE_LOCK_TIME_GRANULARITY) - 1);
                lock.milliseconds = lock.milliseconds.max(time_lock);
            } else {
                let score_lock = input_blue_score as i64 + relative - 1;
                lock.blue_score = lock.blue_score.max(score_lock);
            }
        }
        Ok(lock)
    }
}
