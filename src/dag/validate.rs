//! Stateless block checks. Everything here looks at the block alone plus the
//! clock; nothing reads the DAG.

use std::collections::HashSet;

use super::subnetworks::REGISTRY_PAYLOAD_LEN;
use super::{BehaviorFlags, DagCore};
use crate::core::hash::SubnetworkId;
use crate::core::params::{
    MAX_COINBASE_PAYLOAD_LEN, MAX_MASS_PER_BLOCK, MAX_SIG_OPS_PER_BLOCK, MAX_SOMPI, MIN_BLOCK_VERSION,
};
use crate::core::types::{Block, BlockHeader, Transaction};
use crate::crypto::double_sha256;
use crate::error::{ErrorCode, RuleError};
use crate::pow::{self, PowError};

fn rule(code: ErrorCode, message: impl Into<String>) -> RuleError {
    RuleError::new(code, message)
}

impl DagCore {
    /// Run every sanity check. Returns how many milliseconds the block lies
    /// beyond the allowed future drift; zero means it may be processed now.
    pub(super) fn check_block_sanity(&self, block: &Block, flags: BehaviorFlags) -> Result<i64, RuleError> {
        let delay = self.check_header_sanity(&block.header, flags)?;

        let transactions = &block.transactions;
        let Some(first) = transactions.first() else {
            return Err(rule(ErrorCode::NoTransactions, "block does not contain any transactions"));
        };
        if !first.is_coinbase() {
            return Err(rule(ErrorCode::FirstTxNotCoinbase, "first transaction is not a coinbase"));
        }
        if let Some(i) = transactions.iter().skip(1).position(|tx| tx.is_coinbase()) {
            return Err(rule(ErrorCode::MultipleCoinbases, format!("transaction {} is a second coinbase", i + 1)));
        }

        // after the coinbase, ordered by subnetwork
        for pair in transactions[1..].windows(2) {
            if pair[1].subnetwork_id < pair[0].subnetwork_id {
                return Err(rule(ErrorCode::TransactionsNotSorted, "transactions are not ordered by subnetwork"));
            }
        }

        for tx in transactions {
            check_transaction_sanity(tx, self.local_subnetwork_id.as_ref())?;
            if !self.params.enable_non_native_subnetworks
                && !tx.subnetwork_id.is_native()
                && tx.subnetwork_id != SubnetworkId::COINBASE
            {
                return Err(rule(
                    ErrorCode::InvalidSubnetwork,
                    format!("transaction {} uses subnetwork {} while only native is enabled", tx.id(), tx.subnetwork_id),
                ));
            }
        }

        if !block.validate_hash_merkle_root() {
            return Err(rule(
                ErrorCode::BadMerkleRoot,
                format!(
                    "hash merkle root {} does not match computed {}",
                    block.header.hash_merkle_root,
                    block.compute_hash_merkle_root()
                ),
            ));
        }

        let mut ids = HashSet::with_capacity(transactions.len());
        for tx in transactions {
            let id = tx.id();
            if !ids.insert(id) {
                return Err(rule(ErrorCode::DuplicateTx, format!("block contains duplicate transaction {id}")));
            }
        }

        let sig_ops: u64 = transactions.iter().map(|tx| tx.sig_op_count()).sum();
        if sig_ops > MAX_SIG_OPS_PER_BLOCK {
            return Err(rule(
                ErrorCode::TooManySigOps,
                format!("block has {sig_ops} signature operations, max {MAX_SIG_OPS_PER_BLOCK}"),
            ));
        }

        let mut spent = HashSet::new();
        for tx in transactions {
            for input in &tx.inputs {
                if !spent.insert(input.previous_outpoint) {
                    return Err(rule(
                        ErrorCode::DoubleSpendInSameBlock,
                        format!("outpoint {} is spent twice in the block", input.previous_outpoint),
                    ));
                }
            }
        }

        let mut mass = 0u64;
        for tx in transactions {
            mass = mass.saturating_add(tx.mass());
            if mass > MAX_MASS_PER_BLOCK {
                return Err(rule(
                    ErrorCode::BlockMassTooHigh,
                    format!("block mass exceeds {MAX_MASS_PER_BLOCK}"),
                ));
            }
        }

        Ok(delay)
    }

    fn check_header_sanity(&self, header: &BlockHeader, flags: BehaviorFlags) -> Result<i64, RuleError> {
        if header.version < MIN_BLOCK_VERSION {
            return Err(rule(
                ErrorCode::BlockVersionTooOld,
                format!("block version {} is below {MIN_BLOCK_VERSION}", header.version),
            ));
        }

        let skip_hash = flags.contains(BehaviorFlags::NO_POW_CHECK) || self.params.skip_proof_of_work;
        pow::check_proof_of_work(header, &self.params.pow_max(), skip_hash).map_err(|e| match e {
            PowError::NonPositiveTarget(_) => rule(ErrorCode::UnexpectedDifficulty, e.to_string()),
            PowError::TargetAboveMax(_) => rule(ErrorCode::DifficultyTooLow, e.to_string()),
            PowError::HighHash { .. } => rule(ErrorCode::HighHash, e.to_string()),
        })?;

        if header.parent_hashes.is_empty() {
            if header.hash() != self.genesis_hash {
                return Err(rule(ErrorCode::NoParents, "block has no parents"));
            }
        } else if header.parent_hashes.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(rule(ErrorCode::WrongParentsOrder, "parents are not sorted or repeat"));
        }

        let max_timestamp = self.time_source.now_ms().saturating_add(self.params.max_timestamp_drift_ms());
        Ok(header.timestamp.saturating_sub(max_timestamp).max(0))
    }
}

/// Checks of a transaction that need nothing but the transaction.
pub fn check_transaction_sanity(tx: &Transaction, local_subnetwork: Option<&SubnetworkId>) -> Result<(), RuleError> {
    let is_coinbase = tx.is_coinbase();
    if tx.inputs.is_empty() && !is_coinbase {
        return Err(rule(ErrorCode::NoTxInputs, format!("transaction {} has no inputs", tx.id())));
    }
    if is_coinbase && !tx.inputs.is_empty() {
        return Err(rule(ErrorCode::BadCoinbaseTransaction, "coinbase has inputs"));
    }

    let mass = tx.mass();
    if mass > MAX_MASS_PER_BLOCK {
        return Err(rule(
            ErrorCode::TxMassTooHigh,
            format!("transaction {} has mass {mass}, max {MAX_MASS_PER_BLOCK}", tx.id()),
        ));
    }

    let mut total = 0u64;
    for output in &tx.outputs {
        if output.value > MAX_SOMPI {
            return Err(rule(ErrorCode::BadTxOutValue, format!("output value {} exceeds {MAX_SOMPI}", output.value)));
        }
        total = match total.checked_add(output.value) {
            Some(sum) if sum <= MAX_SOMPI => sum,
            _ => return Err(rule(ErrorCode::BadTxOutValue, format!("total output of {} exceeds {MAX_SOMPI}", tx.id()))),
        };
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.previous_outpoint) {
            return Err(rule(
                ErrorCode::DuplicateTxInputs,
                format!("transaction {} spends {} twice", tx.id(), input.previous_outpoint),
            ));
        }
    }

    if is_coinbase && tx.payload.len() > MAX_COINBASE_PAYLOAD_LEN {
        return Err(rule(
            ErrorCode::BadCoinbasePayloadLen,
            format!("coinbase payload is {} bytes, max {MAX_COINBASE_PAYLOAD_LEN}", tx.payload.len()),
        ));
    }

    let subnetwork = &tx.subnetwork_id;
    if subnetwork.is_builtin() && tx.gas > 0 {
        return Err(rule(ErrorCode::InvalidGas, format!("builtin subnetwork transaction {} has gas", tx.id())));
    }
    if *subnetwork == SubnetworkId::REGISTRY && tx.payload.len() != REGISTRY_PAYLOAD_LEN {
        return Err(rule(
            ErrorCode::InvalidPayload,
            format!("registry payload is {} bytes, expected {REGISTRY_PAYLOAD_LEN}", tx.payload.len()),
        ));
    }
    if subnetwork.is_native() && !tx.payload.is_empty() {
        return Err(rule(ErrorCode::InvalidPayload, "native transaction has a payload"));
    }
    // partial nodes only keep payloads of their own subnetwork
    if let Some(local) = local_subnetwork {
        if !subnetwork.is_builtin() && subnetwork != local && !tx.payload.is_empty() {
            return Err(rule(
                ErrorCode::InvalidPayload,
                format!("transaction {} of foreign subnetwork {subnetwork} carries a payload", tx.id()),
            ));
        }
    }

    if !subnetwork.is_native() {
        let expected = double_sha256(&tx.payload);
        if tx.payload_hash != Some(expected) {
            return Err(rule(ErrorCode::InvalidPayloadHash, format!("payload hash of {} does not match", tx.id())));
        }
    } else if tx.payload_hash.is_some() {
        return Err(rule(ErrorCode::InvalidPayloadHash, "native transaction carries a payload hash"));
    }

    Ok(())
}
