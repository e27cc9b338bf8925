//! Connecting a block: everything after its node is in the index, up to and
//! including the commit that makes it part of the virtual UTXO.

use std::collections::{HashMap, HashSet, VecDeque};

use super::acceptance::{accepted_id_merkle_root, MultiBlockTxsAcceptanceData, PastUtxo};
use super::block_node::{BlockStatus, GhostdagData};
use super::state::DagState;
use super::virtual_block::ChainUpdates;
use super::DagCore;
use crate::core::codec::{CompactFeeData, Encodable};
use crate::core::hash::{Hash, SubnetworkId};
use crate::core::params::MAX_SOMPI;
use crate::core::script::{verify_scripts_parallel, ScriptError, ScriptFlags, ScriptJob};
use crate::core::types::{Block, OutPoint, Transaction};
use crate::error::{rule_error, DagError, ErrorCode};
use crate::storage::Bucket;
use crate::utxo::{outpoint_key, DiffUtxoSet, UtxoDiff, UtxoSet};

impl DagCore {
    /// Validate `block` against its past and, if it passes, apply it to the
    /// DAG and persist the result in one commit.
    pub(super) fn connect_block(
        &mut self,
        hash: &Hash,
        block: &Block,
        anticone: &[Hash],
        fast_add: bool,
    ) -> Result<ChainUpdates, DagError> {
        let node = self.node(hash)?;
        let ghostdag = node.ghostdag.clone();
        let is_genesis = node.is_genesis();

        if !is_genesis {
            self.check_finality_violation(&ghostdag)?;
        }
        self.validate_gas_limits(block)?;

        let mut past = self.past_utxo(&ghostdag)?;

        if !is_genesis {
            let expected = accepted_id_merkle_root(&past.acceptance);
            if block.header.accepted_id_merkle_root != expected {
                return rule_error(
                    ErrorCode::BadMerkleRoot,
                    format!(
                        "accepted id merkle root {} does not match computed {}",
                        block.header.accepted_id_merkle_root, expected
                    ),
                );
            }
        }

        let past_set = DiffUtxoSet::new(&self.virtual_utxo, past.diff);
        let fee_data = self.check_connect_to_past_utxo(hash, &ghostdag, &past_set, &block.transactions, fast_add);
        past.diff = past_set.into_diff();
        let fee_data = fee_data?;

        let commitment = past.multiset.hash();
        if block.header.utxo_commitment != commitment {
            return rule_error(
                ErrorCode::BadUTXOCommitment,
                format!("utxo commitment {} does not match computed {}", block.header.utxo_commitment, commitment),
            );
        }

        if !is_genesis {
            self.validate_coinbase(block, &ghostdag, &past.acceptance)?;
        }

        let (updates, virtual_diff) = match self.apply_dag_changes(hash, &ghostdag, &past, anticone) {
            Ok(applied) => applied,
            Err(e) => {
                self.corrupted = true;
                tracing::error!("❌ Applying block {} to the DAG failed: {}", hash.short(), e);
                panic!("DAG state is undefined after a failed apply of block {hash}: {e}");
            }
        };

        if let Err(e) = self.save_changes(hash, block, &virtual_diff, &past.acceptance, &fee_data) {
            self.corrupted = true;
            tracing::error!("❌ Commit of block {} failed: {}", hash.short(), e);
            return Err(e);
        }
        Ok(updates)
    }

    // ─── Pre-connect checks ──────────────────────────────────────────

    /// The last finality point must stay on the block's selected-parent chain.
    fn check_finality_violation(&self, ghostdag: &GhostdagData) -> Result<(), DagError> {
        let (Some(finality_point), Some(selected_parent)) = (self.last_finality_point, ghostdag.selected_parent) else {
            return Ok(());
        };
        if selected_parent == finality_point {
            return Ok(());
        }

        let finality_score = self.node(&finality_point)?.blue_score();
        let mut current = self.node(&selected_parent)?;
        loop {
            if current.hash == finality_point {
                return Ok(());
            }
            if current.blue_score() <= finality_score {
                break;
            }
            match current.selected_parent() {
                Some(parent) => current = self.node(&parent)?,
                None => break,
            }
        }
        rule_error(
            ErrorCode::Finality,
            format!("finality point {} is not in the selected parent chain", finality_point.short()),
        )
    }

    fn validate_gas_limits(&self, block: &Block) -> Result<(), DagError> {
        let mut used: HashMap<SubnetworkId, u64> = HashMap::new();
        for tx in block.transactions.iter().filter(|tx| !tx.subnetwork_id.is_builtin()) {
            let Some(limit) = self.subnetworks.gas_limit(&tx.subnetwork_id) else {
                return rule_error(
                    ErrorCode::InvalidSubnetwork,
                    format!("transaction {} uses unknown subnetwork {}", tx.id(), tx.subnetwork_id),
                );
            };
            let total = used.entry(tx.subnetwork_id).or_default();
            *total = match total.checked_add(tx.gas) {
                Some(sum) => sum,
                None => return rule_error(ErrorCode::InvalidGas, format!("gas overflow in subnetwork {}", tx.subnetwork_id)),
            };
            if *total > limit {
                return rule_error(
                    ErrorCode::InvalidGas,
                    format!("subnetwork {} uses {} gas, limit {}", tx.subnetwork_id, total, limit),
                );
            }
        }
        Ok(())
    }

    /// Input and script checks against the block's past. Returns the fee of
    /// each transaction in block order.
    fn check_connect_to_past_utxo(
        &self,
        hash: &Hash,
        ghostdag: &GhostdagData,
        past: &DiffUtxoSet<'_>,
        transactions: &[Transaction],
        fast_add: bool,
    ) -> Result<CompactFeeData, DagError> {
        if !fast_add {
            for tx in transactions {
                let tx_id = tx.id();
                for index in 0..tx.outputs.len() {
                    let outpoint = OutPoint::new(tx_id, index as u32);
                    if past.contains(&outpoint) {
                        return rule_error(ErrorCode::OverwriteTx, format!("transaction {tx_id} overwrites unspent {outpoint}"));
                    }
                }
            }
            for tx in transactions.iter().filter(|tx| !tx.is_coinbase()) {
                for input in &tx.inputs {
                    if !past.contains(&input.previous_outpoint) {
                        return rule_error(
                            ErrorCode::MissingTxOut,
                            format!("output {} spent by {} is not in the past utxo", input.previous_outpoint, tx.id()),
                        );
                    }
                }
            }
        }

        let mut fees = Vec::with_capacity(transactions.len());
        let mut total_fees = 0u64;
        for tx in transactions {
            let fee = self.check_inputs_and_calculate_fee(tx, ghostdag.blue_score, past, fast_add)?;
            total_fees = match total_fees.checked_add(fee) {
                Some(sum) => sum,
                None => return rule_error(ErrorCode::BadFees, "total fees overflow"),
            };
            fees.push(fee);
        }

        if !fast_add {
            let median_time = self.past_median_time(ghostdag)?;
            for tx in transactions {
                let lock = self.calc_sequence_lock(hash, tx, past)?;
                if !lock.is_active(ghostdag.blue_score, median_time) {
                    return rule_error(
                        ErrorCode::UnfinalizedTx,
                        format!("sequence locks of transaction {} are not met", tx.id()),
                    );
                }
            }
            self.check_block_scripts(transactions, past)?;
        }

        Ok(CompactFeeData::from_fees(&fees))
    }

    fn check_inputs_and_calculate_fee(
        &self,
        tx: &Transaction,
        blue_score: u64,
        past: &DiffUtxoSet<'_>,
        fast_add: bool,
    ) -> Result<u64, DagError> {
        if tx.is_coinbase() {
            return Ok(0);
        }

        let mut total_in = 0u64;
        for input in &tx.inputs {
            let Some(entry) = past.get(&input.previous_outpoint) else {
                return rule_error(
                    ErrorCode::MissingTxOut,
                    format!("output {} spent by {} is not in the past utxo", input.previous_outpoint, tx.id()),
                );
            };

            if !fast_add && entry.is_coinbase {
                let maturity = self.params.block_coinbase_maturity;
                if entry.block_blue_score > blue_score || blue_score - entry.block_blue_score < maturity {
                    return rule_error(
                        ErrorCode::ImmatureSpend,
                        format!(
                            "coinbase output {} from blue score {} spent at {}, maturity {}",
                            input.previous_outpoint, entry.block_blue_score, blue_score, maturity
                        ),
                    );
                }
            }

            if entry.amount > MAX_SOMPI {
                return rule_error(ErrorCode::BadTxOutValue, format!("input amount {} exceeds {MAX_SOMPI}", entry.amount));
            }
            total_in = match total_in.checked_add(entry.amount) {
                Some(sum) if sum <= MAX_SOMPI => sum,
                _ => return rule_error(ErrorCode::BadTxOutValue, format!("total input of {} exceeds {MAX_SOMPI}", tx.id())),
            };
        }

        let total_out = tx.total_output().unwrap_or(u64::MAX);
        if total_in < total_out {
            return rule_error(
                ErrorCode::SpendTooHigh,
                format!("transaction {} spends {} but only has {}", tx.id(), total_out, total_in),
            );
        }
        Ok(total_in - total_out)
    }

    fn check_block_scripts(&self, transactions: &[Transaction], past: &DiffUtxoSet<'_>) -> Result<(), DagError> {
        let mut spent = Vec::new();
        for tx in transactions.iter().filter(|tx| !tx.is_coinbase()) {
            for (index, input) in tx.inputs.iter().enumerate() {
                let entry = past.get(&input.previous_outpoint).ok_or_else(|| {
                    DagError::Assert(format!("script check of missing outpoint {}", input.previous_outpoint))
                })?;
                spent.push((tx, index, entry.script_pub_key));
            }
        }
        let jobs: Vec<ScriptJob<'_>> = spent
            .iter()
            .map(|(tx, index, script)| ScriptJob { tx, input_index: *index, prev_script_pub_key: script })
            .collect();

        verify_scripts_parallel(
            &jobs,
            self.script_verifier.as_ref(),
            ScriptFlags::NONE,
            self.sig_cache.as_deref(),
            self.script_threads,
        )
        .or_else(|failure| {
            let message = format!("input {} of {}: {}", failure.input_index, failure.tx_id, failure.error);
            match failure.error {
                ScriptError::Malformed(_) => rule_error(ErrorCode::ScriptMalformed, message),
                ScriptError::Failed(_) => rule_error(ErrorCode::ScriptValidation, message),
            }
        })
    }

    // ─── Apply ───────────────────────────────────────────────────────

    /// Mutate every in-memory structure for a validated block. Returns the
    /// chain changes and the diff melded into the virtual UTXO.
    fn apply_dag_changes(
        &mut self,
        hash: &Hash,
        ghostdag: &GhostdagData,
        past: &PastUtxo,
        anticone: &[Hash],
    ) -> Result<(ChainUpdates, UtxoDiff), DagError> {
        match ghostdag.selected_parent {
            Some(selected_parent) => self.reachability.add_block(*hash, selected_parent, anticone)?,
            None => self.reachability.add_genesis(*hash)?,
        }
        self.multiset_store.set(*hash, past.multiset);

        let parents = self.node(hash)?.parents().to_vec();
        for parent in &parents {
            self.index
                .lookup_mut(parent)
                .ok_or(DagError::UnknownBlock(*parent))?
                .add_child(*hash);
        }

        // parents that were tips now keep their diff relative to this block
        self.diff_store.set_block_diff(*hash, past.diff.clone());
        let mut rebased = Vec::new();
        for parent in parents.iter().filter(|p| self.diff_store.diff_child(p).is_none()) {
            let parent_past = self.diff_store.restore_utxo(parent, &self.virtual_utxo)?;
            rebased.push((*parent, past.diff.diff_from(parent_past.diff())?));
        }
        for (parent, diff) in rebased {
            self.diff_store.set_block_diff(parent, diff);
            self.diff_store.set_block_diff_child(parent, *hash);
        }

        let updates = self.virtual_block.add_tip(&self.index, &self.reachability, self.params.k, hash)?;
        self.update_finality_point()?;

        let virtual_ghostdag = self.virtual_block.ghostdag().clone();
        let virtual_past = self.past_utxo(&virtual_ghostdag)?;

        // tips are stored relative to the virtual UTXO, which is about to move
        let mut tip_diffs = Vec::with_capacity(self.virtual_block.tips().len());
        for tip in self.virtual_block.tips() {
            let tip_past = self.diff_store.restore_utxo(tip, &self.virtual_utxo)?;
            tip_diffs.push((*tip, virtual_past.diff.diff_from(tip_past.diff())?));
        }
        for (tip, diff) in tip_diffs {
            self.diff_store.set_block_diff(tip, diff);
        }

        self.virtual_utxo.meld(&virtual_past.diff)?;
        self.virtual_multiset = virtual_past.multiset;
        self.index.set_status_flags(hash, BlockStatus::VALID);

        Ok((updates, virtual_past.diff))
    }

    // ─── Finality ────────────────────────────────────────────────────

    /// Move the finality point up the selected chain once the selected tip is
    /// two finality windows past it, then finalize everything below it.
    fn update_finality_point(&mut self) -> Result<(), DagError> {
        let Some(selected_tip) = self.virtual_block.selected_parent() else {
            return Ok(());
        };
        let tip = self.node(&selected_tip)?;
        if tip.is_genesis() {
            self.last_finality_point = Some(selected_tip);
            return Ok(());
        }
        let Some(finality_point) = self.last_finality_point else {
            return Err(DagError::Assert("no finality point after genesis".into()));
        };

        let finality_score = self.params.finality_score(self.node(&finality_point)?.blue_score());
        if self.params.finality_score(tip.blue_score()) < finality_score + 2 {
            return Ok(());
        }

        let mut current = tip;
        while let Some(selected_parent) = current.selected_parent() {
            let parent = self.node(&selected_parent)?;
            if self.params.finality_score(parent.blue_score()) == finality_score {
                break;
            }
            current = parent;
        }
        let new_point = current.hash;
        tracing::info!("🔒 Finality point moved to {} (blue score {})", new_point.short(), current.blue_score());
        self.last_finality_point = Some(new_point);
        self.finalize_below(&new_point)
    }

    fn finalize_below(&mut self, finality_point: &Hash) -> Result<(), DagError> {
        let mut queue: VecDeque<Hash> = self.node(finality_point)?.parents().iter().copied().collect();
        let mut visited = HashSet::new();
        let mut finalized = 0usize;
        while let Some(hash) = queue.pop_front() {
            if !visited.insert(hash) {
                continue;
            }
            let node = self.node(&hash)?;
            if node.is_finalized() {
                continue;
            }
            queue.extend(node.parents().iter().copied());
            self.index.set_status_flags(&hash, BlockStatus::FINALIZED);
            finalized += 1;
        }
        tracing::debug!("finalized {} blocks below {}", finalized, finality_point.short());
        Ok(())
    }

    // ─── Persist ─────────────────────────────────────────────────────

    fn save_changes(
        &mut self,
        hash: &Hash,
        block: &Block,
        virtual_diff: &UtxoDiff,
        acceptance: &MultiBlockTxsAcceptanceData,
        fee_data: &CompactFeeData,
    ) -> Result<(), DagError> {
        let mut tx = self.storage.begin();

        for outpoint in virtual_diff.to_remove.keys() {
            tx.remove(Bucket::UtxoSet, &outpoint_key(outpoint));
        }
        for (outpoint, entry) in &virtual_diff.to_add {
            tx.put(Bucket::UtxoSet, &outpoint_key(outpoint), entry.to_bytes());
        }
        tx.put(Bucket::FeeData, &hash.0, fee_data.as_bytes().to_vec());

        for id in self.subnetworks.register_from_block(&block.transactions)? {
            tracing::info!("📦 Registered subnetwork {}", id);
        }
        if let Some(index_manager) = &self.index_manager {
            index_manager.connect_block(&mut tx, block, acceptance)?;
        }

        let state = DagState {
            tip_hashes: self.virtual_block.tips().to_vec(),
            last_finality_point: self.last_finality_point.unwrap_or(self.genesis_hash),
            local_subnetwork_id: self.local_subnetwork_id,
        };
        state.save(&mut tx)?;

        self.index.flush(&mut tx);
        self.reachability.flush(&mut tx)?;
        self.diff_store.flush(&mut tx);
        self.multiset_store.flush(&mut tx);
        self.subnetworks.flush(&mut tx);

        self.storage.commit(tx)?;
        Ok(())
    }
}
