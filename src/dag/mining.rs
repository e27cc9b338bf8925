use super::acceptance::accepted_id_merkle_root;
use super::{ghostdag, BlockDag};
use crate::core::hash::Hash;
use crate::core::params::MIN_BLOCK_VERSION;
use crate::core::types::{Block, BlockHeader, Transaction};
use crate::error::DagError;
use crate::pow;

impl BlockDag {
    /// Create a block on `parents` (the current tips when empty) that the DAG
    /// would accept once solved: expected coinbase, both merkle roots, UTXO
    /// commitment and required bits. The timestamp defaults to the later of
    /// now and just after the past median time.
    pub fn block_template(
        &self,
        parents: &[Hash],
        transactions: Vec<Transaction>,
        coinbase_script_pub_key: Vec<u8>,
        extra_data: Vec<u8>,
        timestamp: Option<i64>,
    ) -> Result<Block, DagError> {
        let core = self.core.read();

        let mut parents = if parents.is_empty() { core.virtual_block.tips().to_vec() } else { parents.to_vec() };
        parents.sort();
        parents.dedup();
        for parent in &parents {
            core.node(parent)?;
        }

        let (ghostdag, _) = ghostdag::ghostdag(&core.index, &core.reachability, core.params.k, &parents)?;
        let past = core.past_utxo(&ghostdag)?;
        let coinbase = core.expected_coinbase(&ghostdag, &past.acceptance, coinbase_script_pub_key, extra_data)?;

        let mut rest = transactions;
        rest.retain(|tx| !tx.is_coinbase());
        rest.sort_by_key(|tx| tx.subnetwork_id);
        let mut txs = Vec::with_capacity(rest.len() + 1);
        txs.push(coinbase);
        txs.extend(rest);

        let timestamp = match timestamp {
            Some(ts) => ts,
            None => core.time_source.now_ms().max(core.past_median_time(&ghostdag)? + 1),
        };

        let mut block = Block {
            header: BlockHeader {
                version: MIN_BLOCK_VERSION,
                parent_hashes: parents,
                hash_merkle_root: Hash::ZERO,
                accepted_id_merkle_root: accepted_id_merkle_root(&past.acceptance),
                utxo_commitment: past.multiset.hash(),
                timestamp,
                bits: core.required_difficulty(ghostdag.selected_parent.as_ref())?,
                nonce: 0,
            },
            transactions: txs,
        };
        block.header.hash_merkle_root = block.compute_hash_merkle_root();

        tracing::debug!(
            "⛏️ Template on {} parents: blue score {}, {} txs, bits {:#010x}",
            block.header.parent_hashes.len(),
            ghostdag.blue_score,
            block.transactions.len(),
            block.header.bits
        );
        Ok(block)
    }
}

/// Bump the nonce until the header hash meets its own target. Returns whether
/// a solution was found within `max_tries`.
pub fn solve_block(block: &mut Block, max_tries: u64) -> bool {
    let Some(target) = pow::compact_to_target(block.header.bits) else {
        return false;
    };
    for _ in 0..max_tries {
        if pow::hash_to_big(&block.header.hash()) <= target {
            return true;
        }
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
    false
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::codec::Decodable;
    use crate::core::params::DagParams;
    use crate::core::types::CoinbasePayload;
    use crate::dag::hooks::MockTimeSource;
    use crate::dag::{BehaviorFlags, DagConfig};
    use crate::storage::Storage;

    fn simnet_dag() -> (BlockDag, Arc<MockTimeSource>) {
        let params = DagParams::simnet();
        let clock = Arc::new(MockTimeSource::new(params.genesis_timestamp + 1_000));
        let config = DagConfig::new(params, Storage::temporary().unwrap()).with_time_source(clock.clone());
        (BlockDag::new(config).unwrap(), clock)
    }

    #[test]
    fn test_template_on_genesis() {
        let (dag, _) = simnet_dag();
        let genesis = dag.genesis_hash();
        let block = dag.block_template(&[], Vec::new(), vec![0x51], b"t".to_vec(), None).unwrap();

        assert_eq!(block.header.parent_hashes, vec![genesis]);
        assert!(block.validate_hash_merkle_root());
        assert!(block.transactions[0].is_coinbase());
        let payload = CoinbasePayload::from_bytes(&block.transactions[0].payload).unwrap();
        assert_eq!(payload.blue_score, 1);
        assert_eq!(payload.script_pub_key, vec![0x51]);
        // the only blue is genesis, whose coinbase named an empty script
        let outputs = &block.transactions[0].outputs;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].value, DagParams::simnet().subsidy(0));
        assert!(outputs[0].script_pub_key.is_empty());
    }

    #[test]
    fn test_solved_template_is_accepted() {
        let (dag, _) = simnet_dag();
        let mut block = dag.block_template(&[], Vec::new(), vec![0x51], Vec::new(), None).unwrap();
        assert!(solve_block(&mut block, 1_000_000));
        let hash = block.hash();

        let outcome = dag.process_block(block, BehaviorFlags::empty()).unwrap();
        assert_eq!(outcome, crate::dag::ProcessOutcome::accepted());
        assert_eq!(dag.selected_tip_hash(), hash);
        assert_eq!(dag.virtual_blue_score(), 2);
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let (dag, _) = simnet_dag();
        let missing = Hash([7; 32]);
        assert!(dag.block_template(&[missing], Vec::new(), Vec::new(), Vec::new(), None).is_err());
    }

    #[test]
    fn test_solve_gives_up() {
        let (dag, _) = simnet_dag();
        let mut block = dag.block_template(&[], Vec::new(), Vec::new(), Vec::new(), None).unwrap();
        block.header.bits = 0x0300_0001;
        assert!(!solve_block(&mut block, 16));
        assert_eq!(block.header.nonce, 16);
    }
}
