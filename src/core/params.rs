/// PhantomDAG consensus parameters.
/// Network-wide constants are defined here; per-network knobs live in [`DagParams`].
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use super::codec::Encodable;
use super::hash::Hash;
use super::types::{Block, BlockHeader, CoinbasePayload, Transaction};
use crate::pow;

/// Base unit denomination: one coin is 100,000,000 sompi
pub const SOMPI_PER_COIN: u64 = 100_000_000;

/// Maximum amount a single output, or a transaction's outputs together, may carry
pub const MAX_SOMPI: u64 = 21_000_000 * SOMPI_PER_COIN;

/// Upper bound on the summed mass of a block's transactions
pub const MAX_MASS_PER_BLOCK: u64 = 10_000_000;

/// Mass weights: serialized bytes, script-pub-key bytes, signature operations
pub const MASS_PER_TX_BYTE: u64 = 1;
pub const MASS_PER_SCRIPT_PUB_KEY_BYTE: u64 = 10;
pub const MASS_PER_SIG_OP: u64 = 10_000;

/// Signature operations a single block may perform
pub const MAX_SIG_OPS_PER_BLOCK: u64 = MAX_MASS_PER_BLOCK / MASS_PER_SIG_OP;

pub const MAX_COINBASE_PAYLOAD_LEN: usize = 150;

/// Oldest accepted block version
pub const MIN_BLOCK_VERSION: i32 = 1;

/// Orphan pool cap and the age after which an orphan is dropped (ms)
pub const MAX_ORPHAN_BLOCKS: usize = 100;
pub const ORPHAN_EXPIRATION_MS: i64 = 60 * 60 * 1000;

/// Lock times below this are blue scores, above it unix milliseconds
pub const LOCK_TIME_THRESHOLD: u64 = 500_000_000_000;

/// Input sequence that opts out of every lock
pub const MAX_TX_IN_SEQUENCE_NUM: u64 = u64::MAX;

/// Relative lock disabled for the input
pub const SEQUENCE_LOCK_TIME_DISABLED: u64 = 1 << 63;
/// Relative lock measured in time instead of blue score
pub const SEQUENCE_LOCK_TIME_IS_SECONDS: u64 = 1 << 22;
pub const SEQUENCE_LOCK_TIME_MASK: u64 = 0x0000_0000_ffff_ffff;
/// Time-based relative locks count units of 2^19 ms
pub const SEQUENCE_LOCK_TIME_GRANULARITY: u32 = 19;

/// Consensus parameters of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagParams {
    pub name: String,
    /// PHANTOM K: the anticone bound of a blue block inside the blue set
    pub k: u8,
    /// Blue-score span of one finality window
    pub finality_interval: u64,
    pub base_subsidy: u64,
    /// Subsidy halves every this many blue scores; 0 keeps it constant
    pub subsidy_reduction_interval: u64,
    /// Blue-score distance before a coinbase output may be spent
    pub block_coinbase_maturity: u64,
    pub target_time_per_block_ms: i64,
    /// Compact form of the easiest allowed target
    pub pow_max_bits: u32,
    /// Future drift allowance and median-time window, in blocks
    pub timestamp_deviation_tolerance: u64,
    pub difficulty_adjustment_window_size: u64,
    pub enable_non_native_subnetworks: bool,
    /// When set, blocks are checked against their target without hashing.
    pub skip_proof_of_work: bool,
    pub genesis_timestamp: i64,
    pub genesis_extra_data: Vec<u8>,
}

impl DagParams {
    pub fn mainnet() -> Self {
        DagParams {
            name: "mainnet".to_string(),
            k: 18,
            finality_interval: 86_400,
            base_subsidy: 50 * SOMPI_PER_COIN,
            subsidy_reduction_interval: 210_000,
            block_coinbase_maturity: 100,
            target_time_per_block_ms: 1_000,
            pow_max_bits: 0x1e7fffff,
            timestamp_deviation_tolerance: 132,
            difficulty_adjustment_window_size: 2_640,
            enable_non_native_subnetworks: false,
            skip_proof_of_work: false,
            genesis_timestamp: 1_735_689_600_000,
            genesis_extra_data: b"phantomdag mainnet genesis".to_vec(),
        }
    }

    /// Local test network: trivial PoW and short windows.
    pub fn simnet() -> Self {
        DagParams {
            name: "simnet".to_string(),
            k: 10,
            finality_interval: 100,
            base_subsidy: 50 * SOMPI_PER_COIN,
            subsidy_reduction_interval: 210_000,
            block_coinbase_maturity: 2,
            target_time_per_block_ms: 1_000,
            pow_max_bits: 0x207fffff,
            timestamp_deviation_tolerance: 10,
            difficulty_adjustment_window_size: 10,
            enable_non_native_subnetworks: true,
            skip_proof_of_work: false,
            genesis_timestamp: 1_735_689_600_000,
            genesis_extra_data: b"phantomdag simnet genesis".to_vec(),
        }
    }

    /// Block subsidy at `blue_score`.
    pub fn subsidy(&self, blue_score: u64) -> u64 {
        if self.subsidy_reduction_interval == 0 {
            return self.base_subsidy;
        }
        let reductions = blue_score / self.subsidy_reduction_interval;
        if reductions >= 64 {
            return 0;
        }
        self.base_subsidy >> reductions
    }

    pub fn finality_score(&self, blue_score: u64) -> u64 {
        blue_score / self.finality_interval.max(1)
    }

    /// Past-median-time window: 2 * tolerance - 1 blocks.
    pub fn median_time_window_size(&self) -> u64 {
        (2 * self.timestamp_deviation_tolerance).saturating_sub(1).max(1)
    }

    /// Largest future offset a timestamp may have before the block is delayed (ms).
    pub fn max_timestamp_drift_ms(&self) -> i64 {
        self.timestamp_deviation_tolerance as i64 * self.target_time_per_block_ms
    }

    pub fn pow_max(&self) -> BigUint {
        pow::compact_to_target(self.pow_max_bits).unwrap_or_default()
    }

    /// Genesis: no parents, a coinbase without outputs, zero commitments.
    pub fn genesis_block(&self) -> Block {
        let payload = CoinbasePayload { blue_score: 0, script_pub_key: Vec::new(), extra_data: self.genesis_extra_data.clone() };
        let coinbase = Transaction::new_coinbase(Vec::new(), payload.to_bytes());
        let mut block = Block {
            header: BlockHeader {
                version: MIN_BLOCK_VERSION,
                parent_hashes: Vec::new(),
                hash_merkle_root: Hash::ZERO,
                accepted_id_merkle_root: Hash::ZERO,
                utxo_commitment: Hash::ZERO,
                timestamp: self.genesis_timestamp,
                bits: self.pow_max_bits,
                nonce: 0,
            },
            transactions: vec![coinbase],
        };
        block.header.hash_merkle_root = block.compute_hash_merkle_root();
        block
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_block().hash()
    }
}

impl Default for DagParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_subsidy() {
        let params = DagParams::simnet();
        assert_eq!(params.subsidy(0), 50 * SOMPI_PER_COIN);
    }

    #[test]
    fn test_subsidy_halvings() {
        let params = DagParams::simnet();
        let interval = params.subsidy_reduction_interval;
        assert_eq!(params.subsidy(interval), 25 * SOMPI_PER_COIN);
        assert_eq!(params.subsidy(interval * 2), 12 * SOMPI_PER_COIN + SOMPI_PER_COIN / 2);
        assert_eq!(params.subsidy(interval * 64), 0);
    }

    #[test]
    fn test_constant_subsidy_without_interval() {
        let mut params = DagParams::simnet();
        params.subsidy_reduction_interval = 0;
        assert_eq!(params.subsidy(u64::MAX), params.base_subsidy);
    }

    #[test]
    fn test_genesis_is_stable() {
        let params = DagParams::simnet();
        let genesis = params.genesis_block();
        assert!(genesis.header.is_genesis());
        assert!(genesis.transactions[0].is_coinbase());
        assert!(genesis.validate_hash_merkle_root());
        assert_eq!(params.genesis_hash(), genesis.hash());
        assert_ne!(DagParams::mainnet().genesis_hash(), genesis.hash());
    }

    #[test]
    fn test_windows() {
        let params = DagParams::simnet();
        assert_eq!(params.median_time_window_size(), 19);
        assert_eq!(params.max_timestamp_drift_ms(), 10_000);
        assert_eq!(params.finality_score(250), 2);
    }

    #[test]
    fn test_params_json_roundtrip() {
        let params = DagParams::mainnet();
        let json = serde_json::to_string(&params).unwrap();
        let back: DagParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
