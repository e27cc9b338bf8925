#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use phantomdag::core::params::MAX_TX_IN_SEQUENCE_NUM;
use phantomdag::dag::hooks::MockTimeSource;
use phantomdag::{
    solve_block, BehaviorFlags, Block, BlockDag, DagConfig, DagError, DagParams, Hash, OutPoint, ProcessOutcome,
    Storage, Transaction, TxInput, TxOutput,
};

pub const MINER_SCRIPT: &[u8] = &[0x51];

/// A DAG on a temporary store driven by a clock the test controls.
pub struct TestDag {
    pub dag: BlockDag,
    pub clock: Arc<MockTimeSource>,
    pub params: DagParams,
    /// Coinbase extra data, so sibling blocks never collide
    counter: AtomicU64,
}

impl TestDag {
    pub fn simnet() -> Self {
        Self::with_params(DagParams::simnet())
    }

    pub fn with_params(params: DagParams) -> Self {
        Self::open(params, Storage::temporary().unwrap())
    }

    pub fn open(params: DagParams, storage: Storage) -> Self {
        let clock = Arc::new(MockTimeSource::new(params.genesis_timestamp));
        let config = DagConfig::new(params.clone(), storage).with_time_source(clock.clone()).with_script_threads(2);
        TestDag { dag: BlockDag::new(config).unwrap(), clock, params, counter: AtomicU64::new(0) }
    }

    pub fn genesis(&self) -> Hash {
        self.dag.genesis_hash()
    }

    /// A solved block on `parents` (the tips when empty), one second after the latest of them. The
    /// clock is moved up to the block's timestamp.
    pub fn build_block(&self, parents: &[Hash], transactions: Vec<Transaction>) -> Block {
        let parents = if parents.is_empty() { self.dag.tip_hashes() } else { parents.to_vec() };
        let timestamp = parents
            .iter()
            .map(|p| self.dag.header_by_hash(p).unwrap().timestamp)
            .max()
            .unwrap_or(self.params.genesis_timestamp)
            + 1_000;
        if self.clock_now() < timestamp {
            self.clock.set(timestamp);
        }
        let extra = self.counter.fetch_add(1, Ordering::Relaxed).to_le_bytes().to_vec();
        let mut block = self
            .dag
            .block_template(&parents, transactions, MINER_SCRIPT.to_vec(), extra, Some(timestamp))
            .unwrap();
        assert!(solve_block(&mut block, 10_000_000), "could not solve block");
        block
    }

    /// Rebuild the header commitments after a test edits a block, then solve it.
    pub fn resolve(&self, block: &mut Block) {
        block.header.hash_merkle_root = block.compute_hash_merkle_root();
        block.header.nonce = 0;
        assert!(solve_block(block, 10_000_000));
    }

    pub fn process(&self, block: Block) -> Result<ProcessOutcome, DagError> {
        self.dag.process_block(block, BehaviorFlags::empty())
    }

    /// Build, process and expect acceptance.
    pub fn add_block(&self, parents: &[Hash], transactions: Vec<Transaction>) -> Hash {
        let block = self.build_block(parents, transactions);
        let hash = block.hash();
        let outcome = self.process(block).unwrap();
        assert_eq!(outcome, ProcessOutcome::accepted());
        hash
    }

    /// A chain of `len` blocks on `from`; returns the hashes in order.
    pub fn add_chain(&self, from: Hash, len: usize) -> Vec<Hash> {
        let mut hashes = Vec::with_capacity(len);
        let mut tip = from;
        for _ in 0..len {
            tip = self.add_block(&[tip], Vec::new());
            hashes.push(tip);
        }
        hashes
    }

    pub fn clock_now(&self) -> i64 {
        use phantomdag::dag::hooks::TimeSource;
        self.clock.now_ms()
    }
}

/// The single coinbase output of `block`.
pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].id(), 0)
}

/// Native transaction spending `outpoint` into one output worth `value`.
pub fn spend(outpoint: OutPoint, value: u64) -> Transaction {
    Transaction::new_native(
        vec![TxInput { previous_outpoint: outpoint, signature_script: Vec::new(), sequence: MAX_TX_IN_SEQUENCE_NUM }],
        vec![TxOutput { value, script_pub_key: MINER_SCRIPT.to_vec() }],
        0,
    )
}
