//! The block DAG: index, reachability, virtual block and the UTXO engine
//! behind one write lock, plus the orphan and delayed pools beside it.
//!
//! Lock order is always core first, then a pool. Notifications collected
//! while the core lock is held are dispatched after it is released.

pub mod acceptance;
pub mod block_index;
pub mod block_node;
mod coinbase;
mod connect;
mod context;
mod difficulty;
pub mod ghostdag;
pub mod hooks;
pub mod locks;
mod mining;
pub mod notifications;
pub mod pools;
mod process;
pub mod reachability;
pub mod state;
pub mod subnetworks;
pub mod validate;
pub mod virtual_block;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::codec::{Decodable, Reader};
use crate::core::hash::{Hash, SubnetworkId};
use crate::core::params::DagParams;
use crate::core::script::{AcceptAllVerifier, ScriptVerifier, SigCache};
use crate::core::types::{Block, BlockHeader, OutPoint};
use crate::crypto::multiset::Multiset;
use crate::error::DagError;
use crate::storage::{Bucket, Storage, META_CURRENT_BLOCK_ID};
use crate::utxo::diff_store::UtxoDiffStore;
use crate::utxo::multiset_store::MultisetStore;
use crate::utxo::{decode_outpoint, FullUtxoSet, UtxoEntry, UtxoSet};

use block_index::{load_index_records, BlockIndex};
use acceptance::MultiBlockTxsAcceptanceData;
use block_node::{BlockNode, BlockStatus};
use hooks::{IndexManager, SystemTimeSource, TimeSource};
use notifications::{Callback, Notifier};
use pools::{DelayedPool, OrphanPool};
use reachability::ReachabilityTree;
use state::DagState;
use subnetworks::SubnetworkStore;
use virtual_block::{ChainUpdates, VirtualBlock};

pub use mining::solve_block;

bitflags::bitflags! {
    /// How ProcessBlock treats one block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BehaviorFlags: u32 {
        /// Skip checks already done by a trusted source.
        const FAST_ADD = 1 << 0;
        const NO_POW_CHECK = 1 << 1;
        /// The block comes out of the delayed pool.
        const AFTER_DELAY = 1 << 2;
        const DISALLOW_DELAY = 1 << 3;
        const DISALLOW_ORPHANS = 1 << 4;
        /// The block's bytes were stored by an earlier attempt.
        const WAS_STORED = 1 << 5;
        const WAS_UNORPHANED = 1 << 6;
    }
}

/// Where a processed block ended up when it was not rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub is_orphan: bool,
    pub is_delayed: bool,
}

impl ProcessOutcome {
    pub fn accepted() -> Self {
        Self::default()
    }

    pub fn orphan() -> Self {
        ProcessOutcome { is_orphan: true, is_delayed: false }
    }

    pub fn delayed() -> Self {
        ProcessOutcome { is_orphan: false, is_delayed: true }
    }
}

// ─── Config ──────────────────────────────────────────────────────────

/// Everything a [`BlockDag`] is built from.
pub struct DagConfig {
    pub params: DagParams,
    pub storage: Storage,
    pub time_source: Arc<dyn TimeSource>,
    pub script_verifier: Arc<dyn ScriptVerifier>,
    pub sig_cache: Option<Arc<SigCache>>,
    pub index_manager: Option<Arc<dyn IndexManager>>,
    /// Set on partial nodes: payloads of other subnetworks are rejected.
    pub local_subnetwork_id: Option<SubnetworkId>,
    /// Polled while loading a stored DAG.
    pub interrupt: Option<Arc<AtomicBool>>,
    pub script_threads: usize,
}

impl DagConfig {
    pub fn new(params: DagParams, storage: Storage) -> Self {
        DagConfig {
            params,
            storage,
            time_source: Arc::new(SystemTimeSource),
            script_verifier: Arc::new(AcceptAllVerifier),
            sig_cache: None,
            index_manager: None,
            local_subnetwork_id: None,
            interrupt: None,
            script_threads: num_cpus::get(),
        }
    }

    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    pub fn with_script_verifier(mut self, verifier: Arc<dyn ScriptVerifier>) -> Self {
        self.script_verifier = verifier;
        self
    }

    pub fn with_sig_cache(mut self, sig_cache: Arc<SigCache>) -> Self {
        self.sig_cache = Some(sig_cache);
        self
    }

    pub fn with_index_manager(mut self, index_manager: Arc<dyn IndexManager>) -> Self {
        self.index_manager = Some(index_manager);
        self
    }

    pub fn with_local_subnetwork(mut self, id: SubnetworkId) -> Self {
        self.local_subnetwork_id = Some(id);
        self
    }

    pub fn with_interrupt(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn with_script_threads(mut self, threads: usize) -> Self {
        self.script_threads = threads.max(1);
        self
    }
}

// ─── Core State ──────────────────────────────────────────────────────

/// Everything guarded by the DAG lock.
struct DagCore {
    params: DagParams,
    storage: Storage,
    time_source: Arc<dyn TimeSource>,
    script_verifier: Arc<dyn ScriptVerifier>,
    sig_cache: Option<Arc<SigCache>>,
    index_manager: Option<Arc<dyn IndexManager>>,
    local_subnetwork_id: Option<SubnetworkId>,
    script_threads: usize,
    genesis_hash: Hash,

    index: BlockIndex,
    reachability: ReachabilityTree,
    virtual_block: VirtualBlock,
    /// The virtual block's past UTXO, melded on every connect
    virtual_utxo: FullUtxoSet,
    virtual_multiset: Multiset,
    diff_store: UtxoDiffStore,
    multiset_store: MultisetStore,
    subnetworks: SubnetworkStore,
    last_finality_point: Option<Hash>,
    /// Valid blocks, genesis included
    block_count: u64,
    next_block_id: u64,
    started_at_ms: i64,
    /// When recent blocks were accepted, oldest first
    processing_times: VecDeque<i64>,
    /// Set when a commit failed half way; all further work is refused.
    corrupted: bool,
}

impl DagCore {
    fn new(config: &DagConfig) -> Self {
        DagCore {
            params: config.params.clone(),
            storage: config.storage.clone(),
            time_source: config.time_source.clone(),
            script_verifier: config.script_verifier.clone(),
            sig_cache: config.sig_cache.clone(),
            index_manager: config.index_manager.clone(),
            local_subnetwork_id: config.local_subnetwork_id,
            script_threads: config.script_threads.max(1),
            genesis_hash: config.params.genesis_hash(),
            index: BlockIndex::new(),
            reachability: ReachabilityTree::new(),
            virtual_block: VirtualBlock::new(),
            virtual_utxo: FullUtxoSet::new(),
            virtual_multiset: Multiset::new(),
            diff_store: UtxoDiffStore::new(),
            multiset_store: MultisetStore::new(),
            subnetworks: SubnetworkStore::new(),
            last_finality_point: None,
            block_count: 0,
            next_block_id: 1,
            started_at_ms: config.time_source.now_ms(),
            processing_times: VecDeque::new(),
            corrupted: false,
        }
    }

    /// Rebuild the in-memory DAG from a store written by an earlier run.
    fn load(&mut self, interrupt: Option<&AtomicBool>) -> Result<(), DagError> {
        let state = DagState::load(&self.storage)?
            .ok_or_else(|| DagError::Assert("stored DAG has no state record".into()))?;
        if state.local_subnetwork_id != self.local_subnetwork_id {
            tracing::warn!(
                "⚠️ Stored local subnetwork {:?} differs from configured {:?}",
                state.local_subnetwork_id,
                self.local_subnetwork_id
            );
        }

        self.reachability = ReachabilityTree::load(&self.storage)?;

        let mut children: Vec<(Hash, Hash)> = Vec::new();
        for record in load_index_records(&self.storage)? {
            if interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Err(DagError::Interrupted);
            }

            let hash = record.header.hash();
            let parents = record.header.parent_hashes.clone();
            if parents.iter().any(|p| !self.index.contains(p)) {
                tracing::warn!("⚠️ Skipping stored block {} with unknown parents", hash.short());
                continue;
            }

            let ghostdag = if record.status.known_invalid() {
                ghostdag::lightweight_ghostdag(&self.index, &parents)?
            } else if record.status.known_valid() {
                ghostdag::ghostdag(&self.index, &self.reachability, self.params.k, &parents)?.0
            } else {
                tracing::warn!("⚠️ Skipping stored block {} that never finished validation", hash.short());
                continue;
            };
            let height = self.child_height(&parents)?;
            let valid = record.status.known_valid();

            let mut node = BlockNode::new(record.header, ghostdag, height);
            node.status = record.status;
            self.index.add(node);
            // only connected blocks are linked as children
            if valid {
                children.extend(parents.into_iter().map(|p| (p, hash)));
            }
        }
        for (parent, child) in children {
            if let Some(node) = self.index.lookup_mut(&parent) {
                node.add_child(child);
            }
        }
        self.index.clear_dirty();

        self.diff_store = UtxoDiffStore::load(&self.storage)?;
        self.multiset_store = MultisetStore::load(&self.storage)?;
        self.subnetworks = SubnetworkStore::load(&self.storage)?;

        let mut entries = HashMap::new();
        for (key, value) in self.storage.scan(Bucket::UtxoSet)? {
            let outpoint = decode_outpoint(&mut Reader::new(&key))?;
            entries.insert(outpoint, UtxoEntry::from_bytes(&value)?);
        }
        self.virtual_utxo = FullUtxoSet::from_collection(entries);
        self.virtual_multiset = self.virtual_utxo.multiset();

        self.virtual_block.set_tips(&self.index, &self.reachability, self.params.k, state.tip_hashes)?;
        self.last_finality_point = Some(state.last_finality_point);

        self.next_block_id = match self.storage.get(Bucket::Meta, META_CURRENT_BLOCK_ID)? {
            Some(bytes) => read_block_id(&bytes)? + 1,
            None => 1,
        };
        self.block_count = self.index.iter().filter(|n| n.status.known_valid()).count() as u64;

        tracing::info!(
            "💾 Loaded DAG: blocks={} tips={} blue_score={} utxos={}",
            self.block_count,
            self.virtual_block.tips().len(),
            self.virtual_block.blue_score(),
            self.virtual_utxo.len()
        );
        Ok(())
    }

    fn record_processing_time(&mut self) {
        let now = self.time_source.now_ms();
        self.processing_times.push_back(now);
        while self.processing_times.front().is_some_and(|t| *t < now - SYNC_RATE_WINDOW_MS) {
            self.processing_times.pop_front();
        }
    }

    fn child_height(&self, parents: &[Hash]) -> Result<u32, DagError> {
        let mut height = 0;
        for parent in parents {
            height = height.max(self.node(parent)?.height + 1);
        }
        Ok(height)
    }
}

/// Span over which the block processing rate is measured.
const SYNC_RATE_WINDOW_MS: i64 = 15 * 60 * 1000;

fn read_block_id(bytes: &[u8]) -> Result<u64, DagError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DagError::Assert(format!("block id record is {} bytes", bytes.len())))?;
    Ok(u64::from_le_bytes(raw))
}

// ─── Block DAG ───────────────────────────────────────────────────────

/// The consensus engine. Share it behind an `Arc`; every method takes `&self`.
pub struct BlockDag {
    core: RwLock<DagCore>,
    orphans: Mutex<OrphanPool>,
    delayed: Mutex<DelayedPool>,
    notifier: Notifier,
}

impl BlockDag {
    /// Open the DAG in `config.storage`, connecting genesis on an empty store.
    pub fn new(config: DagConfig) -> Result<Self, DagError> {
        let mut core = DagCore::new(&config);
        let fresh = !config.storage.has_dag_data()?;
        if !fresh {
            core.load(config.interrupt.as_deref())?;
        }

        let dag = BlockDag {
            core: RwLock::new(core),
            orphans: Mutex::new(OrphanPool::new()),
            delayed: Mutex::new(DelayedPool::new()),
            notifier: Notifier::new(),
        };

        if fresh {
            let genesis = config.params.genesis_block();
            tracing::info!("🌱 Connecting genesis {}", genesis.hash().short());
            dag.process_block(
                genesis,
                BehaviorFlags::NO_POW_CHECK
                    | BehaviorFlags::FAST_ADD
                    | BehaviorFlags::DISALLOW_DELAY
                    | BehaviorFlags::DISALLOW_ORPHANS,
            )?;
        }
        Ok(dag)
    }

    /// Flush the store. The DAG stays usable.
    pub fn close(&self) -> Result<(), DagError> {
        self.core.read().storage.flush()?;
        Ok(())
    }

    pub fn subscribe(&self, callback: Callback) {
        self.notifier.subscribe(callback);
    }

    pub fn params(&self) -> DagParams {
        self.core.read().params.clone()
    }

    /// OR `flags` into a stored block's status and persist it. Operators use
    /// this to invalidate a block by hand.
    pub fn set_block_status_flags(&self, hash: &Hash, flags: BlockStatus) -> Result<(), DagError> {
        let mut core = self.core.write();
        if !core.index.contains(hash) {
            return Err(DagError::UnknownBlock(*hash));
        }
        core.index.set_status_flags(hash, flags);
        let mut tx = core.storage.begin();
        core.index.flush(&mut tx);
        core.storage.commit(tx)?;
        Ok(())
    }

    // ─── Queries ─────────────────────────────────────────────────────

    pub fn genesis_hash(&self) -> Hash {
        self.core.read().genesis_hash
    }

    pub fn selected_tip_hash(&self) -> Hash {
        let core = self.core.read();
        core.virtual_block.selected_parent().unwrap_or(core.genesis_hash)
    }

    pub fn tip_hashes(&self) -> Vec<Hash> {
        self.core.read().virtual_block.tips().to_vec()
    }

    pub fn block_count(&self) -> u64 {
        self.core.read().block_count
    }

    /// In the DAG, or waiting as an orphan or a delayed block.
    pub fn have_block(&self, hash: &Hash) -> bool {
        self.is_in_dag(hash) || self.is_known_orphan(hash) || self.is_known_delayed(hash)
    }

    pub fn is_in_dag(&self, hash: &Hash) -> bool {
        self.core.read().index.contains(hash)
    }

    pub fn is_known_orphan(&self, hash: &Hash) -> bool {
        self.orphans.lock().contains(hash)
    }

    pub fn is_known_delayed(&self, hash: &Hash) -> bool {
        self.delayed.lock().contains(hash)
    }

    pub fn is_known_invalid(&self, hash: &Hash) -> bool {
        self.core.read().index.known_invalid(hash)
    }

    pub fn block_status(&self, hash: &Hash) -> Option<BlockStatus> {
        self.core.read().index.lookup(hash).map(|n| n.status)
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
        self.core.read().index.lookup(hash).map(|n| n.header.clone())
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>, DagError> {
        Ok(self.core.read().storage.get_block(hash)?)
    }

    pub fn blue_score_by_hash(&self, hash: &Hash) -> Option<u64> {
        self.core.read().index.lookup(hash).map(|n| n.blue_score())
    }

    pub fn selected_parent_of(&self, hash: &Hash) -> Option<Hash> {
        self.core.read().index.lookup(hash).and_then(|n| n.selected_parent())
    }

    pub fn blues_of(&self, hash: &Hash) -> Option<Vec<Hash>> {
        self.core.read().index.lookup(hash).map(|n| n.blues().to_vec())
    }

    pub fn children_of(&self, hash: &Hash) -> Option<Vec<Hash>> {
        self.core.read().index.lookup(hash).map(|n| n.children.clone())
    }

    /// Inclusive: a block is its own ancestor.
    pub fn is_ancestor_of(&self, ancestor: &Hash, descendant: &Hash) -> Result<bool, DagError> {
        self.core.read().reachability.is_ancestor_of(ancestor, descendant)
    }

    pub fn is_in_selected_parent_chain(&self, hash: &Hash) -> bool {
        self.core.read().virtual_block.chain_contains(hash)
    }

    /// Chain changes needed to go from the chain through `hash` to the
    /// virtual block's chain: `removed` walks down from `hash` to the fork,
    /// `added` climbs from the fork to the selected tip.
    pub fn selected_parent_chain(&self, hash: &Hash) -> Result<ChainUpdates, DagError> {
        let core = self.core.read();
        let mut removed = Vec::new();
        let mut current = *hash;
        while !core.virtual_block.chain_contains(&current) {
            removed.push(current);
            current = core
                .node(&current)?
                .selected_parent()
                .ok_or_else(|| DagError::Assert(format!("{} has no chain ancestor", hash.short())))?;
        }
        let chain = core.virtual_block.selected_parent_chain();
        let fork = chain
            .iter()
            .rposition(|h| *h == current)
            .ok_or_else(|| DagError::Assert("chain set and chain slice disagree".into()))?;
        Ok(ChainUpdates { removed, added: chain[fork + 1..].to_vec() })
    }

    /// Selected-tip blue score minus the accepting block's, plus one. Zero
    /// while nothing on the selected chain accepts the block.
    pub fn block_confirmations(&self, hash: &Hash) -> Result<u64, DagError> {
        let core = self.core.read();
        let node = core.node(hash)?;
        let Some(accepting) = core.accepting_block(node)? else {
            return Ok(0);
        };
        let tip = core.node(&core.virtual_block.selected_parent().unwrap_or(core.genesis_hash))?;
        Ok(tip.blue_score().saturating_sub(accepting.blue_score()) + 1)
    }

    pub fn last_finality_point(&self) -> Option<Hash> {
        self.core.read().last_finality_point
    }

    pub fn virtual_blue_score(&self) -> u64 {
        self.core.read().virtual_block.blue_score()
    }

    pub fn utxo_entry(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.core.read().virtual_utxo.get(outpoint)
    }

    pub fn utxo_count(&self) -> usize {
        self.core.read().virtual_utxo.len()
    }

    pub fn utxo_snapshot(&self) -> FullUtxoSet {
        self.core.read().virtual_utxo.clone()
    }

    /// Multiset commitment of the virtual UTXO set.
    pub fn utxo_commitment(&self) -> Hash {
        self.core.read().virtual_multiset.hash()
    }

    pub fn gas_limit(&self, subnetwork: &SubnetworkId) -> Option<u64> {
        self.core.read().subnetworks.gas_limit(subnetwork)
    }

    pub fn block_id(&self, hash: &Hash) -> Result<Option<u64>, DagError> {
        let core = self.core.read();
        match core.storage.get(Bucket::BlockIdByHash, &hash.0)? {
            Some(bytes) => Ok(Some(read_block_id(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn hash_by_block_id(&self, id: u64) -> Result<Option<Hash>, DagError> {
        let core = self.core.read();
        Ok(core.storage.get(Bucket::HashByBlockId, &id.to_be_bytes())?.and_then(|b| Hash::from_slice(&b)))
    }

    /// Acceptance data of the blues of `hash`, as the block itself saw them.
    pub fn tx_acceptance_by_block(&self, hash: &Hash) -> Result<MultiBlockTxsAcceptanceData, DagError> {
        let core = self.core.read();
        let node = core.node(hash)?;
        if !node.status.known_valid() {
            return Err(DagError::Assert(format!("block {} was never connected", hash.short())));
        }
        Ok(core.past_utxo(&node.ghostdag)?.acceptance)
    }

    /// Headers of blocks in the past of `high` (inclusive) but not in the past
    /// of `low`, lowest blue score first, at most `max`.
    pub fn anti_past_headers_between(&self, low: &Hash, high: &Hash, max: usize) -> Result<Vec<BlockHeader>, DagError> {
        let core = self.core.read();
        core.node(low)?;
        let mut found: Vec<&BlockNode> = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([*high]);
        while let Some(hash) = queue.pop_front() {
            if !visited.insert(hash) || core.reachability.is_ancestor_of(&hash, low)? {
                continue;
            }
            let node = core.node(&hash)?;
            queue.extend(node.parents().iter().copied());
            found.push(node);
        }
        found.sort_by_key(|n| (n.blue_score(), n.hash));
        Ok(found.into_iter().take(max).map(|n| n.header.clone()).collect())
    }

    /// True when blocks were accepted slower than `max_deviation` times the
    /// target rate over the last window. Always false during the first window.
    pub fn is_sync_rate_below_threshold(&self, max_deviation: f64) -> bool {
        let core = self.core.read();
        let now = core.time_source.now_ms();
        if now - core.started_at_ms < SYNC_RATE_WINDOW_MS {
            return false;
        }
        let recent = core.processing_times.iter().filter(|t| **t >= now - SYNC_RATE_WINDOW_MS).count();
        let rate = recent as f64 / (SYNC_RATE_WINDOW_MS as f64 / 1000.0);
        let target_rate = 1000.0 / core.params.target_time_per_block_ms.max(1) as f64;
        rate < target_rate * max_deviation
    }

    pub fn orphan_root(&self, hash: &Hash) -> Hash {
        self.orphans.lock().orphan_root(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.lock().len()
    }

    pub fn delayed_count(&self) -> usize {
        self.delayed.lock().len()
    }
}

impl DagCore {
    /// The selected-chain block that accepted `node`'s transactions.
    fn accepting_block(&self, node: &BlockNode) -> Result<Option<&BlockNode>, DagError> {
        if self.virtual_block.chain_contains(&node.hash) {
            for child in &node.children {
                if self.virtual_block.chain_contains(child) {
                    return Ok(Some(self.node(child)?));
                }
            }
            return Ok(None);
        }

        // the only chain block that may hold `node` among its blues
        let chain = self.virtual_block.selected_parent_chain();
        let position =
            chain.partition_point(|h| self.index.lookup(h).is_some_and(|n| n.blue_score() <= node.blue_score()));
        let Some(hash) = chain.get(position) else {
            return Ok(None);
        };
        let candidate = self.node(hash)?;
        Ok(candidate.blues().contains(&node.hash).then_some(candidate))
    }
}
