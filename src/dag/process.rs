//! ProcessBlock: duplicate, delay and orphan handling around block acceptance.

use std::collections::VecDeque;
use std::sync::Arc;

use super::block_node::{BlockNode, BlockStatus, GhostdagData};
use super::notifications::Notification;
use super::virtual_block::ChainUpdates;
use super::{ghostdag, BehaviorFlags, BlockDag, DagCore, ProcessOutcome};
use crate::core::hash::Hash;
use crate::core::types::Block;
use crate::error::{rule_error, DagError, ErrorCode};
use crate::storage::{Bucket, DbTransaction, META_CURRENT_BLOCK_ID};

impl BlockDag {
    /// Validate `block` and add it to the DAG, or park it as an orphan or a
    /// delayed block. Orphans and delayed blocks that become processable are
    /// handled before returning.
    pub fn process_block(&self, block: Block, flags: BehaviorFlags) -> Result<ProcessOutcome, DagError> {
        let mut notifications = Vec::new();
        let outcome = {
            let mut core = self.core.write();
            self.process_block_locked(&mut core, Arc::new(block), flags, &mut notifications)
        };
        self.notifier.dispatch(&notifications);
        outcome
    }

    /// Accept a block whose sanity was already checked, skipping the pools.
    pub fn maybe_accept_block(&self, block: Block, flags: BehaviorFlags) -> Result<(), DagError> {
        let mut notifications = Vec::new();
        let result = {
            let mut core = self.core.write();
            if core.corrupted {
                return Err(DagError::Corrupted);
            }
            core.maybe_accept(&Arc::new(block), flags, &mut notifications)
        };
        self.notifier.dispatch(&notifications);
        result
    }

    /// Process delayed blocks whose time has come. Call after the clock moves.
    pub fn process_delayed_blocks(&self) -> Result<(), DagError> {
        let mut notifications = Vec::new();
        let result = {
            let mut core = self.core.write();
            self.process_delayed_locked(&mut core, &mut notifications)
        };
        self.notifier.dispatch(&notifications);
        result
    }

    fn process_block_locked(
        &self,
        core: &mut DagCore,
        block: Arc<Block>,
        flags: BehaviorFlags,
        notifications: &mut Vec<Notification>,
    ) -> Result<ProcessOutcome, DagError> {
        if core.corrupted {
            return Err(DagError::Corrupted);
        }
        let hash = block.hash();

        if core.index.contains(&hash) && !flags.contains(BehaviorFlags::WAS_STORED) {
            return rule_error(ErrorCode::DuplicateBlock, format!("already have block {hash}"));
        }
        if self.orphans.lock().contains(&hash) {
            return rule_error(ErrorCode::DuplicateBlock, format!("already have block (orphan) {hash}"));
        }
        if self.delayed.lock().contains(&hash) {
            return rule_error(ErrorCode::DuplicateBlock, format!("already have block (delayed) {hash}"));
        }

        let now = core.time_source.now_ms();
        if !flags.contains(BehaviorFlags::AFTER_DELAY) {
            let delay = core.check_block_sanity(&block, flags)?;
            if delay > 0 {
                if flags.contains(BehaviorFlags::DISALLOW_DELAY) {
                    return rule_error(
                        ErrorCode::DelayedBlockIsNotAllowed,
                        format!("block {hash} is {delay}ms in the future and delays are not allowed"),
                    );
                }
                tracing::debug!("⏳ Delaying block {} by {}ms", hash.short(), delay);
                self.delayed.lock().add(block, now + delay);
                return Ok(ProcessOutcome::delayed());
            }
        }

        let missing: Vec<Hash> =
            block.header.parent_hashes.iter().copied().filter(|p| !core.index.contains(p)).collect();

        // a child of a delayed block waits until just after its parent
        let parent_delay = {
            let delayed = self.delayed.lock();
            missing.iter().filter_map(|p| delayed.process_time(p)).max()
        };
        if let Some(parent_time) = parent_delay {
            let delay = (parent_time - now).max(0) + 1;
            tracing::debug!("⏳ Delaying block {} behind a delayed parent by {}ms", hash.short(), delay);
            self.delayed.lock().add(block, now + delay);
            return Ok(ProcessOutcome::delayed());
        }

        if !missing.is_empty() {
            if flags.contains(BehaviorFlags::DISALLOW_ORPHANS) {
                return rule_error(
                    ErrorCode::OrphanBlockIsNotAllowed,
                    format!("block {hash} is missing {} parents and orphans are not allowed", missing.len()),
                );
            }
            tracing::info!("👻 Adding orphan block {} missing {} parents", hash.short(), missing.len());
            if !self.orphans.lock().add(block, now) {
                tracing::debug!("orphan pool is full, dropped {}", hash.short());
            }
            return Ok(ProcessOutcome::orphan());
        }

        core.maybe_accept(&block, flags, notifications)?;
        self.process_orphans(core, hash, flags, notifications)?;
        if !flags.contains(BehaviorFlags::AFTER_DELAY) {
            self.process_delayed_locked(core, notifications)?;
        }
        Ok(ProcessOutcome::accepted())
    }

    /// Accept every orphan whose parents are now all known, breadth first
    /// from `accepted`. A bad orphan is dropped without failing the caller.
    fn process_orphans(
        &self,
        core: &mut DagCore,
        accepted: Hash,
        flags: BehaviorFlags,
        notifications: &mut Vec<Notification>,
    ) -> Result<(), DagError> {
        let mut queue = VecDeque::from([accepted]);
        while let Some(processed) = queue.pop_front() {
            let waiting = self.orphans.lock().children_of(&processed);
            for orphan_hash in waiting {
                let orphan = self.orphans.lock().get(&orphan_hash);
                let Some(orphan) = orphan else {
                    continue;
                };
                if orphan.header.parent_hashes.iter().any(|p| !core.index.contains(p)) {
                    continue;
                }
                self.orphans.lock().remove(&orphan_hash);

                match core.maybe_accept(&orphan, flags | BehaviorFlags::WAS_UNORPHANED, notifications) {
                    Ok(()) => {}
                    Err(e) if e.is_rule_error() => {
                        tracing::warn!("🚫 Dropping orphan {}: {}", orphan_hash.short(), e);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                queue.push_back(orphan_hash);
            }
        }
        Ok(())
    }

    fn process_delayed_locked(&self, core: &mut DagCore, notifications: &mut Vec<Notification>) -> Result<(), DagError> {
        loop {
            let now = core.time_source.now_ms();
            let due = self.delayed.lock().pop_due(now);
            let Some(block) = due else {
                return Ok(());
            };
            let hash = block.hash();
            match self.process_block_locked(core, block, BehaviorFlags::AFTER_DELAY, notifications) {
                Ok(outcome) => tracing::debug!("processed delayed block {} ({:?})", hash.short(), outcome),
                Err(e) if e.is_rule_error() => tracing::warn!("🚫 Dropping delayed block {}: {}", hash.short(), e),
                Err(e) => return Err(e),
            }
        }
    }
}

impl DagCore {
    /// Add a block whose parents are all in the index.
    pub(super) fn maybe_accept(
        &mut self,
        block: &Arc<Block>,
        flags: BehaviorFlags,
        notifications: &mut Vec<Notification>,
    ) -> Result<(), DagError> {
        let hash = block.hash();
        let parents = &block.header.parent_hashes;

        if self.index.known_valid(&hash) {
            return rule_error(ErrorCode::DuplicateBlock, format!("block {hash} is already connected"));
        }
        if let Some(unknown) = parents.iter().find(|p| !self.index.contains(p)) {
            return rule_error(ErrorCode::ParentBlockUnknown, format!("parent {unknown} of {hash} is unknown"));
        }
        let is_genesis = hash == self.genesis_hash;
        if parents.is_empty() && !is_genesis {
            return rule_error(ErrorCode::NoParents, format!("block {hash} has no parents"));
        }
        if let Some(invalid) = parents.iter().find(|p| self.index.known_invalid(p)).copied() {
            self.add_invalid_descendant(block)?;
            return rule_error(
                ErrorCode::InvalidAncestorBlock,
                format!("parent {} of {} is known to be invalid", invalid, hash),
            );
        }

        let fast_add = flags.contains(BehaviorFlags::FAST_ADD);
        let (ghostdag, anticone) = ghostdag::ghostdag(&self.index, &self.reachability, self.params.k, parents)?;
        if !is_genesis {
            self.check_block_context(block, &ghostdag, fast_add)?;
        }

        let height = self.child_height(parents)?;
        let mut node = BlockNode::new(block.header.clone(), ghostdag.clone(), height);
        node.status = BlockStatus::DATA_STORED;
        self.index.add(node);
        self.index.set_status_flags(&hash, BlockStatus::DATA_STORED);

        let mut tx = self.storage.begin();
        if !self.storage.has_block(&hash)? {
            tx.put_block(block);
            self.assign_block_id(&mut tx, &hash);
        }
        self.index.flush(&mut tx);
        self.storage.commit(tx)?;

        let fast_add = fast_add || self.index.known_valid(&hash);
        let updates = match self.validate_and_connect(&hash, block, &ghostdag, &anticone, fast_add) {
            Ok(updates) => updates,
            Err(e) if e.is_rule_error() => {
                self.index.set_status_flags(&hash, BlockStatus::VALIDATE_FAILED);
                let mut tx = self.storage.begin();
                self.index.flush(&mut tx);
                self.storage.commit(tx)?;
                tracing::warn!("❌ Block {} rejected: {}", hash.short(), e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.block_count += 1;
        self.record_processing_time();

        tracing::info!(
            "✅ Accepted block {} (blue score {}, {} txs, {} tips)",
            hash.short(),
            ghostdag.blue_score,
            block.transactions.len(),
            self.virtual_block.tips().len()
        );
        notifications.push(Notification::BlockAdded {
            block: block.clone(),
            was_unorphaned: flags.contains(BehaviorFlags::WAS_UNORPHANED),
        });
        if !updates.added.is_empty() || !updates.removed.is_empty() {
            if !updates.removed.is_empty() {
                tracing::info!("🔄 Selected chain reorganized: {} removed, {} added", updates.removed.len(), updates.added.len());
            }
            notifications.push(Notification::ChainChanged { removed: updates.removed, added: updates.added });
        }
        Ok(())
    }

    fn validate_and_connect(
        &mut self,
        hash: &Hash,
        block: &Block,
        ghostdag: &GhostdagData,
        anticone: &[Hash],
        fast_add: bool,
    ) -> Result<ChainUpdates, DagError> {
        if !fast_add {
            self.check_transactions_finalized(block, ghostdag)?;
        }
        self.connect_block(hash, block, anticone, fast_add)
    }

    /// A block under a known-invalid parent is kept in the index, marked, so
    /// it is recognised if it arrives again.
    fn add_invalid_descendant(&mut self, block: &Block) -> Result<(), DagError> {
        let hash = block.hash();
        let parents = &block.header.parent_hashes;
        let ghostdag = ghostdag::lightweight_ghostdag(&self.index, parents)?;
        let height = self.child_height(parents)?;
        let mut node = BlockNode::new(block.header.clone(), ghostdag, height);
        node.status = BlockStatus::INVALID_ANCESTOR;
        self.index.add(node);
        self.index.set_status_flags(&hash, BlockStatus::INVALID_ANCESTOR);

        let mut tx = self.storage.begin();
        self.index.flush(&mut tx);
        self.storage.commit(tx)?;
        tracing::warn!("🚫 Block {} descends from an invalid block", hash.short());
        Ok(())
    }

    fn assign_block_id(&mut self, tx: &mut DbTransaction, hash: &Hash) {
        let id = self.next_block_id;
        tx.put(Bucket::BlockIdByHash, &hash.0, id.to_le_bytes().to_vec());
        tx.put(Bucket::HashByBlockId, &id.to_be_bytes(), hash.0.to_vec());
        tx.put(Bucket::Meta, META_CURRENT_BLOCK_ID, id.to_le_bytes().to_vec());
        self.next_block_id += 1;
    }
}
