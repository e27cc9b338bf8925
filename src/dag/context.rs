//! Checks that need the block's parents in the DAG.

use super::block_node::GhostdagData;
use super::locks::is_finalized_transaction;
use super::DagCore;
use crate::core::types::Block;
use crate::error::{rule_error, DagError, ErrorCode};

impl DagCore {
    pub(super) fn check_block_context(
        &self,
        block: &Block,
        ghostdag: &GhostdagData,
        fast_add: bool,
    ) -> Result<(), DagError> {
        let parents = &block.header.parent_hashes;

        for parent in parents {
            if self.node(parent)?.is_finalized() {
                return rule_error(ErrorCode::Finality, format!("parent {} is finalized", parent.short()));
            }
        }

        for a in parents {
            for b in parents {
                if a != b && self.reachability.is_ancestor_of(a, b)? {
                    return rule_error(
                        ErrorCode::InvalidParentsRelation,
                        format!("parent {} is an ancestor of parent {}", a.short(), b.short()),
                    );
                }
            }
        }

        if fast_add {
            return Ok(());
        }

        let required = self.required_difficulty(ghostdag.selected_parent.as_ref())?;
        if block.header.bits != required {
            return rule_error(
                ErrorCode::UnexpectedDifficulty,
                format!("block bits {:#010x}, required {:#010x}", block.header.bits, required),
            );
        }

        let median = self.past_median_time(ghostdag)?;
        if block.header.timestamp < median {
            return rule_error(
                ErrorCode::TimeTooOld,
                format!("timestamp {} is before past median time {}", block.header.timestamp, median),
            );
        }
        Ok(())
    }

    /// Lock times are judged against the selected parent's past median time.
    pub(super) fn check_transactions_finalized(&self, block: &Block, ghostdag: &GhostdagData) -> Result<(), DagError> {
        let block_time = match &ghostdag.selected_parent {
            Some(selected_parent) => self.past_median_time(&self.node(selected_parent)?.ghostdag)?,
            None => block.header.timestamp,
        };
        for tx in &block.transactions {
            if !is_finalized_transaction(tx, ghostdag.blue_score, block_time) {
                return rule_error(
                    ErrorCode::UnfinalizedTx,
                    format!("transaction {} is not finalized at blue score {}", tx.id(), ghostdag.blue_score),
                );
            }
        }
        Ok(())
    }
}
