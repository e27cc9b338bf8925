//! Blue windows: the past median time and the required difficulty.

use super::block_node::{BlockNode, GhostdagData};
use super::DagCore;
use crate::core::hash::Hash;
use crate::error::DagError;
use crate::pow;

impl DagCore {
    pub(super) fn node(&self, hash: &Hash) -> Result<&BlockNode, DagError> {
        self.index.lookup(hash).ok_or(DagError::UnknownBlock(*hash))
    }

    /// The last `size` blue blocks below a block with `ghostdag`, walking its
    /// blues then those of each selected parent in turn. Short windows are
    /// padded with genesis.
    pub(super) fn blue_window(&self, ghostdag: &GhostdagData, size: u64) -> Result<Vec<&BlockNode>, DagError> {
        let size = size as usize;
        let mut window = Vec::with_capacity(size);
        let mut current = ghostdag;
        'walk: while let Some(selected_parent) = current.selected_parent {
            for blue in &current.blues {
                if window.len() == size {
                    break 'walk;
                }
                window.push(self.node(blue)?);
            }
            current = &self.node(&selected_parent)?.ghostdag;
        }

        if window.len() < size {
            let genesis = self.node(&self.genesis_hash)?;
            window.resize(size, genesis);
        }
        Ok(window)
    }

    /// Median timestamp of the blue window ending at a block with `ghostdag`.
    pub(super) fn past_median_time(&self, ghostdag: &GhostdagData) -> Result<i64, DagError> {
        let window = self.blue_window(ghostdag, self.params.median_time_window_size())?;
        let mut timestamps: Vec<i64> = window.iter().map(|n| n.timestamp()).collect();
        timestamps.sort_unstable();
        Ok(timestamps[timestamps.len() / 2])
    }

    /// Bits a child of `selected_parent` must carry.
    pub(super) fn required_difficulty(&self, selected_parent: Option<&Hash>) -> Result<u32, DagError> {
        let window_size = self.params.difficulty_adjustment_window_size;
        let Some(selected_parent) = selected_parent else {
            return Ok(self.params.pow_max_bits);
        };
        let parent = self.node(selected_parent)?;
        if parent.blue_score() < window_size {
            return Ok(self.params.pow_max_bits);
        }

        let window = self.blue_window(&parent.ghostdag, window_size)?;
        let targets = window
            .iter()
            .map(|n| {
                pow::compact_to_target(n.bits())
                    .ok_or_else(|| DagError::Assert(format!("block {} has malformed bits {:#010x}", n.hash, n.bits())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let min_timestamp = window.iter().map(|n| n.timestamp()).min().unwrap_or_default();
        let max_timestamp = window.iter().map(|n| n.timestamp()).max().unwrap_or_default();

        let target = pow::retarget(
            &targets,
            min_timestamp,
            max_timestamp,
            self.params.target_time_per_block_ms,
            &self.params.pow_max(),
        );
        Ok(pow::target_to_compact(&target))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::core::params::DagParams;
    use crate::dag::hooks::MockTimeSource;
    use crate::dag::{BehaviorFlags, BlockDag, DagConfig};
    use crate::error::DagError;
    use crate::storage::Storage;

    #[test]
    fn test_malformed_window_bits_are_reported() {
        let params = DagParams::simnet();
        let clock = Arc::new(MockTimeSource::new(params.genesis_timestamp));
        let window = params.difficulty_adjustment_window_size;
        let config = DagConfig::new(params, Storage::temporary().unwrap()).with_time_source(clock.clone());
        let dag = BlockDag::new(config).unwrap();

        for _ in 0..=window {
            clock.advance(1_000);
            let mut block = dag.block_template(&[], Vec::new(), vec![0x51], Vec::new(), None).unwrap();
            assert!(crate::solve_block(&mut block, 10_000_000));
            dag.process_block(block, BehaviorFlags::empty()).unwrap();
        }

        let tip = dag.selected_tip_hash();
        let mut core = dag.core.write();
        assert!(core.required_difficulty(Some(&tip)).is_ok());

        let hashes: Vec<_> = core.index.iter().map(|n| n.hash).collect();
        for hash in &hashes {
            if let Some(node) = core.index.lookup_mut(hash) {
                node.header.bits = 0x0380_0001;
            }
        }
        assert!(matches!(core.required_difficulty(Some(&tip)), Err(DagError::Assert(_))));
    }
}
