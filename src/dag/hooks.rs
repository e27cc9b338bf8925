//! Collaborators the DAG calls out to: the clock and index managers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::acceptance::MultiBlockTxsAcceptanceData;
use crate::core::types::Block;
use crate::storage::{DbTransaction, StorageError};

/// Wall-clock milliseconds since the unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct MockTimeSource {
    now: AtomicI64,
}

impl MockTimeSource {
    pub fn new(now_ms: i64) -> Self {
        MockTimeSource { now: AtomicI64::new(now_ms) }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl TimeSource for MockTimeSource {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Secondary index (addresses, transactions, ...) updated in the same commit
/// as the block it indexes.
pub trait IndexManager: Send + Sync {
    fn connect_block(
        &self,
        tx: &mut DbTransaction,
        block: &Block,
        acceptance: &MultiBlockTxsAcceptanceData,
    ) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_time_moves_on_request() {
        let clock = MockTimeSource::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_system_time_is_recent() {
        // after 2020-01-01
        assert!(SystemTimeSource.now_ms() > 1_577_836_800_000);
    }
}
