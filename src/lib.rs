//! PhantomDAG: a block-DAG consensus engine ordering blocks with GHOSTDAG.
//!
//! [`BlockDag`] is the entry point. It validates blocks, keeps the
//! reachability and blue-score data needed to order them, and maintains the
//! UTXO set of the virtual block on top of every tip.

pub mod core;
pub mod crypto;
pub mod dag;
pub mod error;
pub mod pow;
pub mod storage;
pub mod utxo;

pub use crate::core::hash::{Hash, SubnetworkId};
pub use crate::core::params::DagParams;
pub use crate::core::types::{Block, BlockHeader, OutPoint, Transaction, TxInput, TxOutput};
pub use crate::dag::{solve_block, BehaviorFlags, BlockDag, DagConfig, ProcessOutcome};
pub use crate::error::{DagError, ErrorCode, RuleError};
pub use crate::storage::Storage;

pub type Result<T> = std::result::Result<T, DagError>;
