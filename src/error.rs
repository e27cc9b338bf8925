//! Error types.
//!
//! A [`RuleError`] means the block is bad: it is fatal to that block and to
//! nothing else. Every other [`DagError`] variant is an internal failure.

use std::fmt;

use crate::core::codec::CodecError;
use crate::core::hash::Hash;
use crate::storage::StorageError;
use crate::utxo::UtxoError;

/// Kind of consensus rule a block broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    DuplicateBlock,
    BlockMassTooHigh,
    BlockVersionTooOld,
    TimeTooOld,
    /// Reserved; no current check produces it.
    TimeTooNew,
    NoParents,
    WrongParentsOrder,
    DifficultyTooLow,
    UnexpectedDifficulty,
    HighHash,
    BadMerkleRoot,
    /// Reserved; no current check produces it.
    FinalityPointTimeTooOld,
    NoTransactions,
    NoTxInputs,
    TxMassTooHigh,
    BadTxOutValue,
    DuplicateTxInputs,
    /// Reserved; no current check produces it.
    BadTxInput,
    MissingTxOut,
    UnfinalizedTx,
    DuplicateTx,
    OverwriteTx,
    ImmatureSpend,
    SpendTooHigh,
    BadFees,
    TooManySigOps,
    FirstTxNotCoinbase,
    MultipleCoinbases,
    BadCoinbasePayloadLen,
    BadCoinbaseTransaction,
    ScriptMalformed,
    ScriptValidation,
    ParentBlockUnknown,
    InvalidAncestorBlock,
    /// Reserved; no current check produces it.
    ParentBlockNotCurrentTips,
    WithDiff,
    Finality,
    TransactionsNotSorted,
    InvalidGas,
    InvalidPayload,
    InvalidPayloadHash,
    InvalidParentsRelation,
    DelayedBlockIsNotAllowed,
    OrphanBlockIsNotAllowed,
    DoubleSpendInSameBlock,
    InvalidSubnetwork,
    BadUTXOCommitment,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RuleError {
    pub code: ErrorCode,
    pub message: String,
}

impl RuleError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RuleError { code, message: message.into() }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DagError {
    #[error("rule violation: {0}")]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("reachability: {0}")]
    Reachability(String),
    #[error("assertion failed: {0}")]
    Assert(String),
    #[error("block {0} is not in the DAG")]
    UnknownBlock(Hash),
    #[error("interrupted")]
    Interrupted,
    #[error("the DAG is corrupted after a failed commit and refuses further work")]
    Corrupted,
}

impl DagError {
    /// The rule kind, if this is a rule violation.
    pub fn rule_code(&self) -> Option<ErrorCode> {
        match self {
            DagError::Rule(e) => Some(e.code),
            _ => None,
        }
    }

    pub fn is_rule_error(&self) -> bool {
        matches!(self, DagError::Rule(_))
    }
}

/// Diff-algebra conflicts are data errors: the block's transactions produced them.
impl From<UtxoError> for DagError {
    fn from(err: UtxoError) -> Self {
        DagError::Rule(RuleError::new(ErrorCode::WithDiff, err.to_string()))
    }
}

/// Shorthand for returning a rule violation.
pub fn rule_error<T>(code: ErrorCode, message: impl Into<String>) -> Result<T, DagError> {
    Err(DagError::Rule(RuleError::new(code, message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_code_roundtrip() {
        let err: DagError = RuleError::new(ErrorCode::HighHash, "hash above target").into();
        assert_eq!(err.rule_code(), Some(ErrorCode::HighHash));
        assert!(err.is_rule_error());
        assert_eq!(err.to_string(), "rule violation: HighHash: hash above target");
        assert_eq!(DagError::Interrupted.rule_code(), None);
    }

    #[test]
    fn test_utxo_conflict_is_with_diff_rule() {
        let err: DagError = UtxoError::Conflict("double add".into()).into();
        assert_eq!(err.rule_code(), Some(ErrorCode::WithDiff));
    }
}
