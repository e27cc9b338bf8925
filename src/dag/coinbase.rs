//! The coinbase a block must carry: one output per blue, paying that blue's
//! subsidy plus the fees of its accepted transactions to the address it
//! named in its own coinbase payload.

use super::acceptance::{find_acceptance_data, MultiBlockTxsAcceptanceData};
use super::block_node::GhostdagData;
use super::DagCore;
use crate::core::codec::{CompactFeeData, Decodable, Encodable};
use crate::core::hash::Hash;
use crate::core::types::{Block, CoinbasePayload, Transaction, TxOutput};
use crate::error::{rule_error, DagError, ErrorCode};
use crate::storage::Bucket;

impl DagCore {
    pub(super) fn expected_coinbase(
        &self,
        ghostdag: &GhostdagData,
        acceptance: &MultiBlockTxsAcceptanceData,
        script_pub_key: Vec<u8>,
        extra_data: Vec<u8>,
    ) -> Result<Transaction, DagError> {
        let mut outputs = Vec::with_capacity(ghostdag.blues.len());
        for blue in &ghostdag.blues {
            if let Some(output) = self.coinbase_output_for_blue(blue, acceptance)? {
                outputs.push(output);
            }
        }
        outputs.sort();

        let payload = CoinbasePayload { blue_score: ghostdag.blue_score, script_pub_key, extra_data };
        Ok(Transaction::new_coinbase(outputs, payload.to_bytes()))
    }

    fn coinbase_output_for_blue(
        &self,
        blue: &Hash,
        acceptance: &MultiBlockTxsAcceptanceData,
    ) -> Result<Option<TxOutput>, DagError> {
        let block_acceptance = find_acceptance_data(acceptance, blue)
            .ok_or_else(|| DagError::Assert(format!("no acceptance data for blue {blue}")))?;
        let fee_bytes = self
            .storage
            .get(Bucket::FeeData, &blue.0)?
            .ok_or_else(|| DagError::Assert(format!("no fee data for blue {blue}")))?;
        let fees: Vec<u64> = CompactFeeData::from_raw(fee_bytes)?.iter().collect();
        if fees.len() != block_acceptance.tx_acceptance_data.len() {
            return Err(DagError::Assert(format!(
                "blue {blue} has {} fee entries for {} transactions",
                fees.len(),
                block_acceptance.tx_acceptance_data.len()
            )));
        }

        let node = self.node(blue)?;
        let mut total = self.params.subsidy(node.blue_score());
        for (data, fee) in block_acceptance.tx_acceptance_data.iter().zip(fees) {
            if data.is_accepted {
                total = total.saturating_add(fee);
            }
        }
        if total == 0 {
            return Ok(None);
        }

        let coinbase = block_acceptance
            .tx_acceptance_data
            .first()
            .ok_or_else(|| DagError::Assert(format!("blue {blue} has no transactions")))?;
        let payload = CoinbasePayload::from_bytes(&coinbase.tx.payload)?;
        Ok(Some(TxOutput { value: total, script_pub_key: payload.script_pub_key }))
    }

    /// The block's coinbase must be exactly the expected one, payload included.
    pub(super) fn validate_coinbase(
        &self,
        block: &Block,
        ghostdag: &GhostdagData,
        acceptance: &MultiBlockTxsAcceptanceData,
    ) -> Result<(), DagError> {
        let Some(coinbase) = block.transactions.first() else {
            return rule_error(ErrorCode::NoTransactions, "block has no coinbase");
        };
        let payload = match CoinbasePayload::from_bytes(&coinbase.payload) {
            Ok(payload) => payload,
            Err(e) => {
                return rule_error(ErrorCode::BadCoinbaseTransaction, format!("coinbase payload does not decode: {e}"))
            }
        };
        if payload.blue_score != ghostdag.blue_score {
            return rule_error(
                ErrorCode::BadCoinbaseTransaction,
                format!("coinbase blue score {} != block blue score {}", payload.blue_score, ghostdag.blue_score),
            );
        }

        let expected = self.expected_coinbase(ghostdag, acceptance, payload.script_pub_key, payload.extra_data)?;
        if expected.hash() != coinbase.hash() {
            return rule_error(
                ErrorCode::BadCoinbaseTransaction,
                format!("coinbase {} is not the expected {}", coinbase.hash(), expected.hash()),
            );
        }
        Ok(())
    }
}
