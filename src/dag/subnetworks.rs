//! Registered subnetworks and their gas limits.

use std::collections::{HashMap, HashSet};

use crate::core::hash::SubnetworkId;
use crate::core::types::Transaction;
use crate::error::{ErrorCode, RuleError};
use crate::storage::{Bucket, DbTransaction, Storage, StorageError};

/// A registry transaction's payload is exactly the gas limit, u64-LE.
pub const REGISTRY_PAYLOAD_LEN: usize = 8;

/// Gas limit announced by a registry transaction.
pub fn registry_gas_limit(tx: &Transaction) -> Result<u64, RuleError> {
    let bytes: [u8; REGISTRY_PAYLOAD_LEN] = tx.payload.as_slice().try_into().map_err(|_| {
        RuleError::new(
            ErrorCode::InvalidPayload,
            format!("registry payload is {} bytes, expected {}", tx.payload.len(), REGISTRY_PAYLOAD_LEN),
        )
    })?;
    Ok(u64::from_le_bytes(bytes))
}

#[derive(Debug, Default)]
pub struct SubnetworkStore {
    gas_limits: HashMap<SubnetworkId, u64>,
    dirty: HashSet<SubnetworkId>,
}

impl SubnetworkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(storage: &Storage) -> Result<Self, StorageError> {
        let mut gas_limits = HashMap::new();
        for (key, value) in storage.scan(Bucket::Subnetworks)? {
            let id = SubnetworkId::from_slice(&key)
                .ok_or_else(|| StorageError::SerializeError("bad subnetwork key".into()))?;
            let limit: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| StorageError::SerializeError("bad subnetwork gas limit".into()))?;
            gas_limits.insert(id, u64::from_le_bytes(limit));
        }
        Ok(SubnetworkStore { gas_limits, dirty: HashSet::new() })
    }

    pub fn gas_limit(&self, id: &SubnetworkId) -> Option<u64> {
        self.gas_limits.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.gas_limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gas_limits.is_empty()
    }

    /// Register every registry transaction of a connected block. Returns the
    /// ids that were new.
    pub fn register_from_block(&mut self, transactions: &[Transaction]) -> Result<Vec<SubnetworkId>, RuleError> {
        let mut registered = Vec::new();
        for tx in transactions.iter().filter(|tx| tx.subnetwork_id == SubnetworkId::REGISTRY) {
            let gas_limit = registry_gas_limit(tx)?;
            let id = SubnetworkId::from_tx_id(&tx.id());
            if self.gas_limits.contains_key(&id) {
                tracing::debug!("subnetwork {} is already registered", id);
                continue;
            }
            self.gas_limits.insert(id, gas_limit);
            self.dirty.insert(id);
            registered.push(id);
        }
        Ok(registered)
    }

    pub fn flush(&mut self, tx: &mut DbTransaction) {
        for id in self.dirty.drain() {
            if let Some(limit) = self.gas_limits.get(&id) {
                tx.put(Bucket::Subnetworks, &id.0, limit.to_le_bytes().to_vec());
            }
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}
