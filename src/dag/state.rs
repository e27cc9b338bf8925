use serde::{Deserialize, Serialize};

use crate::core::hash::{Hash, SubnetworkId};
use crate::storage::{Bucket, DbTransaction, Storage, StorageError, META_DAG_STATE};

/// The small record that ties the stored DAG together: its tips and finality point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DagState {
    pub tip_hashes: Vec<Hash>,
    pub last_finality_point: Hash,
    #[serde(rename = "LocalSubnetworkID")]
    pub local_subnetwork_id: Option<SubnetworkId>,
}

impl DagState {
    pub fn save(&self, tx: &mut DbTransaction) -> Result<(), StorageError> {
        let json = serde_json::to_vec(self).map_err(|e| StorageError::SerializeError(e.to_string()))?;
        tx.put(Bucket::Meta, META_DAG_STATE, json);
        Ok(())
    }

    pub fn load(storage: &Storage) -> Result<Option<Self>, StorageError> {
        match storage.get(Bucket::Meta, META_DAG_STATE)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::SerializeError(e.to_string())),
            None => Ok(None),
        }
    }
}
