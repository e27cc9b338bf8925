use sled::Db;
use std::path::Path;

use crate::core::codec::{CodecError, Decodable, Encodable};
use crate::core::hash::Hash;
use crate::core::types::Block;

/// Key prefixes for the buckets kept in the one sled tree
const PREFIX_BLOCK_INDEX: &[u8] = b"bix:";
const PREFIX_BLOCK: &[u8] = b"blk:";
const PREFIX_UTXO_DIFF: &[u8] = b"udf:";
const PREFIX_MULTISET: &[u8] = b"mst:";
const PREFIX_REACHABILITY: &[u8] = b"rch:";
const PREFIX_SUBNETWORK: &[u8] = b"sub:";
const PREFIX_FEE_DATA: &[u8] = b"fee:";
const PREFIX_UTXO: &[u8] = b"utx:";
const PREFIX_BLOCK_ID_BY_HASH: &[u8] = b"bid:";
const PREFIX_HASH_BY_BLOCK_ID: &[u8] = b"bhs:";
const PREFIX_META: &[u8] = b"meta:";

pub const META_DAG_STATE: &[u8] = b"dag_state";
pub const META_CURRENT_BLOCK_ID: &[u8] = b"current_block_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    /// u32-BE(height) || hash → header || status
    BlockIndex,
    Blocks,
    UtxoDiffs,
    Multisets,
    Reachability,
    Subnetworks,
    FeeData,
    /// outpoint → utxo entry, the virtual block's set
    UtxoSet,
    BlockIdByHash,
    HashByBlockId,
    Meta,
}

impl Bucket {
    fn prefix(self) -> &'static [u8] {
        match self {
            Bucket::BlockIndex => PREFIX_BLOCK_INDEX,
            Bucket::Blocks => PREFIX_BLOCK,
            Bucket::UtxoDiffs => PREFIX_UTXO_DIFF,
            Bucket::Multisets => PREFIX_MULTISET,
            Bucket::Reachability => PREFIX_REACHABILITY,
            Bucket::Subnetworks => PREFIX_SUBNETWORK,
            Bucket::FeeData => PREFIX_FEE_DATA,
            Bucket::UtxoSet => PREFIX_UTXO,
            Bucket::BlockIdByHash => PREFIX_BLOCK_ID_BY_HASH,
            Bucket::HashByBlockId => PREFIX_HASH_BY_BLOCK_ID,
            Bucket::Meta => PREFIX_META,
        }
    }

    fn key(self, key: &[u8]) -> Vec<u8> {
        prefixed_key(self.prefix(), key)
    }
}

/// Persistent storage backend using sled embedded database
#[derive(Clone)]
pub struct Storage {
    db: Db,
}

/// Pending writes. Nothing reaches the database until [`Storage::commit`];
/// dropping the transaction discards it.
#[derive(Default)]
pub struct DbTransaction {
    batch: sled::Batch,
    writes: usize,
}

impl DbTransaction {
    pub fn put(&mut self, bucket: Bucket, key: &[u8], value: impl Into<Vec<u8>>) {
        self.batch.insert(bucket.key(key), value.into());
        self.writes += 1;
    }

    pub fn remove(&mut self, bucket: Bucket, key: &[u8]) {
        self.batch.remove(bucket.key(key));
        self.writes += 1;
    }

    pub fn put_block(&mut self, block: &Block) {
        self.put(Bucket::Blocks, &block.hash().0, block.to_bytes());
    }

    pub fn len(&self) -> usize {
        self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes == 0
    }
}

impl Storage {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(Storage { db })
    }

    /// In-memory database removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(Storage { db })
    }

    /// Check if the database holds a DAG
    pub fn has_dag_data(&self) -> Result<bool, StorageError> {
        self.db
            .contains_key(Bucket::Meta.key(META_DAG_STATE))
            .map_err(|e| StorageError::DbError(e.to_string()))
    }

    pub fn begin(&self) -> DbTransaction {
        DbTransaction::default()
    }

    /// Apply every write of `tx` atomically
    pub fn commit(&self, tx: DbTransaction) -> Result<(), StorageError> {
        if tx.is_empty() {
            return Ok(());
        }
        self.db.apply_batch(tx.batch).map_err(|e| StorageError::DbError(e.to_string()))
    }

    pub fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let value = self.db.get(bucket.key(key)).map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    pub fn contains(&self, bucket: Bucket, key: &[u8]) -> Result<bool, StorageError> {
        self.db.contains_key(bucket.key(key)).map_err(|e| StorageError::DbError(e.to_string()))
    }

    /// Every (key, value) in a bucket, keys without the prefix, in key order
    pub fn scan(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let prefix_len = bucket.prefix().len();
        let mut items = Vec::new();
        for item in self.db.scan_prefix(bucket.prefix()) {
            let (key, value) = item.map_err(|e| StorageError::DbError(e.to_string()))?;
            items.push((key[prefix_len..].to_vec(), value.to_vec()));
        }
        Ok(items)
    }

    // ─── Blocks ──────────────────────────────────────────────────────

    pub fn has_block(&self, hash: &Hash) -> Result<bool, StorageError> {
        self.contains(Bucket::Blocks, &hash.0)
    }

    /// Retrieve a block by hash
    pub fn get_block(&self, hash: &Hash) -> Result<Option<Block>, StorageError> {
        match self.get(Bucket::Blocks, &hash.0)? {
            Some(bytes) => Ok(Some(Block::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decode a stored value with the canonical codec
    pub fn get_decoded<T: Decodable>(&self, bucket: Bucket, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.get(bucket, key)? {
            Some(bytes) => Ok(Some(T::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────

fn prefixed_key(prefix: &[u8], data: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + data.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(data);
    key
}

/// Block-index key: height first so a scan yields parents before children
pub fn block_index_key(height: u32, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(36);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(&hash.0);
    key
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    DbError(String),
    #[error("serialization error: {0}")]
    SerializeError(String),
}

impl From<CodecError> for StorageError {
    fn from(e: CodecError) -> Self {
        StorageError::SerializeError(e.to_string())
    }
}
