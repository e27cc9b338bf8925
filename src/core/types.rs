use std::fmt;

use super::codec::{write_vlq, CodecError, Decodable, Encodable, Reader};
use super::hash::{Hash, SubnetworkId, TxId};
use super::params::{MASS_PER_SCRIPT_PUB_KEY_BYTE, MASS_PER_SIG_OP, MASS_PER_TX_BYTE};
use super::script;
use crate::crypto::{double_sha256, hash_pair, txid};

// ─── Transaction Types ───────────────────────────────────────────────

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub tx_id: TxId,
    pub index: u32,
}

impl OutPoint {
    pub fn new(tx_id: TxId, index: u32) -> Self {
        OutPoint { tx_id, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

/// Transaction input - spends a previous output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub previous_outpoint: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u64,
}

/// Transaction output - creates a new spendable output
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TxOutput {
    pub value: u64,
    pub script_pub_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u64,
    pub subnetwork_id: SubnetworkId,
    pub gas: u64,
    /// Double SHA-256 of `payload`. Absent for native transactions.
    pub payload_hash: Option<Hash>,
    pub payload: Vec<u8>,
}

pub const TX_VERSION: i32 = 1;

impl Transaction {
    /// A plain value transfer in the native subnetwork.
    pub fn new_native(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, lock_time: u64) -> Self {
        Transaction {
            version: TX_VERSION,
            inputs,
            outputs,
            lock_time,
            subnetwork_id: SubnetworkId::NATIVE,
            gas: 0,
            payload_hash: None,
            payload: Vec::new(),
        }
    }

    /// A transaction in a non-native subnetwork; the payload hash is derived.
    pub fn new_subnetwork(
        inputs: Vec<TxInput>,
        outputs: Vec<TxOutput>,
        subnetwork_id: SubnetworkId,
        gas: u64,
        payload: Vec<u8>,
    ) -> Self {
        let payload_hash = if subnetwork_id.is_native() { None } else { Some(double_sha256(&payload)) };
        Transaction {
            version: TX_VERSION,
            inputs,
            outputs,
            lock_time: 0,
            subnetwork_id,
            gas,
            payload_hash,
            payload,
        }
    }

    /// Coinbase transactions live in the coinbase subnetwork and have no inputs.
    pub fn new_coinbase(outputs: Vec<TxOutput>, payload: Vec<u8>) -> Self {
        Self::new_subnetwork(Vec::new(), outputs, SubnetworkId::COINBASE, 0, payload)
    }

    pub fn is_coinbase(&self) -> bool {
        self.subnetwork_id == SubnetworkId::COINBASE
    }

    pub fn id(&self) -> TxId {
        txid::tx_id(self)
    }

    pub fn hash(&self) -> Hash {
        txid::tx_hash(self)
    }

    /// Sum of output values, `None` on overflow.
    pub fn total_output(&self) -> Option<u64> {
        self.outputs.iter().try_fold(0u64, |acc, o| acc.checked_add(o.value))
    }

    pub fn serialized_size(&self) -> usize {
        self.to_bytes().len()
    }

    pub fn sig_op_count(&self) -> u64 {
        let inputs: u64 = self.inputs.iter().map(|i| script::count_sig_ops(&i.signature_script)).sum();
        let outputs: u64 = self.outputs.iter().map(|o| script::count_sig_ops(&o.script_pub_key)).sum();
        inputs + outputs
    }

    /// Resource cost: size, script-pub-key bytes and signature operations, weighted.
    pub fn mass(&self) -> u64 {
        let spk_bytes: u64 = self.outputs.iter().map(|o| o.script_pub_key.len() as u64).sum();
        (self.serialized_size() as u64) * MASS_PER_TX_BYTE
            + spk_bytes * MASS_PER_SCRIPT_PUB_KEY_BYTE
            + self.sig_op_count() * MASS_PER_SIG_OP
    }
}

impl Encodable for Transaction {
    fn encode(&self, buf: &mut Vec<u8>) {
        txid::encode_transaction(self, buf, false);
    }
}

impl Decodable for Transaction {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_i32()?;

        let input_count = r.read_count()?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let tx_id = r.read_hash()?;
            let index = r.read_u32()?;
            let signature_script = r.read_var_bytes()?;
            let sequence = r.read_u64()?;
            inputs.push(TxInput { previous_outpoint: OutPoint { tx_id, index }, signature_script, sequence });
        }

        let output_count = r.read_count()?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = r.read_u64()?;
            let script_pub_key = r.read_var_bytes()?;
            outputs.push(TxOutput { value, script_pub_key });
        }

        let lock_time = r.read_u64()?;
        let subnetwork_id = r.read_subnetwork_id()?;
        let gas = r.read_u64()?;
        let payload_hash = if subnetwork_id.is_native() { None } else { Some(r.read_hash()?) };
        let payload = r.read_var_bytes()?;

        Ok(Transaction { version, inputs, outputs, lock_time, subnetwork_id, gas, payload_hash, payload })
    }
}

// ─── Coinbase Payload ────────────────────────────────────────────────

/// Coinbase payload: blue_score(u64-LE) || vlq(len) script_pub_key || extra_data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbasePayload {
    pub blue_score: u64,
    pub script_pub_key: Vec<u8>,
    pub extra_data: Vec<u8>,
}

impl Encodable for CoinbasePayload {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.blue_score.to_le_bytes());
        super::codec::write_var_bytes(buf, &self.script_pub_key);
        buf.extend_from_slice(&self.extra_data);
    }
}

impl Decodable for CoinbasePayload {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let blue_score = r.read_u64()?;
        let script_pub_key = r.read_var_bytes()?;
        let extra_data = r.read_bytes(r.remaining())?.to_vec();
        Ok(CoinbasePayload { blue_score, script_pub_key, extra_data })
    }
}

// ─── Block Types ─────────────────────────────────────────────────────

/// Block header. A genesis header has no parents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    /// Strictly ascending, no duplicates.
    pub parent_hashes: Vec<Hash>,
    pub hash_merkle_root: Hash,
    pub accepted_id_merkle_root: Hash,
    pub utxo_commitment: Hash,
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    /// Compact-encoded target
    pub bits: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        double_sha256(&self.to_bytes())
    }

    pub fn is_genesis(&self) -> bool {
        self.parent_hashes.is_empty()
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_vlq(buf, self.parent_hashes.len() as u64);
        for parent in &self.parent_hashes {
            buf.extend_from_slice(&parent.0);
        }
        buf.extend_from_slice(&self.hash_merkle_root.0);
        buf.extend_from_slice(&self.accepted_id_merkle_root.0);
        buf.extend_from_slice(&self.utxo_commitment.0);
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
    }
}

impl Decodable for BlockHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = r.read_i32()?;
        let parent_count = r.read_count()?;
        let mut parent_hashes = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            parent_hashes.push(r.read_hash()?);
        }
        Ok(BlockHeader {
            version,
            parent_hashes,
            hash_merkle_root: r.read_hash()?,
            accepted_id_merkle_root: r.read_hash()?,
            utxo_commitment: r.read_hash()?,
            timestamp: r.read_i64()?,
            bits: r.read_u32()?,
            nonce: r.read_u64()?,
        })
    }
}

/// A complete block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Merkle root over the full transaction hashes
    pub fn compute_hash_merkle_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&hashes)
    }

    pub fn validate_hash_merkle_root(&self) -> bool {
        self.header.hash_merkle_root == self.compute_hash_merkle_root()
    }

    pub fn size(&self) -> usize {
        self.to_bytes().len()
    }
}

impl Encodable for Block {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.header.encode(buf);
        write_vlq(buf, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(buf);
        }
    }
}

impl Decodable for Block {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(r)?;
        let tx_count = r.read_count()?;
        let mut transactions = Vec::with_capacity(tx_count);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode(r)?);
        }
        Ok(Block { header, transactions })
    }
}

/// Pairwise double-SHA merkle tree; an odd node is paired with itself.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::ZERO;
    }

    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next_level = Vec::with_capacity(level.len().div_ceil(2));
        for chunk in level.chunks(2) {
            let right = chunk.get(1).unwrap_or(&chunk[0]);
            next_level.push(hash_pair(&chunk[0], right));
        }
        level = next_level;
    }
    level[0]
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block [{}] parents={} bits={:#010x} ts={}",
            self.hash(),
            self.parent_hashes.len(),
            self.bits,
            self.timestamp,
        )
    }
}
