use super::double_sha256;
use crate::core::codec::{write_var_bytes, write_vlq};
use crate::core::hash::Hash;
use crate::core::types::Transaction;

/// Canonical transaction encoding.
///
/// version(i32) || vlq(#inputs) || inputs || vlq(#outputs) || outputs ||
/// lock_time(u64) || subnetwork_id(20) || gas(u64) || payload_hash(32, non-native only) ||
/// vlq(len) payload
///
/// With `blank_signature_scripts` every input's signature script is written as empty,
/// which is the preimage of the transaction id.
pub fn encode_transaction(tx: &Transaction, buf: &mut Vec<u8>, blank_signature_scripts: bool) {
    buf.extend_from_slice(&tx.version.to_le_bytes());

    write_vlq(buf, tx.inputs.len() as u64);
    for input in &tx.inputs {
        buf.extend_from_slice(&input.previous_outpoint.tx_id.0);
        buf.extend_from_slice(&input.previous_outpoint.index.to_le_bytes());
        if blank_signature_scripts {
            write_vlq(buf, 0);
        } else {
            write_var_bytes(buf, &input.signature_script);
        }
        buf.extend_from_slice(&input.sequence.to_le_bytes());
    }

    write_vlq(buf, tx.outputs.len() as u64);
    for output in &tx.outputs {
        buf.extend_from_slice(&output.value.to_le_bytes());
        write_var_bytes(buf, &output.script_pub_key);
    }

    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    buf.extend_from_slice(&tx.subnetwork_id.0);
    buf.extend_from_slice(&tx.gas.to_le_bytes());
    if !tx.subnetwork_id.is_native() {
        buf.extend_from_slice(&tx.payload_hash.unwrap_or(Hash::ZERO).0);
    }
    write_var_bytes(buf, &tx.payload);
}

/// Transaction id: excludes signature scripts so it is stable under re-signing.
pub fn tx_id(tx: &Transaction) -> Hash {
    let mut buf = Vec::with_capacity(256);
    encode_transaction(tx, &mut buf, true);
    double_sha256(&buf)
}

/// Transaction hash: covers the full transaction, signature scripts included.
pub fn tx_hash(tx: &Transaction) -> Hash {
    let mut buf = Vec::with_capacity(256);
    encode_transaction(tx, &mut buf, false);
    double_sha256(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{OutPoint, TxInput, TxOutput};

    fn sample_tx(sig: Vec<u8>) -> Transaction {
        Transaction::new_native(
            vec![TxInput {
                previous_outpoint: OutPoint { tx_id: Hash([3; 32]), index: 1 },
                signature_script: sig,
                sequence: u64::MAX,
            }],
            vec![TxOutput { value: 10, script_pub_key: vec![0x51] }],
            0,
        )
    }

    #[test]
    fn test_txid_ignores_signature_script() {
        let a = sample_tx(vec![1, 2, 3]);
        let b = sample_tx(vec![9, 9]);
        assert_eq!(tx_id(&a), tx_id(&b));
        assert_ne!(tx_hash(&a), tx_hash(&b));
    }

    #[test]
    fn test_txid_equals_hash_without_signatures() {
        let tx = sample_tx(vec![]);
        assert_eq!(tx_id(&tx), tx_hash(&tx));
    }
}
