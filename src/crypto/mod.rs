//! Hash primitives and the elliptic-curve multiset used for UTXO commitments.

use sha2::{Digest, Sha256};

use crate::core::hash::Hash;

pub mod multiset;
pub mod txid;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Double SHA-256, the content address of blocks and transactions.
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    Hash(out)
}

/// Hash of two concatenated nodes, used for merkle trees.
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(&left.0);
    combined[32..].copy_from_slice(&right.0);
    double_sha256(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_sha256_empty() {
        // sha256(sha256(""))
        assert_eq!(
            double_sha256(b"").to_string(),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }

    #[test]
    fn test_hash_pair_order_matters() {
        let a = Hash([1; 32]);
        let b = Hash([2; 32]);
        assert_ne!(hash_pair(&a, &b), hash_pair(&b, &a));
    }
}
