//! Elliptic-curve multiset hash over secp256k1.
//!
//! Each element maps to a curve point; the set is the sum of its points. Adding
//! and removing commute, so a UTXO set's commitment can be updated one entry at a
//! time in any order. The empty set is the point at infinity and hashes to zero.

use std::sync::OnceLock;

use secp256k1::{PublicKey, Secp256k1, VerifyOnly};

use super::{double_sha256, sha256};
use crate::core::hash::Hash;

pub const SERIALIZED_MULTISET_SIZE: usize = 64;

fn context() -> &'static Secp256k1<VerifyOnly> {
    static CTX: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CTX.get_or_init(Secp256k1::verification_only)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MultisetError {
    #[error("serialized multiset is not a curve point")]
    InvalidPoint,
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Multiset {
    /// `None` is the point at infinity.
    point: Option<PublicKey>,
}

impl Multiset {
    pub fn new() -> Self {
        Multiset { point: None }
    }

    pub fn is_empty(&self) -> bool {
        self.point.is_none()
    }

    pub fn add_element(&mut self, data: &[u8]) {
        let p = hash_to_point(data);
        self.point = add_points(self.point, Some(p));
    }

    pub fn remove_element(&mut self, data: &[u8]) {
        let p = hash_to_point(data).negate(context());
        self.point = add_points(self.point, Some(p));
    }

    /// Union of two multisets.
    pub fn combine(&self, other: &Multiset) -> Multiset {
        Multiset { point: add_points(self.point, other.point) }
    }

    /// `self` minus `other`.
    pub fn subtract(&self, other: &Multiset) -> Multiset {
        let negated = other.point.map(|p| p.negate(context()));
        Multiset { point: add_points(self.point, negated) }
    }

    /// x || y, 32 bytes each, big-endian; all zeros for the empty set.
    pub fn serialize(&self) -> [u8; SERIALIZED_MULTISET_SIZE] {
        let mut out = [0u8; SERIALIZED_MULTISET_SIZE];
        if let Some(p) = self.point {
            out.copy_from_slice(&p.serialize_uncompressed()[1..]);
        }
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, MultisetError> {
        if bytes.len() != SERIALIZED_MULTISET_SIZE {
            return Err(MultisetError::InvalidPoint);
        }
        if bytes.iter().all(|b| *b == 0) {
            return Ok(Multiset::new());
        }
        let mut uncompressed = [0u8; SERIALIZED_MULTISET_SIZE + 1];
        uncompressed[0] = 0x04;
        uncompressed[1..].copy_from_slice(bytes);
        let point = PublicKey::from_slice(&uncompressed).map_err(|_| MultisetError::InvalidPoint)?;
        Ok(Multiset { point: Some(point) })
    }

    /// Commitment hash; zero for the empty set.
    pub fn hash(&self) -> Hash {
        match self.point {
            None => Hash::ZERO,
            Some(_) => double_sha256(&self.serialize()),
        }
    }
}

impl std::fmt::Debug for Multiset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Multiset({})", self.hash().short())
    }
}

fn add_points(a: Option<PublicKey>, b: Option<PublicKey>) -> Option<PublicKey> {
    match (a, b) {
        (None, p) | (p, None) => p,
        // combine fails only when the sum is the point at infinity
        (Some(a), Some(b)) => a.combine(&b).ok(),
    }
}

/// Try-and-increment: the first counter whose digest is a valid x coordinate.
fn hash_to_point(data: &[u8]) -> PublicKey {
    let mut preimage = Vec::with_capacity(8 + data.len());
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    let mut counter: u64 = 0;
    loop {
        preimage.clear();
        preimage.extend_from_slice(&counter.to_le_bytes());
        preimage.extend_from_slice(data);
        compressed[1..].copy_from_slice(&sha256(&preimage));
        if let Ok(point) = PublicKey::from_slice(&compressed) {
            return point;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_multiset_hashes_to_zero() {
        let set = Multiset::new();
        assert!(set.is_empty());
        assert_eq!(set.hash(), Hash::ZERO);
        assert_eq!(set.serialize(), [0u8; 64]);
    }

    #[test]
    fn test_order_independent() {
        let mut a = Multiset::new();
        a.add_element(b"one");
        a.add_element(b"two");
        a.add_element(b"three");

        let mut b = Multiset::new();
        b.add_element(b"three");
        b.add_element(b"one");
        b.add_element(b"two");

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), Hash::ZERO);
    }

    #[test]
    fn test_remove_cancels_add() {
        let mut set = Multiset::new();
        set.add_element(b"keep");
        let before = set.hash();
        set.add_element(b"temp");
        assert_ne!(set.hash(), before);
        set.remove_element(b"temp");
        assert_eq!(set.hash(), before);

        set.remove_element(b"keep");
        assert!(set.is_empty());
    }

    #[test]
    fn test_combine_and_subtract() {
        let mut x = Multiset::new();
        x.add_element(b"x");
        let mut y = Multiset::new();
        y.add_element(b"y");

        let mut both = Multiset::new();
        both.add_element(b"x");
        both.add_element(b"y");

        assert_eq!(x.combine(&y), both);
        assert_eq!(both.subtract(&y), x);
        assert!(x.subtract(&x).is_empty());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut set = Multiset::new();
        set.add_element(b"entry");
        let bytes = set.serialize();
        assert_eq!(Multiset::deserialize(&bytes).unwrap(), set);
        assert_eq!(Multiset::deserialize(&[0u8; 64]).unwrap(), Multiset::new());
        assert!(Multiset::deserialize(&[1u8; 64]).is_err());
        assert!(Multiset::deserialize(&[0u8; 10]).is_err());
    }
}
