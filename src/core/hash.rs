use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub const HASH_SIZE: usize = 32;
pub const SUBNETWORK_ID_SIZE: usize = 20;

/// A 32-byte content address. Ordering is plain lexicographic byte order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; HASH_SIZE]);

/// Transaction id: hash of the transaction with signature scripts blanked.
pub type TxId = Hash;

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_SIZE]);

    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// First 16 hex characters, used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HexError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
}

impl FromStr for Hash {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Hash::from_slice(&bytes).ok_or(HexError::Length { expected: HASH_SIZE, got: bytes.len() })
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Hash::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            Ok(Hash(<[u8; HASH_SIZE]>::deserialize(deserializer)?))
        }
    }
}

// ─── Subnetworks ─────────────────────────────────────────────────────

/// 20-byte namespace identifier for transactions.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubnetworkId(pub [u8; SUBNETWORK_ID_SIZE]);

impl SubnetworkId {
    /// Plain value transfers. No payload, no gas.
    pub const NATIVE: SubnetworkId = SubnetworkId::builtin(0);
    pub const COINBASE: SubnetworkId = SubnetworkId::builtin(1);
    /// Transactions registering a new subnetwork and its gas limit.
    pub const REGISTRY: SubnetworkId = SubnetworkId::builtin(2);

    const fn builtin(last: u8) -> Self {
        let mut id = [0u8; SUBNETWORK_ID_SIZE];
        id[SUBNETWORK_ID_SIZE - 1] = last;
        SubnetworkId(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; SUBNETWORK_ID_SIZE] = bytes.try_into().ok()?;
        Some(SubnetworkId(arr))
    }

    /// Ids of registered subnetworks are derived from the registering tx.
    pub fn from_tx_id(tx_id: &TxId) -> Self {
        let mut id = [0u8; SUBNETWORK_ID_SIZE];
        id.copy_from_slice(&tx_id.0[..SUBNETWORK_ID_SIZE]);
        SubnetworkId(id)
    }

    pub fn is_builtin(&self) -> bool {
        *self == Self::NATIVE || *self == Self::COINBASE || *self == Self::REGISTRY
    }

    pub fn is_native(&self) -> bool {
        *self == Self::NATIVE
    }
}

impl fmt::Display for SubnetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SubnetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubnetworkId({})", self)
    }
}

impl FromStr for SubnetworkId {
    type Err = HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        SubnetworkId::from_slice(&bytes)
            .ok_or(HexError::Length { expected: SUBNETWORK_ID_SIZE, got: bytes.len() })
    }
}

impl Serialize for SubnetworkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for SubnetworkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            SubnetworkId::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            Ok(SubnetworkId(<[u8; SUBNETWORK_ID_SIZE]>::deserialize(deserializer)?))
        }
    }
}
