//! Proof-of-work targets.
//!
//! Headers carry their target in the compact "bits" form: the top byte is a
//! base-256 exponent, the low 23 bits the mantissa, and bit 23 a sign that a
//! valid target never sets.
//!
//!   target = mantissa * 256^(exponent - 3)
//!
//! A header hash is read as a little-endian 256-bit integer and must not exceed
//! the target. The target itself must lie in (0, pow_max].
//!
//! Retargeting averages the targets of a window of blue blocks and scales the
//! average by how long the window actually took compared with the intended
//! block rate.

use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

use crate::core::hash::Hash;
use crate::core::types::BlockHeader;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PowError {
    #[error("target encoded by bits {0:#010x} is not positive")]
    NonPositiveTarget(u32),
    #[error("target encoded by bits {0:#010x} is above the maximum")]
    TargetAboveMax(u32),
    #[error("block hash {hash} is above its target")]
    HighHash { hash: Hash },
}

/// Decode compact bits. `None` for a negative encoding.
pub fn compact_to_target(bits: u32) -> Option<BigUint> {
    let mantissa = bits & 0x007f_ffff;
    let negative = bits & 0x0080_0000 != 0;
    let exponent = bits >> 24;

    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3) as usize)
    };

    if negative && !target.is_zero() {
        return None;
    }
    Some(target)
}

/// Encode a target as compact bits, rounding the mantissa down.
pub fn target_to_compact(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let mut size = target.to_bytes_be().len() as u32;
    let mut mantissa: u32 = if size <= 3 {
        let low = target.to_u32().unwrap_or(0);
        low << (8 * (3 - size))
    } else {
        let shifted: BigUint = target >> (8 * (size - 3) as usize);
        shifted.to_u32().unwrap_or(0)
    };

    // Keep bit 23 clear; it is the sign bit.
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    mantissa | (size << 24)
}

/// A hash as the integer it is compared against the target with.
pub fn hash_to_big(hash: &Hash) -> BigUint {
    BigUint::from_bytes_le(&hash.0)
}

/// Check the target range and, unless `skip_hash_check`, the hash itself.
pub fn check_proof_of_work(header: &BlockHeader, pow_max: &BigUint, skip_hash_check: bool) -> Result<(), PowError> {
    let target = compact_to_target(header.bits).ok_or(PowError::NonPositiveTarget(header.bits))?;
    if target.is_zero() {
        return Err(PowError::NonPositiveTarget(header.bits));
    }
    if &target > pow_max {
        return Err(PowError::TargetAboveMax(header.bits));
    }

    if !skip_hash_check {
        let hash = header.hash();
        if hash_to_big(&hash) > target {
            return Err(PowError::HighHash { hash });
        }
    }
    Ok(())
}

/// Expected number of hashes to meet `bits`: 2^256 / (target + 1).
pub fn calc_work(bits: u32) -> BigUint {
    match compact_to_target(bits) {
        Some(target) if !target.is_zero() => (BigUint::one() << 256usize) / (target + BigUint::one()),
        _ => BigUint::zero(),
    }
}

/// Next target from a window of blue blocks.
///
/// `targets` are the window's decoded targets; `min_timestamp`/`max_timestamp`
/// bound the window in milliseconds. The result is clamped to [1, pow_max].
pub fn retarget(
    targets: &[BigUint],
    min_timestamp: i64,
    max_timestamp: i64,
    target_time_per_block_ms: i64,
    pow_max: &BigUint,
) -> BigUint {
    if targets.is_empty() {
        return pow_max.clone();
    }

    let sum: BigUint = targets.iter().sum();
    let average = sum / BigUint::from(targets.len());

    let actual_span = (max_timestamp - min_timestamp).max(1) as u64;
    let intervals = (targets.len() as u64).saturating_sub(1).max(1);
    let expected_span = (target_time_per_block_ms.max(1) as u64).saturating_mul(intervals);

    let next = average * BigUint::from(actual_span) / BigUint::from(expected_span);
    if next.is_zero() {
        BigUint::one()
    } else if &next > pow_max {
        pow_max.clone()
    } else {
        next
    }
}
