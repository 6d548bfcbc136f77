//! Compact target utilities and difficulty retargeting.

use ltcspv_consensus::Hash256;
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    Compact(CompactError),
    /// Header hash does not meet its stated target.
    HashAboveTarget,
    /// Stated target is easier than the network's proof-of-work limit.
    TargetAboveLimit,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::Compact(err) => write!(f, "{err}"),
            PowError::HashAboveTarget => write!(f, "block hash exceeds stated target"),
            PowError::TargetAboveLimit => write!(f, "stated target exceeds proof-of-work limit"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(err: CompactError) -> Self {
        PowError::Compact(err)
    }
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    let value = compact_to_u256(bits)?;
    Ok(value.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    let value = U256::from_little_endian(target);
    u256_to_compact(value)
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    let hash_value = U256::from_little_endian(hash);
    let target_value = U256::from_little_endian(target);
    hash_value <= target_value
}

/// Work contributed by a block with the given compact target,
/// `floor(2^256 / (target + 1))`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// Checks a header hash against its own stated target and the network limit.
pub fn check_proof_of_work(hash: &Hash256, bits: u32, pow_limit: &Hash256) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    let limit = U256::from_little_endian(pow_limit);
    if target > limit {
        return Err(PowError::TargetAboveLimit);
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}

/// Computes the compact bits expected after a retarget.
///
/// `timespan` is the measured seconds between the header one interval back
/// and the previous header, before clamping. The result is masked to the
/// 24-bit precision of `received_bits`, so it compares directly against the
/// value a peer put in the header.
pub fn retarget_bits(
    prev_bits: u32,
    timespan: i64,
    target_timespan: i64,
    pow_limit: &Hash256,
    received_bits: u32,
) -> Result<u32, CompactError> {
    let timespan = timespan.clamp(target_timespan / 4, target_timespan * 4);

    let max_target = U256::from_little_endian(pow_limit);
    let mut new_target = compact_to_u256(prev_bits)?;

    // The shift keeps the intermediate inside 256 bits when the previous
    // target already sits at the limit; reproduced for bit-exact rounding.
    let shifted = new_target > max_target - U256::from(1u64);
    if shifted {
        new_target >>= 1;
    }

    let wide = U512::from_big_endian(&new_target.to_big_endian());
    let wide = wide * U512::from(timespan as u64) / U512::from(target_timespan as u64);
    let narrowed = wide.to_big_endian();
    let mut new_target = U256::from_big_endian(&narrowed[32..]);

    if shifted {
        new_target <<= 1;
    }

    if new_target > max_target {
        new_target = max_target;
    }

    Ok(round_to_received_precision(new_target, received_bits))
}

/// Masks `target` down to the 24-bit mantissa precision implied by
/// `received_bits` and re-encodes it as compact bits.
pub fn round_to_received_precision(target: U256, received_bits: u32) -> u32 {
    let accuracy_bytes = (received_bits >> 24) as i32 - 3;
    let mantissa = U256::from(0x00ff_ffffu64);
    let mask = if accuracy_bytes >= 0 {
        mantissa << (accuracy_bytes as usize * 8)
    } else {
        mantissa >> (accuracy_bytes.unsigned_abs() as usize * 8)
    };
    u256_to_compact(target & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltcspv_consensus::params::{chain_config, Network};

    #[test]
    fn compact_round_trips() {
        for bits in [0x1e0f_fff0u32, 0x1e0f_ffff, 0x1d00_ffff, 0x207f_ffff, 0x1c05_a3f4] {
            let value = compact_to_u256(bits).expect("target");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn compact_rejects_negative() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
    }

    #[test]
    fn compact_rejects_overflow() {
        assert_eq!(compact_to_u256(0x2300_ffff), Err(CompactError::Overflow));
    }

    #[test]
    fn proof_grows_with_difficulty() {
        let easy = block_proof(0x1e0f_ffff).expect("easy proof");
        let hard = block_proof(0x1d00_ffff).expect("hard proof");
        assert!(hard > easy);
    }

    #[test]
    fn pow_limit_accepted_hash_above_rejected() {
        let config = chain_config(Network::Mainnet);
        let target = compact_to_target(0x1e0f_fff0).expect("target");
        let mut below = target;
        below[31] = 0;
        assert!(check_proof_of_work(&below, 0x1e0f_fff0, &config.pow_limit).is_ok());

        let mut above = [0u8; 32];
        above[31] = 0x10;
        assert_eq!(
            check_proof_of_work(&above, 0x1e0f_fff0, &config.pow_limit),
            Err(PowError::HashAboveTarget)
        );
    }

    #[test]
    fn easier_than_limit_rejected() {
        let config = chain_config(Network::Mainnet);
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x207f_ffff, &config.pow_limit),
            Err(PowError::TargetAboveLimit)
        );
    }

    #[test]
    fn retarget_on_schedule_keeps_bits() {
        let config = chain_config(Network::Mainnet);
        let bits = retarget_bits(
            0x1e0f_fff0,
            config.pow_target_timespan,
            config.pow_target_timespan,
            &config.pow_limit,
            0x1e0f_fff0,
        )
        .expect("retarget");
        assert_eq!(bits, 0x1e0f_fff0);
    }

    #[test]
    fn retarget_clamps_fast_chain() {
        let config = chain_config(Network::Mainnet);
        // A quarter timespan quadruples difficulty.
        let bits = retarget_bits(
            0x1e0f_fff0,
            1,
            config.pow_target_timespan,
            &config.pow_limit,
            0x1e03_ffff,
        )
        .expect("retarget");
        assert_eq!(bits, 0x1e03_fffc);
    }

    #[test]
    fn retarget_clamps_slow_chain_to_limit() {
        let config = chain_config(Network::Mainnet);
        let bits = retarget_bits(
            0x1e0f_ffff,
            config.pow_target_timespan * 100,
            config.pow_target_timespan,
            &config.pow_limit,
            0x1e0f_ffff,
        )
        .expect("retarget");
        assert_eq!(bits, 0x1e0f_ffff);
    }

    #[test]
    fn precision_rounding_masks_low_bytes() {
        let target = compact_to_u256(0x1d00_ffff).expect("target");
        let noisy = target + U256::from(0xabcdu64);
        assert_eq!(round_to_received_precision(noisy, 0x1d00_ffff), 0x1d00_ffff);
    }
}
