//! Difficulty and compact target utilities.

use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Overflow,
    ZeroTarget,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
            CompactError::ZeroTarget => write!(f, "compact target is zero"),
        }
    }
}

impl std::error::Error for CompactError {}

const DIFFICULTY_SCALE: u64 = 100_000_000;

/// `coefficient * 2^(8 * (exponent - 3))`, the coefficient being the low 24 bits.
pub fn target_from_bits(bits: u32) -> Result<U256, CompactError> {
    let exponent = bits >> 24;
    let coefficient = bits & 0x00ff_ffff;
    if exponent <= 3 {
        return Ok(U256::from(coefficient >> (8 * (3 - exponent))));
    }
    if coefficient == 0 {
        return Ok(U256::zero());
    }
    let shift = 8 * (exponent - 3);
    let value = U256::from(coefficient);
    if value.bits() as u32 + shift > 256 {
        return Err(CompactError::Overflow);
    }
    Ok(value << shift)
}

/// `max_target / target`, rounded half-up to 8 decimals.
pub fn difficulty_from_bits(bits: u32, max_target_bits: u32) -> Result<f64, CompactError> {
    let target = target_from_bits(bits)?;
    if target.is_zero() {
        return Err(CompactError::ZeroTarget);
    }
    let max_target = target_from_bits(max_target_bits)?;
    Ok(ratio_rounded(max_target, target))
}

fn ratio_rounded(numerator: U256, denominator: U256) -> f64 {
    let mut whole = numerator / denominator;
    let remainder = numerator % denominator;
    let scaled = remainder.full_mul(U256::from(DIFFICULTY_SCALE))
        + U512::from(denominator / U256::from(2u8));
    let mut fraction = (scaled / U512::from(denominator)).low_u64();
    if fraction >= DIFFICULTY_SCALE {
        whole = whole.saturating_add(U256::one());
        fraction -= DIFFICULTY_SCALE;
    }
    u256_to_f64(whole) + fraction as f64 / DIFFICULTY_SCALE as f64
}

/// Nearest `f64`, keeping the top 128 bits.
pub fn u256_to_f64(value: U256) -> f64 {
    if value.bits() <= 128 {
        return value.as_u128() as f64;
    }
    let shift = value.bits() - 128;
    (value >> shift).as_u128() as f64 * 2f64.powi(shift as i32)
}

/// `floor(2^256 / (target + 1))`; zero for a zero target.
pub fn work_from_target(target: U256) -> U256 {
    if target.is_zero() {
        return U256::zero();
    }
    let one = U256::one();
    (!target / (target + one)) + one
}

pub fn work_from_bits(bits: u32) -> Result<U256, CompactError> {
    Ok(work_from_target(target_from_bits(bits)?))
}

pub fn bits_to_hex(bits: u32) -> String {
    format!("{bits:08x}")
}

pub fn bits_from_hex(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u32::from_str_radix(digits, 16).ok()
}

/// 64 lowercase hex digits, most significant first.
pub fn u256_to_hex(value: U256) -> String {
    let mut out = String::with_capacity(64);
    for byte in value.to_big_endian() {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_exponent_shifts_right() {
        assert_eq!(target_from_bits(0x0212_3456).unwrap(), U256::from(0x1234u32));
        assert_eq!(target_from_bits(0x0312_3456).unwrap(), U256::from(0x12_3456u32));
    }

    #[test]
    fn oversized_exponent_overflows() {
        assert_eq!(target_from_bits(0x2301_0000), Err(CompactError::Overflow));
        assert_eq!(target_from_bits(0x2300_0000).unwrap(), U256::zero());
    }

    #[test]
    fn fraction_rounding_carries() {
        // 2 / 3 rounds to 0.66666667, 199999999.5 / 100000000 carries into the integer part.
        assert_eq!(ratio_rounded(U256::from(2u8), U256::from(3u8)), 0.666_666_67);
        assert_eq!(
            ratio_rounded(U256::from(399_999_999u64), U256::from(200_000_000u64)),
            2.0
        );
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(bits_to_hex(0x1d00ffff), "1d00ffff");
        assert_eq!(bits_from_hex("0x1d59063c"), Some(0x1d59063c));
        assert_eq!(bits_from_hex("1e0ffff0"), Some(0x1e0ffff0));
        assert_eq!(bits_from_hex("zz"), None);
        let value = U256::from(0x1234u32);
        let hex = u256_to_hex(value);
        assert_eq!(hex.len(), 64);
        assert!(hex.ends_with("1234"));
    }
}
