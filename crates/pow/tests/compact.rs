use exploder_pow::difficulty::{
    difficulty_from_bits, target_from_bits, u256_to_hex, work_from_bits, work_from_target,
    CompactError,
};
use primitive_types::U256;

const MAX_TARGET_BITS: u32 = 0x1d00ffff;

#[test]
fn genesis_bits() {
    let target = target_from_bits(0x1d00ffff).expect("target");
    assert_eq!(target, U256::from(0xffffu32) << 208);
    assert_eq!(
        u256_to_hex(target),
        "00000000ffff0000000000000000000000000000000000000000000000000000"
    );
    assert_eq!(difficulty_from_bits(0x1d00ffff, MAX_TARGET_BITS), Ok(1.0));
    assert_eq!(work_from_target(target), U256::from(4_295_032_833u64));
}

#[test]
fn low_difficulty_blocks() {
    assert_eq!(
        difficulty_from_bits(0x1d22544b, MAX_TARGET_BITS),
        Ok(0.029_129_22)
    );
    assert_eq!(
        difficulty_from_bits(0x1e0ffff0, MAX_TARGET_BITS),
        Ok(0.000_244_14)
    );
    assert_eq!(work_from_bits(0x1d59063c), Ok(U256::from(48_244_858u64)));
    assert_eq!(work_from_bits(0x1e0ffff0), Ok(U256::from(1_048_592u64)));
}

#[test]
fn high_difficulty_block() {
    let difficulty = difficulty_from_bits(0x1b0404cb, MAX_TARGET_BITS).expect("difficulty");
    assert!((difficulty - 16_307.420_938_52).abs() < 1e-6);
    assert_eq!(
        work_from_bits(0x1b0404cb),
        Ok(U256::from(70_040_908_352_512u64))
    );
}

#[test]
fn work_is_inverse_of_target() {
    let easy = work_from_bits(0x207fffff).expect("work");
    let hard = work_from_bits(0x1d00ffff).expect("work");
    assert_eq!(easy, U256::from(2u8));
    assert!(hard > easy);
    assert_eq!(work_from_target(U256::zero()), U256::zero());
}

#[test]
fn zero_target_has_no_difficulty() {
    assert_eq!(
        difficulty_from_bits(0x0300_0000, MAX_TARGET_BITS),
        Err(CompactError::ZeroTarget)
    );
}
