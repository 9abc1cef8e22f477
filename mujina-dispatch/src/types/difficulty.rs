//! Difficulty and target conversions.
//!
//! Pools describe work in two ways: as a 256-bit little-endian target (getwork
//! and GBT) or as a floating-point difficulty (stratum). Both are related to
//! the difficulty-1 target, `0x00000000ffff0000...0000`:
//!
//! ```text
//! difficulty = TRUEDIFFONE / target
//! ```
//!
//! The conversions work on four 64-bit limbs in double precision rather than
//! exact 256-bit division. A difficulty is only ever an approximation, and the
//! limb form keeps `difficulty_to_target` an exact inverse to within float
//! tolerance across the whole range pools use.

use std::fmt;

/// The difficulty-1 target, `0xffff * 2^208`.
pub const TRUEDIFFONE: f64 =
    26959535291011309493156476344723991336010898738574164086137773096960.0;

const BITS192: f64 = 6277101735386680763835789423207666416102355444464034512896.0;
const BITS128: f64 = 340282366920938463463374607431768211456.0;
const BITS64: f64 = 18446744073709551616.0;

fn limb(bytes: &[u8; 32], index: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[index * 8..index * 8 + 8]);
    u64::from_le_bytes(word)
}

/// Interpret 32 little-endian bytes as a double-precision number.
pub fn le256_to_f64(bytes: &[u8; 32]) -> f64 {
    limb(bytes, 3) as f64 * BITS192
        + limb(bytes, 2) as f64 * BITS128
        + limb(bytes, 1) as f64 * BITS64
        + limb(bytes, 0) as f64
}

/// Difficulty represented by a 256-bit little-endian target.
///
/// An all-zero target is treated as one so the result stays finite.
pub fn target_to_difficulty(target: &[u8; 32]) -> f64 {
    let mut value = le256_to_f64(target);
    if value == 0.0 {
        value = 1.0;
    }
    TRUEDIFFONE / value
}

/// Target for `diff`, as 32 little-endian bytes.
///
/// A zero or negative difficulty is clamped to 1.
pub fn difficulty_to_target(diff: f64) -> [u8; 32] {
    let diff = if diff > 0.0 { diff } else { 1.0 };
    let mut target = [0u8; 32];
    let mut remaining = TRUEDIFFONE / diff;

    for (index, scale) in [(3, BITS192), (2, BITS128), (1, BITS64)] {
        // Float to int casts saturate, which is what we want for the top limb
        // of targets easier than difficulty 1.
        let word = (remaining / scale) as u64;
        target[index * 8..index * 8 + 8].copy_from_slice(&word.to_le_bytes());
        remaining -= word as f64 * scale;
        if remaining < 0.0 {
            remaining = 0.0;
        }
    }
    target[..8].copy_from_slice(&(remaining as u64).to_le_bytes());
    target
}

/// Difficulty a found hash actually achieved, rounded to an integer.
pub fn share_difficulty(hash: &[u8; 32]) -> u64 {
    let mut value = le256_to_f64(hash);
    if value == 0.0 {
        value = 1.0;
    }
    (TRUEDIFFONE / value).round() as u64
}

/// Integer difficulty for display, formatted with SI suffixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Difficulty(u64);

impl Difficulty {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }
}

impl From<Difficulty> for u64 {
    fn from(diff: Difficulty) -> Self {
        diff.0
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0 as f64;

        let (scaled, suffix) = if value >= 1e18 {
            (value / 1e18, "E")
        } else if value >= 1e15 {
            (value / 1e15, "P")
        } else if value >= 1e12 {
            (value / 1e12, "T")
        } else if value >= 1e9 {
            (value / 1e9, "G")
        } else if value >= 1e6 {
            (value / 1e6, "M")
        } else if value >= 1e3 {
            (value / 1e3, "K")
        } else {
            return write!(f, "{}", self.0);
        };

        if scaled >= 100.0 {
            write!(f, "{:.0}{}", scaled, suffix)
        } else if scaled >= 10.0 {
            write!(f, "{:.1}{}", scaled, suffix)
        } else {
            write!(f, "{:.2}{}", scaled, suffix)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn diff1_target() -> [u8; 32] {
        let mut target = [0u8; 32];
        target[26] = 0xff;
        target[27] = 0xff;
        target
    }

    #[test]
    fn test_diff1_target() {
        assert_eq!(difficulty_to_target(1.0), diff1_target());
        assert!((target_to_difficulty(&diff1_target()) - 1.0).abs() < 1e-12);
    }

    #[test_case(1.0)]
    #[test_case(1.5)]
    #[test_case(512.0)]
    #[test_case(65536.0)]
    #[test_case(12345.678)]
    #[test_case(3_000_000.25)]
    #[test_case(1e9)]
    fn test_round_trip_within_tolerance(diff: f64) {
        let recovered = target_to_difficulty(&difficulty_to_target(diff));
        let relative = ((recovered - diff) / diff).abs();
        assert!(relative < 1e-6, "diff {diff} recovered as {recovered}");
    }

    #[test]
    fn test_higher_difficulty_gives_smaller_target() {
        use crate::u256::U256;
        let easy = U256::from_le_bytes(difficulty_to_target(8.0));
        let hard = U256::from_le_bytes(difficulty_to_target(4096.0));
        assert!(hard < easy);
    }

    #[test]
    fn test_zero_target_does_not_divide_by_zero() {
        let diff = target_to_difficulty(&[0u8; 32]);
        assert!(diff.is_finite());
        assert_eq!(share_difficulty(&[0u8; 32]), TRUEDIFFONE.round() as u64);
    }

    #[test]
    fn test_zero_difficulty_clamped() {
        assert_eq!(difficulty_to_target(0.0), diff1_target());
        assert_eq!(difficulty_to_target(-4.0), diff1_target());
    }

    #[test]
    fn test_share_difficulty_of_target_hash() {
        // A hash exactly at the difficulty-1024 target achieves difficulty 1024.
        let hash = difficulty_to_target(1024.0);
        assert_eq!(share_difficulty(&hash), 1024);
    }

    #[test]
    fn test_share_difficulty_from_leading_zeros() {
        // Genesis block hash, little-endian.
        let mut hash =
            hex::decode("000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f")
                .unwrap();
        hash.reverse();
        let hash: [u8; 32] = hash.try_into().unwrap();
        assert_eq!(share_difficulty(&hash), 2536);
    }

    #[test]
    fn test_difficulty_display() {
        assert_eq!(Difficulty::new(500).to_string(), "500");
        assert_eq!(Difficulty::new(1_500_000).to_string(), "1.50M");
        assert_eq!(Difficulty::new(11_200_000_000_000).to_string(), "11.2T");
        assert_eq!(Difficulty::new(112_700_000_000_000).to_string(), "113T");
    }
}
