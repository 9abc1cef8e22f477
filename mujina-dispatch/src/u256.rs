//! 256-bit unsigned integer comparisons for hashes and targets.
//!
//! Wraps `ruint::aliases::U256` so callers work in terms of the little-endian
//! byte arrays that block headers and pool targets use on the wire.

use ruint::aliases::U256 as Ruint256;

/// A 256-bit unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct U256(Ruint256);

impl U256 {
    /// Zero constant.
    pub const ZERO: Self = Self(Ruint256::ZERO);

    /// Create from little-endian bytes.
    pub fn from_le_bytes(bytes: [u8; 32]) -> Self {
        Self(Ruint256::from_le_bytes(bytes))
    }

    /// Convert to little-endian bytes.
    pub fn to_le_bytes(self) -> [u8; 32] {
        self.0.to_le_bytes()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

/// True when `hash` (little-endian) is at or below `target` (little-endian).
pub fn meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    U256::from_le_bytes(*hash) <= U256::from_le_bytes(*target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_uses_most_significant_bytes() {
        let mut low = [0xffu8; 32];
        low[31] = 0x00;
        let mut high = [0u8; 32];
        high[31] = 0x01;
        assert!(U256::from_le_bytes(low) < U256::from_le_bytes(high));
    }

    #[test]
    fn test_meets_target() {
        let mut target = [0u8; 32];
        target[28] = 0xff;
        let mut hash = [0u8; 32];
        hash[27] = 0xff;
        assert!(meets_target(&hash, &target));
        hash[29] = 1;
        assert!(!meets_target(&hash, &target));
        assert!(meets_target(&target, &target));
    }

    #[test]
    fn test_round_trip_bytes() {
        let mut bytes = [0u8; 32];
        bytes[3] = 0x42;
        assert_eq!(U256::from_le_bytes(bytes).to_le_bytes(), bytes);
        assert!(U256::ZERO.is_zero());
    }
}
