use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit perceptual hash of an asset's content.
///
/// Distance is the Hamming distance between the bit patterns, which is
/// symmetric and zero for identical fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub const BITS: u32 = 64;

    /// Number of 8-bit bands the fingerprint is split into for indexing.
    pub const BANDS: usize = 8;

    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Builds a fingerprint from hash bytes, big-endian. Shorter inputs are
    /// zero-padded, longer ones truncated to the first eight bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        let len = bytes.len().min(8);
        buf[..len].copy_from_slice(&bytes[..len]);
        Self(u64::from_be_bytes(buf))
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn distance(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    /// The `index`-th byte of the fingerprint, most significant first.
    pub fn band(&self, index: usize) -> u8 {
        debug_assert!(index < Self::BANDS);
        (self.0 >> ((Self::BANDS - 1 - index) * 8)) as u8
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_is_symmetric_and_zero_on_self() {
        let a = Fingerprint::from_bits(0b1011);
        let b = Fingerprint::from_bits(0b0110);
        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&b), 3);
    }

    #[test]
    fn test_bands_cover_all_bytes() {
        let fp = Fingerprint::from_bits(0x0102_0304_0506_0708);
        let bands: Vec<u8> = (0..Fingerprint::BANDS).map(|i| fp.band(i)).collect();
        assert_eq!(bands, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_from_bytes_pads_short_input() {
        assert_eq!(Fingerprint::from_bytes(&[0xff]).bits(), 0xff00_0000_0000_0000);
        assert_eq!(
            Fingerprint::from_bytes(&[0, 0, 0, 0, 0, 0, 0, 1, 9]).bits(),
            1
        );
        assert_eq!(Fingerprint::from_bits(0xab).to_string(), "00000000000000ab");
    }
}
