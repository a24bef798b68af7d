//! Log Sequence Numbers
//!
//! Positions in the write-ahead log that commit waits are anchored to.

use serde::{Deserialize, Serialize};

/// Byte position in the write-ahead log.
///
/// Zero is reserved as the invalid position: a standby that has not yet
/// reported a flush position reports zero.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The invalid (never reached) position
    pub const INVALID: Lsn = Lsn(0);

    /// Create an LSN from a raw byte position
    pub const fn new(pos: u64) -> Self {
        Lsn(pos)
    }

    /// Raw byte position
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this position has ever been reached
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Bytes between `earlier` and this position, zero if `earlier` is ahead
    pub fn bytes_since(self, earlier: Lsn) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl From<u64> for Lsn {
    fn from(pos: u64) -> Self {
        Lsn(pos)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_splits_high_and_low_words() {
        assert_eq!(Lsn::new(0).to_string(), "0/0");
        assert_eq!(Lsn::new(0x1_0000_00FF).to_string(), "1/FF");
        assert_eq!(Lsn::new(0xAB).to_string(), "0/AB");
    }

    #[test]
    fn test_validity_and_distance() {
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::new(1).is_valid());
        assert_eq!(Lsn::new(150).bytes_since(Lsn::new(100)), 50);
        assert_eq!(Lsn::new(100).bytes_since(Lsn::new(150)), 0);
    }
}
