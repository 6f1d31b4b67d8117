use std::fmt;

use crate::OverlayError;

/// Largest inode number we will ever allocate.
///
/// Inode numbers fit in 63 bits so they can cross interfaces that want a
/// signed integer without reinterpretation.
pub const MAX_INODE_NUMBER: u64 = i64::MAX as u64;

/// The root directory of every mount.
pub const ROOT_INODE: InodeNumber = InodeNumber(1);

/// Identifier for an inode within a single mount.
///
/// Numbers are allocated monotonically starting right after [ROOT_INODE] and
/// persist across remounts. The value 0 is reserved to mean "not allocated"
/// in serialized records and is not representable here.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct InodeNumber(u64);

impl InodeNumber {
    /// Wraps a raw value, rejecting 0 and anything outside the 63-bit range.
    pub fn new(raw: u64) -> Option<Self> {
        if raw == 0 || raw > MAX_INODE_NUMBER {
            None
        } else {
            Some(InodeNumber(raw))
        }
    }

    /// Wraps a value already known to be a valid allocated inode number,
    /// e.g. one read back from a record this crate wrote.
    pub fn from_raw(raw: u64) -> Self {
        debug_assert!(raw != 0 && raw <= MAX_INODE_NUMBER, "invalid inode {}", raw);
        InodeNumber(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The shard an inode's record lives in, for file-per-record backends.
    pub fn shard(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// The inode number following this one, or an overflow error.
    pub fn next(self) -> Result<Self, OverlayError> {
        match self.0.checked_add(1) {
            Some(n) if n <= MAX_INODE_NUMBER => Ok(InodeNumber(n)),
            _ => Err(OverlayError::InodeNumberOverflow),
        }
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_not_an_inode_number() {
        assert_eq!(InodeNumber::new(0), None);
    }

    #[test]
    fn numbers_above_63_bits_are_rejected() {
        assert_eq!(InodeNumber::new(MAX_INODE_NUMBER + 1), None);
        assert!(InodeNumber::new(MAX_INODE_NUMBER).is_some());
    }

    #[test]
    fn next_overflows_at_the_63_bit_boundary() {
        let last = InodeNumber::new(MAX_INODE_NUMBER).unwrap();
        assert!(matches!(
            last.next(),
            Err(OverlayError::InodeNumberOverflow)
        ));
        assert_eq!(ROOT_INODE.next().unwrap(), InodeNumber::from_raw(2));
    }

    #[test]
    fn shard_is_the_low_byte() {
        assert_eq!(InodeNumber::from_raw(0x1234).shard(), 0x34);
        assert_eq!(ROOT_INODE.shard(), 1);
    }
}
