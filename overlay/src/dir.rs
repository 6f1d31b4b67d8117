use std::collections::BTreeMap;

use bstr::{BStr, BString, ByteSlice};
use bytes::Bytes;

use crate::inode_number::InodeNumber;

/// File-type bits used inside overlay records.
///
/// These match the POSIX `S_IF*` constants but are fixed-width and
/// platform-independent so records written on one host parse on another.
pub mod mode {
    pub const FMT: u32 = 0o170000;
    pub const DIR: u32 = 0o040000;
    pub const REG: u32 = 0o100000;
    pub const LNK: u32 = 0o120000;
    pub const SOCK: u32 = 0o140000;
}

/// A single child entry in a directory record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayEntry {
    /// POSIX mode bits, including the file type.
    pub mode: u32,

    /// The child's allocated inode number.
    ///
    /// `None` only occurs in legacy records that predate eager allocation;
    /// every entry written by this crate carries a number.
    pub inode: Option<InodeNumber>,

    /// The source-control object backing this entry.
    ///
    /// Present iff the entry is not materialized: the child is still
    /// byte-identical to this object and has no overlay data of its own.
    pub object_id: Option<Bytes>,
}

impl OverlayEntry {
    pub fn is_directory(&self) -> bool {
        self.mode & mode::FMT == mode::DIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & mode::FMT == mode::LNK
    }

    pub fn is_materialized(&self) -> bool {
        self.object_id.is_none()
    }
}

/// Errors produced when assembling a directory record.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidateEntryError {
    /// Entry names may not be empty, contain slashes or NUL, or be `.`/`..`.
    #[error("invalid entry name: {:?}", .0.as_bstr())]
    InvalidName(BString),
    #[error("{:?} is a duplicate name", .0.as_bstr())]
    DuplicateName(BString),
}

/// The serializable contents of one directory: an ordered map from entry
/// name to [OverlayEntry].
///
/// Iteration order is the on-disk order (lexicographic by name bytes), which
/// lets two sorted walks be merged without buffering.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OverlayDir {
    entries: BTreeMap<BString, OverlayEntry>,
}

impl OverlayDir {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &[u8]) -> Option<&OverlayEntry> {
        self.entries.get(BStr::new(name))
    }

    /// Checks an entry name for validity.
    /// We disallow slashes, NUL bytes, `.`, `..` and the empty string.
    pub fn validate_name(name: &[u8]) -> Result<(), ValidateEntryError> {
        if name.is_empty()
            || name == b".."
            || name == b"."
            || name.contains(&0x00)
            || name.contains(&b'/')
        {
            Err(ValidateEntryError::InvalidName(name.into()))
        } else {
            Ok(())
        }
    }

    /// Adds an entry, keeping the map sorted. Rejects invalid and duplicate
    /// names.
    pub fn add(&mut self, name: BString, entry: OverlayEntry) -> Result<(), ValidateEntryError> {
        Self::validate_name(&name)?;
        if self.entries.contains_key(&name) {
            return Err(ValidateEntryError::DuplicateName(name));
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    /// Inserts or replaces an entry without name validation; used when
    /// rebuilding a record from already-validated in-memory state.
    pub fn insert(&mut self, name: BString, entry: OverlayEntry) -> Option<OverlayEntry> {
        self.entries.insert(name, entry)
    }

    pub fn remove(&mut self, name: &[u8]) -> Option<OverlayEntry> {
        self.entries.remove(BStr::new(name))
    }

    /// Iterates entries in name order.
    pub fn entries(&self) -> impl Iterator<Item = (&BStr, &OverlayEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_bstr(), v))
    }
}

impl FromIterator<(BString, OverlayEntry)> for OverlayDir {
    fn from_iter<T: IntoIterator<Item = (BString, OverlayEntry)>>(iter: T) -> Self {
        OverlayDir {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_entry(ino: u64) -> OverlayEntry {
        OverlayEntry {
            mode: mode::REG | 0o644,
            inode: Some(InodeNumber::from_raw(ino)),
            object_id: None,
        }
    }

    #[test]
    fn entries_iterate_in_name_order() {
        let mut d = OverlayDir::new();
        d.add("zebra".into(), file_entry(4)).unwrap();
        d.add("apple".into(), file_entry(2)).unwrap();
        d.add("mango".into(), file_entry(3)).unwrap();

        let names: Vec<_> = d.entries().map(|(n, _)| n.to_owned()).collect();
        assert_eq!(names, vec!["apple", "mango", "zebra"]);
    }

    #[test]
    fn add_rejects_bad_names() {
        let mut d = OverlayDir::new();
        for bad in [&b""[..], b".", b"..", b"a/b", b"a\0b"] {
            assert!(
                matches!(
                    d.add(bad.into(), file_entry(2)),
                    Err(ValidateEntryError::InvalidName(_))
                ),
                "{:?} should be rejected",
                bad.as_bstr()
            );
        }
    }

    #[test]
    fn add_rejects_duplicates() {
        let mut d = OverlayDir::new();
        d.add("a".into(), file_entry(2)).unwrap();
        assert_eq!(
            d.add("a".into(), file_entry(3)),
            Err(ValidateEntryError::DuplicateName("a".into()))
        );
    }
}
