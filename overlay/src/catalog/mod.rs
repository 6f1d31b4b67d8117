//! Durable inode → directory-record storage.
//!
//! The catalog persists one [OverlayDir] per directory inode and owns the
//! mount's inode number allocator. Several backends exist, selected at mount
//! construction:
//!
//!  - [FsCatalog]: one record file per directory under a 256-way shard
//!    (see [crate::fs]).
//!  - [RedbCatalog]: a single transactional key/value database.
//!  - [MemoryCatalog]: no persistence, for tests and ephemeral mounts.
//!  - [BufferedCatalog]: write-behind wrapper around another backend.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::dir::OverlayDir;
use crate::inode_number::{InodeNumber, MAX_INODE_NUMBER};
use crate::{OverlayEntry, OverlayError};

mod buffered;
mod fs;
mod memory;
mod redb;

pub use self::buffered::BufferedCatalog;
pub use self::fs::FsCatalog;
pub use self::memory::MemoryCatalog;
pub use self::redb::RedbCatalog;

/// Monotonic allocator for inode numbers.
///
/// The arithmetic is shared by every backend; overflow of the 63-bit space
/// is fatal and surfaced to the caller.
#[derive(Debug)]
pub struct InodeAllocator {
    next: AtomicU64,
}

impl InodeAllocator {
    pub fn new() -> Self {
        InodeAllocator {
            next: AtomicU64::new(0),
        }
    }

    /// Sets the next number to hand out. Called once after init or after a
    /// recovery scan determined the correct value.
    pub fn reset(&self, next: InodeNumber) {
        self.next.store(next.get(), Ordering::Release);
    }

    /// The value that would be allocated next, for persisting at shutdown.
    pub fn peek(&self) -> Option<InodeNumber> {
        InodeNumber::new(self.next.load(Ordering::Acquire))
    }

    pub fn allocate(&self) -> Result<InodeNumber, OverlayError> {
        let raw = self.next.fetch_add(1, Ordering::AcqRel);
        if raw == 0 {
            self.next.store(0, Ordering::Release);
            return Err(OverlayError::Storage(
                "inode allocator used before initialization".to_string(),
            ));
        }
        if raw > MAX_INODE_NUMBER {
            // Leave the counter saturated; every subsequent allocation must
            // keep failing.
            self.next.store(MAX_INODE_NUMBER + 1, Ordering::Release);
            return Err(OverlayError::InodeNumberOverflow);
        }
        Ok(InodeNumber::from_raw(raw))
    }
}

impl Default for InodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A durable mapping from inode number to directory record, plus the
/// mount-wide inode number allocator.
///
/// Backends that understand the record structure can additionally implement
/// the `*_child` operations; callers check [supports_semantic_operations]
/// and otherwise rewrite whole parent records.
///
/// [supports_semantic_operations]: InodeCatalog::supports_semantic_operations
#[async_trait]
pub trait InodeCatalog: Send + Sync {
    /// Acquires ownership of the catalog and returns the next inode number
    /// if the previous shutdown was clean, `None` if a scan is required.
    async fn init(
        &self,
        create_if_missing: bool,
        bypass_lock: bool,
    ) -> Result<Option<InodeNumber>, OverlayError>;

    /// Durably records the next inode number and releases ownership.
    async fn close(&self, next_inode: Option<InodeNumber>) -> Result<(), OverlayError>;

    async fn load_dir(&self, inode: InodeNumber) -> Result<Option<OverlayDir>, OverlayError>;

    /// Removes the record and returns what it held.
    async fn load_and_remove_dir(
        &self,
        inode: InodeNumber,
    ) -> Result<Option<OverlayDir>, OverlayError>;

    async fn save_dir(&self, inode: InodeNumber, dir: OverlayDir) -> Result<(), OverlayError>;

    /// Removes the record for `inode`.
    ///
    /// Fails with [OverlayError::DirectoryNotEmpty] if the stored record
    /// still has entries; code that drops populated directories has a bug
    /// and should be loud about it. Use [load_and_remove_dir] when dropping
    /// contents intentionally.
    ///
    /// [load_and_remove_dir]: InodeCatalog::load_and_remove_dir
    async fn remove_dir(&self, inode: InodeNumber) -> Result<(), OverlayError>;

    async fn has_dir(&self, inode: InodeNumber) -> Result<bool, OverlayError>;

    /// Allocates the next inode number. Monotonic; overflow is fatal.
    fn next_inode_number(&self) -> Result<InodeNumber, OverlayError>;

    /// Overrides the allocator position after a recovery scan.
    fn reset_next_inode_number(&self, next: InodeNumber);

    /// Every inode number with a persisted directory record, for the
    /// checker.
    async fn get_all_parent_inode_numbers(&self) -> Result<Vec<InodeNumber>, OverlayError>;

    /// Whether the `*_child` operations below are implemented.
    fn supports_semantic_operations(&self) -> bool {
        false
    }

    async fn add_child(
        &self,
        _parent: InodeNumber,
        _name: &[u8],
        _entry: OverlayEntry,
    ) -> Result<(), OverlayError> {
        Err(OverlayError::Unsupported)
    }

    async fn remove_child(
        &self,
        _parent: InodeNumber,
        _name: &[u8],
    ) -> Result<(), OverlayError> {
        Err(OverlayError::Unsupported)
    }

    async fn has_child(&self, _parent: InodeNumber, _name: &[u8]) -> Result<bool, OverlayError> {
        Err(OverlayError::Unsupported)
    }

    async fn rename_child(
        &self,
        _src_parent: InodeNumber,
        _dst_parent: InodeNumber,
        _src_name: &[u8],
        _dst_name: &[u8],
    ) -> Result<(), OverlayError> {
        Err(OverlayError::Unsupported)
    }
}

/// Removes a directory record and every descendant record reachable from
/// it.
///
/// Used when a checkout replaces a non-materialized subtree: the records
/// only existed to remember inode numbers, and forgetting them is the
/// memory-efficient default.
pub async fn remove_dir_recursive(
    catalog: &dyn InodeCatalog,
    inode: InodeNumber,
) -> Result<(), OverlayError> {
    let mut queue = vec![inode];
    while let Some(inode) = queue.pop() {
        if let Some(dir) = catalog.load_and_remove_dir(inode).await? {
            for (_, entry) in dir.entries() {
                if let (true, Some(child)) = (entry.is_directory(), entry.inode) {
                    queue.push(child);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::mode;
    use crate::ROOT_INODE;

    #[test]
    fn allocator_is_monotonic() {
        let alloc = InodeAllocator::new();
        alloc.reset(InodeNumber::from_raw(2));
        assert_eq!(alloc.allocate().unwrap(), InodeNumber::from_raw(2));
        assert_eq!(alloc.allocate().unwrap(), InodeNumber::from_raw(3));
        assert_eq!(alloc.peek(), Some(InodeNumber::from_raw(4)));
    }

    #[test]
    fn allocator_overflow_is_fatal_and_sticky() {
        let alloc = InodeAllocator::new();
        alloc.reset(InodeNumber::from_raw(MAX_INODE_NUMBER));
        assert!(alloc.allocate().is_ok());
        assert!(matches!(
            alloc.allocate(),
            Err(OverlayError::InodeNumberOverflow)
        ));
        assert!(matches!(
            alloc.allocate(),
            Err(OverlayError::InodeNumberOverflow)
        ));
    }

    #[tokio::test]
    async fn recursive_removal_reaches_grandchildren() {
        let catalog = MemoryCatalog::new();
        catalog.init(true, false).await.unwrap();

        let sub = InodeNumber::from_raw(5);
        let mut root = OverlayDir::new();
        root.add(
            "sub".into(),
            OverlayEntry {
                mode: mode::DIR | 0o755,
                inode: Some(sub),
                object_id: None,
            },
        )
        .unwrap();
        catalog.save_dir(ROOT_INODE, root).await.unwrap();
        catalog.save_dir(sub, OverlayDir::new()).await.unwrap();

        remove_dir_recursive(&catalog, ROOT_INODE).await.unwrap();
        assert!(!catalog.has_dir(ROOT_INODE).await.unwrap());
        assert!(!catalog.has_dir(sub).await.unwrap());
    }
}
