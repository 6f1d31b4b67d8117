use std::collections::HashMap;

use async_trait::async_trait;
use bstr::BString;
use parking_lot::RwLock;

use crate::catalog::{InodeAllocator, InodeCatalog};
use crate::dir::OverlayDir;
use crate::inode_number::{InodeNumber, ROOT_INODE};
use crate::{OverlayEntry, OverlayError};

/// In-memory catalog with no persistence, for tests and ephemeral mounts.
///
/// Supports the semantic child operations so callers exercising that path
/// don't need an on-disk backend.
#[derive(Default)]
pub struct MemoryCatalog {
    dirs: RwLock<HashMap<u64, OverlayDir>>,
    allocator: InodeAllocator,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Default::default()
    }
}

#[async_trait]
impl InodeCatalog for MemoryCatalog {
    async fn init(
        &self,
        _create_if_missing: bool,
        _bypass_lock: bool,
    ) -> Result<Option<InodeNumber>, OverlayError> {
        let next = ROOT_INODE.next()?;
        self.allocator.reset(next);
        Ok(Some(next))
    }

    async fn close(&self, _next_inode: Option<InodeNumber>) -> Result<(), OverlayError> {
        Ok(())
    }

    async fn load_dir(&self, inode: InodeNumber) -> Result<Option<OverlayDir>, OverlayError> {
        Ok(self.dirs.read().get(&inode.get()).cloned())
    }

    async fn load_and_remove_dir(
        &self,
        inode: InodeNumber,
    ) -> Result<Option<OverlayDir>, OverlayError> {
        Ok(self.dirs.write().remove(&inode.get()))
    }

    async fn save_dir(&self, inode: InodeNumber, dir: OverlayDir) -> Result<(), OverlayError> {
        self.dirs.write().insert(inode.get(), dir);
        Ok(())
    }

    async fn remove_dir(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        let mut dirs = self.dirs.write();
        if let Some(dir) = dirs.get(&inode.get()) {
            if !dir.is_empty() {
                return Err(OverlayError::DirectoryNotEmpty(inode));
            }
            dirs.remove(&inode.get());
        }
        Ok(())
    }

    async fn has_dir(&self, inode: InodeNumber) -> Result<bool, OverlayError> {
        Ok(self.dirs.read().contains_key(&inode.get()))
    }

    fn next_inode_number(&self) -> Result<InodeNumber, OverlayError> {
        self.allocator.allocate()
    }

    fn reset_next_inode_number(&self, next: InodeNumber) {
        self.allocator.reset(next);
    }

    async fn get_all_parent_inode_numbers(&self) -> Result<Vec<InodeNumber>, OverlayError> {
        Ok(self
            .dirs
            .read()
            .keys()
            .map(|&raw| InodeNumber::from_raw(raw))
            .collect())
    }

    fn supports_semantic_operations(&self) -> bool {
        true
    }

    async fn add_child(
        &self,
        parent: InodeNumber,
        name: &[u8],
        entry: OverlayEntry,
    ) -> Result<(), OverlayError> {
        let mut dirs = self.dirs.write();
        dirs.entry(parent.get())
            .or_default()
            .insert(BString::from(name), entry);
        Ok(())
    }

    async fn remove_child(&self, parent: InodeNumber, name: &[u8]) -> Result<(), OverlayError> {
        if let Some(dir) = self.dirs.write().get_mut(&parent.get()) {
            dir.remove(name);
        }
        Ok(())
    }

    async fn has_child(&self, parent: InodeNumber, name: &[u8]) -> Result<bool, OverlayError> {
        Ok(self
            .dirs
            .read()
            .get(&parent.get())
            .is_some_and(|dir| dir.get(name).is_some()))
    }

    async fn rename_child(
        &self,
        src_parent: InodeNumber,
        dst_parent: InodeNumber,
        src_name: &[u8],
        dst_name: &[u8],
    ) -> Result<(), OverlayError> {
        let mut dirs = self.dirs.write();
        let entry = dirs
            .get_mut(&src_parent.get())
            .and_then(|dir| dir.remove(src_name));
        if let Some(entry) = entry {
            dirs.entry(dst_parent.get())
                .or_default()
                .insert(BString::from(dst_name), entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::mode;

    fn entry(ino: u64) -> OverlayEntry {
        OverlayEntry {
            mode: mode::REG | 0o644,
            inode: Some(InodeNumber::from_raw(ino)),
            object_id: None,
        }
    }

    #[tokio::test]
    async fn semantic_rename_moves_entries_across_parents() {
        let catalog = MemoryCatalog::new();
        catalog.init(true, false).await.unwrap();
        assert!(catalog.supports_semantic_operations());

        let a = InodeNumber::from_raw(2);
        let b = InodeNumber::from_raw(3);
        catalog.add_child(a, b"x", entry(9)).await.unwrap();
        catalog.rename_child(a, b, b"x", b"y").await.unwrap();

        assert!(!catalog.has_child(a, b"x").await.unwrap());
        assert!(catalog.has_child(b, b"y").await.unwrap());
    }
}
