use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::content::FileContentStore;
use crate::inode_number::InodeNumber;
use crate::OverlayError;

/// Ephemeral content store with no durability; used for tests and mounts
/// that don't outlive the process.
#[derive(Default)]
pub struct MemoryContentStore {
    files: RwLock<HashMap<u64, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Default::default()
    }

    fn missing(inode: InodeNumber) -> OverlayError {
        OverlayError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no contents stored for inode {}", inode),
        ))
    }
}

#[async_trait]
impl FileContentStore for MemoryContentStore {
    async fn create(&self, inode: InodeNumber, contents: Bytes) -> Result<(), OverlayError> {
        self.files.write().insert(inode.get(), contents.to_vec());
        Ok(())
    }

    async fn open(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        if self.files.read().contains_key(&inode.get()) {
            Ok(())
        } else {
            Err(Self::missing(inode))
        }
    }

    async fn pread(
        &self,
        inode: InodeNumber,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, OverlayError> {
        let files = self.files.read();
        let data = files.get(&inode.get()).ok_or_else(|| Self::missing(inode))?;
        let start = (offset as usize).min(data.len());
        let end = start.saturating_add(len as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn pwrite(
        &self,
        inode: InodeNumber,
        data: &[u8],
        offset: u64,
    ) -> Result<u64, OverlayError> {
        let mut files = self.files.write();
        let file = files
            .get_mut(&inode.get())
            .ok_or_else(|| Self::missing(inode))?;
        let offset = offset as usize;
        let end = offset + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset..end].copy_from_slice(data);
        Ok(data.len() as u64)
    }

    async fn truncate(&self, inode: InodeNumber, len: u64) -> Result<(), OverlayError> {
        let mut files = self.files.write();
        let file = files
            .get_mut(&inode.get())
            .ok_or_else(|| Self::missing(inode))?;
        file.resize(len as usize, 0);
        Ok(())
    }

    async fn allocate(
        &self,
        inode: InodeNumber,
        offset: u64,
        len: u64,
    ) -> Result<(), OverlayError> {
        let mut files = self.files.write();
        let file = files
            .get_mut(&inode.get())
            .ok_or_else(|| Self::missing(inode))?;
        let end = (offset + len) as usize;
        if file.len() < end {
            file.resize(end, 0);
        }
        Ok(())
    }

    async fn size(&self, inode: InodeNumber) -> Result<u64, OverlayError> {
        let files = self.files.read();
        let data = files.get(&inode.get()).ok_or_else(|| Self::missing(inode))?;
        Ok(data.len() as u64)
    }

    async fn remove(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        self.files.write().remove(&inode.get());
        Ok(())
    }

    async fn has(&self, inode: InodeNumber) -> Result<bool, OverlayError> {
        Ok(self.files.read().contains_key(&inode.get()))
    }
}
