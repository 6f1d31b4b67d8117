use std::os::unix::fs::FileExt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::{self, HEADER_LEN};
use crate::content::FileContentStore;
use crate::fs::OverlayRoot;
use crate::inode_number::InodeNumber;
use crate::OverlayError;

/// Sharded-file content store, sharing the [OverlayRoot] layout with the
/// catalog. Each file is the 64-byte `OVFL` header followed by the payload;
/// offsets below are payload-relative.
pub struct FsContentStore {
    root: Arc<OverlayRoot>,
}

impl FsContentStore {
    pub fn new(root: Arc<OverlayRoot>) -> Self {
        FsContentStore { root }
    }

    pub fn overlay_root(&self) -> &Arc<OverlayRoot> {
        &self.root
    }
}

const HEADER: u64 = HEADER_LEN as u64;

#[async_trait]
impl FileContentStore for FsContentStore {
    async fn create(&self, inode: InodeNumber, contents: Bytes) -> Result<(), OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            root.save_record(inode, codec::FILE_HEADER, &contents)?;
            Ok(())
        })
        .await?
    }

    async fn open(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            root.open_record(inode, Some(codec::FILE_HEADER))?;
            Ok(())
        })
        .await?
    }

    async fn pread(
        &self,
        inode: InodeNumber,
        offset: u64,
        len: u64,
    ) -> Result<Bytes, OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let file = root.open_record(inode, None)?;
            let file_len = file.metadata()?.len().max(HEADER);
            let start = HEADER + offset;
            let end = start.saturating_add(len).min(file_len);
            if start >= end {
                return Ok(Bytes::new());
            }
            let mut buf = vec![0u8; (end - start) as usize];
            file.read_exact_at(&mut buf, start)?;
            Ok(Bytes::from(buf))
        })
        .await?
    }

    async fn pwrite(
        &self,
        inode: InodeNumber,
        data: &[u8],
        offset: u64,
    ) -> Result<u64, OverlayError> {
        let root = self.root.clone();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(root.record_path(inode))?;
            file.write_all_at(&data, HEADER + offset)?;
            Ok(data.len() as u64)
        })
        .await?
    }

    async fn truncate(&self, inode: InodeNumber, len: u64) -> Result<(), OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(root.record_path(inode))?;
            file.set_len(HEADER + len)?;
            Ok(())
        })
        .await?
    }

    async fn allocate(
        &self,
        inode: InodeNumber,
        offset: u64,
        len: u64,
    ) -> Result<(), OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(root.record_path(inode))?;
            // set_len never shrinks here and zero-fills the extension,
            // which matches posix_fallocate's observable behavior without
            // claiming sparseness.
            let wanted = HEADER + offset + len;
            if file.metadata()?.len() < wanted {
                file.set_len(wanted)?;
            }
            Ok(())
        })
        .await?
    }

    async fn size(&self, inode: InodeNumber) -> Result<u64, OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let file = root.open_record(inode, None)?;
            Ok(file.metadata()?.len().saturating_sub(HEADER))
        })
        .await?
    }

    async fn remove(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || root.remove_record(inode)).await?
    }

    async fn has(&self, inode: InodeNumber) -> Result<bool, OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Ok(root.has_record(inode))).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, FsContentStore) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Arc::new(OverlayRoot::new(tmp.path().join("local")));
        tokio::task::block_in_place(|| root.initialize(true, false)).unwrap();
        (tmp, FsContentStore::new(root))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_read_write_roundtrip() {
        let (_tmp, store) = store().await;
        let ino = InodeNumber::from_raw(2);

        store.create(ino, Bytes::from_static(b"hello world")).await.unwrap();
        assert!(store.has(ino).await.unwrap());
        assert_eq!(store.size(ino).await.unwrap(), 11);

        let read = store.pread(ino, 6, 16).await.unwrap();
        assert_eq!(&read[..], b"world");

        store.pwrite(ino, b"WORLD", 6).await.unwrap();
        let read = store.pread(ino, 0, 64).await.unwrap();
        assert_eq!(&read[..], b"hello WORLD");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_past_the_end_zero_fill() {
        let (_tmp, store) = store().await;
        let ino = InodeNumber::from_raw(2);

        store.create(ino, Bytes::from_static(b"ab")).await.unwrap();
        store.pwrite(ino, b"z", 5).await.unwrap();
        assert_eq!(store.size(ino).await.unwrap(), 6);
        let read = store.pread(ino, 0, 16).await.unwrap();
        assert_eq!(&read[..], b"ab\0\0\0z");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn truncate_and_allocate_adjust_size() {
        let (_tmp, store) = store().await;
        let ino = InodeNumber::from_raw(2);

        store.create(ino, Bytes::from_static(b"abcdef")).await.unwrap();
        store.truncate(ino, 3).await.unwrap();
        assert_eq!(store.size(ino).await.unwrap(), 3);

        store.allocate(ino, 2, 6).await.unwrap();
        assert_eq!(store.size(ino).await.unwrap(), 8);
        // allocate preserves existing bytes.
        let read = store.pread(ino, 0, 16).await.unwrap();
        assert_eq!(&read[..3], b"abc");

        store.remove(ino).await.unwrap();
        assert!(!store.has(ino).await.unwrap());
    }
}
