use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::catalog::{InodeAllocator, InodeCatalog};
use crate::codec;
use crate::dir::OverlayDir;
use crate::fs::{OverlayRoot, NUM_SHARDS};
use crate::inode_number::InodeNumber;
use crate::OverlayError;

/// Sharded-file catalog: one record file per directory inode, stored in the
/// shared [OverlayRoot] layout next to the file contents.
///
/// Blocking filesystem work runs under `spawn_blocking`.
pub struct FsCatalog {
    root: Arc<OverlayRoot>,
    allocator: InodeAllocator,
}

impl FsCatalog {
    pub fn new(root: Arc<OverlayRoot>) -> Self {
        FsCatalog {
            root,
            allocator: InodeAllocator::new(),
        }
    }

    pub fn overlay_root(&self) -> &Arc<OverlayRoot> {
        &self.root
    }

    /// Recomputes the next inode number by scanning the on-disk records.
    /// Needed when [init](InodeCatalog::init) reported an unclean shutdown.
    pub async fn scan_next_inode_number(&self) -> Result<InodeNumber, OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || root.scan_next_inode_number()).await?
    }
}

#[async_trait]
impl InodeCatalog for FsCatalog {
    #[instrument(skip(self))]
    async fn init(
        &self,
        create_if_missing: bool,
        bypass_lock: bool,
    ) -> Result<Option<InodeNumber>, OverlayError> {
        let root = self.root.clone();
        let next =
            tokio::task::spawn_blocking(move || root.initialize(create_if_missing, bypass_lock))
                .await??;
        if let Some(next) = next {
            self.allocator.reset(next);
        }
        Ok(next)
    }

    #[instrument(skip(self))]
    async fn close(&self, next_inode: Option<InodeNumber>) -> Result<(), OverlayError> {
        let next = next_inode.or_else(|| self.allocator.peek());
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || root.close(next)).await?
    }

    async fn load_dir(&self, inode: InodeNumber) -> Result<Option<OverlayDir>, OverlayError> {
        let root = self.root.clone();
        let payload =
            tokio::task::spawn_blocking(move || root.read_record(inode, codec::DIR_HEADER))
                .await??;
        payload
            .map(|payload| codec::decode_dir(inode, &payload))
            .transpose()
    }

    async fn load_and_remove_dir(
        &self,
        inode: InodeNumber,
    ) -> Result<Option<OverlayDir>, OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let payload = root.read_record(inode, codec::DIR_HEADER)?;
            let dir = payload
                .map(|payload| codec::decode_dir(inode, &payload))
                .transpose()?;
            if dir.is_some() {
                root.remove_record(inode)?;
            }
            Ok(dir)
        })
        .await?
    }

    async fn save_dir(&self, inode: InodeNumber, dir: OverlayDir) -> Result<(), OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let payload = codec::encode_dir(&dir);
            root.save_record(inode, codec::DIR_HEADER, &payload)?;
            Ok(())
        })
        .await?
    }

    async fn remove_dir(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(payload) = root.read_record(inode, codec::DIR_HEADER)? {
                let dir = codec::decode_dir(inode, &payload)?;
                if !dir.is_empty() {
                    return Err(OverlayError::DirectoryNotEmpty(inode));
                }
            }
            root.remove_record(inode)
        })
        .await?
    }

    async fn has_dir(&self, inode: InodeNumber) -> Result<bool, OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            if !root.has_record(inode) {
                return Ok(false);
            }
            Ok(&root.record_identifier(inode)? == codec::DIR_HEADER)
        })
        .await?
    }

    fn next_inode_number(&self) -> Result<InodeNumber, OverlayError> {
        self.allocator.allocate()
    }

    fn reset_next_inode_number(&self, next: InodeNumber) {
        self.allocator.reset(next);
    }

    async fn get_all_parent_inode_numbers(&self) -> Result<Vec<InodeNumber>, OverlayError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut parents = Vec::new();
            for shard in 0..NUM_SHARDS {
                let iter = match std::fs::read_dir(root.shard_dir(shard as u8)) {
                    Ok(iter) => iter,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                for dir_entry in iter {
                    let dir_entry = dir_entry?;
                    let Some(inode) = dir_entry
                        .file_name()
                        .to_str()
                        .and_then(|s| s.parse::<u64>().ok())
                        .and_then(InodeNumber::new)
                    else {
                        continue;
                    };
                    if matches!(root.record_identifier(inode), Ok(id) if &id == codec::DIR_HEADER)
                    {
                        parents.push(inode);
                    }
                }
            }
            Ok(parents)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::{mode, OverlayEntry};
    use crate::ROOT_INODE;

    fn sample_dir(child: u64) -> OverlayDir {
        let mut dir = OverlayDir::new();
        dir.add(
            "child".into(),
            OverlayEntry {
                mode: mode::REG | 0o644,
                inode: Some(InodeNumber::from_raw(child)),
                object_id: None,
            },
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn save_load_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = FsCatalog::new(Arc::new(OverlayRoot::new(tmp.path().join("local"))));
        catalog.init(true, false).await.unwrap();

        let dir = sample_dir(7);
        catalog.save_dir(ROOT_INODE, dir.clone()).await.unwrap();
        assert_eq!(catalog.load_dir(ROOT_INODE).await.unwrap(), Some(dir));
        assert!(catalog.has_dir(ROOT_INODE).await.unwrap());

        // remove_dir refuses to drop a populated record.
        assert!(matches!(
            catalog.remove_dir(ROOT_INODE).await,
            Err(OverlayError::DirectoryNotEmpty(_))
        ));
        let removed = catalog.load_and_remove_dir(ROOT_INODE).await.unwrap();
        assert!(removed.is_some());
        assert!(!catalog.has_dir(ROOT_INODE).await.unwrap());
    }

    #[tokio::test]
    async fn inode_numbers_survive_clean_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("local");

        let catalog = FsCatalog::new(Arc::new(OverlayRoot::new(path.clone())));
        catalog.init(true, false).await.unwrap();
        let a = catalog.next_inode_number().unwrap();
        let b = catalog.next_inode_number().unwrap();
        assert!(b > a);
        catalog.close(None).await.unwrap();

        let catalog = FsCatalog::new(Arc::new(OverlayRoot::new(path)));
        let next = catalog.init(false, false).await.unwrap().unwrap();
        assert!(next > b);
    }

    #[tokio::test]
    async fn parent_enumeration_sees_only_directory_records() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Arc::new(OverlayRoot::new(tmp.path().join("local")));
        let catalog = FsCatalog::new(root.clone());
        catalog.init(true, false).await.unwrap();

        catalog.save_dir(ROOT_INODE, sample_dir(7)).await.unwrap();
        root.save_record(InodeNumber::from_raw(7), codec::FILE_HEADER, b"bytes")
            .unwrap();

        let parents = catalog.get_all_parent_inode_numbers().await.unwrap();
        assert_eq!(parents, vec![ROOT_INODE]);
    }
}
