use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bstr::BString;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::instrument;

use crate::catalog::{InodeAllocator, InodeCatalog};
use crate::codec;
use crate::dir::OverlayDir;
use crate::inode_number::{InodeNumber, ROOT_INODE};
use crate::{OverlayEntry, OverlayError};

const DIRS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("dirs");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Meta key holding the next inode number. Present only between a clean
/// shutdown and the next init, mirroring the sharded backend's marker file.
const NEXT_INODE_KEY: &str = "next-inode-number";

/// Key/value catalog backed by a single transactional redb database.
///
/// Records are stored without the 64-byte header; the database does its own
/// integrity checking. redb also holds its own file lock, which doubles as
/// the catalog lock.
pub struct RedbCatalog {
    // Wrapped in an Arc to move into spawn_blocking closures.
    db: Arc<Database>,
    allocator: InodeAllocator,
}

impl RedbCatalog {
    /// Opens (or creates) the database at the given path.
    pub async fn open(path: PathBuf) -> Result<Self, OverlayError> {
        if path == PathBuf::from("/") {
            return Err(OverlayError::Storage(
                "cowardly refusing to open / as a catalog".to_string(),
            ));
        }
        let db = tokio::task::spawn_blocking(move || -> Result<_, redb::Error> {
            let db = Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await??;
        Ok(RedbCatalog {
            db: Arc::new(db),
            allocator: InodeAllocator::new(),
        })
    }

    /// Constructs an instance on the in-memory backend, for tests.
    pub fn new_temporary() -> Result<Self, OverlayError> {
        let db =
            Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        create_schema(&db)?;
        Ok(RedbCatalog {
            db: Arc::new(db),
            allocator: InodeAllocator::new(),
        })
    }

    async fn with_dir_mut<F>(&self, parent: InodeNumber, f: F) -> Result<(), OverlayError>
    where
        F: FnOnce(&mut OverlayDir) + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), OverlayError> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(DIRS_TABLE)?;
                let mut dir = match table.get(parent.get())? {
                    Some(payload) => codec::decode_dir(parent, &payload.value())?,
                    None => OverlayDir::new(),
                };
                f(&mut dir);
                table.insert(parent.get(), codec::encode_dir(&dir))?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }
}

fn create_schema(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(DIRS_TABLE)?;
    txn.open_table(META_TABLE)?;
    txn.commit()?;
    Ok(())
}

#[async_trait]
impl InodeCatalog for RedbCatalog {
    #[instrument(skip(self))]
    async fn init(
        &self,
        _create_if_missing: bool,
        _bypass_lock: bool,
    ) -> Result<Option<InodeNumber>, OverlayError> {
        let db = self.db.clone();
        let next = tokio::task::spawn_blocking(move || -> Result<_, OverlayError> {
            let txn = db.begin_write()?;
            let next = {
                let mut table = txn.open_table(META_TABLE)?;
                // Consume the marker: its presence is the clean-shutdown
                // flag, so it must not survive while we are running.
                let result = table
                    .remove(NEXT_INODE_KEY)?
                    .map(|guard| guard.value())
                    .and_then(InodeNumber::new);
                result
            };
            txn.commit()?;
            Ok(next)
        })
        .await??;
        match next {
            Some(next) => {
                self.allocator.reset(next);
                Ok(Some(next))
            }
            None => {
                // Fresh database or unclean shutdown: tell them apart by
                // whether any directory record exists.
                let has_dirs = !self.get_all_parent_inode_numbers().await?.is_empty();
                if has_dirs {
                    Ok(None)
                } else {
                    let next = ROOT_INODE.next()?;
                    self.allocator.reset(next);
                    Ok(Some(next))
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn close(&self, next_inode: Option<InodeNumber>) -> Result<(), OverlayError> {
        let Some(next) = next_inode.or_else(|| self.allocator.peek()) else {
            return Ok(());
        };
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), OverlayError> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(META_TABLE)?;
                table.insert(NEXT_INODE_KEY, next.get())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn load_dir(&self, inode: InodeNumber) -> Result<Option<OverlayDir>, OverlayError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, OverlayError> {
            let txn = db.begin_read()?;
            let table = txn.open_table(DIRS_TABLE)?;
            table
                .get(inode.get())?
                .map(|payload| codec::decode_dir(inode, &payload.value()))
                .transpose()
        })
        .await?
    }

    async fn load_and_remove_dir(
        &self,
        inode: InodeNumber,
    ) -> Result<Option<OverlayDir>, OverlayError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, OverlayError> {
            let txn = db.begin_write()?;
            let dir = {
                let mut table = txn.open_table(DIRS_TABLE)?;
                let result = table
                    .remove(inode.get())?
                    .map(|payload| codec::decode_dir(inode, &payload.value()))
                    .transpose()?;
                result
            };
            txn.commit()?;
            Ok(dir)
        })
        .await?
    }

    async fn save_dir(&self, inode: InodeNumber, dir: OverlayDir) -> Result<(), OverlayError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), OverlayError> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(DIRS_TABLE)?;
                table.insert(inode.get(), codec::encode_dir(&dir))?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn remove_dir(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<(), OverlayError> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(DIRS_TABLE)?;
                if let Some(payload) = table.get(inode.get())? {
                    let dir = codec::decode_dir(inode, &payload.value())?;
                    if !dir.is_empty() {
                        return Err(OverlayError::DirectoryNotEmpty(inode));
                    }
                }
                table.remove(inode.get())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn has_dir(&self, inode: InodeNumber) -> Result<bool, OverlayError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, OverlayError> {
            let txn = db.begin_read()?;
            let table = txn.open_table(DIRS_TABLE)?;
            Ok(table.get(inode.get())?.is_some())
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
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, OverlayError> {
            let txn = db.begin_read()?;
            let table = txn.open_table(DIRS_TABLE)?;
            let mut parents = Vec::new();
            for item in table.iter()? {
                let (key, _) = item?;
                if let Some(inode) = InodeNumber::new(key.value()) {
                    parents.push(inode);
                }
            }
            Ok(parents)
        })
        .await?
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
        let name = BString::from(name);
        self.with_dir_mut(parent, move |dir| {
            dir.insert(name, entry);
        })
        .await
    }

    async fn remove_child(&self, parent: InodeNumber, name: &[u8]) -> Result<(), OverlayError> {
        let name = BString::from(name);
        self.with_dir_mut(parent, move |dir| {
            dir.remove(&name);
        })
        .await
    }

    async fn has_child(&self, parent: InodeNumber, name: &[u8]) -> Result<bool, OverlayError> {
        Ok(self
            .load_dir(parent)
            .await?
            .is_some_and(|dir| dir.get(name).is_some()))
    }

    async fn rename_child(
        &self,
        src_parent: InodeNumber,
        dst_parent: InodeNumber,
        src_name: &[u8],
        dst_name: &[u8],
    ) -> Result<(), OverlayError> {
        let db = self.db.clone();
        let src_name = BString::from(src_name);
        let dst_name = BString::from(dst_name);
        tokio::task::spawn_blocking(move || -> Result<(), OverlayError> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(DIRS_TABLE)?;
                let mut src_dir = match table.get(src_parent.get())? {
                    Some(payload) => codec::decode_dir(src_parent, &payload.value())?,
                    None => OverlayDir::new(),
                };
                let Some(entry) = src_dir.remove(&src_name) else {
                    // Nothing to move; leave the records untouched.
                    return Ok(());
                };
                if src_parent == dst_parent {
                    src_dir.insert(dst_name, entry);
                    table.insert(src_parent.get(), codec::encode_dir(&src_dir))?;
                } else {
                    let mut dst_dir = match table.get(dst_parent.get())? {
                        Some(payload) => codec::decode_dir(dst_parent, &payload.value())?,
                        None => OverlayDir::new(),
                    };
                    dst_dir.insert(dst_name, entry);
                    table.insert(src_parent.get(), codec::encode_dir(&src_dir))?;
                    table.insert(dst_parent.get(), codec::encode_dir(&dst_dir))?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await?
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
    async fn roundtrip_and_semantic_ops() {
        let catalog = RedbCatalog::new_temporary().unwrap();
        catalog.init(true, false).await.unwrap();

        let mut dir = OverlayDir::new();
        dir.add("a".into(), entry(7)).unwrap();
        catalog.save_dir(ROOT_INODE, dir.clone()).await.unwrap();
        assert_eq!(catalog.load_dir(ROOT_INODE).await.unwrap(), Some(dir));

        catalog.add_child(ROOT_INODE, b"b", entry(8)).await.unwrap();
        assert!(catalog.has_child(ROOT_INODE, b"b").await.unwrap());
        catalog
            .rename_child(ROOT_INODE, ROOT_INODE, b"b", b"c")
            .await
            .unwrap();
        assert!(!catalog.has_child(ROOT_INODE, b"b").await.unwrap());
        assert!(catalog.has_child(ROOT_INODE, b"c").await.unwrap());
    }

    #[tokio::test]
    async fn unclean_shutdown_forces_a_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalog.redb");

        {
            let catalog = RedbCatalog::open(path.clone()).await.unwrap();
            assert!(catalog.init(true, false).await.unwrap().is_some());
            let mut dir = OverlayDir::new();
            dir.add("a".into(), entry(7)).unwrap();
            catalog.save_dir(ROOT_INODE, dir).await.unwrap();
            // No close: simulated crash.
        }

        let catalog = RedbCatalog::open(path.clone()).await.unwrap();
        assert_eq!(catalog.init(false, false).await.unwrap(), None);

        // Recovery writes the corrected value at close.
        catalog.reset_next_inode_number(InodeNumber::from_raw(8));
        catalog.close(None).await.unwrap();
        drop(catalog);

        let catalog = RedbCatalog::open(path).await.unwrap();
        assert_eq!(
            catalog.init(false, false).await.unwrap(),
            Some(InodeNumber::from_raw(8))
        );
    }
}
