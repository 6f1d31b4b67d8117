//! The mount: one root inode, one catalog, one content store.

use std::sync::{Arc, OnceLock};

use bstr::{BStr, ByteSlice};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use scmfs_overlay::catalog::InodeCatalog;
use scmfs_overlay::content::FileContentStore;
use scmfs_overlay::{InodeNumber, OverlayError, ROOT_INODE};

use crate::channel::MountChannel;
use crate::inode::InodeHandle;
use crate::inode_map::InodeMap;
use crate::journal::Journal;
use crate::store::{BlobCache, FetchContext, ObjectId, ObjectStore};
use crate::tree::{self, TreeInode};
use crate::FsError;

/// How entry names compare within a directory. A mount-wide policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

/// The name of the reserved introspection subtree. Every mutation inside
/// it is denied.
pub const RESERVED_SUBTREE: &[u8] = b".eden";

pub struct MountConfig {
    pub case_sensitivity: CaseSensitivity,
    /// Root tree of the commit the working copy is based on.
    pub commit_tree: ObjectId,
}

/// A single virtual filesystem instance.
///
/// Owns the durable overlay (catalog + content store), the connection to
/// the object store, the inode registry, and the mount-wide rename lock
/// that serializes name-changing operations against tree walks.
pub struct Mount {
    catalog: Arc<dyn InodeCatalog>,
    content_store: Arc<dyn FileContentStore>,
    object_store: Arc<dyn ObjectStore>,
    blob_cache: Arc<BlobCache>,
    journal: Arc<dyn Journal>,
    channel: Arc<dyn MountChannel>,
    inode_map: InodeMap,
    rename_lock: RwLock<()>,
    case_sensitivity: CaseSensitivity,
    root: OnceLock<Arc<TreeInode>>,
    /// Inode of the reserved subtree's directory, when the root contains
    /// one. Fixed at mount construction.
    reserved_ino: OnceLock<Option<InodeNumber>>,
}

impl Mount {
    /// Opens (or creates) a mount over the given stores.
    ///
    /// Runs unclean-shutdown recovery for the inode allocator if the
    /// catalog reports one; a sharded on-disk catalog should normally be
    /// checked by the overlay checker before this is called, but the
    /// record-walk recovery here is enough to keep allocating correctly.
    #[instrument(skip_all)]
    pub async fn new(
        config: MountConfig,
        catalog: Arc<dyn InodeCatalog>,
        content_store: Arc<dyn FileContentStore>,
        object_store: Arc<dyn ObjectStore>,
        blob_cache: Arc<BlobCache>,
        journal: Arc<dyn Journal>,
        channel: Arc<dyn MountChannel>,
    ) -> Result<Arc<Mount>, FsError> {
        let clean_next = catalog.init(true, false).await?;
        if clean_next.is_none() {
            let next = recover_next_inode_number(catalog.as_ref()).await?;
            warn!(next = %next, "unclean shutdown; recovered next inode number");
            catalog.reset_next_inode_number(next);
        }

        let mount = Arc::new(Mount {
            catalog,
            content_store,
            object_store,
            blob_cache,
            journal,
            channel,
            inode_map: InodeMap::new(),
            rename_lock: RwLock::new(()),
            case_sensitivity: config.case_sensitivity,
            root: OnceLock::new(),
            reserved_ino: OnceLock::new(),
        });

        let root = load_root(&mount, &config.commit_tree).await?;
        let reserved = {
            let contents = root.contents().read();
            contents
                .find_key(RESERVED_SUBTREE.as_bstr(), config.case_sensitivity)
                .and_then(|key| contents.entries.get(&key).map(|e| e.ino))
        };
        mount
            .root
            .set(root.clone())
            .ok()
            .expect("root initialized once");
        mount
            .reserved_ino
            .set(reserved)
            .ok()
            .expect("reserved inode recorded once");
        mount.inode_map.load_complete(InodeHandle::Tree(root));
        info!(root_materialized = mount.root().is_materialized(), "mount ready");
        Ok(mount)
    }

    pub fn root(&self) -> Arc<TreeInode> {
        self.root.get().expect("mount is initialized").clone()
    }

    pub fn catalog(&self) -> &Arc<dyn InodeCatalog> {
        &self.catalog
    }

    pub fn content_store(&self) -> &Arc<dyn FileContentStore> {
        &self.content_store
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.object_store
    }

    pub fn blob_cache(&self) -> &Arc<BlobCache> {
        &self.blob_cache
    }

    pub fn journal(&self) -> &Arc<dyn Journal> {
        &self.journal
    }

    pub fn channel(&self) -> &Arc<dyn MountChannel> {
        &self.channel
    }

    pub fn inode_map(&self) -> &InodeMap {
        &self.inode_map
    }

    /// Mount-wide rename lock. Exclusive for rename/unlink/rmdir, shared
    /// for checkout, diff and everything else that needs a stable tree.
    pub fn rename_lock(&self) -> &RwLock<()> {
        &self.rename_lock
    }

    pub fn case_sensitivity(&self) -> CaseSensitivity {
        self.case_sensitivity
    }

    /// Denies mutations of the reserved subtree: both entries inside it
    /// and the subtree's own name in the root.
    pub fn check_reserved_inode(&self, dir: InodeNumber, name: &BStr) -> Result<(), FsError> {
        if let Some(Some(reserved)) = self.reserved_ino.get() {
            if dir == *reserved {
                return Err(FsError::PermissionDenied(name.to_owned()));
            }
        }
        if dir == ROOT_INODE && name == RESERVED_SUBTREE.as_bstr() {
            return Err(FsError::PermissionDenied(name.to_owned()));
        }
        Ok(())
    }

    /// Resolves a `/`-separated path from the root.
    pub async fn resolve_path(
        self: &Arc<Self>,
        path: &BStr,
        ctx: &FetchContext,
    ) -> Result<InodeHandle, FsError> {
        self.root().get_child_recursive(path, ctx).await
    }

    /// Persists the next inode number and releases the catalog.
    pub async fn shutdown(&self) -> Result<(), FsError> {
        self.catalog.close(None).await?;
        info!("mount shut down cleanly");
        Ok(())
    }
}

/// Loads the root inode: from its overlay record when the root is
/// materialized (the record's presence is what says so), otherwise from
/// the commit's root tree.
async fn load_root(
    mount: &Arc<Mount>,
    commit_tree: &ObjectId,
) -> Result<Arc<TreeInode>, FsError> {
    let ctx = FetchContext::default();
    let state = match mount.catalog().load_dir(ROOT_INODE).await? {
        Some(record) => tree::state_from_record(mount, record, None)?,
        None => {
            let tree = mount.object_store().get_tree(commit_tree, &ctx).await?;
            tree::state_from_tree(mount, &tree)?
        }
    };
    Ok(TreeInode::new(
        ROOT_INODE,
        Arc::downgrade(mount),
        None,
        Default::default(),
        scmfs_overlay::dir::mode::DIR | 0o755,
        state,
    ))
}

/// Recomputes the next inode number from the catalog's records: the
/// maximum of every persisted parent and every child those records name,
/// plus one.
async fn recover_next_inode_number(
    catalog: &dyn InodeCatalog,
) -> Result<InodeNumber, OverlayError> {
    let mut max = ROOT_INODE;
    for parent in catalog.get_all_parent_inode_numbers().await? {
        max = max.max(parent);
        if let Some(dir) = catalog.load_dir(parent).await? {
            for (_, entry) in dir.entries() {
                if let Some(child) = entry.inode {
                    max = max.max(child);
                }
            }
        }
    }
    max.next()
}
