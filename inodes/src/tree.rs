//! Directory inodes.
//!
//! A tree inode owns its children's directory entries. Entries carry the
//! child's inode number (allocated eagerly, even before the child inode is
//! ever loaded) and, for non-materialized entries, the id of the
//! source-control object the child is still identical to. A loaded child
//! holds a weak back-edge to its parent; parent pointer and back-edge are
//! kept in agreement under the mount rename lock.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bstr::{BStr, BString, ByteSlice};
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use scmfs_overlay::dir::{mode, OverlayDir, OverlayEntry};
use scmfs_overlay::{catalog, InodeNumber};

use crate::file::FileInode;
use crate::inode::{InodeBase, InodeHandle, SetAttr, Stat, VirtualInode};
use crate::journal::JournalEvent;
use crate::mount::{CaseSensitivity, Mount};
use crate::store::{FetchContext, ObjectId, Tree};
use crate::FsError;

/// A single child entry of a directory.
#[derive(Clone)]
pub(crate) struct DirEntry {
    /// POSIX mode bits, including the file type.
    pub mode: u32,
    /// Allocated inode number; stable while the entry exists.
    pub ino: InodeNumber,
    /// Backing source-control object. `None` iff the child is
    /// materialized.
    pub object_id: Option<ObjectId>,
    /// The loaded child inode, if any. Never persisted.
    pub inode: Option<InodeHandle>,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.mode & mode::FMT == mode::DIR
    }

    pub fn is_materialized(&self) -> bool {
        self.object_id.is_none()
    }
}

/// The lock-protected contents of a tree inode.
pub(crate) struct TreeState {
    pub entries: BTreeMap<BString, DirEntry>,
    /// `Some` iff this directory is still identical to that source-control
    /// tree. Materialized directories have `None` here and a persisted
    /// overlay record instead.
    pub tree_object_id: Option<ObjectId>,
}

impl TreeState {
    /// Resolves `name` to the stored key under the mount's case policy.
    pub fn find_key(&self, name: &BStr, case: CaseSensitivity) -> Option<BString> {
        if self.entries.contains_key(name) {
            return Some(name.to_owned());
        }
        if case == CaseSensitivity::Insensitive {
            // ASCII casefold; stored names keep their original spelling.
            return self
                .entries
                .keys()
                .find(|k| k.eq_ignore_ascii_case(name))
                .cloned();
        }
        None
    }

    /// Snapshot of the entries as a serializable record.
    pub fn to_overlay_dir(&self) -> OverlayDir {
        self.entries
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    OverlayEntry {
                        mode: entry.mode,
                        inode: Some(entry.ino),
                        object_id: entry.object_id.as_ref().map(|o| o.as_bytes().clone()),
                    },
                )
            })
            .collect()
    }
}

pub struct TreeInode {
    base: InodeBase,
    contents: RwLock<TreeState>,
}

/// A child load started while the parent's contents lock was held; the
/// actual IO is kicked off only after the lock is released.
pub(crate) struct PendingLoad {
    parent: Arc<TreeInode>,
    name: BString,
    ino: InodeNumber,
    entry_mode: u32,
    object_id: Option<ObjectId>,
}

impl PendingLoad {
    pub fn finish(self, mount: &Arc<Mount>) {
        let mount = mount.clone();
        tokio::spawn(async move {
            let result = load_child(
                &mount,
                self.parent.clone(),
                self.name.clone(),
                self.ino,
                self.entry_mode,
                self.object_id.clone(),
            )
            .await;
            match result {
                Ok(handle) => {
                    // Point the parent's entry at the loaded inode, unless
                    // the entry was concurrently removed or replaced.
                    let mut contents = self.parent.contents.write();
                    match contents.entries.get_mut(&self.name) {
                        Some(entry) if entry.ino == self.ino => {
                            entry.inode = Some(handle.clone());
                        }
                        _ => {
                            handle.base().location.lock().unlinked = true;
                        }
                    }
                    drop(contents);
                    mount.inode_map().load_complete(handle);
                }
                Err(e) => {
                    warn!(inode = %self.ino, error = %e, "child inode load failed");
                    mount.inode_map().load_failed(self.ino, &e);
                }
            }
        });
    }
}

/// Kicks off a child load whose slot was already claimed in the
/// [InodeMap](crate::inode_map::InodeMap); used by callers (like checkout)
/// that gathered the load parameters under the contents lock.
pub(crate) fn spawn_child_load(
    mount: &Arc<Mount>,
    parent: Arc<TreeInode>,
    name: BString,
    ino: InodeNumber,
    entry_mode: u32,
    object_id: Option<ObjectId>,
) {
    PendingLoad {
        parent,
        name,
        ino,
        entry_mode,
        object_id,
    }
    .finish(mount);
}

/// Loads a child inode from the overlay and/or the object store.
async fn load_child(
    mount: &Arc<Mount>,
    parent: Arc<TreeInode>,
    name: BString,
    ino: InodeNumber,
    entry_mode: u32,
    object_id: Option<ObjectId>,
) -> Result<InodeHandle, FsError> {
    let ctx = FetchContext::default();
    if entry_mode & mode::FMT == mode::DIR {
        let record = mount.catalog().load_dir(ino).await?;
        let state = match (record, &object_id) {
            (Some(record), backing) => {
                if let Some(backing) = backing {
                    // A historically persisted record for a directory that
                    // is still non-materialized: the record is
                    // authoritative for its shape, but divergences from the
                    // source-control tree are worth seeing in the logs.
                    if let Ok(tree) = mount.object_store().get_tree(backing, &ctx).await {
                        log_record_divergence(ino, &record, &tree);
                    }
                }
                state_from_record(mount, record, object_id.clone())?
            }
            (None, Some(backing)) => {
                let tree = mount.object_store().get_tree(backing, &ctx).await?;
                state_from_tree(mount, &tree)?
            }
            (None, None) => {
                return Err(FsError::LoadFailed(format!(
                    "materialized directory {} has no overlay record",
                    ino
                )))
            }
        };
        Ok(InodeHandle::Tree(TreeInode::new(
            ino,
            Arc::downgrade(mount),
            Some(Arc::downgrade(&parent)),
            name,
            entry_mode,
            state,
        )))
    } else {
        if object_id.is_none() {
            // Materialized file: its bytes must exist in the content store.
            mount.content_store().open(ino).await?;
        }
        Ok(InodeHandle::File(FileInode::new(
            ino,
            Arc::downgrade(mount),
            Some(Arc::downgrade(&parent)),
            name,
            entry_mode,
            object_id,
        )))
    }
}

fn log_record_divergence(ino: InodeNumber, record: &OverlayDir, tree: &Tree) {
    for (name, _) in record.entries() {
        if tree.get(name).is_none() {
            debug!(inode = %ino, name = %name, "overlay record entry not in source tree");
        }
    }
    for (name, _) in tree.entries() {
        if record.get(name).is_none() {
            debug!(inode = %ino, name = %name, "source tree entry not in overlay record");
        }
    }
}

/// Builds directory contents from a source-control tree, allocating inode
/// numbers for every entry.
pub(crate) fn state_from_tree(mount: &Arc<Mount>, tree: &Tree) -> Result<TreeState, FsError> {
    let mut entries = BTreeMap::new();
    for (name, tree_entry) in tree.entries() {
        let ino = mount.catalog().next_inode_number()?;
        entries.insert(
            name.to_owned(),
            DirEntry {
                mode: tree_entry.kind.initial_mode(),
                ino,
                object_id: Some(tree_entry.id.clone()),
                inode: None,
            },
        );
    }
    Ok(TreeState {
        entries,
        tree_object_id: Some(tree.id().clone()),
    })
}

/// Builds directory contents from a persisted overlay record.
pub(crate) fn state_from_record(
    mount: &Arc<Mount>,
    record: OverlayDir,
    tree_object_id: Option<ObjectId>,
) -> Result<TreeState, FsError> {
    let mut entries = BTreeMap::new();
    for (name, entry) in record.entries() {
        // Legacy records may carry unallocated inode numbers.
        let ino = match entry.inode {
            Some(ino) => ino,
            None => mount.catalog().next_inode_number()?,
        };
        entries.insert(
            name.to_owned(),
            DirEntry {
                mode: entry.mode,
                ino,
                object_id: entry
                    .object_id
                    .as_ref()
                    .map(|bytes| ObjectId::from_bytes(bytes.clone())),
                inode: None,
            },
        );
    }
    Ok(TreeState {
        entries,
        tree_object_id,
    })
}

/// One row of a readdir listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirListEntry {
    pub name: BString,
    pub ino: InodeNumber,
    pub mode: u32,
    /// Pass this back as `offset` to resume after this entry.
    pub offset: u64,
}

impl TreeInode {
    pub(crate) fn new(
        ino: InodeNumber,
        mount: Weak<Mount>,
        parent: Option<Weak<TreeInode>>,
        name: BString,
        initial_mode: u32,
        state: TreeState,
    ) -> Arc<Self> {
        Arc::new(TreeInode {
            base: InodeBase::new(ino, mount, parent, name, initial_mode),
            contents: RwLock::new(state),
        })
    }

    pub(crate) fn base(&self) -> &InodeBase {
        &self.base
    }

    pub(crate) fn contents(&self) -> &RwLock<TreeState> {
        &self.contents
    }

    pub fn ino(&self) -> InodeNumber {
        self.base.ino
    }

    pub fn is_materialized(&self) -> bool {
        self.contents.read().tree_object_id.is_none()
    }

    pub fn tree_object_id(&self) -> Option<ObjectId> {
        self.contents.read().tree_object_id.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.read().entries.is_empty()
    }

    fn mount(&self) -> Result<Arc<Mount>, FsError> {
        self.base.mount()
    }

    /// Looks up `name`, loading the child inode if it isn't loaded yet.
    /// At most one load runs per inode number; concurrent callers coalesce.
    #[instrument(skip(self, _ctx), fields(inode = %self.base.ino, name = %name))]
    pub async fn get_or_load_child(
        self: &Arc<Self>,
        name: &BStr,
        _ctx: &FetchContext,
    ) -> Result<InodeHandle, FsError> {
        let mount = self.mount()?;
        let (rx, pending) = {
            let mut contents = self.contents.write();
            let Some(key) = contents.find_key(name, mount.case_sensitivity()) else {
                return Err(FsError::NotFound(name.to_owned()));
            };
            let entry = contents.entries.get_mut(&key).expect("key just resolved");
            if let Some(handle) = &entry.inode {
                return Ok(handle.clone());
            }
            let (tx, rx) = oneshot::channel();
            let pending = mount
                .inode_map()
                .start_loading_if_not_loading(entry.ino, tx)
                .then(|| PendingLoad {
                    parent: self.clone(),
                    name: key.clone(),
                    ino: entry.ino,
                    entry_mode: entry.mode,
                    object_id: entry.object_id.clone(),
                });
            (rx, pending)
        };
        if let Some(pending) = pending {
            pending.finish(&mount);
        }
        rx.await
            .map_err(|_| FsError::LoadFailed("inode load abandoned".to_string()))?
    }

    /// Like [get_or_load_child](Self::get_or_load_child) but requires the
    /// result to be a directory.
    pub async fn get_or_load_child_tree(
        self: &Arc<Self>,
        name: &BStr,
        ctx: &FetchContext,
    ) -> Result<Arc<TreeInode>, FsError> {
        match self.get_or_load_child(name, ctx).await? {
            InodeHandle::Tree(tree) => Ok(tree),
            InodeHandle::File(_) => Err(FsError::NotADirectory(name.to_owned())),
        }
    }

    /// Iterative descent along a `/`-separated relative path.
    pub async fn get_child_recursive(
        self: &Arc<Self>,
        path: &BStr,
        ctx: &FetchContext,
    ) -> Result<InodeHandle, FsError> {
        let mut current = InodeHandle::Tree(self.clone());
        if path.is_empty() {
            return Ok(current);
        }
        for component in path.split_str(b"/") {
            let tree = match &current {
                InodeHandle::Tree(tree) => tree.clone(),
                InodeHandle::File(_) => {
                    return Err(FsError::NotADirectory(component.as_bstr().to_owned()))
                }
            };
            current = tree.get_or_load_child(component.as_bstr(), ctx).await?;
        }
        Ok(current)
    }

    /// Looks up `name` without forcing a load when the entry is still a
    /// plain source-control reference.
    pub async fn get_or_find_child(
        self: &Arc<Self>,
        name: &BStr,
        ctx: &FetchContext,
    ) -> Result<VirtualInode, FsError> {
        let mount = self.mount()?;
        {
            let contents = self.contents.read();
            if let Some(key) = contents.find_key(name, mount.case_sensitivity()) {
                let entry = &contents.entries[&key];
                if let Some(handle) = &entry.inode {
                    return Ok(VirtualInode::Loaded(handle.clone()));
                }
                if let Some(object_id) = &entry.object_id {
                    return Ok(if entry.is_directory() {
                        VirtualInode::UnloadedTree {
                            ino: entry.ino,
                            mode: entry.mode,
                            object_id: object_id.clone(),
                        }
                    } else {
                        VirtualInode::UnloadedFile {
                            ino: entry.ino,
                            mode: entry.mode,
                            object_id: object_id.clone(),
                        }
                    });
                }
                // Materialized but unloaded: only the inode itself can
                // describe it.
            } else {
                return Err(FsError::NotFound(name.to_owned()));
            }
        }
        Ok(VirtualInode::Loaded(
            self.get_or_load_child(name, ctx).await?,
        ))
    }

    /// Bulk lookup of all children, loading only what must be loaded.
    pub async fn get_children(
        self: &Arc<Self>,
        ctx: &FetchContext,
    ) -> Result<Vec<(BString, VirtualInode)>, FsError> {
        let names: Vec<BString> = {
            let contents = self.contents.read();
            contents.entries.keys().cloned().collect()
        };
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            match self.get_or_find_child(name.as_bstr(), ctx).await {
                Ok(child) => out.push((name, child)),
                // Concurrently removed; just skip it.
                Err(FsError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Lists the directory starting after `offset`, in the stable
    /// inode-number order: `.` at offset 1, `..` at offset 2, children at
    /// `ino + 2`.
    pub fn readdir(self: &Arc<Self>, offset: u64) -> Vec<DirListEntry> {
        let mut out = Vec::new();
        if offset < 1 {
            out.push(DirListEntry {
                name: ".".into(),
                ino: self.base.ino,
                mode: mode::DIR | 0o755,
                offset: 1,
            });
        }
        if offset < 2 {
            let parent_ino = self
                .base
                .parent()
                .map(|p| p.ino())
                .unwrap_or(self.base.ino);
            out.push(DirListEntry {
                name: "..".into(),
                ino: parent_ino,
                mode: mode::DIR | 0o755,
                offset: 2,
            });
        }

        let contents = self.contents.read();
        let mut heap = BinaryHeap::new();
        for (name, entry) in contents.entries.iter() {
            let entry_offset = entry.ino.get() + 2;
            if entry_offset > offset {
                heap.push(Reverse((entry_offset, name.clone(), entry.mode, entry.ino)));
            }
        }
        while let Some(Reverse((entry_offset, name, entry_mode, ino))) = heap.pop() {
            out.push(DirListEntry {
                name,
                ino,
                mode: entry_mode,
                offset: entry_offset,
            });
        }
        out
    }

    pub async fn stat(&self) -> Result<Stat, FsError> {
        let size = self.contents.read().entries.len() as u64;
        Ok(self.base.stat_with_size(size))
    }

    pub async fn setattr(self: &Arc<Self>, attr: SetAttr) -> Result<Stat, FsError> {
        if attr.is_empty() {
            return self.stat().await;
        }
        let mount = self.mount()?;
        if let Some(parent) = self.base.parent() {
            mount.check_reserved_inode(parent.ino(), self.base.name().as_bstr())?;
        }
        if attr.size.is_some() {
            return Err(FsError::IsADirectory(self.base.name()));
        }
        self.base.apply_setattr(&attr);
        self.stat().await
    }

    /// Directories expose no extended attributes.
    pub fn listxattr(&self) -> Vec<String> {
        Vec::new()
    }

    /// Creates a regular file with the given contents.
    #[instrument(skip(self, contents), fields(inode = %self.base.ino, name = %name))]
    pub async fn create(
        self: &Arc<Self>,
        name: &BStr,
        perms: u32,
        contents: Bytes,
    ) -> Result<Arc<FileInode>, FsError> {
        let handle = self
            .create_impl(name, mode::REG | (perms & !mode::FMT), Some(contents))
            .await?;
        match handle {
            InodeHandle::File(file) => Ok(file),
            InodeHandle::Tree(_) => unreachable!("create_impl returned a tree for a file mode"),
        }
    }

    /// Creates a device-less special file. Only regular files and unix
    /// sockets are supported.
    pub async fn mknod(
        self: &Arc<Self>,
        name: &BStr,
        file_mode: u32,
    ) -> Result<Arc<FileInode>, FsError> {
        let fmt = file_mode & mode::FMT;
        if fmt != mode::REG && fmt != mode::SOCK {
            return Err(FsError::InvalidArgument(format!(
                "unsupported file type {:o} for mknod",
                fmt
            )));
        }
        let handle = self.create_impl(name, file_mode, Some(Bytes::new())).await?;
        match handle {
            InodeHandle::File(file) => Ok(file),
            InodeHandle::Tree(_) => unreachable!("mknod never creates directories"),
        }
    }

    pub async fn symlink(
        self: &Arc<Self>,
        name: &BStr,
        target: &BStr,
    ) -> Result<Arc<FileInode>, FsError> {
        let handle = self
            .create_impl(name, mode::LNK | 0o777, Some(Bytes::copy_from_slice(target)))
            .await?;
        match handle {
            InodeHandle::File(file) => Ok(file),
            InodeHandle::Tree(_) => unreachable!("symlink never creates directories"),
        }
    }

    #[instrument(skip(self), fields(inode = %self.base.ino, name = %name))]
    pub async fn mkdir(self: &Arc<Self>, name: &BStr, perms: u32) -> Result<Arc<TreeInode>, FsError> {
        let handle = self
            .create_impl(name, mode::DIR | (perms & !mode::FMT), None)
            .await?;
        match handle {
            InodeHandle::Tree(tree) => Ok(tree),
            InodeHandle::File(_) => unreachable!("mkdir always creates directories"),
        }
    }

    /// Shared creation path. `contents` is `Some` for files (and symlink
    /// targets), `None` for directories.
    async fn create_impl(
        self: &Arc<Self>,
        name: &BStr,
        full_mode: u32,
        contents: Option<Bytes>,
    ) -> Result<InodeHandle, FsError> {
        OverlayDir::validate_name(name)
            .map_err(|e| FsError::InvalidArgument(e.to_string()))?;
        let mount = self.mount()?;
        mount.check_reserved_inode(self.base.ino, name)?;
        if self.base.is_unlinked() {
            return Err(FsError::NotFound(name.to_owned()));
        }

        let ino = mount.catalog().next_inode_number()?;
        // Create the durable state first so a directory entry never points
        // at nothing; losing the race below just leaves garbage to clean
        // up.
        let is_dir = contents.is_none();
        match &contents {
            Some(bytes) => mount.content_store().create(ino, bytes.clone()).await?,
            None => mount.catalog().save_dir(ino, OverlayDir::new()).await?,
        }

        let handle = {
            let mut contents_lock = self.contents.write();
            if contents_lock
                .find_key(name, mount.case_sensitivity())
                .is_some()
            {
                drop(contents_lock);
                if is_dir {
                    let _ = mount.catalog().load_and_remove_dir(ino).await;
                } else {
                    let _ = mount.content_store().remove(ino).await;
                }
                return Err(FsError::AlreadyExists(name.to_owned()));
            }

            if let Err(e) = mount.channel().invalidate_entry(self.base.ino, name) {
                drop(contents_lock);
                if is_dir {
                    let _ = mount.catalog().load_and_remove_dir(ino).await;
                } else {
                    let _ = mount.content_store().remove(ino).await;
                }
                return Err(FsError::Io(e));
            }

            let handle = if is_dir {
                InodeHandle::Tree(TreeInode::new(
                    ino,
                    Arc::downgrade(&mount),
                    Some(Arc::downgrade(self)),
                    name.to_owned(),
                    full_mode,
                    TreeState {
                        entries: BTreeMap::new(),
                        tree_object_id: None,
                    },
                ))
            } else {
                InodeHandle::File(FileInode::new(
                    ino,
                    Arc::downgrade(&mount),
                    Some(Arc::downgrade(self)),
                    name.to_owned(),
                    full_mode,
                    None,
                ))
            };
            contents_lock.entries.insert(
                name.to_owned(),
                DirEntry {
                    mode: full_mode,
                    ino,
                    object_id: None,
                    inode: Some(handle.clone()),
                },
            );
            self.base.update_mtime();
            handle
        };

        mount.inode_map().load_complete(handle.clone());
        // Persist our updated listing and make sure every ancestor records
        // us as materialized.
        self.materialize().await?;
        if let Err(e) = mount.channel().invalidate_dir(self.base.ino) {
            warn!(inode = %self.base.ino, error = %e, "directory invalidation failed");
        }
        if let Some(path) = handle.base().path() {
            mount.journal().record(JournalEvent::Created { path });
        }
        Ok(handle)
    }

    /// Removes a non-directory child.
    pub async fn unlink(self: &Arc<Self>, name: &BStr, ctx: &FetchContext) -> Result<(), FsError> {
        self.remove_impl(name, false, ctx).await
    }

    /// Removes an empty child directory.
    pub async fn rmdir(self: &Arc<Self>, name: &BStr, ctx: &FetchContext) -> Result<(), FsError> {
        self.remove_impl(name, true, ctx).await
    }

    async fn remove_impl(
        self: &Arc<Self>,
        name: &BStr,
        must_be_dir: bool,
        ctx: &FetchContext,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        mount.check_reserved_inode(self.base.ino, name)?;

        // The entry may be replaced between loading the child and taking
        // the locks; retry a bounded number of times.
        for _attempt in 0..3 {
            let child = self.get_or_load_child(name, ctx).await?;
            let _rename = mount.rename_lock().write().await;
            match self
                .remove_entry_locked(&mount, name, must_be_dir, &child)
                .await?
            {
                RemoveOutcome::Removed => {
                    let mut path = self.base.path().unwrap_or_default();
                    if !path.is_empty() {
                        path.push(b'/');
                    }
                    path.extend_from_slice(name);
                    mount.journal().record(JournalEvent::Removed { path });
                    return Ok(());
                }
                RemoveOutcome::Retry => continue,
            }
        }
        Err(FsError::LoadFailed(format!(
            "entry {} kept changing during removal",
            name
        )))
    }

    /// The locked core of unlink/rmdir: caller holds the rename lock and
    /// has loaded the child it expects to remove.
    pub(crate) async fn remove_entry_locked(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        name: &BStr,
        must_be_dir: bool,
        child: &InodeHandle,
    ) -> Result<RemoveOutcome, FsError> {
        match (child, must_be_dir) {
            (InodeHandle::Tree(_), false) => {
                return Err(FsError::IsADirectory(name.to_owned()));
            }
            (InodeHandle::File(_), true) => {
                return Err(FsError::NotADirectory(name.to_owned()));
            }
            _ => {}
        }

        {
            let mut contents = self.contents.write();
            let Some(key) = contents.find_key(name, mount.case_sensitivity()) else {
                return Err(FsError::NotFound(name.to_owned()));
            };
            let entry = &contents.entries[&key];
            if entry.ino != child.ino() {
                return Ok(RemoveOutcome::Retry);
            }
            if let InodeHandle::Tree(tree) = child {
                // Parent contents lock, then child contents lock.
                if !tree.contents.read().entries.is_empty() {
                    return Err(FsError::DirectoryNotEmpty(name.to_owned()));
                }
            }
            // Invalidation happens before any in-memory mutation; if the
            // host refuses, the operation fails with nothing to roll back.
            mount
                .channel()
                .invalidate_entry(self.base.ino, key.as_bstr())
                .map_err(FsError::Io)?;
            contents.entries.remove(&key);
            child.base().location.lock().unlinked = true;
            self.base.update_mtime();
        }

        self.materialize().await?;
        match child {
            InodeHandle::File(file) => file.cleanup_after_unlink().await?,
            InodeHandle::Tree(tree) => tree.cleanup_after_unlink().await?,
        }
        if let Err(e) = mount.channel().invalidate_dir(self.base.ino) {
            warn!(inode = %self.base.ino, error = %e, "directory invalidation failed");
        }
        Ok(RemoveOutcome::Removed)
    }

    /// Removes a child and all of its descendants.
    ///
    /// An unloaded, non-materialized child (with no kernel references) can
    /// be dropped with a single entry removal; anything else is deleted
    /// bottom-up under the rename lock held for the whole operation.
    #[instrument(skip(self, ctx), fields(inode = %self.base.ino, name = %name))]
    pub async fn remove_recursively(
        self: &Arc<Self>,
        name: &BStr,
        ctx: &FetchContext,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        mount.check_reserved_inode(self.base.ino, name)?;

        // Fast path.
        let removed_unloaded = {
            let mut contents = self.contents.write();
            match contents.find_key(name, mount.case_sensitivity()) {
                None => return Err(FsError::NotFound(name.to_owned())),
                Some(key) => {
                    let entry = &contents.entries[&key];
                    if entry.inode.is_none()
                        && entry.object_id.is_some()
                        && !mount.inode_map().is_loaded_or_remembered(entry.ino)
                    {
                        mount
                            .channel()
                            .invalidate_entry(self.base.ino, key.as_bstr())
                            .map_err(FsError::Io)?;
                        let entry = contents.entries.remove(&key).expect("key resolved");
                        self.base.update_mtime();
                        Some(entry)
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(entry) = removed_unloaded {
            self.materialize().await?;
            if entry.is_directory() {
                // Forget any historically persisted records underneath.
                catalog::remove_dir_recursive(mount.catalog().as_ref(), entry.ino).await?;
            }
            return Ok(());
        }

        let child = self.get_or_load_child(name, ctx).await?;
        let _rename = mount.rename_lock().write().await;
        match &child {
            InodeHandle::File(_) => {
                match self
                    .remove_entry_locked(&mount, name, false, &child)
                    .await?
                {
                    RemoveOutcome::Removed => Ok(()),
                    RemoveOutcome::Retry => Err(FsError::NotFound(name.to_owned())),
                }
            }
            InodeHandle::Tree(tree) => {
                tree.remove_all_children_locked(&mount, ctx).await?;
                match self.remove_entry_locked(&mount, name, true, &child).await? {
                    RemoveOutcome::Removed => Ok(()),
                    RemoveOutcome::Retry => Err(FsError::NotFound(name.to_owned())),
                }
            }
        }
    }

    /// Deletes every child, recursively. The caller holds the rename lock.
    fn remove_all_children_locked<'a>(
        self: &'a Arc<Self>,
        mount: &'a Arc<Mount>,
        ctx: &'a FetchContext,
    ) -> futures::future::BoxFuture<'a, Result<(), FsError>> {
        use futures::FutureExt;
        async move {
            loop {
                let names: Vec<BString> = {
                    let contents = self.contents.read();
                    contents.entries.keys().cloned().collect()
                };
                if names.is_empty() {
                    return Ok(());
                }
                for name in names {
                    // Unloaded source-control references go in one step.
                    let removed_unloaded = {
                        let mut contents = self.contents.write();
                        match contents.entries.get(&name) {
                            Some(entry)
                                if entry.inode.is_none()
                                    && entry.object_id.is_some()
                                    && !mount.inode_map().is_loaded_or_remembered(entry.ino) =>
                            {
                                mount
                                    .channel()
                                    .invalidate_entry(self.base.ino, name.as_bstr())
                                    .map_err(FsError::Io)?;
                                let entry =
                                    contents.entries.remove(&name).expect("entry present");
                                Some(entry)
                            }
                            _ => None,
                        }
                    };
                    if let Some(entry) = removed_unloaded {
                        self.materialize().await?;
                        if entry.is_directory() {
                            catalog::remove_dir_recursive(mount.catalog().as_ref(), entry.ino)
                                .await?;
                        }
                        continue;
                    }

                    let child = self.get_or_load_child(name.as_bstr(), ctx).await?;
                    match &child {
                        InodeHandle::File(_) => {
                            self.remove_entry_locked(mount, name.as_bstr(), false, &child)
                                .await?;
                        }
                        InodeHandle::Tree(tree) => {
                            tree.remove_all_children_locked(mount, ctx).await?;
                            self.remove_entry_locked(mount, name.as_bstr(), true, &child)
                                .await?;
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Marks this directory materialized (persisting its record) and walks
    /// the ancestor chain doing the same. Never acquires the rename lock;
    /// callers hold it in the mode their operation requires.
    pub(crate) async fn materialize(self: &Arc<Self>) -> Result<(), FsError> {
        let mount = self.mount()?;
        let (was_materialized, record) = {
            let mut contents = self.contents.write();
            let was = contents.tree_object_id.is_none();
            contents.tree_object_id = None;
            (was, contents.to_overlay_dir())
        };
        mount.catalog().save_dir(self.base.ino, record).await?;
        if !was_materialized {
            if let Some(parent) = self.base.parent() {
                parent.child_materialized(self.base.name().as_bstr()).await?;
            }
        }
        Ok(())
    }

    /// Records that the named child became materialized: drops the child's
    /// object id from our entry and materializes ourselves (and our
    /// ancestors) if we weren't already.
    pub(crate) async fn child_materialized(self: &Arc<Self>, child_name: &BStr) -> Result<(), FsError> {
        let mount = self.mount()?;
        let mut current = self.clone();
        let mut name = child_name.to_owned();
        loop {
            let (was_materialized, record) = {
                let mut contents = current.contents.write();
                if let Some(key) = contents.find_key(name.as_bstr(), mount.case_sensitivity()) {
                    if let Some(entry) = contents.entries.get_mut(&key) {
                        entry.object_id = None;
                    }
                }
                let was = contents.tree_object_id.is_none();
                contents.tree_object_id = None;
                (was, contents.to_overlay_dir())
            };
            mount.catalog().save_dir(current.base.ino, record).await?;
            if was_materialized {
                return Ok(());
            }
            let Some(parent) = current.base.parent() else {
                return Ok(());
            };
            name = current.base.name();
            current = parent;
        }
    }

    /// Records that the named child reverted to a source-control
    /// reference after a checkout confirmed equivalence.
    pub(crate) async fn child_dematerialized(
        self: &Arc<Self>,
        child_name: &BStr,
        object_id: ObjectId,
    ) -> Result<(), FsError> {
        let mount = self.mount()?;
        let record = {
            let mut contents = self.contents.write();
            if let Some(key) = contents.find_key(child_name, mount.case_sensitivity()) {
                if let Some(entry) = contents.entries.get_mut(&key) {
                    entry.object_id = Some(object_id);
                }
            }
            contents.to_overlay_dir()
        };
        mount.catalog().save_dir(self.base.ino, record).await?;
        Ok(())
    }

    /// Cleans up persistent and registry state after this (empty)
    /// directory was unlinked.
    pub(crate) async fn cleanup_after_unlink(self: &Arc<Self>) -> Result<(), FsError> {
        let mount = self.mount()?;
        let _ = mount.catalog().load_and_remove_dir(self.base.ino).await?;
        mount.inode_map().forget(self.base.ino);
        Ok(())
    }

    /// Forgets loaded, non-materialized children whose last access
    /// precedes `cutoff`. Returns how many inodes were unloaded.
    pub fn invalidate_children_not_materialized(
        self: &Arc<Self>,
        cutoff: SystemTime,
    ) -> Result<u64, FsError> {
        let mount = self.mount()?;
        let mut unloaded = 0;
        let mut subdirs: Vec<Arc<TreeInode>> = Vec::new();
        {
            let mut contents = self.contents.write();
            for (name, entry) in contents.entries.iter_mut() {
                let Some(handle) = &entry.inode else { continue };
                match handle {
                    InodeHandle::Tree(tree) => subdirs.push(tree.clone()),
                    InodeHandle::File(file) => {
                        if entry.object_id.is_none() {
                            continue;
                        }
                        // The kernel may still address this inode directly.
                        if mount.inode_map().fs_refcount(entry.ino) > 0 {
                            continue;
                        }
                        let atime = file.base().metadata.lock().atime;
                        if atime >= cutoff {
                            continue;
                        }
                        // The host must agree to drop its cached entry
                        // before we forget the inode.
                        if mount
                            .channel()
                            .invalidate_entry(self.base.ino, name.as_bstr())
                            .is_err()
                        {
                            continue;
                        }
                        mount.inode_map().forget(entry.ino);
                        entry.inode = None;
                        unloaded += 1;
                    }
                }
            }
        }
        for subdir in subdirs {
            unloaded += subdir.invalidate_children_not_materialized(cutoff)?;
        }
        Ok(unloaded)
    }

    /// Renames `name` into `dst_parent/dst_name`. See the module-level
    /// discussion of lock order; this is the only operation touching two
    /// directories at once.
    #[instrument(skip(self, dst_parent, ctx), fields(inode = %self.base.ino, from = %name, to = %dst_name))]
    pub async fn rename(
        self: &Arc<Self>,
        name: &BStr,
        dst_parent: &Arc<TreeInode>,
        dst_name: &BStr,
        ctx: &FetchContext,
    ) -> Result<(), FsError> {
        OverlayDir::validate_name(dst_name)
            .map_err(|e| FsError::InvalidArgument(e.to_string()))?;
        let mount = self.mount()?;
        mount.check_reserved_inode(self.base.ino, name)?;
        mount.check_reserved_inode(dst_parent.base.ino, dst_name)?;

        let rename_guard = mount.rename_lock().write().await;

        let src_child = self.get_or_load_child(name, ctx).await?;

        // Renaming an entry onto itself is a no-op.
        if self.base.ino == dst_parent.base.ino && name == dst_name {
            return Ok(());
        }

        if dst_parent.base.is_unlinked() {
            return Err(FsError::NotFound(dst_name.to_owned()));
        }

        // A directory must never become its own descendant.
        if let InodeHandle::Tree(src_tree) = &src_child {
            let mut cursor = Some(dst_parent.clone());
            while let Some(tree) = cursor {
                if tree.ino() == src_tree.ino() {
                    return Err(FsError::InvalidArgument(
                        "cannot move a directory underneath itself".to_string(),
                    ));
                }
                cursor = tree.base.parent();
            }
        }

        // Load the destination (to judge replacement) before mutating.
        let dst_existing = {
            let has_dst = {
                let contents = dst_parent.contents.read();
                contents
                    .find_key(dst_name, mount.case_sensitivity())
                    .is_some()
            };
            if has_dst {
                Some(dst_parent.get_or_load_child(dst_name, ctx).await?)
            } else {
                None
            }
        };
        match (&src_child, &dst_existing) {
            (_, None) => {}
            (InodeHandle::File(_), Some(InodeHandle::Tree(_))) => {
                return Err(FsError::IsADirectory(dst_name.to_owned()));
            }
            (InodeHandle::Tree(_), Some(InodeHandle::File(_))) => {
                return Err(FsError::NotADirectory(dst_name.to_owned()));
            }
            (_, Some(InodeHandle::Tree(dst_tree))) => {
                if !dst_tree.is_empty() {
                    return Err(FsError::AlreadyExists(dst_name.to_owned()));
                }
            }
            (_, Some(InodeHandle::File(_))) => {}
        }

        // Both parents become materialized before the listing changes.
        self.materialize().await?;
        if dst_parent.base.ino != self.base.ino {
            dst_parent.materialize().await?;
        }

        let same_parent = self.base.ino == dst_parent.base.ino;
        // Contents locks in ascending inode order when two are needed.
        if same_parent {
            let mut contents = self.contents.write();
            rename_within(
                &mount,
                self,
                &mut contents,
                name,
                dst_name,
                &src_child,
                &dst_existing,
            )?;
        } else if self.base.ino < dst_parent.base.ino {
            let mut src_guard = self.contents.write();
            let mut dst_guard = dst_parent.contents.write();
            rename_across(
                &mount,
                self,
                dst_parent,
                &mut src_guard,
                &mut dst_guard,
                name,
                dst_name,
                &src_child,
                &dst_existing,
            )?;
        } else {
            let mut dst_guard = dst_parent.contents.write();
            let mut src_guard = self.contents.write();
            rename_across(
                &mount,
                self,
                dst_parent,
                &mut src_guard,
                &mut dst_guard,
                name,
                dst_name,
                &src_child,
                &dst_existing,
            )?;
        }

        // Persist the new listings.
        if mount.catalog().supports_semantic_operations() {
            mount
                .catalog()
                .rename_child(self.base.ino, dst_parent.base.ino, name, dst_name)
                .await?;
        } else {
            let src_record = self.contents.read().to_overlay_dir();
            mount.catalog().save_dir(self.base.ino, src_record).await?;
            if !same_parent {
                let dst_record = dst_parent.contents.read().to_overlay_dir();
                mount
                    .catalog()
                    .save_dir(dst_parent.base.ino, dst_record)
                    .await?;
            }
        }

        if let Err(e) = mount.channel().invalidate_dir(self.base.ino) {
            warn!(inode = %self.base.ino, error = %e, "directory invalidation failed");
        }
        if !same_parent {
            if let Err(e) = mount.channel().invalidate_dir(dst_parent.base.ino) {
                warn!(inode = %dst_parent.base.ino, error = %e, "directory invalidation failed");
            }
        }

        // Journal while still holding the rename lock, so no dependent
        // operation can observe the rename before the event exists.
        let mut from = self.base.path().unwrap_or_default();
        if !from.is_empty() {
            from.push(b'/');
        }
        from.extend_from_slice(name);
        let to = src_child.base().path().unwrap_or_default();
        mount.journal().record(if dst_existing.is_some() {
            JournalEvent::Replaced { from, to }
        } else {
            JournalEvent::Renamed { from, to }
        });

        drop(rename_guard);

        // Destroy whatever the rename replaced.
        if let Some(replaced) = dst_existing {
            match replaced {
                InodeHandle::File(file) => file.cleanup_after_unlink().await?,
                InodeHandle::Tree(tree) => tree.cleanup_after_unlink().await?,
            }
        }
        Ok(())
    }
}

/// Outcome of the locked removal core.
pub(crate) enum RemoveOutcome {
    Removed,
    /// The entry changed between load and lock; the caller retries.
    Retry,
}

/// Applies a same-directory rename to the locked contents.
fn rename_within(
    mount: &Arc<Mount>,
    parent: &Arc<TreeInode>,
    contents: &mut TreeState,
    src_name: &BStr,
    dst_name: &BStr,
    src_child: &InodeHandle,
    dst_existing: &Option<InodeHandle>,
) -> Result<(), FsError> {
    let Some(src_key) = contents.find_key(src_name, mount.case_sensitivity()) else {
        return Err(FsError::NotFound(src_name.to_owned()));
    };
    mount
        .channel()
        .invalidate_entry(parent.base.ino, src_key.as_bstr())
        .map_err(FsError::Io)?;
    mount
        .channel()
        .invalidate_entry(parent.base.ino, dst_name)
        .map_err(FsError::Io)?;

    let entry = contents.entries.remove(&src_key).expect("key resolved");
    if let Some(replaced) = dst_existing {
        replaced.base().location.lock().unlinked = true;
    }
    contents.entries.insert(dst_name.to_owned(), entry);

    let mut location = src_child.base().location.lock();
    location.name = dst_name.to_owned();
    drop(location);

    parent.base.update_mtime();
    Ok(())
}

/// Applies a cross-directory rename to the two locked contents.
#[allow(clippy::too_many_arguments)]
fn rename_across(
    mount: &Arc<Mount>,
    src_parent: &Arc<TreeInode>,
    dst_parent: &Arc<TreeInode>,
    src_contents: &mut parking_lot::RwLockWriteGuard<'_, TreeState>,
    dst_contents: &mut parking_lot::RwLockWriteGuard<'_, TreeState>,
    src_name: &BStr,
    dst_name: &BStr,
    src_child: &InodeHandle,
    dst_existing: &Option<InodeHandle>,
) -> Result<(), FsError> {
    let Some(src_key) = src_contents.find_key(src_name, mount.case_sensitivity()) else {
        return Err(FsError::NotFound(src_name.to_owned()));
    };
    mount
        .channel()
        .invalidate_entry(src_parent.base.ino, src_key.as_bstr())
        .map_err(FsError::Io)?;
    mount
        .channel()
        .invalidate_entry(dst_parent.base.ino, dst_name)
        .map_err(FsError::Io)?;

    let entry = src_contents.entries.remove(&src_key).expect("key resolved");
    if let Some(replaced) = dst_existing {
        replaced.base().location.lock().unlinked = true;
    }
    dst_contents.entries.insert(dst_name.to_owned(), entry);

    let mut location = src_child.base().location.lock();
    location.parent = Some(Arc::downgrade(dst_parent));
    location.name = dst_name.to_owned();
    drop(location);

    src_parent.base.update_mtime();
    dst_parent.base.update_mtime();
    Ok(())
}
