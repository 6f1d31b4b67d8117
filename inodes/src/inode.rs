use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bstr::BString;
use parking_lot::Mutex;

use scmfs_overlay::dir::mode;
use scmfs_overlay::InodeNumber;

use crate::file::FileInode;
use crate::mount::Mount;
use crate::store::{FetchContext, ObjectId};
use crate::tree::TreeInode;
use crate::FsError;

/// POSIX-like metadata kept in memory per inode.
///
/// Only the mode's file type and permission bits are persisted (inside the
/// parent's directory record); ownership and timestamps live for the
/// duration of the mount.
#[derive(Clone, Copy, Debug)]
pub struct InodeMetadata {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl InodeMetadata {
    pub fn new(mode: u32) -> Self {
        let now = SystemTime::now();
        InodeMetadata {
            mode,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.mode & mode::FMT == mode::DIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & mode::FMT == mode::LNK
    }
}

/// Attributes a `setattr` call wants to change. Empty means no-op.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    pub fn is_empty(&self) -> bool {
        self.size.is_none()
            && self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }
}

/// Result of a stat call.
#[derive(Clone, Copy, Debug)]
pub struct Stat {
    pub ino: InodeNumber,
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

/// Where an inode hangs in the tree: its parent and its name there.
///
/// This is the child half of the parent/child relationship. The parent
/// owns the child through its directory entry; the child holds only this
/// non-owning back-edge, which is kept consistent with the parent's entry
/// under the mount rename lock.
pub(crate) struct InodeLocation {
    pub parent: Option<Weak<TreeInode>>,
    pub name: BString,
    /// Set once the inode has been unlinked from its parent. The inode may
    /// outlive this (open handles), but it has no path anymore.
    pub unlinked: bool,
}

/// State shared by file and tree inodes.
pub(crate) struct InodeBase {
    pub ino: InodeNumber,
    pub mount: Weak<Mount>,
    pub location: Mutex<InodeLocation>,
    pub metadata: Mutex<InodeMetadata>,
}

impl InodeBase {
    pub fn new(
        ino: InodeNumber,
        mount: Weak<Mount>,
        parent: Option<Weak<TreeInode>>,
        name: BString,
        initial_mode: u32,
    ) -> Self {
        InodeBase {
            ino,
            mount,
            location: Mutex::new(InodeLocation {
                parent,
                name,
                unlinked: false,
            }),
            metadata: Mutex::new(InodeMetadata::new(initial_mode)),
        }
    }

    pub fn mount(&self) -> Result<Arc<Mount>, FsError> {
        self.mount.upgrade().ok_or(FsError::MountShutdown)
    }

    /// The inode's current parent, if it is still linked.
    pub fn parent(&self) -> Option<Arc<TreeInode>> {
        let location = self.location.lock();
        if location.unlinked {
            return None;
        }
        location.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn name(&self) -> BString {
        self.location.lock().name.clone()
    }

    pub fn is_unlinked(&self) -> bool {
        self.location.lock().unlinked
    }

    /// The path from the mount root, or `None` for unlinked inodes.
    ///
    /// Best-effort when racing renames; callers that need stability hold
    /// the mount rename lock.
    pub fn path(&self) -> Option<BString> {
        let mut segments: Vec<BString> = Vec::new();
        let mut current: Option<Arc<TreeInode>>;
        {
            let location = self.location.lock();
            if location.unlinked {
                return None;
            }
            let Some(parent) = &location.parent else {
                return Some(BString::default());
            };
            segments.push(location.name.clone());
            current = parent.upgrade();
        }
        while let Some(inode) = current {
            let location = inode.base().location.lock();
            if location.unlinked {
                return None;
            }
            match &location.parent {
                Some(parent) => {
                    segments.push(location.name.clone());
                    current = parent.upgrade();
                }
                None => break,
            }
        }
        segments.reverse();
        let mut path = BString::default();
        for (i, seg) in segments.iter().enumerate() {
            if i > 0 {
                path.push(b'/');
            }
            path.extend_from_slice(seg);
        }
        Some(path)
    }

    pub fn touch_atime(&self) {
        self.metadata.lock().atime = SystemTime::now();
    }

    pub fn update_mtime(&self) {
        let now = SystemTime::now();
        let mut metadata = self.metadata.lock();
        metadata.mtime = now;
        metadata.ctime = now;
    }

    pub fn stat_with_size(&self, size: u64) -> Stat {
        let metadata = self.metadata.lock();
        Stat {
            ino: self.ino,
            mode: metadata.mode,
            size,
            uid: metadata.uid,
            gid: metadata.gid,
            atime: metadata.atime,
            mtime: metadata.mtime,
            ctime: metadata.ctime,
        }
    }

    /// Applies the non-size parts of a setattr request.
    pub fn apply_setattr(&self, attr: &SetAttr) {
        let mut metadata = self.metadata.lock();
        if let Some(new_mode) = attr.mode {
            // The file type can never change; only permission bits do.
            metadata.mode = (metadata.mode & mode::FMT) | (new_mode & !mode::FMT);
        }
        if let Some(uid) = attr.uid {
            metadata.uid = uid;
        }
        if let Some(gid) = attr.gid {
            metadata.gid = gid;
        }
        if let Some(atime) = attr.atime {
            metadata.atime = atime;
        }
        if let Some(mtime) = attr.mtime {
            metadata.mtime = mtime;
        }
        metadata.ctime = SystemTime::now();
    }
}

/// A loaded inode: either a directory or a file/symlink.
#[derive(Clone)]
pub enum InodeHandle {
    Tree(Arc<TreeInode>),
    File(Arc<FileInode>),
}

impl InodeHandle {
    pub fn ino(&self) -> InodeNumber {
        self.base().ino
    }

    pub(crate) fn base(&self) -> &InodeBase {
        match self {
            InodeHandle::Tree(t) => t.base(),
            InodeHandle::File(f) => f.base(),
        }
    }

    pub fn is_tree(&self) -> bool {
        matches!(self, InodeHandle::Tree(_))
    }

    pub fn as_tree(&self) -> Option<&Arc<TreeInode>> {
        match self {
            InodeHandle::Tree(t) => Some(t),
            InodeHandle::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&Arc<FileInode>> {
        match self {
            InodeHandle::File(f) => Some(f),
            InodeHandle::Tree(_) => None,
        }
    }

    pub async fn stat(&self, ctx: &FetchContext) -> Result<Stat, FsError> {
        match self {
            InodeHandle::Tree(t) => t.stat().await,
            InodeHandle::File(f) => f.stat(ctx).await,
        }
    }

    pub(crate) fn downgrade(&self) -> WeakInodeHandle {
        match self {
            InodeHandle::Tree(t) => WeakInodeHandle::Tree(Arc::downgrade(t)),
            InodeHandle::File(f) => WeakInodeHandle::File(Arc::downgrade(f)),
        }
    }
}

#[derive(Clone)]
pub(crate) enum WeakInodeHandle {
    Tree(Weak<TreeInode>),
    File(Weak<FileInode>),
}

impl WeakInodeHandle {
    pub fn upgrade(&self) -> Option<InodeHandle> {
        match self {
            WeakInodeHandle::Tree(t) => t.upgrade().map(InodeHandle::Tree),
            WeakInodeHandle::File(f) => f.upgrade().map(InodeHandle::File),
        }
    }
}

/// The result of looking up a name without forcing a load: either the
/// loaded inode, or a plain descriptor of a still-unmaterialized entry.
#[derive(Clone)]
pub enum VirtualInode {
    Loaded(InodeHandle),
    /// A directory entry still identical to a source-control tree.
    UnloadedTree {
        ino: InodeNumber,
        mode: u32,
        object_id: ObjectId,
    },
    /// A file entry still identical to a source-control blob.
    UnloadedFile {
        ino: InodeNumber,
        mode: u32,
        object_id: ObjectId,
    },
}

impl VirtualInode {
    pub fn ino(&self) -> InodeNumber {
        match self {
            VirtualInode::Loaded(handle) => handle.ino(),
            VirtualInode::UnloadedTree { ino, .. } | VirtualInode::UnloadedFile { ino, .. } => {
                *ino
            }
        }
    }

    pub fn is_directory(&self) -> bool {
        match self {
            VirtualInode::Loaded(handle) => handle.is_tree(),
            VirtualInode::UnloadedTree { .. } => true,
            VirtualInode::UnloadedFile { .. } => false,
        }
    }

    /// The source-control object this entry refers to, for entries that
    /// are not materialized.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            VirtualInode::Loaded(_) => None,
            VirtualInode::UnloadedTree { object_id, .. }
            | VirtualInode::UnloadedFile { object_id, .. } => Some(object_id),
        }
    }

    /// Stats without loading an inode: unloaded files consult the object
    /// store for their size.
    pub async fn stat(&self, mount: &Arc<Mount>, ctx: &FetchContext) -> Result<Stat, FsError> {
        match self {
            VirtualInode::Loaded(handle) => handle.stat(ctx).await,
            VirtualInode::UnloadedTree { ino, mode, .. } => {
                let now = SystemTime::now();
                Ok(Stat {
                    ino: *ino,
                    mode: *mode,
                    size: 0,
                    uid: unsafe { libc::getuid() },
                    gid: unsafe { libc::getgid() },
                    atime: now,
                    mtime: now,
                    ctime: now,
                })
            }
            VirtualInode::UnloadedFile {
                ino,
                mode,
                object_id,
            } => {
                let size = mount.object_store().get_blob_size(object_id, ctx).await?;
                let now = SystemTime::now();
                Ok(Stat {
                    ino: *ino,
                    mode: *mode,
                    size,
                    uid: unsafe { libc::getuid() },
                    gid: unsafe { libc::getgid() },
                    atime: now,
                    mtime: now,
                    ctime: now,
                })
            }
        }
    }
}
