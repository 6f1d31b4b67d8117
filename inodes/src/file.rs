//! File (and symlink) inodes.
//!
//! A file starts out as a lazy reference to a source-control blob and moves
//! through three states:
//!
//!  - **not loading**: we hold the object id and maybe a cached size, but
//!    no blob contents,
//!  - **loading**: a blob fetch is in flight; everyone else queues on it,
//!  - **materialized**: the file's bytes live in the overlay content store
//!    under this inode's number; the object id is gone.
//!
//! Transitions are monotonic toward materialized for the lifetime of a
//! mount. A truncate that arrives while a load is in flight materializes
//! immediately and resolves the waiters with no blob; they re-observe the
//! state and take the overlay path.

use std::sync::{Arc, Weak};

use bstr::{BString, ByteSlice};
use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, instrument, warn};

use scmfs_overlay::InodeNumber;

use crate::coverage::CoverageSet;
use crate::inode::{InodeBase, SetAttr, Stat};
use crate::mount::Mount;
use crate::store::{
    sha1_of, Blob, BlobInterestHandle, FetchContext, Interest, ObjectComparison, ObjectId,
    Sha1Hash,
};
use crate::tree::TreeInode;
use crate::FsError;

/// The only extended attribute files expose.
pub const SHA1_XATTR: &str = "user.sha1";

enum FileState {
    /// Not materialized, no fetch in flight.
    NotLoading {
        object_id: ObjectId,
        /// Blob size, once known.
        size: Option<u64>,
        /// Interest keeping the blob cached while we still serve reads from
        /// it.
        interest: BlobInterestHandle,
        /// Byte ranges already handed to the kernel from the cached blob.
        coverage: CoverageSet,
    },
    /// A blob fetch is in flight; waiters resolve when it lands.
    ///
    /// A `None` resolution means the state changed underneath the load
    /// (truncate won the race); waiters must re-observe the state.
    Loading {
        object_id: ObjectId,
        size: Option<u64>,
        waiters: Vec<oneshot::Sender<Option<Arc<Blob>>>>,
    },
    /// Bytes live in the overlay content store under this inode's number.
    Materialized,
}

pub struct FileInode {
    base: InodeBase,
    state: Mutex<FileState>,
}

/// What the state inspection under the lock decided to do next.
enum Step {
    Overlay,
    Blob(Arc<Blob>),
    Fetch(ObjectId),
    Wait(oneshot::Receiver<Option<Arc<Blob>>>),
}

impl FileInode {
    pub(crate) fn new(
        ino: InodeNumber,
        mount: Weak<Mount>,
        parent: Option<Weak<TreeInode>>,
        name: BString,
        initial_mode: u32,
        object_id: Option<ObjectId>,
    ) -> Arc<Self> {
        let state = match object_id {
            Some(object_id) => FileState::NotLoading {
                object_id,
                size: None,
                interest: BlobInterestHandle::empty(),
                coverage: CoverageSet::new(),
            },
            None => FileState::Materialized,
        };
        Arc::new(FileInode {
            base: InodeBase::new(ino, mount, parent, name, initial_mode),
            state: Mutex::new(state),
        })
    }

    pub(crate) fn base(&self) -> &InodeBase {
        &self.base
    }

    pub fn ino(&self) -> InodeNumber {
        self.base.ino
    }

    pub async fn is_materialized(&self) -> bool {
        matches!(*self.state.lock().await, FileState::Materialized)
    }

    /// Acquires the state lock and either returns the blob backing this
    /// file, or `None` if the file is materialized and reads should go to
    /// the overlay. Drives the load state machine as needed.
    async fn blob_for_read(
        self: &Arc<Self>,
        interest: Interest,
        ctx: &FetchContext,
    ) -> Result<Option<Arc<Blob>>, FsError> {
        let mount = self.base.mount()?;
        loop {
            let step = {
                let mut state = self.state.lock().await;
                match &mut *state {
                    FileState::Materialized => Step::Overlay,
                    FileState::NotLoading {
                        object_id,
                        size,
                        interest: held,
                        coverage,
                    } => {
                        if let Some(blob) = held.blob() {
                            Step::Blob(blob)
                        } else {
                            let lookup = mount.blob_cache().get(object_id, interest);
                            match lookup.blob {
                                Some(blob) => {
                                    *held = lookup.handle;
                                    Step::Blob(blob)
                                }
                                None => {
                                    // The blob was evicted; whatever the
                                    // kernel cached from it can no longer be
                                    // assumed either.
                                    coverage.clear();
                                    let id = object_id.clone();
                                    let size = *size;
                                    *state = FileState::Loading {
                                        object_id: id.clone(),
                                        size,
                                        waiters: Vec::new(),
                                    };
                                    Step::Fetch(id)
                                }
                            }
                        }
                    }
                    FileState::Loading { waiters, .. } => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Step::Wait(rx)
                    }
                }
            };

            match step {
                Step::Overlay => return Ok(None),
                Step::Blob(blob) => return Ok(Some(blob)),
                Step::Wait(rx) => {
                    // Whatever resolves the load, loop to re-observe the
                    // state; a truncate may have materialized us meanwhile.
                    let _ = rx.await;
                }
                Step::Fetch(object_id) => {
                    let fetched = mount.object_store().get_blob(&object_id, ctx).await;
                    let mut guard = self.state.lock().await;
                    match std::mem::replace(&mut *guard, FileState::Materialized) {
                        FileState::Loading {
                            object_id,
                            size,
                            waiters,
                        } => match fetched {
                            Ok(blob) => {
                                let handle = mount.blob_cache().insert(
                                    object_id.clone(),
                                    blob.clone(),
                                    interest,
                                );
                                *guard = FileState::NotLoading {
                                    object_id,
                                    size: Some(blob.len()),
                                    interest: handle,
                                    coverage: CoverageSet::new(),
                                };
                                drop(guard);
                                for waiter in waiters {
                                    let _ = waiter.send(Some(blob.clone()));
                                }
                                return Ok(Some(blob));
                            }
                            Err(e) => {
                                *guard = FileState::NotLoading {
                                    object_id,
                                    size,
                                    interest: BlobInterestHandle::empty(),
                                    coverage: CoverageSet::new(),
                                };
                                drop(guard);
                                // Waiters retry; each surfaces its own
                                // fetch error.
                                for waiter in waiters {
                                    let _ = waiter.send(None);
                                }
                                return Err(e);
                            }
                        },
                        // Truncate materialized us while the fetch was in
                        // flight; it already resolved the waiters.
                        other => {
                            *guard = other;
                        }
                    }
                }
            }
        }
    }

    /// Moves the file into the materialized state, copying the blob
    /// contents into the overlay if it isn't there yet.
    async fn materialize_for_write(self: &Arc<Self>, ctx: &FetchContext) -> Result<(), FsError> {
        let mount = self.base.mount()?;
        loop {
            // The blob goes straight into the overlay and is then dropped,
            // so there is no point caching it.
            let Some(blob) = self
                .blob_for_read(Interest::UnlikelyNeededAgain, ctx)
                .await?
            else {
                return Ok(());
            };
            let mut state = self.state.lock().await;
            match &*state {
                FileState::NotLoading { .. } => {
                    mount
                        .content_store()
                        .create(self.base.ino, blob.contents().clone())
                        .await?;
                    *state = FileState::Materialized;
                    drop(state);
                    debug!(inode = %self.base.ino, "file materialized");
                    self.materialize_in_parent().await?;
                    return Ok(());
                }
                FileState::Materialized => return Ok(()),
                // Someone else started another load; go around again.
                FileState::Loading { .. } => continue,
            }
        }
    }

    /// Tells the ancestors to record this inode as materialized. Runs after
    /// the state lock has been released.
    async fn materialize_in_parent(self: &Arc<Self>) -> Result<(), FsError> {
        let mount = self.base.mount()?;
        let _rename = mount.rename_lock().read().await;
        if let Some(parent) = self.base.parent() {
            parent.child_materialized(self.base.name().as_bstr()).await?;
        }
        Ok(())
    }

    /// Reads up to `len` bytes at `offset`. The second return value is the
    /// end-of-file flag.
    #[instrument(skip(self, ctx), fields(inode = %self.base.ino))]
    pub async fn read(
        self: &Arc<Self>,
        offset: u64,
        len: u64,
        ctx: &FetchContext,
    ) -> Result<(Bytes, bool), FsError> {
        offset
            .checked_add(len)
            .ok_or_else(|| FsError::InvalidArgument("read range overflows".to_string()))?;
        let mount = self.base.mount()?;

        let result = match self.blob_for_read(Interest::LikelyNeededAgain, ctx).await? {
            Some(blob) => {
                let contents = blob.contents();
                let start = (offset as usize).min(contents.len());
                let end = start.saturating_add(len as usize).min(contents.len());
                let data = contents.slice(start..end);
                let eof = end as u64 >= blob.len();

                // Track what the kernel has seen; once it has seen all of
                // it, the page cache serves the rest and we can drop our
                // interest in the cached blob.
                let mut state = self.state.lock().await;
                if let FileState::NotLoading {
                    coverage, interest, ..
                } = &mut *state
                {
                    coverage.add(offset, end as u64);
                    if coverage.covers(0, blob.len()) {
                        interest.reset();
                    }
                }
                (data, eof)
            }
            None => {
                let data = mount.content_store().pread(self.base.ino, offset, len).await?;
                let size = mount.content_store().size(self.base.ino).await?;
                let eof = offset + data.len() as u64 >= size;
                (data, eof)
            }
        };
        self.base.touch_atime();
        Ok(result)
    }

    /// Writes `data` at `offset`, materializing first if needed.
    #[instrument(skip(self, data, ctx), fields(inode = %self.base.ino, len = data.len()))]
    pub async fn write(
        self: &Arc<Self>,
        offset: u64,
        data: &[u8],
        ctx: &FetchContext,
    ) -> Result<u64, FsError> {
        offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::InvalidArgument("write range overflows".to_string()))?;
        let mount = self.base.mount()?;
        self.materialize_for_write(ctx).await?;
        let written = mount
            .content_store()
            .pwrite(self.base.ino, data, offset)
            .await?;
        self.base.update_mtime();
        Ok(written)
    }

    /// Truncates to zero length without loading the blob. Resolves any
    /// in-flight load with no blob; waiters re-observe the state.
    async fn truncate_to_empty(self: &Arc<Self>) -> Result<(), FsError> {
        let mount = self.base.mount()?;
        let waiters = {
            let mut state = self.state.lock().await;
            match &mut *state {
                FileState::Materialized => {
                    mount.content_store().truncate(self.base.ino, 0).await?;
                    return Ok(());
                }
                FileState::NotLoading { .. } => {
                    mount
                        .content_store()
                        .create(self.base.ino, Bytes::new())
                        .await?;
                    *state = FileState::Materialized;
                    Vec::new()
                }
                FileState::Loading { waiters, .. } => {
                    mount
                        .content_store()
                        .create(self.base.ino, Bytes::new())
                        .await?;
                    let waiters = std::mem::take(waiters);
                    *state = FileState::Materialized;
                    waiters
                }
            }
        };
        for waiter in waiters {
            let _ = waiter.send(None);
        }
        debug!(inode = %self.base.ino, "file materialized by truncate");
        self.materialize_in_parent().await?;
        Ok(())
    }

    /// Truncates the file to `size`.
    #[instrument(skip(self, ctx), fields(inode = %self.base.ino))]
    pub async fn truncate(self: &Arc<Self>, size: u64, ctx: &FetchContext) -> Result<(), FsError> {
        if size == 0 {
            self.truncate_to_empty().await?;
        } else {
            // Shrinking or growing to a nonzero size keeps a prefix of the
            // old contents, so the blob has to be loaded.
            let mount = self.base.mount()?;
            self.materialize_for_write(ctx).await?;
            mount.content_store().truncate(self.base.ino, size).await?;
        }
        self.base.update_mtime();
        Ok(())
    }

    pub async fn stat(self: &Arc<Self>, ctx: &FetchContext) -> Result<Stat, FsError> {
        let mount = self.base.mount()?;
        let size = {
            let mut state = self.state.lock().await;
            match &mut *state {
                FileState::Materialized => None,
                FileState::NotLoading {
                    size: Some(size), ..
                }
                | FileState::Loading {
                    size: Some(size), ..
                } => Some(*size),
                FileState::NotLoading {
                    object_id, size, ..
                }
                | FileState::Loading {
                    object_id, size, ..
                } => {
                    let fetched = mount.object_store().get_blob_size(object_id, ctx).await?;
                    *size = Some(fetched);
                    Some(fetched)
                }
            }
        };
        let size = match size {
            Some(size) => size,
            None => mount.content_store().size(self.base.ino).await?,
        };
        Ok(self.base.stat_with_size(size))
    }

    /// Applies the requested attribute changes. An empty request is a
    /// no-op returning current attributes.
    pub async fn setattr(self: &Arc<Self>, attr: SetAttr, ctx: &FetchContext) -> Result<Stat, FsError> {
        if attr.is_empty() {
            return self.stat(ctx).await;
        }
        let mount = self.base.mount()?;
        if let Some(parent) = self.base.parent() {
            mount.check_reserved_inode(parent.ino(), self.base.name().as_bstr())?;
        }
        if let Some(size) = attr.size {
            self.truncate(size, ctx).await?;
        }
        self.base.apply_setattr(&attr);
        self.stat(ctx).await
    }

    /// The symlink target. EINVAL for non-symlinks.
    pub async fn readlink(self: &Arc<Self>, ctx: &FetchContext) -> Result<Bytes, FsError> {
        if !self.base.metadata.lock().is_symlink() {
            return Err(FsError::InvalidArgument(format!(
                "inode {} is not a symlink",
                self.base.ino
            )));
        }
        let (target, _eof) = self.read(0, u32::MAX as u64, ctx).await?;
        Ok(target)
    }

    /// SHA-1 of the file contents. Delegated to the object store for
    /// non-materialized files, which can usually answer without fetching.
    pub async fn sha1(self: &Arc<Self>, ctx: &FetchContext) -> Result<Sha1Hash, FsError> {
        let mount = self.base.mount()?;
        let object_id = {
            let state = self.state.lock().await;
            match &*state {
                FileState::Materialized => None,
                FileState::NotLoading { object_id, .. }
                | FileState::Loading { object_id, .. } => Some(object_id.clone()),
            }
        };
        match object_id {
            Some(id) => mount.object_store().get_blob_sha1(&id, ctx).await,
            None => {
                let size = mount.content_store().size(self.base.ino).await?;
                let data = mount.content_store().pread(self.base.ino, 0, size).await?;
                Ok(sha1_of(&data))
            }
        }
    }

    /// Whether this file's contents match the given source-control entry.
    ///
    /// Triage by object id comparison first; only when ids can't decide
    /// (or the file is materialized) fall back to comparing content
    /// hashes.
    pub async fn is_same_as(
        self: &Arc<Self>,
        other_id: &ObjectId,
        other_mode_is_symlink: bool,
        other_mode_is_executable: bool,
        ctx: &FetchContext,
    ) -> Result<bool, FsError> {
        {
            let metadata = self.base.metadata.lock();
            if metadata.is_symlink() != other_mode_is_symlink {
                return Ok(false);
            }
            let executable = metadata.mode & 0o111 != 0 && !metadata.is_symlink();
            if !other_mode_is_symlink && executable != other_mode_is_executable {
                return Ok(false);
            }
        }

        let mount = self.base.mount()?;
        let own_id = {
            let state = self.state.lock().await;
            match &*state {
                FileState::Materialized => None,
                FileState::NotLoading { object_id, .. }
                | FileState::Loading { object_id, .. } => Some(object_id.clone()),
            }
        };
        if let Some(own_id) = &own_id {
            match mount.object_store().compare_objects(own_id, other_id) {
                ObjectComparison::Identical => return Ok(true),
                ObjectComparison::Different => return Ok(false),
                ObjectComparison::Unknown => {}
            }
        }

        // Slow path: compare content hashes.
        let own_sha1 = self.sha1(ctx).await?;
        let other_sha1 = mount.object_store().get_blob_sha1(other_id, ctx).await?;
        Ok(own_sha1 == other_sha1)
    }

    /// The extended attributes exposed for files: just the content hash.
    pub fn listxattr(&self) -> Vec<String> {
        vec![SHA1_XATTR.to_string()]
    }

    /// Reads the named extended attribute. Only [SHA1_XATTR] exists.
    pub async fn getxattr(self: &Arc<Self>, name: &str, ctx: &FetchContext) -> Result<Vec<u8>, FsError> {
        if name != SHA1_XATTR {
            return Err(FsError::Io(std::io::Error::from_raw_os_error(
                libc::ENODATA,
            )));
        }
        let sha1 = self.sha1(ctx).await?;
        Ok(data_encoding::HEXLOWER.encode(&sha1).into_bytes())
    }

    /// Reads the whole contents, wherever they live.
    pub async fn read_all(self: &Arc<Self>, ctx: &FetchContext) -> Result<Bytes, FsError> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        loop {
            let (chunk, eof) = self.read(offset, 1 << 20, ctx).await?;
            offset += chunk.len() as u64;
            out.extend_from_slice(&chunk);
            if eof || chunk.is_empty() {
                return Ok(Bytes::from(out));
            }
        }
    }

    /// Called when the entry referencing this inode is removed. Cleans up
    /// overlay data for materialized files.
    pub(crate) async fn cleanup_after_unlink(self: &Arc<Self>) -> Result<(), FsError> {
        let mount = self.base.mount()?;
        let materialized = self.is_materialized().await;
        if materialized {
            if let Err(e) = mount.content_store().remove(self.base.ino).await {
                warn!(inode = %self.base.ino, error = %e, "failed to remove overlay contents");
            }
        }
        mount.inode_map().forget(self.base.ino);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestMount;
    use crate::store::FetchCause;
    use scmfs_overlay::dir::mode;

    fn ctx() -> FetchContext {
        FetchContext::for_cause(FetchCause::Channel)
    }

    #[tokio::test]
    async fn read_from_blob_then_materialize_on_write() {
        let mount = TestMount::builder()
            .file("f.txt", "lazy bytes")
            .build()
            .await;
        let file = mount.load_file("f.txt").await;

        let (data, eof) = file.read(0, 64, &ctx()).await.unwrap();
        assert_eq!(&data[..], b"lazy bytes");
        assert!(eof);
        assert!(!file.is_materialized().await);

        file.write(0, b"LAZY", &ctx()).await.unwrap();
        assert!(file.is_materialized().await);
        let (data, _) = file.read(0, 64, &ctx()).await.unwrap();
        assert_eq!(&data[..], b"LAZY bytes");

        // The parent chain was materialized too.
        assert!(mount.root().is_materialized());
    }

    #[tokio::test]
    async fn truncate_to_zero_skips_the_blob_fetch() {
        let mount = TestMount::builder()
            .file("f.txt", "does not matter")
            .build()
            .await;
        let file = mount.load_file("f.txt").await;

        file.truncate(0, &ctx()).await.unwrap();
        assert!(file.is_materialized().await);
        let stat = file.stat(&ctx()).await.unwrap();
        assert_eq!(stat.size, 0);
        // The blob was never requested.
        assert_eq!(mount.store_fetch_count(), 0);
    }

    #[tokio::test]
    async fn truncate_to_nonzero_keeps_a_prefix() {
        let mount = TestMount::builder()
            .file("f.txt", "hello world")
            .build()
            .await;
        let file = mount.load_file("f.txt").await;

        file.truncate(5, &ctx()).await.unwrap();
        let (data, eof) = file.read(0, 64, &ctx()).await.unwrap();
        assert_eq!(&data[..], b"hello");
        assert!(eof);
    }

    #[tokio::test]
    async fn stat_caches_the_blob_size() {
        let mount = TestMount::builder().file("f.txt", "12345").build().await;
        let file = mount.load_file("f.txt").await;

        let stat = file.stat(&ctx()).await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(!file.is_materialized().await);
    }

    #[tokio::test]
    async fn sha1_of_materialized_matches_store_hash() {
        let mount = TestMount::builder().file("f.txt", "stable").build().await;
        let file = mount.load_file("f.txt").await;

        let before = file.sha1(&ctx()).await.unwrap();
        // Write identical bytes: the hash must not change even though the
        // source moved from blob to overlay.
        file.write(0, b"stable", &ctx()).await.unwrap();
        let after = file.sha1(&ctx()).await.unwrap();
        assert_eq!(before, after);
        assert_eq!(after, sha1_of(b"stable"));
    }

    #[tokio::test]
    async fn symlink_readlink_and_einval_for_regular_files() {
        let mount = TestMount::builder()
            .symlink("link", "target/path")
            .file("f.txt", "x")
            .build()
            .await;

        let link = mount.load_file("link").await;
        assert_eq!(&link.readlink(&ctx()).await.unwrap()[..], b"target/path");

        let file = mount.load_file("f.txt").await;
        assert!(matches!(
            file.readlink(&ctx()).await,
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn is_same_as_uses_id_triage_then_hashes() {
        let mount = TestMount::builder().file("f.txt", "contents").build().await;
        let file = mount.load_file("f.txt").await;
        let id = mount.blob_id("f.txt");

        assert!(file.is_same_as(&id, false, false, &ctx()).await.unwrap());
        // Type mismatches never match.
        assert!(!file.is_same_as(&id, true, false, &ctx()).await.unwrap());

        // After writing different bytes the slow path reports a mismatch.
        file.write(0, b"CONTENTS", &ctx()).await.unwrap();
        assert!(!file.is_same_as(&id, false, false, &ctx()).await.unwrap());
    }

    #[tokio::test]
    async fn setattr_empty_is_a_noop() {
        let mount = TestMount::builder().file("f.txt", "abc").build().await;
        let file = mount.load_file("f.txt").await;

        let before = file.stat(&ctx()).await.unwrap();
        let after = file.setattr(SetAttr::default(), &ctx()).await.unwrap();
        assert_eq!(before.size, after.size);
        assert_eq!(before.mode, after.mode);
        assert!(!file.is_materialized().await);
    }

    #[tokio::test]
    async fn setattr_mode_keeps_the_file_type() {
        let mount = TestMount::builder().file("f.txt", "abc").build().await;
        let file = mount.load_file("f.txt").await;

        let attr = SetAttr {
            mode: Some(0o777),
            ..Default::default()
        };
        let stat = file.setattr(attr, &ctx()).await.unwrap();
        assert_eq!(stat.mode & mode::FMT, mode::REG);
        assert_eq!(stat.mode & 0o777, 0o777);
    }
}
