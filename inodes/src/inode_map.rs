//! Registry of loaded inodes and loads in progress.
//!
//! The map is the single choke point guaranteeing **at most one** load per
//! inode number: the first caller to ask for an unloaded inode starts the
//! load, everyone else attaches a waiter to it. It also tracks the kernel's
//! reference counts, so the tree knows which unloaded inodes the kernel can
//! still address ("remembered" inodes) and must therefore be treated as
//! loaded for checkout purposes.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use scmfs_overlay::InodeNumber;

use crate::inode::{InodeHandle, WeakInodeHandle};
use crate::FsError;

pub(crate) type LoadWaiter = oneshot::Sender<Result<InodeHandle, FsError>>;

#[derive(Default)]
struct InodeMapState {
    /// Weak pointers to every loaded inode.
    loaded: HashMap<u64, WeakInodeHandle>,
    /// In-progress loads and the callers waiting on each.
    loading: HashMap<u64, Vec<LoadWaiter>>,
    /// Outstanding kernel references per inode number.
    fs_refcounts: HashMap<u64, u64>,
}

#[derive(Default)]
pub struct InodeMap {
    state: Mutex<InodeMapState>,
}

impl InodeMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Either begins a new load (returns true; the caller must drive it to
    /// [load_complete] or [load_failed]) or attaches `waiter` to the load
    /// already in progress (returns false).
    ///
    /// [load_complete]: InodeMap::load_complete
    /// [load_failed]: InodeMap::load_failed
    pub(crate) fn start_loading_if_not_loading(
        &self,
        ino: InodeNumber,
        waiter: LoadWaiter,
    ) -> bool {
        let mut state = self.state.lock();
        match state.loading.get_mut(&ino.get()) {
            Some(waiters) => {
                waiters.push(waiter);
                false
            }
            None => {
                state.loading.insert(ino.get(), vec![waiter]);
                true
            }
        }
    }

    /// Registers a finished load and fulfills every waiter.
    pub(crate) fn load_complete(&self, handle: InodeHandle) {
        let ino = handle.ino();
        let waiters = {
            let mut state = self.state.lock();
            state.loaded.insert(ino.get(), handle.downgrade());
            state.loading.remove(&ino.get()).unwrap_or_default()
        };
        debug!(inode = %ino, waiters = waiters.len(), "inode load complete");
        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }
    }

    /// Fails every waiter attached to an in-progress load.
    pub(crate) fn load_failed(&self, ino: InodeNumber, error: &FsError) {
        let waiters = {
            let mut state = self.state.lock();
            state.loading.remove(&ino.get()).unwrap_or_default()
        };
        debug!(inode = %ino, waiters = waiters.len(), error = %error, "inode load failed");
        for waiter in waiters {
            let _ = waiter.send(Err(error.duplicate()));
        }
    }

    /// The loaded inode for `ino`, if any.
    pub fn lookup_loaded(&self, ino: InodeNumber) -> Option<InodeHandle> {
        let mut state = self.state.lock();
        match state.loaded.get(&ino.get()).and_then(WeakInodeHandle::upgrade) {
            Some(handle) => Some(handle),
            None => {
                // Drop the stale weak entry if the inode died.
                state.loaded.remove(&ino.get());
                None
            }
        }
    }

    pub fn is_loaded(&self, ino: InodeNumber) -> bool {
        self.lookup_loaded(ino).is_some()
    }

    /// Whether the kernel still holds references to this inode even though
    /// it is not loaded. Such inodes must survive unload and be reloaded
    /// before their entries can be replaced.
    pub fn is_inode_remembered(&self, ino: InodeNumber) -> bool {
        let state = self.state.lock();
        state.fs_refcounts.get(&ino.get()).copied().unwrap_or(0) > 0
            && !state.loaded.contains_key(&ino.get())
    }

    pub fn is_loaded_or_remembered(&self, ino: InodeNumber) -> bool {
        let state = self.state.lock();
        state.loaded.contains_key(&ino.get())
            || state.fs_refcounts.get(&ino.get()).copied().unwrap_or(0) > 0
    }

    /// The kernel's outstanding reference count for `ino`.
    pub fn fs_refcount(&self, ino: InodeNumber) -> u64 {
        self.state
            .lock()
            .fs_refcounts
            .get(&ino.get())
            .copied()
            .unwrap_or(0)
    }

    pub fn inc_fs_refcount(&self, ino: InodeNumber) {
        *self
            .state
            .lock()
            .fs_refcounts
            .entry(ino.get())
            .or_insert(0) += 1;
    }

    /// Called when an OS-visible entry is invalidated.
    pub fn dec_fs_refcount(&self, ino: InodeNumber) {
        let mut state = self.state.lock();
        if let Some(count) = state.fs_refcounts.get_mut(&ino.get()) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.fs_refcounts.remove(&ino.get());
            }
        }
    }

    /// Drops the registry entry for an unloaded or destroyed inode.
    pub(crate) fn forget(&self, ino: InodeNumber) {
        let mut state = self.state.lock();
        state.loaded.remove(&ino.get());
        state.fs_refcounts.remove(&ino.get());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_caller_starts_a_load() {
        let map = InodeMap::new();
        let ino = InodeNumber::from_raw(5);

        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        assert!(map.start_loading_if_not_loading(ino, tx1));
        assert!(!map.start_loading_if_not_loading(ino, tx2));
    }

    #[tokio::test]
    async fn failed_loads_fan_out_to_every_waiter() {
        let map = InodeMap::new();
        let ino = InodeNumber::from_raw(5);

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        assert!(map.start_loading_if_not_loading(ino, tx1));
        assert!(!map.start_loading_if_not_loading(ino, tx2));

        map.load_failed(ino, &FsError::BackingStoreUnavailable("offline".into()));
        assert!(matches!(rx1.await.unwrap(), Err(FsError::LoadFailed(_))));
        assert!(matches!(rx2.await.unwrap(), Err(FsError::LoadFailed(_))));

        // The load slot is free again.
        let (tx3, _rx3) = oneshot::channel();
        assert!(map.start_loading_if_not_loading(ino, tx3));
    }

    #[test]
    fn fs_refcounts_drive_remembered_state() {
        let map = InodeMap::new();
        let ino = InodeNumber::from_raw(5);

        assert!(!map.is_inode_remembered(ino));
        map.inc_fs_refcount(ino);
        assert!(map.is_inode_remembered(ino));
        assert!(map.is_loaded_or_remembered(ino));
        map.dec_fs_refcount(ino);
        assert!(!map.is_inode_remembered(ino));
        assert!(!map.is_loaded_or_remembered(ino));
    }
}
