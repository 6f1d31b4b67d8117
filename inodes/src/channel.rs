//! Contract to the host filesystem channel's cache invalidation.
//!
//! The kernel (or userspace filesystem bridge) caches directory listings
//! and attributes; every mutation must invalidate the affected entries
//! before the mutating operation completes. On hosts where the channel is
//! authoritative, a failed invalidation is fatal to the operation; during
//! checkout it is recorded as a conflict on the directory instead.

use std::io;

use bstr::{BStr, BString};
use parking_lot::Mutex;

use scmfs_overlay::InodeNumber;

pub trait MountChannel: Send + Sync {
    /// Invalidates the cached entry `name` under directory `dir`.
    fn invalidate_entry(&self, dir: InodeNumber, name: &BStr) -> io::Result<()>;

    /// Invalidates the cached listing and attributes of `dir` itself.
    fn invalidate_dir(&self, dir: InodeNumber) -> io::Result<()>;
}

/// Channel for mounts with no kernel attached (tests, offline tools).
#[derive(Default)]
pub struct NoopChannel;

impl MountChannel for NoopChannel {
    fn invalidate_entry(&self, _dir: InodeNumber, _name: &BStr) -> io::Result<()> {
        Ok(())
    }

    fn invalidate_dir(&self, _dir: InodeNumber) -> io::Result<()> {
        Ok(())
    }
}

/// Records invalidations and optionally injects failures, for tests.
#[derive(Default)]
pub struct RecordingChannel {
    state: Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    entries: Vec<(InodeNumber, BString)>,
    dirs: Vec<InodeNumber>,
    fail_entries: bool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn fail_entry_invalidations(&self, fail: bool) {
        self.state.lock().fail_entries = fail;
    }

    pub fn entry_invalidations(&self) -> Vec<(InodeNumber, BString)> {
        self.state.lock().entries.clone()
    }

    pub fn dir_invalidations(&self) -> Vec<InodeNumber> {
        self.state.lock().dirs.clone()
    }
}

impl MountChannel for RecordingChannel {
    fn invalidate_entry(&self, dir: InodeNumber, name: &BStr) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.fail_entries {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "injected invalidation failure",
            ));
        }
        state.entries.push((dir, name.into()));
        Ok(())
    }

    fn invalidate_dir(&self, dir: InodeNumber) -> io::Result<()> {
        self.state.lock().dirs.push(dir);
        Ok(())
    }
}
