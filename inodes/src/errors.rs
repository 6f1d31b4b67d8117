use bstr::BString;
use thiserror::Error;

use scmfs_overlay::OverlayError;

/// Errors surfaced by filesystem operations.
///
/// Checkout conflicts are deliberately not here: they are reported through
/// the [crate::checkout::CheckoutContext], not raised.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(BString),

    #[error("not a directory: {0}")]
    NotADirectory(BString),

    #[error("is a directory: {0}")]
    IsADirectory(BString),

    #[error("file exists: {0}")]
    AlreadyExists(BString),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(BString),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(BString),

    /// The object store could not serve a fetch. Diff treats the affected
    /// entry as changed; checkout aborts the entry.
    #[error("object store unavailable: {0}")]
    BackingStoreUnavailable(String),

    /// An in-progress inode load failed; waiters coalesced onto it observe
    /// the failure through this variant.
    #[error("inode load failed: {0}")]
    LoadFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("mount is shutting down")]
    MountShutdown,

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// The errno presented at the filesystem channel boundary.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::PermissionDenied(_) => libc::EPERM,
            FsError::BackingStoreUnavailable(_) => libc::EIO,
            FsError::LoadFailed(_) => libc::EIO,
            FsError::Cancelled => libc::EINTR,
            FsError::MountShutdown => libc::ENODEV,
            FsError::Overlay(OverlayError::DirectoryNotEmpty(_)) => libc::ENOTEMPTY,
            FsError::Overlay(_) => libc::EIO,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// A shallow copy suitable for fanning one failure out to several
    /// waiters.
    pub(crate) fn duplicate(&self) -> FsError {
        FsError::LoadFailed(self.to_string())
    }
}
