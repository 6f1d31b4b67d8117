use std::path::PathBuf;

use thiserror::Error;
use tokio::task::JoinError;

use crate::inode_number::InodeNumber;

/// Errors surfaced by the overlay stores.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Another process holds the catalog lock.
    #[error("overlay at {0} is locked by another process")]
    Locked(PathBuf),

    #[error("overlay does not exist at {0}")]
    MissingOverlay(PathBuf),

    /// A persisted record failed header validation or deserialization.
    #[error("corrupt overlay data for inode {inode}: {reason}")]
    DataCorruption { inode: InodeNumber, reason: String },

    #[error("unsupported overlay format version {0}")]
    UnsupportedVersion(u32),

    /// The 63-bit inode number space ran out. Allocation is monotonic for
    /// the lifetime of a mount, so this is fatal.
    #[error("inode number space exhausted")]
    InodeNumberOverflow,

    /// `remove_dir` was asked to drop a record that still has entries.
    #[error("directory record for inode {0} is not empty")]
    DirectoryNotEmpty(InodeNumber),

    #[error("operation not supported by this catalog backend")]
    Unsupported,

    #[error("overlay storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<JoinError> for OverlayError {
    fn from(value: JoinError) -> Self {
        OverlayError::Storage(value.to_string())
    }
}

impl From<redb::Error> for OverlayError {
    fn from(value: redb::Error) -> Self {
        OverlayError::Storage(value.to_string())
    }
}

impl From<redb::DatabaseError> for OverlayError {
    fn from(value: redb::DatabaseError) -> Self {
        OverlayError::Storage(value.to_string())
    }
}

impl From<redb::TableError> for OverlayError {
    fn from(value: redb::TableError) -> Self {
        OverlayError::Storage(value.to_string())
    }
}

impl From<redb::TransactionError> for OverlayError {
    fn from(value: redb::TransactionError) -> Self {
        OverlayError::Storage(value.to_string())
    }
}

impl From<redb::StorageError> for OverlayError {
    fn from(value: redb::StorageError) -> Self {
        OverlayError::Storage(value.to_string())
    }
}

impl From<redb::CommitError> for OverlayError {
    fn from(value: redb::CommitError) -> Self {
        OverlayError::Storage(value.to_string())
    }
}
