//! Durable byte storage for materialized file contents, keyed by inode
//! number.

use async_trait::async_trait;
use bytes::Bytes;

use crate::inode_number::InodeNumber;
use crate::OverlayError;

mod fs;
mod memory;

pub use self::fs::FsContentStore;
pub use self::memory::MemoryContentStore;

/// Random-access byte storage for materialized files.
///
/// The sharded-file backend prefixes each file with the fixed `OVFL` header;
/// key/value and in-memory backends store the payload alone. Offsets and
/// sizes below are always payload-relative.
#[async_trait]
pub trait FileContentStore: Send + Sync {
    /// Creates the storage for `inode` with the given initial contents.
    /// Atomic: a crash leaves either no file or the complete file.
    async fn create(&self, inode: InodeNumber, contents: Bytes) -> Result<(), OverlayError>;

    /// Verifies the storage for `inode` exists (and, where applicable, has
    /// a valid header).
    async fn open(&self, inode: InodeNumber) -> Result<(), OverlayError>;

    /// Reads up to `len` bytes at `offset`. Short reads only happen at end
    /// of file.
    async fn pread(&self, inode: InodeNumber, offset: u64, len: u64)
        -> Result<Bytes, OverlayError>;

    /// Writes `data` at `offset`, extending the file if needed. Returns the
    /// number of bytes written.
    async fn pwrite(&self, inode: InodeNumber, data: &[u8], offset: u64)
        -> Result<u64, OverlayError>;

    async fn truncate(&self, inode: InodeNumber, len: u64) -> Result<(), OverlayError>;

    /// Ensures `[offset, offset + len)` is backed by storage, zero-filling
    /// any extension. Existing data is preserved; sparseness is
    /// backend-dependent.
    async fn allocate(&self, inode: InodeNumber, offset: u64, len: u64)
        -> Result<(), OverlayError>;

    async fn size(&self, inode: InodeNumber) -> Result<u64, OverlayError>;

    async fn remove(&self, inode: InodeNumber) -> Result<(), OverlayError>;

    async fn has(&self, inode: InodeNumber) -> Result<bool, OverlayError>;
}
