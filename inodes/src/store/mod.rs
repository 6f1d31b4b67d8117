//! The source-control object model and the contract for fetching it.
//!
//! The backing store is content-addressed and immutable: a given
//! [ObjectId] always resolves to the same [Tree] or [Blob]. Some stores
//! derive ids from path and history rather than contents alone, in which
//! case comparing two different ids yields [ObjectComparison::Unknown] and
//! callers fall back to hashing contents.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bstr::{BStr, BString, ByteSlice};
use bytes::Bytes;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use crate::FsError;
use scmfs_overlay::dir::mode;

pub mod blob_cache;

pub use blob_cache::{BlobCache, BlobInterestHandle, Interest};

/// Opaque identifier of an immutable source-control object.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectId(Bytes);

impl ObjectId {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        ObjectId(bytes.into())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Ids are frequently readable strings in tests and hex elsewhere;
        // print readable bytes as-is and everything else hex-encoded.
        match std::str::from_utf8(&self.0) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => f.write_str(s),
            _ => f.write_str(&data_encoding::HEXLOWER.encode(&self.0)),
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl From<&[u8]> for ObjectId {
    fn from(value: &[u8]) -> Self {
        ObjectId(Bytes::copy_from_slice(value))
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        ObjectId(Bytes::copy_from_slice(value.as_bytes()))
    }
}

/// Result of comparing two object ids without fetching contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectComparison {
    /// The ids are known to refer to identical contents.
    Identical,
    /// The ids are known to refer to different contents.
    Different,
    /// The ids alone don't tell; contents must be compared.
    Unknown,
}

/// SHA-1 of a blob's contents.
pub type Sha1Hash = [u8; 20];

pub fn sha1_of(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// The kind of a tree entry. Trees carry a restricted set of modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Tree,
    Regular,
    Executable,
    Symlink,
}

impl EntryKind {
    /// The initial POSIX mode bits for an inode backed by this entry.
    pub fn initial_mode(self) -> u32 {
        match self {
            EntryKind::Tree => mode::DIR | 0o755,
            EntryKind::Regular => mode::REG | 0o644,
            EntryKind::Executable => mode::REG | 0o755,
            EntryKind::Symlink => mode::LNK | 0o777,
        }
    }

    pub fn is_tree(self) -> bool {
        matches!(self, EntryKind::Tree)
    }
}

/// One name inside a [Tree].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: EntryKind,
    pub id: ObjectId,
}

/// An immutable source-control directory listing, sorted by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    id: ObjectId,
    entries: BTreeMap<BString, TreeEntry>,
}

impl Tree {
    pub fn new(id: ObjectId, entries: BTreeMap<BString, TreeEntry>) -> Self {
        Tree { id, entries }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &[u8]) -> Option<&TreeEntry> {
        self.entries.get(BStr::new(name))
    }

    /// Entries in name order, matching overlay record iteration order.
    pub fn entries(&self) -> impl Iterator<Item = (&BStr, &TreeEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_bstr(), v))
    }
}

/// Immutable blob contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    contents: Bytes,
}

impl Blob {
    pub fn new(contents: impl Into<Bytes>) -> Self {
        Blob {
            contents: contents.into(),
        }
    }

    pub fn contents(&self) -> &Bytes {
        &self.contents
    }

    pub fn len(&self) -> u64 {
        self.contents.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub fn sha1(&self) -> Sha1Hash {
        sha1_of(&self.contents)
    }
}

/// Why a fetch is happening; forwarded to the object store for prioritizing
/// and accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FetchCause {
    #[default]
    Unknown,
    /// Serving a request from the filesystem channel.
    Channel,
    Checkout,
    Diff,
    Fsck,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FetchContext {
    pub cause: FetchCause,
}

impl FetchContext {
    pub fn for_cause(cause: FetchCause) -> Self {
        FetchContext { cause }
    }
}

/// Contract to the remote content-addressed object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_tree(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Arc<Tree>, FsError>;

    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Arc<Blob>, FsError>;

    async fn get_blob_sha1(&self, id: &ObjectId, ctx: &FetchContext)
        -> Result<Sha1Hash, FsError>;

    async fn get_blob_size(&self, id: &ObjectId, ctx: &FetchContext) -> Result<u64, FsError>;

    /// Compares two ids without fetching. Never does IO.
    fn compare_objects(&self, a: &ObjectId, b: &ObjectId) -> ObjectComparison;
}

/// Convenience: are two ids known to refer to identical objects?
pub fn objects_known_identical(store: &dyn ObjectStore, a: &ObjectId, b: &ObjectId) -> bool {
    store.compare_objects(a, b) == ObjectComparison::Identical
}

/// In-memory object store used by tests and ephemeral mounts.
///
/// Ids are byte strings chosen by the caller. By default differing ids are
/// reported [ObjectComparison::Different] (content-addressed behavior); an
/// opaque-ids mode reports [ObjectComparison::Unknown] instead, modeling
/// stores whose ids bake in path and history.
#[derive(Default)]
pub struct MemoryObjectStore {
    state: RwLock<MemoryStoreState>,
    opaque_ids: bool,
}

#[derive(Default)]
struct MemoryStoreState {
    trees: HashMap<ObjectId, Arc<Tree>>,
    blobs: HashMap<ObjectId, Arc<Blob>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// A store whose ids cannot be compared by equality alone.
    pub fn with_opaque_ids() -> Self {
        MemoryObjectStore {
            state: Default::default(),
            opaque_ids: true,
        }
    }

    pub fn put_tree(&self, tree: Tree) -> ObjectId {
        let id = tree.id().clone();
        self.state.write().trees.insert(id.clone(), Arc::new(tree));
        id
    }

    pub fn put_blob(&self, id: ObjectId, blob: Blob) -> ObjectId {
        self.state.write().blobs.insert(id.clone(), Arc::new(blob));
        id
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_tree(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Arc<Tree>, FsError> {
        self.state
            .read()
            .trees
            .get(id)
            .cloned()
            .ok_or_else(|| FsError::BackingStoreUnavailable(format!("unknown tree {}", id)))
    }

    async fn get_blob(&self, id: &ObjectId, _ctx: &FetchContext) -> Result<Arc<Blob>, FsError> {
        self.state
            .read()
            .blobs
            .get(id)
            .cloned()
            .ok_or_else(|| FsError::BackingStoreUnavailable(format!("unknown blob {}", id)))
    }

    async fn get_blob_sha1(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
    ) -> Result<Sha1Hash, FsError> {
        Ok(self.get_blob(id, ctx).await?.sha1())
    }

    async fn get_blob_size(&self, id: &ObjectId, ctx: &FetchContext) -> Result<u64, FsError> {
        Ok(self.get_blob(id, ctx).await?.len())
    }

    fn compare_objects(&self, a: &ObjectId, b: &ObjectId) -> ObjectComparison {
        if a == b {
            ObjectComparison::Identical
        } else if self.opaque_ids {
            ObjectComparison::Unknown
        } else {
            ObjectComparison::Different
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn sha1_matches_known_vector() {
        assert_eq!(
            sha1_of(b"hello"),
            hex!("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d")
        );
    }

    #[test]
    fn comparison_modes() {
        let plain = MemoryObjectStore::new();
        let a = ObjectId::from("a");
        let b = ObjectId::from("b");
        assert_eq!(plain.compare_objects(&a, &a), ObjectComparison::Identical);
        assert_eq!(plain.compare_objects(&a, &b), ObjectComparison::Different);

        let opaque = MemoryObjectStore::with_opaque_ids();
        assert_eq!(opaque.compare_objects(&a, &a), ObjectComparison::Identical);
        assert_eq!(opaque.compare_objects(&a, &b), ObjectComparison::Unknown);
    }

    #[tokio::test]
    async fn missing_objects_surface_as_store_unavailable() {
        let store = MemoryObjectStore::new();
        let ctx = FetchContext::default();
        assert!(matches!(
            store.get_blob(&ObjectId::from("nope"), &ctx).await,
            Err(FsError::BackingStoreUnavailable(_))
        ));
    }
}
