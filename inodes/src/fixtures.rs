//! Shared test fixtures: an in-memory mount wired to an in-memory object
//! store, plus builders for commit trees.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bstr::{BStr, BString, ByteSlice};
use bytes::Bytes;
use lazy_static::lazy_static;

use scmfs_overlay::catalog::MemoryCatalog;
use scmfs_overlay::content::MemoryContentStore;

use crate::channel::RecordingChannel;
use crate::file::FileInode;
use crate::inode::InodeHandle;
use crate::journal::MemoryJournal;
use crate::mount::{CaseSensitivity, Mount, MountConfig};
use crate::store::{
    sha1_of, Blob, BlobCache, EntryKind, FetchContext, MemoryObjectStore, ObjectComparison,
    ObjectId, ObjectStore, Sha1Hash, Tree, TreeEntry,
};
use crate::tree::TreeInode;
use crate::FsError;

lazy_static! {
    /// A blob used wherever a test just needs some bytes.
    pub static ref GREETING: Bytes = Bytes::from_static(b"hello, overlay\n");
}

/// Content-addressed blob id, so identical contents compare identical.
pub fn blob_id_for(contents: &[u8]) -> ObjectId {
    let hex = data_encoding::HEXLOWER.encode(&sha1_of(contents));
    ObjectId::from_bytes(format!("blob:{}", hex).into_bytes())
}

fn tree_id_for(description: &[u8]) -> ObjectId {
    let hex = data_encoding::HEXLOWER.encode(&sha1_of(description));
    ObjectId::from_bytes(format!("tree:{}", hex).into_bytes())
}

/// Object store wrapper counting blob fetches.
pub struct CountingStore {
    inner: MemoryObjectStore,
    blob_fetches: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: MemoryObjectStore) -> Self {
        CountingStore {
            inner,
            blob_fetches: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryObjectStore {
        &self.inner
    }

    pub fn blob_fetches(&self) -> usize {
        self.blob_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn get_tree(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Arc<Tree>, FsError> {
        self.inner.get_tree(id, ctx).await
    }

    async fn get_blob(&self, id: &ObjectId, ctx: &FetchContext) -> Result<Arc<Blob>, FsError> {
        self.blob_fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.get_blob(id, ctx).await
    }

    async fn get_blob_sha1(
        &self,
        id: &ObjectId,
        ctx: &FetchContext,
    ) -> Result<Sha1Hash, FsError> {
        self.inner.get_blob_sha1(id, ctx).await
    }

    async fn get_blob_size(&self, id: &ObjectId, ctx: &FetchContext) -> Result<u64, FsError> {
        self.inner.get_blob_size(id, ctx).await
    }

    fn compare_objects(&self, a: &ObjectId, b: &ObjectId) -> ObjectComparison {
        self.inner.compare_objects(a, b)
    }
}

#[derive(Clone)]
enum TreeNode {
    File { kind: EntryKind, contents: Bytes },
    Dir(BTreeMap<BString, TreeNode>),
}

/// Declarative commit-tree builder. Paths are `/`-separated; intermediate
/// directories are created implicitly.
#[derive(Clone, Default)]
pub struct TreeBuilder {
    root: BTreeMap<BString, TreeNode>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn file(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.insert(
            path,
            TreeNode::File {
                kind: EntryKind::Regular,
                contents: contents.into(),
            },
        );
        self
    }

    pub fn executable(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.insert(
            path,
            TreeNode::File {
                kind: EntryKind::Executable,
                contents: contents.into(),
            },
        );
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.insert(
            path,
            TreeNode::File {
                kind: EntryKind::Symlink,
                contents: Bytes::copy_from_slice(target.as_bytes()),
            },
        );
        self
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.insert(path, TreeNode::Dir(BTreeMap::new()));
        self
    }

    fn insert(&mut self, path: &str, node: TreeNode) {
        let mut components: Vec<&str> = path.split('/').collect();
        let leaf = components.pop().expect("path has at least one component");
        let mut cursor = &mut self.root;
        for component in components {
            let child = cursor
                .entry(BString::from(component))
                .or_insert_with(|| TreeNode::Dir(BTreeMap::new()));
            cursor = match child {
                TreeNode::Dir(map) => map,
                TreeNode::File { .. } => panic!("{} is a file, not a directory", component),
            };
        }
        cursor.insert(BString::from(leaf), node);
    }

    /// Stores every blob and tree, returning the root tree's id.
    pub fn build(&self, store: &MemoryObjectStore) -> ObjectId {
        build_tree(store, &self.root)
    }
}

fn build_tree(store: &MemoryObjectStore, nodes: &BTreeMap<BString, TreeNode>) -> ObjectId {
    let mut entries = BTreeMap::new();
    let mut description = Vec::new();
    for (name, node) in nodes {
        let entry = match node {
            TreeNode::File { kind, contents } => {
                let id = blob_id_for(contents);
                store.put_blob(id.clone(), Blob::new(contents.clone()));
                TreeEntry { kind: *kind, id }
            }
            TreeNode::Dir(children) => TreeEntry {
                kind: EntryKind::Tree,
                id: build_tree(store, children),
            },
        };
        description.extend_from_slice(name);
        description.push(0);
        description.extend_from_slice(entry.id.as_slice());
        description.push(0);
        entries.insert(name.clone(), entry);
    }
    let id = tree_id_for(&description);
    store.put_tree(Tree::new(id.clone(), entries));
    id
}

pub struct TestMountBuilder {
    tree: TreeBuilder,
    case_sensitivity: CaseSensitivity,
}

impl TestMountBuilder {
    pub fn file(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.tree = self.tree.file(path, contents);
        self
    }

    pub fn executable(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.tree = self.tree.executable(path, contents);
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.tree = self.tree.symlink(path, target);
        self
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.tree = self.tree.dir(path);
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitivity = CaseSensitivity::Insensitive;
        self
    }

    pub async fn build(self) -> TestMount {
        let store = Arc::new(CountingStore::new(MemoryObjectStore::new()));
        let root_tree = self.tree.build(store.inner());

        let journal = Arc::new(MemoryJournal::new());
        let channel = Arc::new(RecordingChannel::new());
        let mount = Mount::new(
            MountConfig {
                case_sensitivity: self.case_sensitivity,
                commit_tree: root_tree.clone(),
            },
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryContentStore::new()),
            store.clone(),
            BlobCache::new(10 * 1024 * 1024, 4),
            journal.clone(),
            channel.clone(),
        )
        .await
        .expect("test mount initializes");

        TestMount {
            mount,
            store,
            journal,
            channel,
            tree: self.tree,
            root_tree,
        }
    }
}

/// An in-memory mount over a freshly built commit.
pub struct TestMount {
    pub mount: Arc<Mount>,
    pub store: Arc<CountingStore>,
    pub journal: Arc<MemoryJournal>,
    pub channel: Arc<RecordingChannel>,
    tree: TreeBuilder,
    root_tree: ObjectId,
}

impl TestMount {
    pub fn builder() -> TestMountBuilder {
        TestMountBuilder {
            tree: TreeBuilder::new(),
            case_sensitivity: CaseSensitivity::Sensitive,
        }
    }

    pub fn root(&self) -> Arc<TreeInode> {
        self.mount.root()
    }

    pub fn root_tree_id(&self) -> ObjectId {
        self.root_tree.clone()
    }

    /// Stores another commit tree in the same object store.
    pub fn put_commit(&self, builder: &TreeBuilder) -> ObjectId {
        builder.build(self.store.inner())
    }

    pub fn store_fetch_count(&self) -> usize {
        self.store.blob_fetches()
    }

    /// The content-addressed id of a file in the *initial* commit.
    pub fn blob_id(&self, path: &str) -> ObjectId {
        fn lookup<'a>(
            nodes: &'a BTreeMap<BString, TreeNode>,
            mut components: std::str::Split<'a, char>,
        ) -> Option<&'a TreeNode> {
            let component = components.next()?;
            match nodes.get(BStr::new(component.as_bytes()))? {
                node @ TreeNode::File { .. } => Some(node),
                TreeNode::Dir(children) => lookup(children, components),
            }
        }
        match lookup(&self.tree.root, path.split('/')) {
            Some(TreeNode::File { contents, .. }) => blob_id_for(contents),
            _ => panic!("no file at {} in the fixture tree", path),
        }
    }

    pub async fn resolve(&self, path: &str) -> Result<InodeHandle, FsError> {
        self.mount
            .resolve_path(path.as_bytes().as_bstr(), &FetchContext::default())
            .await
    }

    pub async fn load_file(&self, path: &str) -> Arc<FileInode> {
        match self.resolve(path).await.expect("path resolves") {
            InodeHandle::File(file) => file,
            InodeHandle::Tree(_) => panic!("{} is a directory", path),
        }
    }

    pub async fn load_tree(&self, path: &str) -> Arc<TreeInode> {
        match self.resolve(path).await.expect("path resolves") {
            InodeHandle::Tree(tree) => tree,
            InodeHandle::File(_) => panic!("{} is a file", path),
        }
    }
}
