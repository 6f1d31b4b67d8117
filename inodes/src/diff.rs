//! Differential walk between the working copy and one or more commits.
//!
//! The walk merges each directory's live contents with the corresponding
//! source-control trees in name order. Per-directory work is enumerated
//! under the contents lock and executed after the lock is released;
//! subdirectories are processed concurrently. A cancellation token is
//! checked at every directory boundary.

use std::sync::Arc;

use bstr::{BStr, BString, ByteSlice};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::gitignore::{GitIgnoreFile, IgnoreStack, IgnoreStatus};
use crate::inode::InodeHandle;
use crate::mount::Mount;
use crate::store::{
    EntryKind, FetchCause, FetchContext, ObjectComparison, ObjectId, ObjectStore, Tree, TreeEntry,
};
use crate::tree::{DirEntry, TreeInode};
use crate::FsError;

/// Receives path events as the walk produces them.
pub trait DiffCallback: Send + Sync {
    fn added(&self, path: &BStr);
    fn removed(&self, path: &BStr);
    fn modified(&self, path: &BStr);
    fn ignored(&self, path: &BStr);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiffStatus {
    Added,
    Removed,
    Modified,
    Ignored,
}

/// Collects events into a vector, for tests and synchronous callers.
#[derive(Default)]
pub struct DiffCollector {
    entries: Mutex<Vec<(BString, DiffStatus)>>,
}

impl DiffCollector {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn entries(&self) -> Vec<(BString, DiffStatus)> {
        let mut entries = self.entries.lock().clone();
        entries.sort();
        entries
    }

    fn push(&self, path: &BStr, status: DiffStatus) {
        self.entries.lock().push((path.to_owned(), status));
    }
}

impl DiffCallback for DiffCollector {
    fn added(&self, path: &BStr) {
        self.push(path, DiffStatus::Added);
    }
    fn removed(&self, path: &BStr) {
        self.push(path, DiffStatus::Removed);
    }
    fn modified(&self, path: &BStr) {
        self.push(path, DiffStatus::Modified);
    }
    fn ignored(&self, path: &BStr) {
        self.push(path, DiffStatus::Ignored);
    }
}

pub struct DiffContext<'a> {
    callback: &'a dyn DiffCallback,
    fetch: FetchContext,
    cancel: CancellationToken,
    list_ignored: bool,
}

impl<'a> DiffContext<'a> {
    pub fn new(
        callback: &'a dyn DiffCallback,
        cancel: CancellationToken,
        list_ignored: bool,
    ) -> Self {
        DiffContext {
            callback,
            fetch: FetchContext::for_cause(FetchCause::Diff),
            cancel,
            list_ignored,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Mount {
    /// Reports the differences between the working copy and the given
    /// commit root trees (usually one; several when comparing against a
    /// merge). Cancellation returns quietly with whatever was already
    /// reported.
    #[instrument(skip_all)]
    pub async fn diff(
        self: &Arc<Self>,
        commit_trees: &[ObjectId],
        callback: &dyn DiffCallback,
        list_ignored: bool,
        cancel: CancellationToken,
    ) -> Result<(), FsError> {
        let ctx = DiffContext::new(callback, cancel, list_ignored);
        let _rename = self.rename_lock().read().await;

        let mut trees = Vec::with_capacity(commit_trees.len());
        for id in commit_trees {
            trees.push(self.object_store().get_tree(id, &ctx.fetch).await?);
        }

        let root = self.root();
        root.diff(&ctx, BString::default(), trees, IgnoreStack::root(), false)
            .await
    }
}

/// Work deferred until the directory's contents lock is released.
enum DiffWork {
    /// Untracked entry: report it (and recurse, for directories).
    Untracked {
        path: BString,
        entry: DirEntry,
        is_ignored: bool,
    },
    /// Present in a source tree, gone locally.
    Removed {
        path: BString,
        kind: EntryKind,
        id: ObjectId,
    },
    ModifiedFile {
        path: BString,
    },
    /// Both sides have a directory here; recurse.
    RecurseTree {
        name: BString,
        path: BString,
        scm_entries: Vec<TreeEntry>,
        is_ignored: bool,
    },
}

impl TreeInode {
    /// Walks this directory against the `trees` entries at the same path.
    pub(crate) fn diff<'a>(
        self: &'a Arc<Self>,
        ctx: &'a DiffContext<'a>,
        current_path: BString,
        trees: Vec<Arc<Tree>>,
        ignore_stack: Arc<IgnoreStack>,
        is_ignored: bool,
    ) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            if ctx.cancelled() {
                return Ok(());
            }
            let mount = self.base().mount()?;

            // The directory's own .gitignore gates its siblings'
            // classification, so it must be loaded before enumerating.
            let ignore_stack = self
                .push_gitignore_frame(&mount, ctx, &current_path, ignore_stack)
                .await?;

            let work = self.enumerate_diff_work(&mount, ctx, &current_path, &trees, &ignore_stack);

            let mut recursions = Vec::new();
            for item in work {
                match item {
                    DiffWork::ModifiedFile { path } => ctx.callback.modified(path.as_bstr()),
                    DiffWork::Removed { path, kind, id } => {
                        report_removed(ctx, mount.object_store().as_ref(), path, kind, &id)
                            .await?;
                    }
                    DiffWork::Untracked {
                        path,
                        entry,
                        is_ignored,
                    } => {
                        self.report_untracked(&mount, ctx, path, entry, is_ignored)
                            .await?;
                    }
                    DiffWork::RecurseTree {
                        name,
                        path,
                        scm_entries,
                        is_ignored,
                    } => recursions.push((name, path, scm_entries, is_ignored)),
                }
            }

            // Subdirectories in parallel.
            let recursion_futures = recursions
                .into_iter()
                .map(|(name, path, scm_entries, sub_ignored)| {
                    let mount = mount.clone();
                    let ignore_stack = ignore_stack.clone();
                    async move {
                        let child = self
                            .get_or_load_child_tree(name.as_bstr(), &ctx.fetch)
                            .await?;
                        let mut subtrees = Vec::with_capacity(scm_entries.len());
                        for entry in &scm_entries {
                            subtrees
                                .push(mount.object_store().get_tree(&entry.id, &ctx.fetch).await?);
                        }
                        child
                            .diff(ctx, path, subtrees, ignore_stack, sub_ignored)
                            .await
                    }
                });
            let results = futures::future::join_all(recursion_futures).await;
            for result in results {
                // An unreachable store makes us assume the subtree changed;
                // that was already reported where the failure occurred.
                // Surface everything else.
                if let Err(e) = result {
                    match e {
                        FsError::BackingStoreUnavailable(_) => {
                            debug!(error = %e, "diff assumed subtree changed: store unavailable")
                        }
                        other => return Err(other),
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Loads and parses this directory's `.gitignore`, if any.
    async fn push_gitignore_frame(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        ctx: &DiffContext<'_>,
        current_path: &BString,
        stack: Arc<IgnoreStack>,
    ) -> Result<Arc<IgnoreStack>, FsError> {
        let lookup = {
            let contents = self.contents().read();
            contents.entries.get(BStr::new(b".gitignore")).cloned()
        };
        let Some(entry) = lookup else {
            return Ok(stack);
        };
        if entry.is_directory() {
            return Ok(stack);
        }

        let contents = match (&entry.inode, &entry.object_id) {
            (Some(InodeHandle::File(file)), _) => Some(file.read_all(&ctx.fetch).await?),
            (_, Some(id)) => match mount.object_store().get_blob(id, &ctx.fetch).await {
                Ok(blob) => Some(blob.contents().clone()),
                // Can't classify better than "not ignored" without it.
                Err(FsError::BackingStoreUnavailable(_)) => None,
                Err(e) => return Err(e),
            },
            _ => match self.get_or_load_child(BStr::new(b".gitignore"), &ctx.fetch).await? {
                InodeHandle::File(file) => Some(file.read_all(&ctx.fetch).await?),
                InodeHandle::Tree(_) => None,
            },
        };

        let file = contents.map(|bytes| GitIgnoreFile::parse(&bytes));
        Ok(stack.push(current_path.clone(), file))
    }

    /// Merge-walks the live entries against the union of the trees'
    /// entries, producing deferred work. No IO; runs under the contents
    /// read lock.
    fn enumerate_diff_work(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        ctx: &DiffContext<'_>,
        current_path: &BString,
        trees: &[Arc<Tree>],
        ignore_stack: &Arc<IgnoreStack>,
    ) -> Vec<DiffWork> {
        let store = mount.object_store();
        let contents = self.contents().read();
        let mut work = Vec::new();

        // Union of entry names across the live contents and every tree.
        let mut names: Vec<BString> = contents.entries.keys().cloned().collect();
        for tree in trees {
            names.extend(tree.entries().map(|(n, _)| n.to_owned()));
        }
        names.sort();
        names.dedup();

        for name in names {
            let child_path = join(current_path, &name);
            let live = contents.entries.get(&name);
            let scm: Vec<&TreeEntry> =
                trees.iter().filter_map(|t| t.get(&name)).collect();

            match (live, scm.is_empty()) {
                (None, true) => unreachable!("name came from one of the sides"),
                (Some(live), true) => {
                    // Untracked locally.
                    let status =
                        ignore_stack.status(child_path.as_bstr(), live.is_directory());
                    match status {
                        IgnoreStatus::Hidden => {}
                        IgnoreStatus::Ignored => {
                            work.push(DiffWork::Untracked {
                                path: child_path,
                                entry: live.clone(),
                                is_ignored: true,
                            });
                        }
                        IgnoreStatus::NotIgnored => {
                            work.push(DiffWork::Untracked {
                                path: child_path,
                                entry: live.clone(),
                                is_ignored: false,
                            });
                        }
                    }
                }
                (None, false) => {
                    // Removed locally. Hidden names never existed as far
                    // as diff is concerned.
                    if ignore_stack.status(child_path.as_bstr(), scm[0].kind.is_tree())
                        == IgnoreStatus::Hidden
                    {
                        continue;
                    }
                    work.push(DiffWork::Removed {
                        path: child_path,
                        kind: scm[0].kind,
                        id: scm[0].id.clone(),
                    });
                }
                (Some(live), false) => {
                    if ignore_stack.status(child_path.as_bstr(), live.is_directory())
                        == IgnoreStatus::Hidden
                    {
                        continue;
                    }
                    let live_is_dir = live.is_directory();
                    let scm_trees: Vec<&TreeEntry> = scm
                        .iter()
                        .copied()
                        .filter(|e| e.kind.is_tree())
                        .collect();

                    if live_is_dir && !scm_trees.is_empty() {
                        // Unchanged if the live dir is still one of the
                        // comparison trees.
                        if let Some(live_id) = &live.object_id {
                            let unchanged = scm_trees.iter().any(|e| {
                                store.compare_objects(live_id, &e.id)
                                    == ObjectComparison::Identical
                            });
                            if unchanged {
                                continue;
                            }
                        }
                        work.push(DiffWork::RecurseTree {
                            name: name.clone(),
                            path: child_path,
                            scm_entries: scm_trees.into_iter().cloned().collect(),
                            is_ignored: false,
                        });
                    } else if !live_is_dir && scm_trees.len() == scm.len() {
                        // Every scm side is a tree but the live entry is a
                        // file: the tree's files are gone, the file is new.
                        work.push(DiffWork::Removed {
                            path: child_path.clone(),
                            kind: scm[0].kind,
                            id: scm[0].id.clone(),
                        });
                        let status = ignore_stack.status(child_path.as_bstr(), false);
                        if status != IgnoreStatus::Hidden {
                            work.push(DiffWork::Untracked {
                                path: child_path,
                                entry: live.clone(),
                                is_ignored: status == IgnoreStatus::Ignored,
                            });
                        }
                    } else if live_is_dir {
                        // Dir replaced every scm file.
                        work.push(DiffWork::Removed {
                            path: child_path.clone(),
                            kind: scm[0].kind,
                            id: scm[0].id.clone(),
                        });
                        work.push(DiffWork::Untracked {
                            path: child_path,
                            entry: live.clone(),
                            is_ignored: false,
                        });
                    } else {
                        // File vs file(s).
                        let unchanged = match &live.object_id {
                            Some(live_id) => scm.iter().any(|e| {
                                !e.kind.is_tree()
                                    && store.compare_objects(live_id, &e.id)
                                        == ObjectComparison::Identical
                            }),
                            // Materialized files count as modified.
                            None => false,
                        };
                        if !unchanged {
                            work.push(DiffWork::ModifiedFile { path: child_path });
                        }
                    }
                }
            }
        }
        work
    }

    /// Reports an untracked entry, recursing into directories.
    fn report_untracked<'a>(
        self: &'a Arc<Self>,
        mount: &'a Arc<Mount>,
        ctx: &'a DiffContext<'a>,
        path: BString,
        entry: DirEntry,
        is_ignored: bool,
    ) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            if ctx.cancelled() {
                return Ok(());
            }
            if !entry.is_directory() {
                if is_ignored {
                    if ctx.list_ignored {
                        ctx.callback.ignored(path.as_bstr());
                    }
                } else {
                    ctx.callback.added(path.as_bstr());
                }
                return Ok(());
            }

            // Ignored directories are not descended into unless ignored
            // output was requested.
            if is_ignored && !ctx.list_ignored {
                return Ok(());
            }

            let name = path
                .rsplit_str(b"/")
                .next()
                .map(|n| n.as_bstr().to_owned())
                .unwrap_or_else(|| path.clone());
            let child = self
                .get_or_load_child_tree(name.as_bstr(), &ctx.fetch)
                .await?;
            let children: Vec<(BString, DirEntry)> = {
                let contents = child.contents().read();
                contents
                    .entries
                    .iter()
                    .map(|(n, e)| (n.clone(), e.clone()))
                    .collect()
            };
            for (child_name, child_entry) in children {
                let child_path = join(&path, &child_name);
                child
                    .report_untracked(mount, ctx, child_path, child_entry, is_ignored)
                    .await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// Reports a source-control entry (and, for trees, everything under it) as
/// removed.
fn report_removed<'a>(
    ctx: &'a DiffContext<'a>,
    store: &'a dyn ObjectStore,
    path: BString,
    kind: EntryKind,
    id: &'a ObjectId,
) -> BoxFuture<'a, Result<(), FsError>> {
    async move {
        if ctx.cancelled() {
            return Ok(());
        }
        if !kind.is_tree() {
            ctx.callback.removed(path.as_bstr());
            return Ok(());
        }
        let tree = store.get_tree(id, &ctx.fetch).await?;
        for (name, entry) in tree.entries() {
            let child_path = join(&path, name);
            report_removed(ctx, store, child_path, entry.kind, &entry.id).await?;
        }
        Ok(())
    }
    .boxed()
}

fn join(base: &[u8], name: &[u8]) -> BString {
    let mut out = BString::from(base);
    if !out.is_empty() {
        out.push(b'/');
    }
    out.extend_from_slice(name);
    out
}
