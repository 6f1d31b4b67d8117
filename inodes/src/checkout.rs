//! Two-tree reconciliation: transitioning the working copy between
//! commits.
//!
//! Each directory merge-walks the old tree, the new tree and its live
//! contents in name order. Entries whose live state is a plain
//! source-control reference are handled inline under the contents lock;
//! anything loaded, remembered or materialized becomes a deferred
//! [CheckoutAction] that runs after the lock is released, possibly
//! recursing into subtrees. After all actions for a directory settle, the
//! directory writes its overlay record at most once, dematerializing back
//! to a pure reference when its contents ended up identical to the new
//! tree.
//!
//! The mount rename lock is held in shared mode for the whole transition,
//! so renames cannot reorder entries mid-walk. Conflicts are reported, not
//! raised; per-entry errors are collected and the overall checkout keeps
//! going.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bstr::{BStr, BString, ByteSlice};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use scmfs_overlay::{catalog, InodeNumber};

use crate::inode::InodeHandle;
use crate::mount::Mount;
use crate::store::{
    objects_known_identical, EntryKind, FetchCause, FetchContext, ObjectComparison, ObjectId,
    ObjectStore, Tree,
};
use crate::tree::{DirEntry, TreeInode, TreeState};
use crate::FsError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Report conflicts and skip the conflicting entries.
    Normal,
    /// Report conflicts but apply the new state anyway.
    Force,
    /// Never mutate; only detect and report conflicts.
    DryRun,
}

/// How an entry's live state disagreed with the transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictType {
    /// Locally modified, removed by the new commit.
    ModifiedRemoved,
    /// Untracked locally where the new commit adds an entry.
    UntrackedAdded,
    /// Removed locally, modified by the new commit.
    RemovedModified,
    /// Removed locally and removed by the new commit too.
    MissingRemoved,
    /// Modified locally and modified by the new commit.
    ModifiedModified,
    /// A directory that had to go could not be emptied.
    DirectoryNotEmpty,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckoutConflict {
    pub path: BString,
    pub kind: ConflictType,
}

/// A per-entry failure that did not abort the checkout.
#[derive(Debug)]
pub struct CheckoutError {
    pub path: BString,
    pub message: String,
}

pub struct CheckoutContext {
    mode: CheckoutMode,
    fetch: FetchContext,
    conflicts: Mutex<Vec<CheckoutConflict>>,
    errors: Mutex<Vec<CheckoutError>>,
}

impl CheckoutContext {
    fn new(mode: CheckoutMode) -> Arc<Self> {
        Arc::new(CheckoutContext {
            mode,
            fetch: FetchContext::for_cause(FetchCause::Checkout),
            conflicts: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode == CheckoutMode::DryRun
    }

    pub fn force_update(&self) -> bool {
        self.mode == CheckoutMode::Force
    }

    pub fn fetch_context(&self) -> &FetchContext {
        &self.fetch
    }

    fn add_conflict(&self, dir: &TreeInode, name: &BStr, kind: ConflictType) {
        let path = join_path(dir, name);
        debug!(path = %path, kind = ?kind, "checkout conflict");
        self.conflicts.lock().push(CheckoutConflict { path, kind });
    }

    fn add_conflict_on_dir(&self, dir: &TreeInode, kind: ConflictType) {
        let path = dir.base().path().unwrap_or_default();
        self.conflicts.lock().push(CheckoutConflict { path, kind });
    }

    fn add_error(&self, dir: &TreeInode, name: &BStr, error: &FsError) {
        let path = join_path(dir, name);
        warn!(path = %path, error = %error, "checkout entry failed");
        self.errors.lock().push(CheckoutError {
            path,
            message: error.to_string(),
        });
    }
}

fn join_path(dir: &TreeInode, name: &BStr) -> BString {
    let mut path = dir.base().path().unwrap_or_default();
    if !path.is_empty() {
        path.push(b'/');
    }
    path.extend_from_slice(name);
    path
}

/// Outcome of a whole-mount checkout.
#[derive(Debug)]
pub struct CheckoutResult {
    pub conflicts: Vec<CheckoutConflict>,
    pub errors: Vec<CheckoutError>,
    pub duration: Duration,
}

impl Mount {
    /// Transitions the working copy from the commit tree `from` to `to`.
    ///
    /// `from` is `None` for a mount with no previous commit (initial
    /// checkout into an empty root).
    #[instrument(skip(self), fields(mode = ?mode))]
    pub async fn checkout(
        self: &Arc<Self>,
        from: Option<&ObjectId>,
        to: &ObjectId,
        mode: CheckoutMode,
    ) -> Result<CheckoutResult, FsError> {
        let start = Instant::now();
        let ctx = CheckoutContext::new(mode);

        // Shared: tree walks may proceed, renames may not.
        let _rename = self.rename_lock().read().await;

        let from_tree = match from {
            Some(id) => Some(self.object_store().get_tree(id, ctx.fetch_context()).await?),
            None => None,
        };
        let to_tree = self.object_store().get_tree(to, ctx.fetch_context()).await?;

        let root = self.root();
        root.checkout(&ctx, from_tree, Some(to_tree)).await?;

        let result = CheckoutResult {
            conflicts: std::mem::take(&mut *ctx.conflicts.lock()),
            errors: std::mem::take(&mut *ctx.errors.lock()),
            duration: start.elapsed(),
        };
        debug!(
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            "checkout finished"
        );
        Ok(result)
    }
}

/// Where a deferred action gets its inode from.
enum InodeSource {
    Ready(InodeHandle),
    Loading(oneshot::Receiver<Result<InodeHandle, FsError>>),
}

/// Deferred per-entry work: anything that needs to inspect or recurse into
/// a loaded child.
pub(crate) struct CheckoutAction {
    name: BString,
    old: Option<(EntryKind, ObjectId)>,
    new: Option<(EntryKind, ObjectId)>,
    inode: InodeSource,
}

impl CheckoutAction {
    /// Runs the action. Returns whether the parent listing changed.
    async fn run(
        self,
        parent: &Arc<TreeInode>,
        ctx: &Arc<CheckoutContext>,
        mount: &Arc<Mount>,
    ) -> (BString, Result<bool, FsError>) {
        let name = self.name.clone();
        let result = self.run_impl(parent, ctx, mount).await;
        (name, result)
    }

    async fn run_impl(
        self,
        parent: &Arc<TreeInode>,
        ctx: &Arc<CheckoutContext>,
        mount: &Arc<Mount>,
    ) -> Result<bool, FsError> {
        let inode = match self.inode {
            InodeSource::Ready(handle) => handle,
            InodeSource::Loading(rx) => rx
                .await
                .map_err(|_| FsError::LoadFailed("inode load abandoned".to_string()))??,
        };

        // Conflict classification against the old state.
        let conflict = match &self.old {
            None => {
                // Nothing was here before; a loaded inode means the user
                // put something untracked where the new commit wants an
                // entry.
                Some(ConflictType::UntrackedAdded)
            }
            Some((old_kind, old_id)) => match (&inode, old_kind.is_tree()) {
                (InodeHandle::Tree(_), true) => None,
                (InodeHandle::File(file), false) => {
                    let same = file
                        .is_same_as(
                            old_id,
                            *old_kind == EntryKind::Symlink,
                            *old_kind == EntryKind::Executable,
                            ctx.fetch_context(),
                        )
                        .await?;
                    if same {
                        None
                    } else if self.new.is_none() {
                        Some(ConflictType::ModifiedRemoved)
                    } else {
                        Some(ConflictType::ModifiedModified)
                    }
                }
                // The type changed locally (file became dir or vice
                // versa).
                _ => {
                    if self.new.is_none() {
                        Some(ConflictType::ModifiedRemoved)
                    } else {
                        Some(ConflictType::ModifiedModified)
                    }
                }
            },
        };

        // Directories always recurse so conflicts are reported per file;
        // the conflict short-circuit only applies to non-directories.
        let recursing_tree = matches!(&inode, InodeHandle::Tree(_))
            && self.old.as_ref().is_some_and(|(k, _)| k.is_tree());
        if let Some(kind) = conflict {
            if !recursing_tree {
                ctx.add_conflict(parent, self.name.as_bstr(), kind);
                if !ctx.force_update() {
                    return Ok(false);
                }
            }
        } else if let (Some((old_kind, old_id)), Some((new_kind, new_id))) =
            (&self.old, &self.new)
        {
            // Identical transition and the live file matches it: the only
            // remaining work is dropping redundant materialized state.
            if old_kind == new_kind
                && objects_known_identical(mount.object_store().as_ref(), old_id, new_id)
            {
                if let InodeHandle::File(file) = &inode {
                    if !file.is_materialized().await {
                        return Ok(false);
                    }
                }
            }
        }

        // Fetch the trees needed for recursion.
        let old_tree = match &self.old {
            Some((EntryKind::Tree, id)) => Some(
                mount
                    .object_store()
                    .get_tree(id, ctx.fetch_context())
                    .await?,
            ),
            _ => None,
        };
        let new_tree = match &self.new {
            Some((EntryKind::Tree, id)) => Some(
                mount
                    .object_store()
                    .get_tree(id, ctx.fetch_context())
                    .await?,
            ),
            _ => None,
        };

        checkout_update_entry(
            parent, ctx, mount, self.name.as_bstr(), inode, old_tree, new_tree, self.new,
        )
        .await
    }
}

/// Applies the transition to one live entry whose inode is loaded.
#[allow(clippy::too_many_arguments)]
async fn checkout_update_entry(
    parent: &Arc<TreeInode>,
    ctx: &Arc<CheckoutContext>,
    mount: &Arc<Mount>,
    name: &BStr,
    inode: InodeHandle,
    old_tree: Option<Arc<Tree>>,
    new_tree: Option<Arc<Tree>>,
    new_entry: Option<(EntryKind, ObjectId)>,
) -> Result<bool, FsError> {
    let tree = match &inode {
        InodeHandle::Tree(tree) => tree.clone(),
        InodeHandle::File(file) => {
            // Replacing or removing a file: unlink it and install the new
            // reference, if any.
            if ctx.is_dry_run() {
                return Ok(false);
            }
            {
                let mut contents = parent.contents().write();
                let Some(entry) = contents.entries.get(name) else {
                    return Err(FsError::LoadFailed(format!(
                        "entry {} removed while holding the rename lock during checkout",
                        name
                    )));
                };
                if entry.ino != file.ino() {
                    return Err(FsError::LoadFailed(format!(
                        "entry {} changed while holding the rename lock during checkout",
                        name
                    )));
                }
                if let Err(e) = mount.channel().invalidate_entry(parent.ino(), name) {
                    drop(contents);
                    ctx.add_error(parent, name, &FsError::Io(e));
                    return Ok(false);
                }
                inode.base().location.lock().unlinked = true;
                contents.entries.remove(name);
                if let Some((kind, id)) = &new_entry {
                    let ino = mount.catalog().next_inode_number()?;
                    contents.entries.insert(
                        name.to_owned(),
                        DirEntry {
                            mode: kind.initial_mode(),
                            ino,
                            object_id: Some(id.clone()),
                            inode: None,
                        },
                    );
                }
            }
            file.cleanup_after_unlink().await?;
            return Ok(true);
        }
    };

    // Directory to directory: recursing is the whole job. The parent
    // listing does not change.
    if new_tree.is_some() {
        tree.checkout(ctx, old_tree, new_tree).await?;
        return Ok(false);
    }

    // The directory disappears (or becomes a file). Empty it first;
    // checkout with no destination tree is exactly that.
    tree.checkout(ctx, old_tree, None).await?;
    if ctx.is_dry_run() {
        return Ok(false);
    }

    {
        let mut contents = parent.contents().write();
        let Some(entry) = contents.entries.get(name) else {
            return Err(FsError::LoadFailed(format!(
                "entry {} removed while holding the rename lock during checkout",
                name
            )));
        };
        if entry.ino != tree.ino() {
            return Err(FsError::LoadFailed(format!(
                "entry {} changed while holding the rename lock during checkout",
                name
            )));
        }
        // Locally added (or conflicted, in normal mode) children survive,
        // and then so must the directory.
        if !tree.is_empty() {
            drop(contents);
            ctx.add_conflict_on_dir(&tree, ConflictType::DirectoryNotEmpty);
            return Ok(false);
        }
        if let Err(e) = mount.channel().invalidate_entry(parent.ino(), name) {
            drop(contents);
            ctx.add_error(parent, name, &FsError::Io(e));
            return Ok(false);
        }
        tree.base().location.lock().unlinked = true;
        contents.entries.remove(name);
        if let Some((kind, id)) = &new_entry {
            let ino = mount.catalog().next_inode_number()?;
            contents.entries.insert(
                name.to_owned(),
                DirEntry {
                    mode: kind.initial_mode(),
                    ino,
                    object_id: Some(id.clone()),
                    inode: None,
                },
            );
        }
    }
    tree.cleanup_after_unlink().await?;
    Ok(true)
}

impl TreeInode {
    /// Transitions this directory (recursively) from `from_tree` to
    /// `to_tree`. `None` stands for "no entries": used for the initial
    /// checkout and for emptying removed directories.
    pub(crate) fn checkout<'a>(
        self: &'a Arc<Self>,
        ctx: &'a Arc<CheckoutContext>,
        from_tree: Option<Arc<Tree>>,
        to_tree: Option<Arc<Tree>>,
    ) -> BoxFuture<'a, Result<(), FsError>> {
        async move {
            let mount = self.base().mount()?;
            debug!(
                inode = %self.ino(),
                from = ?from_tree.as_ref().map(|t| t.id().to_string()),
                to = ?to_tree.as_ref().map(|t| t.id().to_string()),
                "checkout: updating directory"
            );

            let mut plan = CheckoutPlan::default();
            self.compute_checkout_actions(
                &mount,
                ctx,
                from_tree.as_deref(),
                to_tree.as_deref(),
                &mut plan,
            )?;

            for load in plan.pending_loads {
                load.finish(&mount);
            }
            // Stale records of replaced subtrees are forgotten rather than
            // rewritten; the subtree is as if freshly checked out.
            for ino in plan.forget_records {
                catalog::remove_dir_recursive(mount.catalog().as_ref(), ino).await?;
            }

            let mut modified = plan.modified;
            let results = futures::future::join_all(
                plan.actions
                    .into_iter()
                    .map(|action| action.run(self, ctx, &mount)),
            )
            .await;
            for (name, result) in results {
                match result {
                    Ok(invalidation_required) => modified |= invalidation_required,
                    Err(e) => ctx.add_error(self, name.as_bstr(), &e),
                }
            }

            if modified && !ctx.is_dry_run() {
                self.base().update_mtime();
                if let Err(e) = mount.channel().invalidate_dir(self.ino()) {
                    // Recorded against the directory; the checkout keeps
                    // going.
                    ctx.add_error(self, BStr::new(b""), &FsError::Io(e));
                }
            }

            self.save_overlay_post_checkout(ctx, &mount, to_tree.as_deref())
                .await
        }
        .boxed()
    }

    /// Merge-walks the two trees against the live contents and fills the
    /// plan. Runs entirely under the contents write lock, no IO.
    fn compute_checkout_actions(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        ctx: &Arc<CheckoutContext>,
        from_tree: Option<&Tree>,
        to_tree: Option<&Tree>,
        plan: &mut CheckoutPlan,
    ) -> Result<(), FsError> {
        let mut contents = self.contents().write();

        if let Some(current) = contents.tree_object_id.clone() {
            if can_short_circuit(mount.object_store().as_ref(), ctx, &current, from_tree, to_tree)
            {
                debug!(inode = %self.ino(), "checkout: already in the target state");
                return Ok(());
            }
        }

        let mut old_iter = from_tree
            .map(|t| t.entries().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .peekable();
        let mut new_iter = to_tree
            .map(|t| t.entries().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .peekable();

        loop {
            let (old_entry, new_entry) = match (old_iter.peek(), new_iter.peek()) {
                (None, None) => break,
                (Some(_), None) => (old_iter.next(), None),
                (None, Some(_)) => (None, new_iter.next()),
                (Some((old_name, _)), Some((new_name, _))) => {
                    match old_name.cmp(new_name) {
                        std::cmp::Ordering::Less => (old_iter.next(), None),
                        std::cmp::Ordering::Greater => (None, new_iter.next()),
                        std::cmp::Ordering::Equal => (old_iter.next(), new_iter.next()),
                    }
                }
            };
            self.process_checkout_entry(mount, ctx, &mut contents, old_entry, new_entry, plan)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn process_checkout_entry(
        self: &Arc<Self>,
        mount: &Arc<Mount>,
        ctx: &Arc<CheckoutContext>,
        contents: &mut TreeState,
        old_entry: Option<(&BStr, &crate::store::TreeEntry)>,
        new_entry: Option<(&BStr, &crate::store::TreeEntry)>,
        plan: &mut CheckoutPlan,
    ) -> Result<(), FsError> {
        let store = mount.object_store();

        let name: &BStr = old_entry
            .map(|(n, _)| n)
            .or(new_entry.map(|(n, _)| n))
            .expect("at least one side is present");

        // Entries identical between the two commits need no work as long
        // as the live state is a clean reference to that same object (or
        // gone). A materialized, loaded or diverged live entry still gets
        // verified, so hash-equal local contents can dematerialize; a
        // force checkout verifies everything regardless.
        if !ctx.force_update() {
            if let (Some((_, old)), Some((_, new))) = (&old_entry, &new_entry) {
                if old.kind == new.kind && objects_known_identical(store.as_ref(), &old.id, &new.id)
                {
                    let live_is_clean = contents.entries.get(name).map_or(true, |live| {
                        live.inode.is_none()
                            && !mount.inode_map().is_inode_remembered(live.ino)
                            && live.object_id.as_ref().is_some_and(|id| {
                                objects_known_identical(store.as_ref(), id, &new.id)
                            })
                    });
                    if live_is_clean {
                        return Ok(());
                    }
                }
            }
        }

        let Some(live) = contents.entries.get(name).cloned() else {
            // No live entry at this name.
            match (&old_entry, &new_entry) {
                (None, Some((_, new))) => {
                    // Plain addition.
                    if !ctx.is_dry_run() {
                        if let Err(e) = mount.channel().invalidate_entry(self.ino(), name) {
                            ctx.add_error(self, name, &FsError::Io(e));
                            return Ok(());
                        }
                        let ino = mount.catalog().next_inode_number()?;
                        contents.entries.insert(
                            name.to_owned(),
                            DirEntry {
                                mode: new.kind.initial_mode(),
                                ino,
                                object_id: Some(new.id.clone()),
                                inode: None,
                            },
                        );
                        plan.modified = true;
                    }
                }
                (Some(_), None) => {
                    // Already removed locally; the state matches, but it is
                    // still worth flagging.
                    ctx.add_conflict(self, name, ConflictType::MissingRemoved);
                }
                (Some(_), Some((_, new))) => {
                    ctx.add_conflict(self, name, ConflictType::RemovedModified);
                    if ctx.force_update() {
                        if let Err(e) = mount.channel().invalidate_entry(self.ino(), name) {
                            ctx.add_error(self, name, &FsError::Io(e));
                            return Ok(());
                        }
                        let ino = mount.catalog().next_inode_number()?;
                        contents.entries.insert(
                            name.to_owned(),
                            DirEntry {
                                mode: new.kind.initial_mode(),
                                ino,
                                object_id: Some(new.id.clone()),
                                inode: None,
                            },
                        );
                        plan.modified = true;
                    }
                }
                (None, None) => unreachable!("one side must be present"),
            }
            return Ok(());
        };

        let defer = |plan: &mut CheckoutPlan| {
            let action_inode = match &live.inode {
                Some(handle) => InodeSource::Ready(handle.clone()),
                None => {
                    let (tx, rx) = oneshot::channel();
                    if mount.inode_map().start_loading_if_not_loading(live.ino, tx) {
                        plan.pending_loads
                            .push(self.make_pending_load(name.to_owned(), &live));
                    }
                    InodeSource::Loading(rx)
                }
            };
            plan.actions.push(CheckoutAction {
                name: name.to_owned(),
                old: old_entry.map(|(_, e)| (e.kind, e.id.clone())),
                new: new_entry.map(|(_, e)| (e.kind, e.id.clone())),
                inode: action_inode,
            });
        };

        // Loaded inodes are always handled as deferred actions.
        if live.inode.is_some() {
            defer(plan);
            return Ok(());
        }

        // A materialized or kernel-remembered child must be loaded to
        // judge conflicts and update its saved state.
        if live.is_materialized() || mount.inode_map().is_inode_remembered(live.ino) {
            defer(plan);
            return Ok(());
        }

        let live_id = live
            .object_id
            .clone()
            .expect("non-materialized entries carry an object id");

        // Unloaded, non-materialized: classify by ids alone if possible.
        let mut conflict = None;
        match &old_entry {
            None => conflict = Some(ConflictType::UntrackedAdded),
            Some((_, old)) => {
                if let Some((_, new)) = &new_entry {
                    if objects_known_identical(store.as_ref(), &live_id, &new.id) {
                        // Already in the destination state.
                        return Ok(());
                    }
                }
                match store.compare_objects(&live_id, &old.id) {
                    ObjectComparison::Identical => {}
                    ObjectComparison::Different => {
                        conflict = Some(ConflictType::ModifiedModified)
                    }
                    ObjectComparison::Unknown => {
                        // Only the contents can tell; load and re-judge.
                        defer(plan);
                        return Ok(());
                    }
                }
            }
        }

        if let Some(kind) = conflict {
            if live.is_directory() {
                // Recurse to report precise per-file conflict paths.
                defer(plan);
                return Ok(());
            }
            ctx.add_conflict(self, name, kind);
            if !ctx.force_update() {
                return Ok(());
            }
        }

        if ctx.is_dry_run() {
            return Ok(());
        }

        // Replace (or remove) the plain reference inline.
        if let Err(e) = mount.channel().invalidate_entry(self.ino(), name) {
            ctx.add_error(self, name, &FsError::Io(e));
            return Ok(());
        }
        contents.entries.remove(name);
        if live.is_directory() {
            // Forget inode numbers for the replaced subtree; it is as if
            // it were deleted and checked out from scratch.
            plan.forget_records.push(live.ino);
        }
        if let Some((_, new)) = &new_entry {
            let ino = mount.catalog().next_inode_number()?;
            contents.entries.insert(
                name.to_owned(),
                DirEntry {
                    mode: new.kind.initial_mode(),
                    ino,
                    object_id: Some(new.id.clone()),
                    inode: None,
                },
            );
        }
        plan.modified = true;
        Ok(())
    }

    fn make_pending_load(self: &Arc<Self>, name: BString, entry: &DirEntry) -> PendingLoadSpec {
        PendingLoadSpec {
            parent: self.clone(),
            name,
            ino: entry.ino,
            entry_mode: entry.mode,
            object_id: entry.object_id.clone(),
        }
    }

    /// After every action has settled: decide whether this directory can
    /// drop back to being a plain reference to `to_tree`, persist
    /// accordingly, and tell the parent if our state changed.
    async fn save_overlay_post_checkout(
        self: &Arc<Self>,
        ctx: &Arc<CheckoutContext>,
        mount: &Arc<Mount>,
        to_tree: Option<&Tree>,
    ) -> Result<(), FsError> {
        if ctx.is_dry_run() {
            return Ok(());
        }

        let (old_id, new_id, record) = {
            let mut contents = self.contents().write();
            let old_id = contents.tree_object_id.clone();
            let new_id = try_dematerialize(mount.object_store().as_ref(), &contents, to_tree);
            contents.tree_object_id = new_id.clone();
            (old_id, new_id, contents.to_overlay_dir())
        };

        match &new_id {
            // Dematerialized: the reference replaces the record.
            Some(_) => {
                let _ = mount.catalog().load_and_remove_dir(self.ino()).await?;
            }
            None => mount.catalog().save_dir(self.ino(), record).await?,
        }

        let state_changed = match (&old_id, &new_id) {
            (Some(a), Some(b)) => a != b,
            (None, None) => false,
            _ => true,
        };
        if state_changed {
            debug!(
                inode = %self.ino(),
                materialized = new_id.is_none(),
                "directory materialization changed during checkout"
            );
            if let Some(parent) = self.base().parent() {
                let name = self.base().name();
                match new_id {
                    Some(id) => parent.child_dematerialized(name.as_bstr(), id).await?,
                    None => parent.child_materialized(name.as_bstr()).await?,
                }
            }
        }
        Ok(())
    }
}

/// The per-directory work list assembled under the contents lock.
#[derive(Default)]
struct CheckoutPlan {
    actions: Vec<CheckoutAction>,
    pending_loads: Vec<PendingLoadSpec>,
    forget_records: Vec<InodeNumber>,
    modified: bool,
}

/// Parameters of a child load to start once the contents lock drops.
pub(crate) struct PendingLoadSpec {
    parent: Arc<TreeInode>,
    name: BString,
    ino: InodeNumber,
    entry_mode: u32,
    object_id: Option<ObjectId>,
}

impl PendingLoadSpec {
    fn finish(self, mount: &Arc<Mount>) {
        crate::tree::spawn_child_load(
            mount,
            self.parent,
            self.name,
            self.ino,
            self.entry_mode,
            self.object_id,
        );
    }
}

/// Nothing to do for this directory?
fn can_short_circuit(
    store: &dyn ObjectStore,
    ctx: &CheckoutContext,
    current: &ObjectId,
    from_tree: Option<&Tree>,
    to_tree: Option<&Tree>,
) -> bool {
    if ctx.is_dry_run() {
        // Only conflict detection matters: being identical to the old
        // state means no conflicts are possible. Failing that, already
        // being in the destination state works too.
        return match from_tree {
            Some(from) => objects_known_identical(store, current, from.id()),
            None => match to_tree {
                None => true,
                Some(to) => objects_known_identical(store, current, to.id()),
            },
        };
    }

    let Some(to) = to_tree else { return false };
    if !objects_known_identical(store, current, to.id()) {
        return false;
    }
    // Already in the destination state. With no old tree the only possible
    // conflicts are additions that are already resolved; with one, being
    // identical to it as well guarantees no conflicts to report.
    match from_tree {
        None => true,
        Some(from) => objects_known_identical(store, current, from.id()),
    }
}

/// Compares the settled contents to the destination tree entry-for-entry.
/// `Some(id)` means the directory is exactly the tree and can drop its
/// materialized state.
fn try_dematerialize(
    store: &dyn ObjectStore,
    contents: &TreeState,
    to_tree: Option<&Tree>,
) -> Option<ObjectId> {
    let tree = to_tree?;
    if tree.len() != contents.entries.len() {
        return None;
    }
    for ((live_name, live), (tree_name, tree_entry)) in
        contents.entries.iter().zip(tree.entries())
    {
        if live_name.as_bstr() != tree_name {
            return None;
        }
        // A materialized child forces us to stay materialized, if only to
        // record that fact.
        let live_id = live.object_id.as_ref()?;
        match store.compare_objects(live_id, &tree_entry.id) {
            ObjectComparison::Identical => {}
            ObjectComparison::Different | ObjectComparison::Unknown => return None,
        }
    }
    Some(tree.id().clone())
}
