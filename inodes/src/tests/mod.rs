//! End-to-end behavior of the mount: lookup, mutation, checkout, diff and
//! recovery, driven through the public surface over in-memory (and, for
//! recovery, on-disk) stores.

use std::sync::Arc;

use bstr::{BStr, ByteSlice};
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use scmfs_overlay::catalog::FsCatalog;
use scmfs_overlay::content::FsContentStore;
use scmfs_overlay::fs::OverlayRoot;
use scmfs_overlay::ROOT_INODE;

use crate::channel::NoopChannel;
use crate::checkout::{CheckoutMode, ConflictType};
use crate::diff::{DiffCollector, DiffStatus};
use crate::fixtures::{TestMount, TreeBuilder};
use crate::journal::{JournalEvent, NullJournal};
use crate::mount::{CaseSensitivity, Mount, MountConfig};
use crate::store::{BlobCache, FetchContext, MemoryObjectStore};
use crate::{FsError, InodeHandle, SetAttr};

fn ctx() -> FetchContext {
    FetchContext::default()
}

fn n(name: &str) -> &BStr {
    name.as_bytes().as_bstr()
}

#[tokio::test]
async fn create_then_read_materializes_the_root() {
    let tm = TestMount::builder().build().await;
    let root = tm.root();
    assert!(!root.is_materialized());

    let file = root
        .create(n("hello.txt"), 0o644, Bytes::from_static(b"world"))
        .await
        .unwrap();

    let stat = file.stat(&ctx()).await.unwrap();
    assert_eq!(stat.size, 5);

    let (data, eof) = file.read(0, 16, &ctx()).await.unwrap();
    assert_eq!(&data[..], b"world");
    assert!(eof);

    assert!(root.is_materialized());
    assert!(tm.mount.catalog().has_dir(ROOT_INODE).await.unwrap());
    assert_eq!(
        tm.journal.events(),
        vec![JournalEvent::Created {
            path: "hello.txt".into()
        }]
    );
}

#[tokio::test]
async fn create_rejects_duplicates_and_bad_names() {
    let tm = TestMount::builder().file("taken.txt", "x").build().await;
    let root = tm.root();

    assert!(matches!(
        root.create(n("taken.txt"), 0o644, Bytes::new()).await,
        Err(FsError::AlreadyExists(_))
    ));
    assert!(matches!(
        root.create(n("a/b"), 0o644, Bytes::new()).await,
        Err(FsError::InvalidArgument(_))
    ));
    assert!(matches!(
        root.mkdir(n(".."), 0o755).await,
        Err(FsError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn mkdir_then_rmdir_leaves_no_trace() {
    let tm = TestMount::builder().build().await;
    let root = tm.root();

    let dir = root.mkdir(n("newdir"), 0o755).await.unwrap();
    let dir_ino = dir.ino();
    assert!(tm.mount.catalog().has_dir(dir_ino).await.unwrap());

    root.rmdir(n("newdir"), &ctx()).await.unwrap();
    assert!(matches!(
        tm.resolve("newdir").await,
        Err(FsError::NotFound(_))
    ));
    assert!(!tm.mount.catalog().has_dir(dir_ino).await.unwrap());
}

#[tokio::test]
async fn rmdir_requires_an_empty_directory() {
    let tm = TestMount::builder().file("d/f.txt", "x").build().await;
    let root = tm.root();

    assert!(matches!(
        root.rmdir(n("d"), &ctx()).await,
        Err(FsError::DirectoryNotEmpty(_))
    ));
    // unlink refuses directories outright.
    assert!(matches!(
        root.unlink(n("d"), &ctx()).await,
        Err(FsError::IsADirectory(_))
    ));

    let d = tm.load_tree("d").await;
    d.unlink(n("f.txt"), &ctx()).await.unwrap();
    root.rmdir(n("d"), &ctx()).await.unwrap();
    assert!(matches!(tm.resolve("d").await, Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn unlink_records_a_journal_event() {
    let tm = TestMount::builder().file("d/f.txt", "x").build().await;
    let d = tm.load_tree("d").await;
    d.unlink(n("f.txt"), &ctx()).await.unwrap();
    assert_eq!(
        tm.journal.events(),
        vec![JournalEvent::Removed {
            path: "d/f.txt".into()
        }]
    );
}

#[tokio::test]
async fn materialization_walks_every_ancestor() {
    let tm = TestMount::builder().file("d1/d2/f.txt", "x").build().await;
    let file = tm.load_file("d1/d2/f.txt").await;
    file.write(0, b"y", &ctx()).await.unwrap();

    let root = tm.root();
    let d1 = tm.load_tree("d1").await;
    let d2 = tm.load_tree("d1/d2").await;
    assert!(root.is_materialized());
    assert!(d1.is_materialized());
    assert!(d2.is_materialized());

    // The parent entries dropped their object ids along the path.
    let root_entry = root.contents().read().entries[BStr::new(b"d1")].clone();
    assert!(root_entry.object_id.is_none());
    let d1_entry = d1.contents().read().entries[BStr::new(b"d2")].clone();
    assert!(d1_entry.object_id.is_none());
}

#[tokio::test]
async fn readdir_uses_stable_offsets() {
    let tm = TestMount::builder()
        .file("alpha", "1")
        .file("beta", "2")
        .build()
        .await;
    let root = tm.root();

    let all = root.readdir(0);
    assert_eq!(all[0].name, ".");
    assert_eq!(all[0].offset, 1);
    assert_eq!(all[1].name, "..");
    assert_eq!(all[1].offset, 2);
    // Children come in ascending inode order with offsets ino + 2.
    let children: Vec<_> = all[2..].iter().map(|e| (e.name.clone(), e.offset)).collect();
    assert_eq!(children.len(), 2);
    assert!(children[0].1 >= 3);
    assert!(children[1].1 > children[0].1);

    // Resuming from an entry's offset yields only what follows it.
    let rest = root.readdir(children[0].1);
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name, children[1].0);

    // Inode id 0 is never observable.
    assert!(all.iter().all(|e| e.ino.get() != 0));
}

#[tokio::test]
async fn write_offset_overflow_is_rejected() {
    let tm = TestMount::builder().file("f", "x").build().await;
    let file = tm.load_file("f").await;
    assert!(matches!(
        file.write(u64::MAX, b"y", &ctx()).await,
        Err(FsError::InvalidArgument(_))
    ));
    assert!(matches!(
        file.read(u64::MAX, u64::MAX, &ctx()).await,
        Err(FsError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn case_insensitive_mounts_fold_lookups() {
    let tm = TestMount::builder()
        .case_insensitive()
        .file("ReadMe.md", "docs")
        .build()
        .await;
    let file = tm.load_file("readme.md").await;
    let (data, _) = file.read(0, 16, &ctx()).await.unwrap();
    assert_eq!(&data[..], b"docs");

    // Creating a name differing only in case collides.
    assert!(matches!(
        tm.root().create(n("README.MD"), 0o644, Bytes::new()).await,
        Err(FsError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn mutations_inside_the_reserved_subtree_are_denied() {
    let tm = TestMount::builder().dir(".eden").build().await;
    let root = tm.root();

    let reserved = tm.load_tree(".eden").await;
    assert!(matches!(
        reserved.create(n("x"), 0o644, Bytes::new()).await,
        Err(FsError::PermissionDenied(_))
    ));
    assert!(matches!(
        root.rmdir(n(".eden"), &ctx()).await,
        Err(FsError::PermissionDenied(_))
    ));
    assert!(matches!(
        root.rename(n(".eden"), &root, n("other"), &ctx()).await,
        Err(FsError::PermissionDenied(_))
    ));
}

#[tokio::test]
async fn checkout_reports_a_conflict_and_keeps_local_changes() {
    let tm = TestMount::builder().file("a.txt", "one").build().await;
    let from = tm.root_tree_id();

    let file = tm.load_file("a.txt").await;
    file.write(0, b"two", &ctx()).await.unwrap();

    let to = tm.put_commit(&TreeBuilder::new().file("a.txt", "three"));
    let result = tm
        .mount
        .checkout(Some(&from), &to, CheckoutMode::Normal)
        .await
        .unwrap();

    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].path, "a.txt");
    assert_eq!(result.conflicts[0].kind, ConflictType::ModifiedModified);
    assert!(result.errors.is_empty());

    let (data, _) = file.read(0, 16, &ctx()).await.unwrap();
    assert_eq!(&data[..], b"two");
}

#[tokio::test]
async fn force_checkout_overwrites_and_dematerializes() {
    let tm = TestMount::builder().file("a.txt", "one").build().await;
    let from = tm.root_tree_id();

    let file = tm.load_file("a.txt").await;
    file.write(0, b"two", &ctx()).await.unwrap();
    let old_ino = file.ino();

    let to = tm.put_commit(&TreeBuilder::new().file("a.txt", "three"));
    let result = tm
        .mount
        .checkout(Some(&from), &to, CheckoutMode::Force)
        .await
        .unwrap();
    // The conflict is still reported, then overridden.
    assert_eq!(result.conflicts.len(), 1);

    let replacement = tm.load_file("a.txt").await;
    let (data, _) = replacement.read(0, 16, &ctx()).await.unwrap();
    assert_eq!(&data[..], b"three");
    assert!(!replacement.is_materialized().await);

    // The whole tree dropped back to plain references.
    assert_eq!(tm.root().tree_object_id(), Some(to));
    assert!(!tm.mount.content_store().has(old_ino).await.unwrap());
}

#[tokio::test]
async fn dry_run_checkout_reports_without_mutating() {
    let tm = TestMount::builder().file("a.txt", "one").build().await;
    let from = tm.root_tree_id();

    let file = tm.load_file("a.txt").await;
    file.write(0, b"two", &ctx()).await.unwrap();

    let to = tm.put_commit(&TreeBuilder::new().file("a.txt", "three"));
    let result = tm
        .mount
        .checkout(Some(&from), &to, CheckoutMode::DryRun)
        .await
        .unwrap();
    assert_eq!(result.conflicts.len(), 1);

    // Nothing changed.
    let (data, _) = file.read(0, 16, &ctx()).await.unwrap();
    assert_eq!(&data[..], b"two");
    assert!(tm.root().is_materialized());
}

#[tokio::test]
async fn checkout_dematerializes_hash_equal_state() {
    let tm = TestMount::builder().file("d/f", "x").build().await;
    let commit = tm.root_tree_id();

    // Write the same bytes: materialized but content-identical.
    let file = tm.load_file("d/f").await;
    file.write(0, b"x", &ctx()).await.unwrap();
    assert!(tm.root().is_materialized());
    let old_f_ino = file.ino();

    let result = tm
        .mount
        .checkout(Some(&commit), &commit, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);

    // Everything reverted to plain references...
    let d = tm.load_tree("d").await;
    assert!(!d.is_materialized());
    assert_eq!(tm.root().tree_object_id(), Some(commit));
    // ...and the overlay holds no trace of d or f anymore.
    assert!(!tm.mount.catalog().has_dir(ROOT_INODE).await.unwrap());
    assert!(!tm.mount.catalog().has_dir(d.ino()).await.unwrap());
    assert!(!tm.mount.content_store().has(old_f_ino).await.unwrap());
}

#[tokio::test]
async fn checkout_adds_and_removes_unmodified_entries_silently() {
    let tm = TestMount::builder()
        .file("stays.txt", "same")
        .file("goes.txt", "bye")
        .build()
        .await;
    let from = tm.root_tree_id();
    let to = tm.put_commit(
        &TreeBuilder::new()
            .file("stays.txt", "same")
            .file("arrives.txt", "new"),
    );

    let result = tm
        .mount
        .checkout(Some(&from), &to, CheckoutMode::Normal)
        .await
        .unwrap();
    assert!(result.conflicts.is_empty(), "{:?}", result.conflicts);

    assert!(matches!(
        tm.resolve("goes.txt").await,
        Err(FsError::NotFound(_))
    ));
    let arrived = tm.load_file("arrives.txt").await;
    let (data, _) = arrived.read(0, 16, &ctx()).await.unwrap();
    assert_eq!(&data[..], b"new");
}

#[tokio::test]
async fn checkout_flags_a_locally_deleted_then_upstream_modified_file() {
    let tm = TestMount::builder().file("f.txt", "v1").build().await;
    let from = tm.root_tree_id();
    tm.root().unlink(n("f.txt"), &ctx()).await.unwrap();

    let to = tm.put_commit(&TreeBuilder::new().file("f.txt", "v2"));
    let result = tm
        .mount
        .checkout(Some(&from), &to, CheckoutMode::Normal)
        .await
        .unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].kind, ConflictType::RemovedModified);
}

#[tokio::test]
async fn rename_into_own_subtree_is_rejected() {
    let tm = TestMount::builder().file("a/b/.keep", "").build().await;
    let root = tm.root();
    let b = tm.load_tree("a/b").await;

    let result = root.rename(n("a"), &b, n("a"), &ctx()).await;
    assert!(matches!(result, Err(FsError::InvalidArgument(_))));
    // State unchanged.
    assert!(tm.resolve("a/b/.keep").await.is_ok());
}

#[tokio::test]
async fn rename_onto_itself_is_a_noop() {
    let tm = TestMount::builder().file("a/x.txt", "1").build().await;
    let a = tm.load_tree("a").await;
    a.rename(n("x.txt"), &a, n("x.txt"), &ctx()).await.unwrap();
    assert!(tm.resolve("a/x.txt").await.is_ok());
    assert!(tm.journal.events().is_empty());
}

#[tokio::test]
async fn rename_roundtrip_restores_the_tree() {
    let tm = TestMount::builder()
        .file("a/x.txt", "payload")
        .dir("b")
        .build()
        .await;
    let a = tm.load_tree("a").await;
    let b = tm.load_tree("b").await;

    a.rename(n("x.txt"), &b, n("y.txt"), &ctx()).await.unwrap();
    assert!(matches!(
        tm.resolve("a/x.txt").await,
        Err(FsError::NotFound(_))
    ));
    let moved = tm.load_file("b/y.txt").await;
    let (data, _) = moved.read(0, 16, &ctx()).await.unwrap();
    assert_eq!(&data[..], b"payload");

    b.rename(n("y.txt"), &a, n("x.txt"), &ctx()).await.unwrap();
    assert!(tm.resolve("a/x.txt").await.is_ok());
    assert!(matches!(
        tm.resolve("b/y.txt").await,
        Err(FsError::NotFound(_))
    ));

    assert_eq!(
        tm.journal.events(),
        vec![
            JournalEvent::Renamed {
                from: "a/x.txt".into(),
                to: "b/y.txt".into()
            },
            JournalEvent::Renamed {
                from: "b/y.txt".into(),
                to: "a/x.txt".into()
            },
        ]
    );
}

#[tokio::test]
async fn rename_over_a_nonempty_directory_fails() {
    let tm = TestMount::builder()
        .dir("src_dir")
        .file("dst/contents.txt", "x")
        .build()
        .await;
    let root = tm.root();
    let result = root.rename(n("src_dir"), &root, n("dst"), &ctx()).await;
    assert!(matches!(result, Err(FsError::AlreadyExists(_))));
}

#[tokio::test]
async fn rename_replacing_a_file_reports_replaced() {
    let tm = TestMount::builder()
        .file("old.txt", "old")
        .file("new.txt", "new")
        .build()
        .await;
    let root = tm.root();
    root.rename(n("new.txt"), &root, n("old.txt"), &ctx())
        .await
        .unwrap();

    let survivor = tm.load_file("old.txt").await;
    let (data, _) = survivor.read(0, 16, &ctx()).await.unwrap();
    assert_eq!(&data[..], b"new");
    assert_eq!(
        tm.journal.events(),
        vec![JournalEvent::Replaced {
            from: "new.txt".into(),
            to: "old.txt".into()
        }]
    );
}

#[tokio::test]
async fn remove_recursively_handles_loaded_and_unloaded_subtrees() {
    let tm = TestMount::builder()
        .file("a/f1", "1")
        .file("a/f2", "2")
        .file("a/sub/f3", "3")
        .build()
        .await;
    let root = tm.root();

    // Unloaded, non-materialized: fast path.
    root.remove_recursively(n("a"), &ctx()).await.unwrap();
    assert!(matches!(tm.resolve("a").await, Err(FsError::NotFound(_))));

    // Again with a materialized file inside: slow path.
    let tm = TestMount::builder()
        .file("a/f1", "1")
        .file("a/sub/f3", "3")
        .build()
        .await;
    let f1 = tm.load_file("a/f1").await;
    f1.write(0, b"dirty", &ctx()).await.unwrap();
    tm.root().remove_recursively(n("a"), &ctx()).await.unwrap();
    assert!(matches!(tm.resolve("a").await, Err(FsError::NotFound(_))));
    assert!(!tm.mount.content_store().has(f1.ino()).await.unwrap());
}

#[tokio::test]
async fn setattr_empty_is_noop_and_size_zero_truncates() {
    let tm = TestMount::builder().file("f", "0123456789").build().await;
    let file = tm.load_file("f").await;

    let attr = SetAttr {
        size: Some(0),
        ..Default::default()
    };
    let stat = file.setattr(attr, &ctx()).await.unwrap();
    assert_eq!(stat.size, 0);
    assert!(file.is_materialized().await);
    // The truncate fast path never fetched the blob.
    assert_eq!(tm.store_fetch_count(), 0);
}

#[tokio::test]
async fn diff_reports_all_four_statuses() {
    let tm = TestMount::builder()
        .file(".gitignore", "*.log\n")
        .file("src/main.rs", "fn main() {}\n")
        .file("docs/old.md", "old")
        .build()
        .await;
    let commit = tm.root_tree_id();

    let main = tm.load_file("src/main.rs").await;
    main.write(0, b"fn main() { panic!() }\n", &ctx())
        .await
        .unwrap();
    tm.root()
        .create(n("notes.txt"), 0o644, Bytes::from_static(b"untracked"))
        .await
        .unwrap();
    tm.root()
        .create(n("debug.log"), 0o644, Bytes::from_static(b"noise"))
        .await
        .unwrap();
    let docs = tm.load_tree("docs").await;
    docs.unlink(n("old.md"), &ctx()).await.unwrap();

    let collector = DiffCollector::new();
    tm.mount
        .diff(
            std::slice::from_ref(&commit),
            &collector,
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(
        collector.entries(),
        vec![
            ("debug.log".into(), DiffStatus::Ignored),
            ("docs/old.md".into(), DiffStatus::Removed),
            ("notes.txt".into(), DiffStatus::Added),
            ("src/main.rs".into(), DiffStatus::Modified),
        ]
    );

    // Without list_ignored the ignored entry disappears.
    let collector = DiffCollector::new();
    tm.mount
        .diff(
            std::slice::from_ref(&commit),
            &collector,
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(collector
        .entries()
        .iter()
        .all(|(_, status)| *status != DiffStatus::Ignored));
}

#[tokio::test]
async fn diff_enumerates_removed_subtrees_from_the_store() {
    let tm = TestMount::builder()
        .file("gone/a.txt", "a")
        .file("gone/deep/b.txt", "b")
        .build()
        .await;
    let commit = tm.root_tree_id();

    tm.root().remove_recursively(n("gone"), &ctx()).await.unwrap();

    let collector = DiffCollector::new();
    tm.mount
        .diff(
            std::slice::from_ref(&commit),
            &collector,
            false,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(
        collector.entries(),
        vec![
            ("gone/a.txt".into(), DiffStatus::Removed),
            ("gone/deep/b.txt".into(), DiffStatus::Removed),
        ]
    );
}

#[tokio::test]
async fn diff_cancellation_returns_quietly() {
    let tm = TestMount::builder().file("f", "x").build().await;
    let commit = tm.root_tree_id();
    let file = tm.load_file("f").await;
    file.write(0, b"y", &ctx()).await.unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let collector = DiffCollector::new();
    tm.mount
        .diff(std::slice::from_ref(&commit), &collector, false, token)
        .await
        .unwrap();
    assert!(collector.entries().is_empty());
}

#[tokio::test]
async fn diff_hides_reserved_subtrees() {
    let tm = TestMount::builder().dir(".eden").file("f", "x").build().await;
    let commit = tm.root_tree_id();
    let file = tm.load_file("f").await;
    file.write(0, b"y", &ctx()).await.unwrap();

    let collector = DiffCollector::new();
    tm.mount
        .diff(
            std::slice::from_ref(&commit),
            &collector,
            true,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(collector.entries(), vec![("f".into(), DiffStatus::Modified)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_recovery_preserves_inode_numbers() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryObjectStore::new());
    let commit = TreeBuilder::new().build(&store);

    let open_mount = |store: Arc<MemoryObjectStore>, commit| {
        let path = tmp_path(&tmp);
        async move {
        let overlay = Arc::new(OverlayRoot::new(path));
        let catalog = Arc::new(FsCatalog::new(overlay.clone()));
        let content = Arc::new(FsContentStore::new(overlay));
        Mount::new(
            MountConfig {
                case_sensitivity: CaseSensitivity::Sensitive,
                commit_tree: commit,
            },
            catalog,
            content,
            store,
            BlobCache::new(1024 * 1024, 2),
            Arc::new(NullJournal),
            Arc::new(NoopChannel),
        )
        .await
        .unwrap()
        }
    };

    let mount = open_mount(store.clone(), commit.clone()).await;
    let root = mount.root();
    let x = root.mkdir(n("x"), 0o755).await.unwrap();
    let y = x.mkdir(n("y"), 0o755).await.unwrap();
    let z = y
        .create(n("z.txt"), 0o644, Bytes::from_static(b"precious"))
        .await
        .unwrap();
    let z_ino = z.ino();
    mount.shutdown().await.unwrap();
    drop(mount);

    // Simulate an unclean shutdown: the clean marker disappears.
    std::fs::remove_file(tmp_path(&tmp).join("next-inode-number")).unwrap();

    let mount = open_mount(store, commit).await;
    // New allocations never collide with recovered ones.
    let fresh = mount.catalog().next_inode_number().unwrap();
    assert!(fresh > z_ino);

    let recovered = mount
        .resolve_path(n("x/y/z.txt"), &ctx())
        .await
        .unwrap();
    assert_eq!(recovered.ino(), z_ino);
    match recovered {
        InodeHandle::File(file) => {
            let (data, _) = file.read(0, 16, &ctx()).await.unwrap();
            assert_eq!(&data[..], b"precious");
        }
        InodeHandle::Tree(_) => panic!("z.txt is a file"),
    }
    mount.shutdown().await.unwrap();
}

fn tmp_path(tmp: &tempfile::TempDir) -> std::path::PathBuf {
    tmp.path().join("local")
}

#[tokio::test]
async fn virtual_lookup_avoids_loading_clean_entries() {
    let tm = TestMount::builder().file("d/f", "x").build().await;
    let root = tm.root();

    let child = root.get_or_find_child(n("d"), &ctx()).await.unwrap();
    assert!(child.is_directory());
    assert!(child.object_id().is_some());

    let children = root.get_children(&ctx()).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].0, "d");
    // No blob was fetched for any of this.
    assert_eq!(tm.store_fetch_count(), 0);
}

#[tokio::test]
async fn concurrent_lookups_share_one_load() {
    let tm = TestMount::builder().file("f", "x").build().await;
    let root = tm.root();

    let ctx1 = ctx();
    let ctx2 = ctx();
    let (a, b) = tokio::join!(
        root.get_or_load_child(n("f"), &ctx1),
        root.get_or_load_child(n("f"), &ctx2),
    );
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.ino(), b.ino());
    // Same underlying inode, not two loads racing.
    assert!(Arc::ptr_eq(
        a.as_file().unwrap(),
        b.as_file().unwrap()
    ));
}

#[tokio::test]
async fn xattr_surface_is_sha1_only() {
    let tm = TestMount::builder().file("f", "hello").build().await;
    let file = tm.load_file("f").await;
    let sha1 = file.sha1(&ctx()).await.unwrap();
    assert_eq!(
        data_encoding::HEXLOWER.encode(&sha1),
        "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
    );
    assert!(tm.root().listxattr().is_empty());
}
