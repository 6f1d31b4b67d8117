//! Offline consistency checking and repair for the sharded overlay.
//!
//! After an unclean shutdown (or on explicit request) the checker scans
//! every record file, rebuilds the parent/child graph, and conservatively
//! repairs what it finds: corrupt records are replaced and their bytes
//! archived, orphaned subtrees are archived into a `lost+found` directory
//! and removed, and the next inode number is recomputed from everything
//! observed.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bstr::{BStr, BString, ByteSlice};
use bytes::Bytes;
use threadpool::ThreadPool;
use tracing::{error, info, warn};

use crate::codec;
use crate::dir::{mode, OverlayDir, OverlayEntry};
use crate::fs::{OverlayRoot, NUM_SHARDS};
use crate::inode_number::{InodeNumber, ROOT_INODE};
use crate::OverlayError;

/// Number of threads used for the shard scan.
const SCAN_THREADS: usize = 4;

/// Resolves a path in the mount's current commit to the object id backing
/// it, if any. Lets the checker dematerialize a broken entry back into a
/// source-control reference instead of replacing it with empty contents.
pub trait ScmLookup: Send + Sync {
    fn lookup(&self, path: &BStr) -> Option<Bytes>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InodeKind {
    File,
    Dir,
    /// The record exists but could not be read; a replacement is created
    /// during repair.
    Error,
}

struct InodeInfo {
    number: InodeNumber,
    kind: InodeKind,
    /// Children, for directory records.
    children: OverlayDir,
    /// (parent, mode-in-parent) links discovered while walking.
    parents: Vec<(InodeNumber, u32)>,
}

/// A problem found in the overlay.
pub enum FsckError {
    ShardEnumeration {
        path: PathBuf,
        error: std::io::Error,
    },
    UnexpectedFile {
        path: PathBuf,
    },
    UnexpectedInodeShard {
        inode: InodeNumber,
        shard: u8,
    },
    InodeData {
        inode: InodeNumber,
        reason: String,
    },
    MissingMaterializedInode {
        parent: InodeNumber,
        name: BString,
        entry: OverlayEntry,
    },
    OrphanInode {
        inode: InodeNumber,
    },
    HardLinkedInode {
        inode: InodeNumber,
        parents: Vec<InodeNumber>,
    },
    BadNextInodeNumber {
        loaded: InodeNumber,
        expected: InodeNumber,
    },
}

impl fmt::Display for FsckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsckError::ShardEnumeration { path, error } => {
                write!(f, "error enumerating {}: {}", path.display(), error)
            }
            FsckError::UnexpectedFile { path } => {
                write!(f, "unexpected file present in overlay: {}", path.display())
            }
            FsckError::UnexpectedInodeShard { inode, shard } => write!(
                f,
                "found a data file for inode {} in the wrong shard directory ({:02x})",
                inode, shard
            ),
            FsckError::InodeData { inode, reason } => {
                write!(f, "error reading data for inode {}: {}", inode, reason)
            }
            FsckError::MissingMaterializedInode {
                parent,
                name,
                entry,
            } => {
                let kind = if entry.is_directory() {
                    "directory"
                } else if entry.is_symlink() {
                    "symlink"
                } else {
                    "file"
                };
                write!(
                    f,
                    "missing overlay data for materialized {} inode {} ({} in parent {})",
                    kind,
                    entry.inode.map_or(0, InodeNumber::get),
                    name,
                    parent
                )
            }
            FsckError::OrphanInode { inode } => write!(f, "found orphan inode {}", inode),
            FsckError::HardLinkedInode { inode, parents } => {
                write!(f, "found hard linked inode {}: parents {:?}", inode, parents)
            }
            FsckError::BadNextInodeNumber { loaded, expected } => write!(
                f,
                "bad stored next inode number: read {} but should be at least {}",
                loaded, expected
            ),
        }
    }
}

/// Outcome of a repair run.
#[derive(Debug)]
pub struct RepairReport {
    pub repair_dir: PathBuf,
    pub total_errors: usize,
    pub fixed_errors: usize,
}

/// Scans the sharded overlay for inconsistencies and repairs them.
pub struct OverlayChecker<'a> {
    root: Arc<OverlayRoot>,
    loaded_next_inode: Option<InodeNumber>,
    lookup: Option<&'a dyn ScmLookup>,
    inodes: HashMap<u64, InodeInfo>,
    errors: Vec<FsckError>,
    max_inode: u64,
}

impl<'a> OverlayChecker<'a> {
    pub fn new(
        root: Arc<OverlayRoot>,
        loaded_next_inode: Option<InodeNumber>,
        lookup: Option<&'a dyn ScmLookup>,
    ) -> Self {
        OverlayChecker {
            root,
            loaded_next_inode,
            lookup,
            inodes: HashMap::new(),
            errors: Vec::new(),
            max_inode: ROOT_INODE.get(),
        }
    }

    /// The next inode number computed from everything observed. Valid after
    /// [scan_for_errors](Self::scan_for_errors).
    pub fn next_inode_number(&self) -> Result<InodeNumber, OverlayError> {
        InodeNumber::from_raw(self.max_inode).next()
    }

    pub fn errors(&self) -> &[FsckError] {
        &self.errors
    }

    /// Scans every shard, rebuilds the inode graph, and records errors.
    pub fn scan_for_errors(&mut self) -> Result<(), OverlayError> {
        info!(dir = %self.root.local_dir().display(), "starting overlay scan");
        self.read_inodes();
        self.link_inode_children();
        self.scan_for_parent_errors();
        self.check_next_inode_number();
        if self.errors.is_empty() {
            info!(dir = %self.root.local_dir().display(), "overlay scan found no problems");
        } else {
            error!(
                dir = %self.root.local_dir().display(),
                problems = self.errors.len(),
                "overlay scan found problems"
            );
        }
        Ok(())
    }

    /// Logs every recorded error without repairing anything.
    pub fn log_errors(&self) {
        for e in &self.errors {
            error!(dir = %self.root.local_dir().display(), "fsck error: {}", e);
        }
    }

    fn read_inodes(&mut self) {
        enum ScanMessage {
            Info(InodeInfo),
            Error(FsckError),
        }

        let pool = ThreadPool::new(SCAN_THREADS);
        let (tx, rx) = mpsc::channel::<ScanMessage>();

        for shard in 0..NUM_SHARDS {
            let shard = shard as u8;
            let root = self.root.clone();
            let tx = tx.clone();
            pool.execute(move || {
                let shard_dir = root.shard_dir(shard);
                let iter = match fs::read_dir(&shard_dir) {
                    Ok(iter) => iter,
                    Err(error) => {
                        let _ = tx.send(ScanMessage::Error(FsckError::ShardEnumeration {
                            path: shard_dir,
                            error,
                        }));
                        return;
                    }
                };
                for dir_entry in iter {
                    let dir_entry = match dir_entry {
                        Ok(e) => e,
                        Err(error) => {
                            let _ = tx.send(ScanMessage::Error(FsckError::ShardEnumeration {
                                path: shard_dir.clone(),
                                error,
                            }));
                            break;
                        }
                    };
                    let Some(inode) = dir_entry
                        .file_name()
                        .to_str()
                        .and_then(|s| s.parse::<u64>().ok())
                        .and_then(InodeNumber::new)
                    else {
                        let _ = tx.send(ScanMessage::Error(FsckError::UnexpectedFile {
                            path: dir_entry.path(),
                        }));
                        continue;
                    };
                    if inode.shard() != shard {
                        let _ = tx.send(ScanMessage::Error(FsckError::UnexpectedInodeShard {
                            inode,
                            shard,
                        }));
                        continue;
                    }
                    let message = match load_inode_info(&root, inode) {
                        Ok(info) => ScanMessage::Info(info),
                        Err(reason) => {
                            let _ = tx.send(ScanMessage::Error(FsckError::InodeData {
                                inode,
                                reason,
                            }));
                            ScanMessage::Info(InodeInfo {
                                number: inode,
                                kind: InodeKind::Error,
                                children: OverlayDir::new(),
                                parents: Vec::new(),
                            })
                        }
                    };
                    let _ = tx.send(message);
                }
            });
        }
        drop(tx);

        // Drain the concurrent queue single-threaded before any repair
        // logic looks at the graph.
        while let Ok(message) = rx.recv() {
            match message {
                ScanMessage::Info(info) => {
                    self.max_inode = self.max_inode.max(info.number.get());
                    self.inodes.insert(info.number.get(), info);
                }
                ScanMessage::Error(e) => self.errors.push(e),
            }
        }
        pool.join();
    }

    fn link_inode_children(&mut self) {
        let mut links: Vec<(u64, InodeNumber, u32)> = Vec::new();
        for info in self.inodes.values() {
            if info.kind != InodeKind::Dir {
                continue;
            }
            for (name, entry) in info.children.entries() {
                let Some(child) = entry.inode else { continue };
                self.max_inode = self.max_inode.max(child.get());
                if self.inodes.contains_key(&child.get()) {
                    links.push((child.get(), info.number, entry.mode));
                } else if entry.is_materialized() {
                    self.errors.push(FsckError::MissingMaterializedInode {
                        parent: info.number,
                        name: name.into(),
                        entry: entry.clone(),
                    });
                }
            }
        }
        for (child, parent, entry_mode) in links {
            if let Some(info) = self.inodes.get_mut(&child) {
                info.parents.push((parent, entry_mode));
            }
        }
    }

    fn scan_for_parent_errors(&mut self) {
        for info in self.inodes.values() {
            if info.number == ROOT_INODE {
                continue;
            }
            if info.parents.is_empty() {
                self.errors.push(FsckError::OrphanInode {
                    inode: info.number,
                });
            } else if info.parents.len() > 1 {
                self.errors.push(FsckError::HardLinkedInode {
                    inode: info.number,
                    parents: info.parents.iter().map(|&(p, _)| p).collect(),
                });
            }
        }
    }

    fn check_next_inode_number(&mut self) {
        let expected = self.max_inode + 1;
        if let Some(loaded) = self.loaded_next_inode {
            if loaded.get() < expected {
                self.errors.push(FsckError::BadNextInodeNumber {
                    loaded,
                    expected: InodeNumber::from_raw(expected),
                });
            }
        }
    }

    /// Attempts to repair every recorded error. Returns `None` when there
    /// was nothing to repair.
    pub fn repair_errors(&mut self) -> Result<Option<RepairReport>, OverlayError> {
        if self.errors.is_empty() {
            return Ok(None);
        }

        let mut repair = RepairState::create(&self.root)?;
        repair.log(format!(
            "beginning overlay repair for {}",
            self.root.local_dir().display()
        ));
        repair.log(format!("{} problems detected", self.errors.len()));

        let errors = std::mem::take(&mut self.errors);
        let mut fixed = 0;
        for (errnum, error) in errors.iter().enumerate() {
            let errnum = errnum + 1;
            repair.log(format!("error {}: {}", errnum, error));
            match self.repair_one(&mut repair, error) {
                Ok(true) => {
                    fixed += 1;
                    repair.log(format!("  - successfully repaired error {}", errnum));
                }
                Ok(false) => repair.log(format!("  ! unable to repair error {}", errnum)),
                Err(e) => {
                    error!(error = %e, "unexpected error during overlay repair");
                    repair.log(format!("  ! failed to repair error {}: {}", errnum, e));
                }
            }
        }

        let report = RepairReport {
            repair_dir: repair.dir.clone(),
            total_errors: errors.len(),
            fixed_errors: fixed,
        };
        self.errors = errors;
        if report.fixed_errors == report.total_errors {
            repair.log(format!(
                "successfully repaired all {} problems",
                report.fixed_errors
            ));
        } else {
            repair.log(format!(
                "repaired {} problems; {} were unfixable",
                report.fixed_errors,
                report.total_errors - report.fixed_errors
            ));
        }
        Ok(Some(report))
    }

    fn repair_one(
        &mut self,
        repair: &mut RepairState,
        error: &FsckError,
    ) -> Result<bool, OverlayError> {
        match error {
            FsckError::ShardEnumeration { path, .. } => {
                // The only recoverable cause is a missing shard directory.
                Ok(fs::create_dir(path).is_ok())
            }
            FsckError::UnexpectedFile { .. } | FsckError::UnexpectedInodeShard { .. } => Ok(false),
            FsckError::InodeData { inode, .. } => {
                let archive = repair.lost_and_found_path(&self.compute_path(*inode));
                if let Some(parent) = archive.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(self.root.record_path(*inode), &archive)?;

                let entry_mode = self
                    .inodes
                    .get(&inode.get())
                    .and_then(|info| info.parents.first().map(|&(_, m)| m))
                    .unwrap_or(mode::REG | 0o644);
                self.create_inode_replacement(*inode, entry_mode)?;
                Ok(true)
            }
            FsckError::MissingMaterializedInode {
                parent,
                name,
                entry,
            } => {
                if self.try_dematerialize_entry(*parent, name.as_bstr())? {
                    return Ok(true);
                }
                let child = entry.inode.expect("materialized entry has an inode");
                self.create_inode_replacement(child, entry.mode)?;
                // Register the replacement so orphan archival can find it if
                // the parent itself turns out to be part of an orphaned
                // subtree.
                self.inodes.insert(
                    child.get(),
                    InodeInfo {
                        number: child,
                        kind: if entry.is_directory() {
                            InodeKind::Dir
                        } else {
                            InodeKind::File
                        },
                        children: OverlayDir::new(),
                        parents: vec![(*parent, entry.mode)],
                    },
                );
                Ok(true)
            }
            FsckError::OrphanInode { inode } => {
                let archive = repair.lost_and_found_path_for_inode(*inode);
                fs::create_dir_all(repair.lost_and_found())?;
                match self.inodes.get(&inode.get()).map(|i| i.kind) {
                    Some(InodeKind::File) => {
                        self.archive_orphan_file(*inode, &archive, mode::REG | 0o644)?;
                        Ok(true)
                    }
                    Some(InodeKind::Dir) => {
                        self.archive_orphan_dir(*inode, &archive)?;
                        Ok(true)
                    }
                    // A corrupt orphan was already archived and replaced by
                    // the InodeData repair above; remove the replacement.
                    Some(InodeKind::Error) | None => {
                        self.root.remove_record(*inode)?;
                        Ok(false)
                    }
                }
            }
            FsckError::HardLinkedInode { .. } => Ok(false),
            // The corrected value is always written at close.
            FsckError::BadNextInodeNumber { .. } => Ok(true),
        }
    }

    fn create_inode_replacement(
        &self,
        inode: InodeNumber,
        entry_mode: u32,
    ) -> Result<(), OverlayError> {
        if entry_mode & mode::FMT == mode::DIR {
            let payload = codec::encode_dir(&OverlayDir::new());
            self.root
                .save_record(inode, codec::DIR_HEADER, &payload)?;
        } else if entry_mode & mode::FMT == mode::LNK {
            // Symlinks can't usefully be empty; leave a marker target.
            self.root
                .save_record(inode, codec::FILE_HEADER, b"[lost]")?;
        } else {
            self.root.save_record(inode, codec::FILE_HEADER, b"")?;
        }
        Ok(())
    }

    /// Re-points the parent's entry at the source-control object backing
    /// the same path, dropping the dangling materialization.
    fn try_dematerialize_entry(
        &self,
        parent: InodeNumber,
        name: &BStr,
    ) -> Result<bool, OverlayError> {
        let Some(lookup) = self.lookup else {
            return Ok(false);
        };
        let path_info = self.compute_path(parent);
        if path_info.parent != ROOT_INODE {
            // The parent is itself unlinked; there is no path to resolve.
            return Ok(false);
        }
        let mut path = path_info.path.clone();
        if !path.is_empty() {
            path.push(b'/');
        }
        path.extend_from_slice(name);
        let Some(object_id) = lookup.lookup(path.as_bstr()) else {
            warn!(path = %path, "unable to resolve path against source control");
            return Ok(false);
        };

        let Some(payload) = self.root.read_record(parent, codec::DIR_HEADER)? else {
            return Ok(false);
        };
        let mut dir = codec::decode_dir(parent, &payload)?;
        let Some(entry) = dir.get(name).cloned() else {
            return Ok(false);
        };
        dir.insert(
            name.into(),
            OverlayEntry {
                mode: entry.mode,
                inode: None,
                object_id: Some(object_id),
            },
        );
        self.root
            .save_record(parent, codec::DIR_HEADER, &codec::encode_dir(&dir))?;
        Ok(true)
    }

    fn archive_orphan_dir(
        &self,
        inode: InodeNumber,
        archive_path: &Path,
    ) -> Result<(), OverlayError> {
        match fs::create_dir_all(archive_path) {
            Ok(()) => {}
            // Another repair step may have created this directory already
            // for other files in the same orphaned subtree.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let children: Vec<(BString, OverlayEntry)> = match self.inodes.get(&inode.get()) {
            Some(info) => info
                .children
                .entries()
                .map(|(n, e)| (n.into(), e.clone()))
                .collect(),
            None => Vec::new(),
        };
        for (name, entry) in children {
            // Entries without an inode number cannot be materialized and
            // need no archiving.
            let Some(child) = entry.inode else { continue };
            let Some(child_info) = self.inodes.get(&child.get()) else {
                // Not present in the overlay: not materialized.
                continue;
            };
            // Leave multi-parent children alone; another parent still
            // references them. If every parent was an orphan a second run
            // will catch them.
            if child_info.parents.len() > 1 {
                continue;
            }
            let child_kind = child_info.kind;
            let child_path = archive_path.join(name.to_str_lossy().as_ref());
            match child_kind {
                InodeKind::File => {
                    self.archive_orphan_file(child, &child_path, entry.mode)?;
                }
                InodeKind::Dir => self.archive_orphan_dir(child, &child_path)?,
                InodeKind::Error => {
                    if let Err(e) = self.root.remove_record(child) {
                        error!(inode = %child, error = %e, "failed to remove replaced record");
                    }
                }
            }
        }

        if let Err(e) = self.root.remove_record(inode) {
            error!(inode = %inode, error = %e, "failed to remove archived directory record");
        }
        Ok(())
    }

    fn archive_orphan_file(
        &self,
        inode: InodeNumber,
        archive_path: &Path,
        entry_mode: u32,
    ) -> Result<(), OverlayError> {
        let file = self.root.open_record(inode, Some(codec::FILE_HEADER))?;
        let payload_len = file
            .metadata()?
            .len()
            .saturating_sub(codec::HEADER_LEN as u64);

        // Symlink contents that fit in a single read are restored as
        // symlinks; anything longer (or any failure) falls back to a
        // regular file. Symlink length limits vary by filesystem; 4096
        // covers the common ones.
        if entry_mode & mode::FMT == mode::LNK && payload_len > 0 && payload_len < 4096 {
            let mut target = vec![0u8; payload_len as usize];
            file.read_exact_at(&mut target, codec::HEADER_LEN as u64)?;
            if let Ok(target) = std::str::from_utf8(&target) {
                if std::os::unix::fs::symlink(target, archive_path).is_ok() {
                    if let Err(e) = self.root.remove_record(inode) {
                        error!(inode = %inode, error = %e, "failed to remove archived file record");
                    }
                    return Ok(());
                }
            }
        }

        let mut output = File::create(archive_path)?;
        let mut offset = codec::HEADER_LEN as u64;
        let mut buf = vec![0u8; 1024 * 1024];
        loop {
            let n = file.read_at(&mut buf, offset)?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n])?;
            offset += n as u64;
        }
        if let Err(e) = self.root.remove_record(inode) {
            error!(inode = %inode, error = %e, "failed to remove archived file record");
        }
        Ok(())
    }

    fn compute_path(&self, inode: InodeNumber) -> PathInfo {
        let mut segments: Vec<BString> = Vec::new();
        let mut current = inode;
        loop {
            if current == ROOT_INODE {
                return PathInfo::new(ROOT_INODE, segments);
            }
            let Some(info) = self.inodes.get(&current.get()) else {
                return PathInfo::new(current, segments);
            };
            let Some(&(parent, _)) = info.parents.first() else {
                return PathInfo::new(current, segments);
            };
            match self
                .inodes
                .get(&parent.get())
                .and_then(|p| find_child_name(p, current))
            {
                Some(name) => segments.push(name),
                None => segments.push(format!("[missing_child({})]", current).into()),
            }
            current = parent;
        }
    }
}

struct PathInfo {
    /// Root of the path: [ROOT_INODE], or the nearest unlinked ancestor.
    parent: InodeNumber,
    path: BString,
}

impl PathInfo {
    fn new(parent: InodeNumber, mut reversed_segments: Vec<BString>) -> Self {
        reversed_segments.reverse();
        let mut path = BString::default();
        for (i, seg) in reversed_segments.iter().enumerate() {
            if i > 0 {
                path.push(b'/');
            }
            path.extend_from_slice(seg);
        }
        PathInfo { parent, path }
    }
}

fn find_child_name(parent: &InodeInfo, child: InodeNumber) -> Option<BString> {
    parent
        .children
        .entries()
        .find(|(_, e)| e.inode == Some(child))
        .map(|(n, _)| n.into())
}

fn load_inode_info(root: &OverlayRoot, inode: InodeNumber) -> Result<InodeInfo, String> {
    let identifier = root.record_identifier(inode).map_err(|e| e.to_string())?;
    if &identifier == codec::FILE_HEADER {
        // Validate the rest of the header too.
        root.open_record(inode, Some(codec::FILE_HEADER))
            .map_err(|e| e.to_string())?;
        return Ok(InodeInfo {
            number: inode,
            kind: InodeKind::File,
            children: OverlayDir::new(),
            parents: Vec::new(),
        });
    }
    let payload = root
        .read_record(inode, codec::DIR_HEADER)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "record disappeared during scan".to_string())?;
    let children = codec::decode_dir(inode, &payload).map_err(|e| e.to_string())?;
    Ok(InodeInfo {
        number: inode,
        kind: InodeKind::Dir,
        children,
        parents: Vec::new(),
    })
}

struct RepairState {
    dir: PathBuf,
    log_file: File,
}

impl RepairState {
    fn create(root: &OverlayRoot) -> Result<Self, OverlayError> {
        let base = root
            .local_dir()
            .parent()
            .unwrap_or_else(|| root.local_dir())
            .join("fsck");
        fs::create_dir_all(&base)?;

        let timestamp = format_timestamp_compact(SystemTime::now());
        // In the unlikely event that a repair already ran this second, add
        // a counter suffix rather than reusing the directory.
        for iteration in 0..100 {
            let candidate = if iteration == 0 {
                base.join(&timestamp)
            } else {
                base.join(format!("{}.{}", timestamp, iteration))
            };
            match fs::create_dir(&candidate) {
                Ok(()) => {
                    let log_file = File::create(candidate.join("fsck.log"))?;
                    return Ok(RepairState {
                        dir: candidate,
                        log_file,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OverlayError::Storage(
            "failed to create a repair directory: retry limit exceeded".to_string(),
        ))
    }

    fn lost_and_found(&self) -> PathBuf {
        self.dir.join("lost+found")
    }

    fn lost_and_found_path_for_inode(&self, inode: InodeNumber) -> PathBuf {
        self.lost_and_found().join(inode.to_string())
    }

    fn lost_and_found_path(&self, path_info: &PathInfo) -> PathBuf {
        // The anchoring inode number is part of the path even for the root,
        // so names in lost+found can't collide with stray inode numbers.
        let mut out = self.lost_and_found().join(path_info.parent.to_string());
        if !path_info.path.is_empty() {
            out = out.join(path_info.path.to_str_lossy().as_ref());
        }
        out
    }

    fn log(&mut self, message: impl AsRef<str>) {
        let line = format!(
            "{}: {}\n",
            format_timestamp_log(SystemTime::now()),
            message.as_ref()
        );
        // Write each message immediately; a crash mid-repair should leave
        // as much of the log as possible.
        if let Err(e) = self.log_file.write_all(line.as_bytes()) {
            error!(error = %e, "error writing to overlay repair log");
        }
    }
}

/// Civil date from a day count, days since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

fn split_timestamp(now: SystemTime) -> (i64, u32, u32, u64, u64, u64, u64) {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_epoch.as_secs();
    let (year, month, day) = civil_from_days((secs / 86400) as i64);
    let rem = secs % 86400;
    (
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
        since_epoch.subsec_micros() as u64,
    )
}

/// `YYYYMMDD_HHMMSS`, for repair directory names.
fn format_timestamp_compact(now: SystemTime) -> String {
    let (y, mo, d, h, mi, s, _) = split_timestamp(now);
    format!("{:04}{:02}{:02}_{:02}{:02}{:02}", y, mo, d, h, mi, s)
}

/// `YYYY-MM-DD HH:MM:SS.micros`, for repair log lines.
fn format_timestamp_log(now: SystemTime) -> String {
    let (y, mo, d, h, mi, s, us) = split_timestamp(now);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
        y, mo, d, h, mi, s, us
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_overlay() -> (tempfile::TempDir, Arc<OverlayRoot>) {
        let tmp = tempfile::tempdir().unwrap();
        let root = Arc::new(OverlayRoot::new(tmp.path().join("local")));
        root.initialize(true, false).unwrap();
        (tmp, root)
    }

    fn save_dir_record(root: &OverlayRoot, inode: InodeNumber, dir: &OverlayDir) {
        root.save_record(inode, codec::DIR_HEADER, &codec::encode_dir(dir))
            .unwrap();
    }

    fn dir_entry(ino: u64) -> OverlayEntry {
        OverlayEntry {
            mode: mode::DIR | 0o755,
            inode: Some(InodeNumber::from_raw(ino)),
            object_id: None,
        }
    }

    fn file_entry(ino: u64) -> OverlayEntry {
        OverlayEntry {
            mode: mode::REG | 0o644,
            inode: Some(InodeNumber::from_raw(ino)),
            object_id: None,
        }
    }

    #[test]
    fn clean_overlay_scans_clean() {
        let (_tmp, root) = new_overlay();
        let mut dir = OverlayDir::new();
        dir.add("f".into(), file_entry(2)).unwrap();
        save_dir_record(&root, ROOT_INODE, &dir);
        root.save_record(InodeNumber::from_raw(2), codec::FILE_HEADER, b"hi")
            .unwrap();

        let mut checker = OverlayChecker::new(root, None, None);
        checker.scan_for_errors().unwrap();
        assert!(checker.errors().is_empty());
        assert_eq!(
            checker.next_inode_number().unwrap(),
            InodeNumber::from_raw(3)
        );
    }

    #[test]
    fn corrupt_record_is_archived_and_replaced() {
        let (_tmp, root) = new_overlay();
        let sub = InodeNumber::from_raw(2);
        let mut dir = OverlayDir::new();
        dir.add("p".into(), dir_entry(2)).unwrap();
        save_dir_record(&root, ROOT_INODE, &dir);
        // Zero-byte record: too short for even a header.
        fs::write(root.record_path(sub), b"").unwrap();

        let mut checker = OverlayChecker::new(root.clone(), None, None);
        checker.scan_for_errors().unwrap();
        assert!(checker
            .errors()
            .iter()
            .any(|e| matches!(e, FsckError::InodeData { inode, .. } if *inode == sub)));

        let report = checker.repair_errors().unwrap().unwrap();
        assert!(report.fixed_errors >= 1);
        // The replacement is a valid empty directory record.
        let payload = root.read_record(sub, codec::DIR_HEADER).unwrap().unwrap();
        assert!(codec::decode_dir(sub, &payload).unwrap().is_empty());
        // The broken bytes were archived under lost+found.
        let lost = report.repair_dir.join("lost+found");
        assert!(lost.join("1").join("p").exists());
    }

    #[test]
    fn orphan_directory_is_archived_with_contents() {
        let (_tmp, root) = new_overlay();
        save_dir_record(&root, ROOT_INODE, &OverlayDir::new());

        // Inode 2 is a directory holding a file (inode 3), but nothing
        // references inode 2.
        let orphan = InodeNumber::from_raw(2);
        let child = InodeNumber::from_raw(3);
        let mut orphan_dir = OverlayDir::new();
        orphan_dir.add("data.txt".into(), file_entry(3)).unwrap();
        save_dir_record(&root, orphan, &orphan_dir);
        root.save_record(child, codec::FILE_HEADER, b"precious")
            .unwrap();

        let mut checker = OverlayChecker::new(root.clone(), None, None);
        checker.scan_for_errors().unwrap();
        assert!(checker
            .errors()
            .iter()
            .any(|e| matches!(e, FsckError::OrphanInode { inode } if *inode == orphan)));

        let report = checker.repair_errors().unwrap().unwrap();
        let archived = report
            .repair_dir
            .join("lost+found")
            .join("2")
            .join("data.txt");
        assert_eq!(fs::read(archived).unwrap(), b"precious");
        assert!(!root.has_record(orphan));
        assert!(!root.has_record(child));
    }

    #[test]
    fn orphan_symlink_is_restored_as_symlink() {
        let (_tmp, root) = new_overlay();
        save_dir_record(&root, ROOT_INODE, &OverlayDir::new());

        let orphan = InodeNumber::from_raw(2);
        let target = InodeNumber::from_raw(3);
        let mut orphan_dir = OverlayDir::new();
        orphan_dir
            .add(
                "link".into(),
                OverlayEntry {
                    mode: mode::LNK | 0o777,
                    inode: Some(target),
                    object_id: None,
                },
            )
            .unwrap();
        save_dir_record(&root, orphan, &orphan_dir);
        root.save_record(target, codec::FILE_HEADER, b"../elsewhere")
            .unwrap();

        let mut checker = OverlayChecker::new(root.clone(), None, None);
        checker.scan_for_errors().unwrap();
        let report = checker.repair_errors().unwrap().unwrap();

        let archived = report.repair_dir.join("lost+found").join("2").join("link");
        let link = fs::read_link(archived).unwrap();
        assert_eq!(link.to_str().unwrap(), "../elsewhere");
    }

    #[test]
    fn missing_materialized_child_gets_a_replacement() {
        let (_tmp, root) = new_overlay();
        let mut dir = OverlayDir::new();
        dir.add("gone".into(), file_entry(2)).unwrap();
        save_dir_record(&root, ROOT_INODE, &dir);
        // No record for inode 2 at all.

        let mut checker = OverlayChecker::new(root.clone(), None, None);
        checker.scan_for_errors().unwrap();
        assert!(checker
            .errors()
            .iter()
            .any(|e| matches!(e, FsckError::MissingMaterializedInode { .. })));

        checker.repair_errors().unwrap().unwrap();
        // The replacement is an empty file.
        assert_eq!(
            root.read_record(InodeNumber::from_raw(2), codec::FILE_HEADER)
                .unwrap(),
            Some(Vec::new())
        );
    }

    #[test]
    fn missing_materialized_child_dematerializes_when_scm_knows_it() {
        struct FixedLookup;
        impl ScmLookup for FixedLookup {
            fn lookup(&self, path: &BStr) -> Option<Bytes> {
                (path == "gone").then(|| Bytes::from_static(b"blob:gone-v1"))
            }
        }

        let (_tmp, root) = new_overlay();
        let mut dir = OverlayDir::new();
        dir.add("gone".into(), file_entry(2)).unwrap();
        save_dir_record(&root, ROOT_INODE, &dir);

        let lookup = FixedLookup;
        let mut checker = OverlayChecker::new(root.clone(), None, Some(&lookup));
        checker.scan_for_errors().unwrap();
        checker.repair_errors().unwrap().unwrap();

        let payload = root
            .read_record(ROOT_INODE, codec::DIR_HEADER)
            .unwrap()
            .unwrap();
        let repaired = codec::decode_dir(ROOT_INODE, &payload).unwrap();
        let entry = repaired.get(b"gone").unwrap();
        assert_eq!(entry.object_id, Some(Bytes::from_static(b"blob:gone-v1")));
        assert_eq!(entry.inode, None);
        // No replacement record was created.
        assert!(!root.has_record(InodeNumber::from_raw(2)));
    }

    #[test]
    fn stale_next_inode_number_is_reported() {
        let (_tmp, root) = new_overlay();
        let mut dir = OverlayDir::new();
        dir.add("f".into(), file_entry(9)).unwrap();
        save_dir_record(&root, ROOT_INODE, &dir);
        root.save_record(InodeNumber::from_raw(9), codec::FILE_HEADER, b"")
            .unwrap();

        let mut checker =
            OverlayChecker::new(root, Some(InodeNumber::from_raw(5)), None);
        checker.scan_for_errors().unwrap();
        assert!(checker
            .errors()
            .iter()
            .any(|e| matches!(e, FsckError::BadNextInodeNumber { .. })));
        assert_eq!(
            checker.next_inode_number().unwrap(),
            InodeNumber::from_raw(10)
        );
    }

    #[test]
    fn timestamp_formatting_is_civil() {
        // 2024-03-01 12:34:56 UTC
        let t = UNIX_EPOCH + Duration::from_secs(1709296496);
        assert_eq!(format_timestamp_compact(t), "20240301_123456");
        assert!(format_timestamp_log(t).starts_with("2024-03-01 12:34:56."));
    }
}
