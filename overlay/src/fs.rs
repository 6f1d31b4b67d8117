//! The sharded on-disk layout shared by the file-backed catalog and content
//! store.
//!
//! ```text
//! <mount>/local/
//!    info                  version marker, also the lock file
//!    next-inode-number     8 bytes u64 LE; present only after clean shutdown
//!    00/ 01/ … ff/         one record file per inode, sharded by low byte
//!    tmp/                  staging area for atomic record writes
//!    fsck/…                created by the checker when repairs run
//! ```
//!
//! Record files are named by decimal inode number inside their shard. A
//! directory inode's record (header `OVDR`) and a file inode's contents
//! (header `OVFL`) live side by side in the same shards; the header tells
//! them apart.
//!
//! All functions here do blocking IO; async callers wrap them in
//! `spawn_blocking`.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{self, HEADER_LEN};
use crate::inode_number::{InodeNumber, ROOT_INODE};
use crate::OverlayError;

const INFO_FILE: &str = "info";
const NEXT_INODE_FILE: &str = "next-inode-number";
const TMP_DIR: &str = "tmp";
pub const NUM_SHARDS: u32 = 256;

/// 4-byte magic at the start of the info file, followed by a u32 BE version.
const INFO_MAGIC: [u8; 4] = [0xed, 0xe0, 0x00, 0x01];
const INFO_VERSION: u32 = 1;

/// Handle to the overlay's on-disk root directory.
///
/// Holds the info file open for as long as the overlay is in use; the flock
/// on it guarantees single-process ownership.
pub struct OverlayRoot {
    dir: PathBuf,
    info_file: Mutex<Option<File>>,
}

impl OverlayRoot {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        OverlayRoot {
            dir: dir.into(),
            info_file: Mutex::new(None),
        }
    }

    pub fn local_dir(&self) -> &Path {
        &self.dir
    }

    pub fn initialized(&self) -> bool {
        self.info_file.lock().is_some()
    }

    /// Opens (or creates) the overlay directory, acquires the lock, and
    /// returns the recorded next inode number.
    ///
    /// `None` means the previous shutdown was unclean and the caller must
    /// recompute the next number by scanning, normally by running the
    /// checker.
    pub fn initialize(
        &self,
        create_if_missing: bool,
        bypass_lock: bool,
    ) -> Result<Option<InodeNumber>, OverlayError> {
        let info_path = self.dir.join(INFO_FILE);
        let mut created = false;
        let info_file = match File::open(&info_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !create_if_missing {
                    return Err(OverlayError::MissingOverlay(self.dir.clone()));
                }
                self.create_layout()?;
                created = true;
                File::open(&info_path)?
            }
            Err(e) => return Err(e.into()),
        };

        self.validate_info_file(&info_file)?;

        let locked = unsafe { libc::flock(info_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if locked != 0 {
            if bypass_lock {
                warn!(dir = %self.dir.display(), "overlay is locked, proceeding anyway");
            } else {
                return Err(OverlayError::Locked(self.dir.clone()));
            }
        }

        *self.info_file.lock() = Some(info_file);

        if created {
            return Ok(Some(ROOT_INODE.next()?));
        }
        self.take_next_inode_number()
    }

    /// Persists the next inode number and releases the lock.
    pub fn close(&self, next_inode: Option<InodeNumber>) -> Result<(), OverlayError> {
        if let Some(next) = next_inode {
            self.write_next_inode_number(next)?;
        }
        // Dropping the file releases the flock.
        *self.info_file.lock() = None;
        Ok(())
    }

    fn create_layout(&self) -> Result<(), OverlayError> {
        fs::create_dir_all(&self.dir)?;
        for shard in 0..NUM_SHARDS {
            fs::create_dir_all(self.dir.join(format!("{:02x}", shard)))?;
        }
        fs::create_dir_all(self.dir.join(TMP_DIR))?;

        let mut contents = Vec::with_capacity(8);
        contents.extend_from_slice(&INFO_MAGIC);
        contents.extend_from_slice(&INFO_VERSION.to_be_bytes());
        self.write_file_atomic(&self.dir.join(INFO_FILE), &contents)?;
        Ok(())
    }

    fn validate_info_file(&self, mut file: &File) -> Result<(), OverlayError> {
        let mut header = [0u8; 8];
        file.read_exact(&mut header).map_err(|e| {
            OverlayError::Storage(format!(
                "truncated overlay info file in {}: {}",
                self.dir.display(),
                e
            ))
        })?;
        if header[..4] != INFO_MAGIC {
            return Err(OverlayError::Storage(format!(
                "bad magic in overlay info file in {}",
                self.dir.display()
            )));
        }
        let version = u32::from_be_bytes(header[4..8].try_into().unwrap());
        if version != INFO_VERSION {
            return Err(OverlayError::UnsupportedVersion(version));
        }
        Ok(())
    }

    /// Reads and deletes the clean-shutdown marker.
    ///
    /// The marker's presence is what indicates a clean shutdown, so it must
    /// be gone while we are running: a crash from here on leaves no marker
    /// and forces a scan on the next mount.
    fn take_next_inode_number(&self) -> Result<Option<InodeNumber>, OverlayError> {
        let path = self.dir.join(NEXT_INODE_FILE);
        let contents = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;

        let Ok(raw) = <[u8; 8]>::try_from(contents.as_slice()) else {
            warn!(
                len = contents.len(),
                "next-inode-number file has the wrong size, full scan required"
            );
            return Ok(None);
        };
        match InodeNumber::new(u64::from_le_bytes(raw)) {
            Some(n) if n > ROOT_INODE => Ok(Some(n)),
            _ => {
                warn!("next-inode-number file holds an invalid value, full scan required");
                Ok(None)
            }
        }
    }

    pub fn write_next_inode_number(&self, next: InodeNumber) -> Result<(), OverlayError> {
        self.write_file_atomic(
            &self.dir.join(NEXT_INODE_FILE),
            &next.get().to_le_bytes(),
        )
    }

    fn write_file_atomic(&self, path: &Path, contents: &[u8]) -> Result<(), OverlayError> {
        let tmp = self.dir.join(TMP_DIR).join(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "atomic".to_string()),
        );
        // The tmp directory may not exist yet when writing the very first
        // info file.
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_data()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn shard_dir(&self, shard: u8) -> PathBuf {
        self.dir.join(format!("{:02x}", shard))
    }

    pub fn record_path(&self, inode: InodeNumber) -> PathBuf {
        self.shard_dir(inode.shard()).join(inode.to_string())
    }

    fn tmp_record_path(&self, inode: InodeNumber) -> PathBuf {
        // Creating in an empty directory and renaming into the shard is
        // substantially faster on some filesystems than creating in place.
        self.dir.join(TMP_DIR).join(inode.to_string())
    }

    /// Writes a record file atomically: header + payload staged under tmp/,
    /// committed by rename. The root inode's record is additionally synced
    /// before the rename; losing any other record after a crash is
    /// recoverable, losing the root makes the overlay unmountable.
    pub fn save_record(
        &self,
        inode: InodeNumber,
        identifier: &[u8; 4],
        payload: &[u8],
    ) -> Result<File, OverlayError> {
        let tmp = self.tmp_record_path(inode);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp)?;

        let result = (|| -> Result<(), OverlayError> {
            file.write_all(&codec::make_header(identifier))?;
            file.write_all(payload)?;
            if inode == ROOT_INODE {
                file.sync_data()?;
            }
            fs::rename(&tmp, self.record_path(inode))?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        debug!(inode = %inode, "wrote overlay record");
        Ok(file)
    }

    /// Opens an existing record, optionally validating its header.
    pub fn open_record(
        &self,
        inode: InodeNumber,
        identifier: Option<&[u8; 4]>,
    ) -> Result<File, OverlayError> {
        let mut file = File::open(self.record_path(inode))?;
        if let Some(identifier) = identifier {
            let mut header = [0u8; HEADER_LEN];
            file.read_exact(&mut header).map_err(|e| {
                OverlayError::DataCorruption {
                    inode,
                    reason: format!("short header read: {}", e),
                }
            })?;
            codec::validate_header(inode, &header, identifier)?;
        }
        Ok(file)
    }

    /// Reads a whole record and returns its payload, or `None` if no record
    /// exists for this inode.
    pub fn read_record(
        &self,
        inode: InodeNumber,
        identifier: &[u8; 4],
    ) -> Result<Option<Vec<u8>>, OverlayError> {
        let contents = match fs::read(self.record_path(inode)) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let payload = codec::validate_header(inode, &contents, identifier)?;
        Ok(Some(payload.to_vec()))
    }

    /// Removes a record; missing records are not an error.
    pub fn remove_record(&self, inode: InodeNumber) -> Result<(), OverlayError> {
        match fs::remove_file(self.record_path(inode)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn has_record(&self, inode: InodeNumber) -> bool {
        self.record_path(inode).is_file()
    }

    /// Reads just a record's header identifier, to tell directory records
    /// from file contents during scans.
    pub fn record_identifier(&self, inode: InodeNumber) -> Result<[u8; 4], OverlayError> {
        let mut file = File::open(self.record_path(inode))?;
        let mut identifier = [0u8; 4];
        file.read_exact(&mut identifier)
            .map_err(|e| OverlayError::DataCorruption {
                inode,
                reason: format!("short header read: {}", e),
            })?;
        Ok(identifier)
    }

    /// Recomputes the next inode number by walking the directory records
    /// from the root down, then sweeping shard filenames to catch records
    /// whose parents were unlinked.
    pub fn scan_next_inode_number(&self) -> Result<InodeNumber, OverlayError> {
        let mut max_inode = ROOT_INODE;
        let mut to_process = vec![ROOT_INODE];
        let mut saw_broken_dir = false;
        while let Some(dir_inode) = to_process.pop() {
            let dir = match self.read_record(dir_inode, codec::DIR_HEADER) {
                Ok(Some(payload)) => match codec::decode_dir(dir_inode, &payload) {
                    Ok(dir) => dir,
                    Err(e) => {
                        if !saw_broken_dir {
                            warn!(inode = %dir_inode, error = %e, "ignoring unreadable directory record during scan");
                            saw_broken_dir = true;
                        }
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(e) => {
                    if !saw_broken_dir {
                        warn!(inode = %dir_inode, error = %e, "ignoring unreadable directory record during scan");
                        saw_broken_dir = true;
                    }
                    continue;
                }
            };
            for (_, entry) in dir.entries() {
                let Some(child) = entry.inode else { continue };
                max_inode = max_inode.max(child);
                if entry.is_directory() {
                    to_process.push(child);
                }
            }
        }

        for shard in 0..NUM_SHARDS {
            let iter = match fs::read_dir(self.shard_dir(shard as u8)) {
                Ok(iter) => iter,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for dir_entry in iter {
                let dir_entry = dir_entry?;
                if let Some(n) = dir_entry
                    .file_name()
                    .to_str()
                    .and_then(|s| s.parse::<u64>().ok())
                    .and_then(InodeNumber::new)
                {
                    max_inode = max_inode.max(n);
                }
            }
        }

        max_inode.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::{mode, OverlayDir, OverlayEntry};

    fn overlay_in(dir: &Path) -> OverlayRoot {
        OverlayRoot::new(dir.join("local"))
    }

    #[test]
    fn fresh_overlay_starts_after_root() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = overlay_in(tmp.path());
        let next = overlay.initialize(true, false).unwrap();
        assert_eq!(next, Some(InodeNumber::from_raw(2)));
        assert!(overlay.shard_dir(0xff).is_dir());
    }

    #[test]
    fn clean_shutdown_roundtrips_the_next_inode_number() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = overlay_in(tmp.path());
        overlay.initialize(true, false).unwrap();
        overlay.close(Some(InodeNumber::from_raw(42))).unwrap();

        let overlay = overlay_in(tmp.path());
        assert_eq!(
            overlay.initialize(false, false).unwrap(),
            Some(InodeNumber::from_raw(42))
        );
        // The marker is consumed: a crash now must look unclean.
        assert!(!overlay.local_dir().join("next-inode-number").exists());
    }

    #[test]
    fn unclean_shutdown_reports_none() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = overlay_in(tmp.path());
        overlay.initialize(true, false).unwrap();
        overlay.close(None).unwrap();

        let overlay = overlay_in(tmp.path());
        assert_eq!(overlay.initialize(false, false).unwrap(), None);
    }

    #[test]
    fn missing_overlay_is_an_error_without_create() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = overlay_in(tmp.path());
        assert!(matches!(
            overlay.initialize(false, false),
            Err(OverlayError::MissingOverlay(_))
        ));
    }

    #[test]
    fn second_open_fails_while_locked() {
        let tmp = tempfile::tempdir().unwrap();
        let first = overlay_in(tmp.path());
        first.initialize(true, false).unwrap();

        let second = overlay_in(tmp.path());
        assert!(matches!(
            second.initialize(false, false),
            Err(OverlayError::Locked(_))
        ));

        // bypass_lock proceeds anyway, for the offline checker.
        assert!(second.initialize(false, true).is_ok());
    }

    #[test]
    fn records_roundtrip_and_validate() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = overlay_in(tmp.path());
        overlay.initialize(true, false).unwrap();

        let ino = InodeNumber::from_raw(2);
        overlay
            .save_record(ino, codec::FILE_HEADER, b"hello")
            .unwrap();
        assert!(overlay.has_record(ino));
        assert_eq!(
            overlay.read_record(ino, codec::FILE_HEADER).unwrap(),
            Some(b"hello".to_vec())
        );
        // Reading it back as a directory record must fail on the header.
        assert!(overlay.read_record(ino, codec::DIR_HEADER).is_err());

        overlay.remove_record(ino).unwrap();
        assert!(!overlay.has_record(ino));
        assert_eq!(overlay.read_record(ino, codec::FILE_HEADER).unwrap(), None);
        // Double remove is fine.
        overlay.remove_record(ino).unwrap();
    }

    #[test]
    fn scan_recovers_the_next_inode_number() {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = overlay_in(tmp.path());
        overlay.initialize(true, false).unwrap();

        // Root lists one subdirectory (inode 5) with a file child (inode 9).
        let mut root = OverlayDir::new();
        root.add(
            "sub".into(),
            OverlayEntry {
                mode: mode::DIR | 0o755,
                inode: Some(InodeNumber::from_raw(5)),
                object_id: None,
            },
        )
        .unwrap();
        overlay
            .save_record(ROOT_INODE, codec::DIR_HEADER, &codec::encode_dir(&root))
            .unwrap();

        let mut sub = OverlayDir::new();
        sub.add(
            "f".into(),
            OverlayEntry {
                mode: mode::REG | 0o644,
                inode: Some(InodeNumber::from_raw(9)),
                object_id: None,
            },
        )
        .unwrap();
        overlay
            .save_record(
                InodeNumber::from_raw(5),
                codec::DIR_HEADER,
                &codec::encode_dir(&sub),
            )
            .unwrap();
        overlay
            .save_record(InodeNumber::from_raw(9), codec::FILE_HEADER, b"x")
            .unwrap();

        // An unlinked file with a larger inode number still bumps the scan.
        overlay
            .save_record(InodeNumber::from_raw(23), codec::FILE_HEADER, b"orphan")
            .unwrap();

        assert_eq!(
            overlay.scan_next_inode_number().unwrap(),
            InodeNumber::from_raw(24)
        );
    }
}
