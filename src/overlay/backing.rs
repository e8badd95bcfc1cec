//! The physical persistence layer beneath the overlay facade.
//!
//! Everything is keyed by inode number and sharded into 256 directories by
//! the low byte: `<root>/<00..ff>/<ino>.dir` holds a serialized directory
//! record, `<root>/<00..ff>/<ino>.file` holds a file body behind a small
//! fixed header. `<root>/info.json` carries the persisted next-inode-number
//! and the clean-shutdown marker; it is exclusively locked while the
//! overlay is open so two processes cannot share one overlay directory.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SapwoodError};
use crate::overlay::types::{DirRecord, InodeNumber};

/// Header id for overlay file bodies.
pub const FILE_HEADER_ID: &[u8; 4] = b"SWOF";
const FILE_HEADER_VERSION: u32 = 1;
/// Bytes of header preceding the body contents: 4-byte id + version.
pub const FILE_HEADER_LEN: u64 = 8;

const INFO_FILE: &str = "info.json";
const METADATA_FILE: &str = "metadata.json";
const INFO_VERSION: u32 = 1;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct InfoFile {
    version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next_inode_number: Option<u64>,
    clean_shutdown: bool,
}

/// What kind of data is stored for an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeContent {
    Dir,
    FileBody,
}

/// Aggregate capacity and usage of the filesystem holding the overlay.
#[derive(Debug, Clone, Copy)]
pub struct OverlayFsStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub available_bytes: u64,
}

pub struct BackingOverlay {
    root: PathBuf,
    // Present while the overlay is open; holds the fs2 exclusive lock.
    info: Mutex<Option<File>>,
}

impl BackingOverlay {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        BackingOverlay {
            root: root.into(),
            info: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn initialized(&self) -> bool {
        self.info.lock().is_some()
    }

    /// Open the on-disk state. Returns the persisted next-inode number when
    /// the previous shutdown was clean, `None` when it was not (which the
    /// caller must answer with a recovery scan). A directory with no prior
    /// data counts as clean with a fresh counter.
    ///
    /// The info file is rewritten with the dirty marker immediately, so a
    /// crash between now and `close` is detectable on the next open.
    pub fn init(&self) -> Result<Option<InodeNumber>> {
        fs::create_dir_all(&self.root)?;

        let info_path = self.root.join(INFO_FILE);
        let existed = info_path.exists();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&info_path)?;
        file.try_lock_exclusive()?;

        let previous = if existed {
            let mut raw = String::new();
            file.read_to_string(&mut raw)?;
            match serde_json::from_str::<InfoFile>(&raw) {
                Ok(info) => Some(info),
                Err(e) => {
                    tracing::warn!(
                        "unreadable overlay info file {}: {}",
                        info_path.display(),
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        let next = match previous {
            Some(InfoFile {
                next_inode_number: Some(next),
                clean_shutdown: true,
                ..
            }) => Some(InodeNumber::new(next)),
            Some(_) => None,
            None if existed || self.has_shard_data()? => None,
            // Brand-new overlay: nothing to recover.
            None => Some(InodeNumber::new(InodeNumber::ROOT.get() + 1)),
        };

        write_info(
            &mut file,
            &InfoFile {
                version: INFO_VERSION,
                next_inode_number: None,
                clean_shutdown: false,
            },
        )?;

        *self.info.lock() = Some(file);
        Ok(next)
    }

    /// Persist `next_inode_number` (if provided) with the clean-shutdown
    /// marker and release the info-file lock. Without a number the dirty
    /// marker is left in place so the next open runs recovery. Idempotent.
    pub fn close(&self, next_inode_number: Option<InodeNumber>) -> Result<()> {
        let Some(mut file) = self.info.lock().take() else {
            return Ok(());
        };

        if let Some(next) = next_inode_number {
            write_info(
                &mut file,
                &InfoFile {
                    version: INFO_VERSION,
                    next_inode_number: Some(next.get()),
                    clean_shutdown: true,
                },
            )?;
        }
        // Dropping the handle releases the lock.
        Ok(())
    }

    fn shard_dir(&self, inode: InodeNumber) -> PathBuf {
        self.root.join(format!("{:02x}", inode.get() & 0xff))
    }

    fn dir_path(&self, inode: InodeNumber) -> PathBuf {
        self.shard_dir(inode).join(format!("{}.dir", inode.get()))
    }

    fn file_path(&self, inode: InodeNumber) -> PathBuf {
        self.shard_dir(inode).join(format!("{}.file", inode.get()))
    }

    fn has_shard_data(&self) -> Result<bool> {
        if !self.root.exists() {
            return Ok(false);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if is_shard_name(&entry.file_name().to_string_lossy())
                && entry.file_type()?.is_dir()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn load_dir(&self, inode: InodeNumber) -> Result<Option<DirRecord>> {
        let raw = match fs::read(self.dir_path(inode)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_slice(&raw).map_err(|e| SapwoodError::Corruption {
            inode,
            reason: format!("unparseable directory record: {}", e),
        })?;
        Ok(Some(record))
    }

    /// Atomically replace the directory record for `inode`: the record is
    /// written to a temp file in the shard and renamed into place.
    pub fn save_dir(&self, inode: InodeNumber, record: &DirRecord) -> Result<()> {
        let shard = self.shard_dir(inode);
        fs::create_dir_all(&shard)?;

        let serial = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = shard.join(format!(".{}.dir.tmp{}", inode.get(), serial));
        let raw = serde_json::to_vec(record).map_err(|e| {
            SapwoodError::InvariantViolation(format!(
                "failed to serialize directory record for inode {}: {}",
                inode, e
            ))
        })?;
        fs::write(&temp, raw)?;
        fs::rename(&temp, self.dir_path(inode))?;
        Ok(())
    }

    pub fn has_inode(&self, inode: InodeNumber) -> bool {
        self.dir_path(inode).exists() || self.file_path(inode).exists()
    }

    /// Remove both the directory record and any file body. Idempotent.
    pub fn remove_inode(&self, inode: InodeNumber) -> Result<()> {
        self.remove_dir_record(inode)?;
        self.remove_file_body(inode)?;
        Ok(())
    }

    pub fn remove_dir_record(&self, inode: InodeNumber) -> Result<()> {
        remove_if_present(&self.dir_path(inode))
    }

    pub fn remove_file_body(&self, inode: InodeNumber) -> Result<()> {
        remove_if_present(&self.file_path(inode))
    }

    /// Create a file body for `inode`, replacing any previous one. The
    /// returned handle is positioned at the start of the header.
    pub fn create_file(&self, inode: InodeNumber, contents: &[u8]) -> Result<File> {
        let shard = self.shard_dir(inode);
        fs::create_dir_all(&shard)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(inode))?;
        file.write_all(FILE_HEADER_ID)?;
        file.write_all(&FILE_HEADER_VERSION.to_le_bytes())?;
        file.write_all(contents)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    /// Open an existing file body, validating that its header id matches.
    pub fn open_file(&self, inode: InodeNumber, header_id: &[u8; 4]) -> Result<File> {
        let mut file = self.open_file_no_verify(inode)?;
        let mut header = [0u8; FILE_HEADER_LEN as usize];
        file.read_exact(&mut header).map_err(|_| SapwoodError::Corruption {
            inode,
            reason: "truncated file header".to_string(),
        })?;
        if &header[..4] != header_id {
            return Err(SapwoodError::Corruption {
                inode,
                reason: format!(
                    "unexpected file header id {:?}, wanted {:?}",
                    &header[..4],
                    header_id
                ),
            });
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    pub fn open_file_no_verify(&self, inode: InodeNumber) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(inode))?;
        Ok(file)
    }

    /// Every inode with persisted data, with what kind of data it holds. An
    /// inode carrying both a record and a body yields two entries.
    pub fn list(&self) -> Result<Vec<(InodeNumber, InodeContent)>> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return Ok(found);
        }
        for shard in fs::read_dir(&self.root)? {
            let shard = shard?;
            if !is_shard_name(&shard.file_name().to_string_lossy())
                || !shard.file_type()?.is_dir()
            {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                match parse_inode_file_name(&name) {
                    Some(parsed) => found.push(parsed),
                    None => {
                        tracing::warn!(
                            "ignoring unrecognized overlay file {}",
                            entry.path().display()
                        );
                    }
                }
            }
        }
        found.sort_by_key(|(inode, _)| inode.get());
        Ok(found)
    }

    pub fn stat_fs(&self) -> Result<OverlayFsStats> {
        let stats = fs2::statvfs(&self.root)?;
        Ok(OverlayFsStats {
            total_bytes: stats.total_space(),
            free_bytes: stats.free_space(),
            available_bytes: stats.available_space(),
        })
    }
}

fn write_info(file: &mut File, info: &InfoFile) -> Result<()> {
    let raw = serde_json::to_string_pretty(info).map_err(|e| {
        SapwoodError::InvariantViolation(format!("failed to serialize overlay info: {}", e))
    })?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(raw.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn is_shard_name(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

fn parse_inode_file_name(name: &str) -> Option<(InodeNumber, InodeContent)> {
    if let Some(stem) = name.strip_suffix(".dir") {
        return stem.parse().ok().map(|n| (InodeNumber::new(n), InodeContent::Dir));
    }
    if let Some(stem) = name.strip_suffix(".file") {
        return stem
            .parse()
            .ok()
            .map(|n| (InodeNumber::new(n), InodeContent::FileBody));
    }
    None
}
