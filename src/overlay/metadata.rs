use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::overlay::types::InodeNumber;

/// Lightweight per-inode metadata: authoritative mode bits and timestamps
/// once an inode has been loaded. Until then the directory entry's
/// `initial_mode` stands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeMetadata {
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

/// The table from inode number to metadata, persisted alongside the
/// overlay. The inode layer writes through this table; the overlay only
/// frees slots when inodes are removed and flushes the table at shutdown.
pub struct InodeMetadataTable {
    path: PathBuf,
    entries: RwLock<BTreeMap<u64, InodeMetadata>>,
}

impl InodeMetadataTable {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    // Metadata is reconstructible from the inodes themselves,
                    // so a bad table is dropped rather than fatal.
                    tracing::warn!(
                        "discarding unreadable inode metadata table {}: {}",
                        path.display(),
                        e
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(InodeMetadataTable {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn set_metadata(&self, inode: InodeNumber, metadata: InodeMetadata) {
        self.entries.write().insert(inode.get(), metadata);
    }

    pub fn get_metadata(&self, inode: InodeNumber) -> Option<InodeMetadata> {
        self.entries.read().get(&inode.get()).copied()
    }

    /// Release the slot for a removed inode. Idempotent.
    pub fn free_inode(&self, inode: InodeNumber) {
        self.entries.write().remove(&inode.get());
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        let raw = {
            let entries = self.entries.read();
            serde_json::to_vec(&*entries)
        };
        match raw {
            Ok(raw) => {
                fs::write(&self.path, raw)?;
                Ok(())
            }
            Err(e) => {
                tracing::error!("failed to serialize inode metadata table: {}", e);
                Ok(())
            }
        }
    }
}
