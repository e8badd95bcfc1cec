use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::Hash;

/// A durable 64-bit identifier for a filesystem node, unique within one
/// overlay lifetime. `0` is reserved as "unallocated" and `1` is the root.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeNumber(u64);

impl InodeNumber {
    pub const ROOT: InodeNumber = InodeNumber(1);

    pub const fn new(value: u64) -> Self {
        InodeNumber(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InodeNumber({})", self.0)
    }
}

/// One name in an overlay directory.
///
/// A materialized entry has no hash: its authoritative content lives in the
/// overlay. An unmaterialized entry references the object-store object
/// identified by its hash. `initial_mode` persists until the inode is first
/// loaded, at which point authoritative mode moves to the metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub initial_mode: u32,
    pub inode_number: InodeNumber,
    pub hash: Option<Hash>,
}

impl DirEntry {
    pub fn materialized(initial_mode: u32, inode_number: InodeNumber) -> Self {
        DirEntry {
            initial_mode,
            inode_number,
            hash: None,
        }
    }

    pub fn unmaterialized(initial_mode: u32, inode_number: InodeNumber, hash: Hash) -> Self {
        DirEntry {
            initial_mode,
            inode_number,
            hash: Some(hash),
        }
    }

    pub fn is_materialized(&self) -> bool {
        self.hash.is_none()
    }

    pub fn is_directory(&self) -> bool {
        mode_is_directory(self.initial_mode)
    }
}

/// The in-memory contents of one overlay directory, ordered by name.
/// Names are non-empty, contain no path separator, and are unique.
pub type DirContents = BTreeMap<String, DirEntry>;

pub(crate) fn mode_is_directory(mode: u32) -> bool {
    mode & (libc::S_IFMT as u32) == libc::S_IFDIR as u32
}

/// The serialized form of a directory record. Field names are the stable
/// cross-version encoding; old records may omit `inode_number`, which
/// `Overlay::load_dir` migrates on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirRecord {
    pub entries: BTreeMap<String, RecordEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl RecordEntry {
    /// An absent or empty hash means the entry is materialized.
    pub fn is_materialized(&self) -> bool {
        match &self.hash {
            None => true,
            Some(hex) => hex.is_empty(),
        }
    }

    pub fn is_directory(&self) -> bool {
        mode_is_directory(self.mode)
    }
}

impl From<&DirEntry> for RecordEntry {
    fn from(entry: &DirEntry) -> Self {
        RecordEntry {
            mode: entry.initial_mode,
            inode_number: Some(entry.inode_number.get()),
            hash: entry.hash.as_ref().map(Hash::to_hex),
        }
    }
}

impl DirRecord {
    pub fn from_contents(contents: &DirContents) -> Self {
        DirRecord {
            entries: contents
                .iter()
                .map(|(name, entry)| (name.clone(), RecordEntry::from(entry)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HASH_LEN;

    fn hash_of(byte: u8) -> Hash {
        Hash::from_bytes([byte; HASH_LEN])
    }

    #[test]
    fn test_materialized_entries_have_no_hash() {
        let entry = DirEntry::materialized(0o100644, InodeNumber::new(7));
        assert!(entry.is_materialized());
        assert!(!entry.is_directory());

        let entry = DirEntry::unmaterialized(
            libc::S_IFDIR as u32 | 0o755,
            InodeNumber::new(8),
            hash_of(1),
        );
        assert!(!entry.is_materialized());
        assert!(entry.is_directory());
    }

    #[test]
    fn test_record_round_trip() {
        let mut contents = DirContents::new();
        contents.insert(
            "data.bin".to_string(),
            DirEntry::unmaterialized(0o100644, InodeNumber::new(12), hash_of(9)),
        );
        contents.insert(
            "scratch".to_string(),
            DirEntry::materialized(libc::S_IFDIR as u32 | 0o755, InodeNumber::new(13)),
        );

        let record = DirRecord::from_contents(&contents);
        let json = serde_json::to_string(&record).unwrap();
        let parsed: DirRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);

        let data = &parsed.entries["data.bin"];
        assert!(!data.is_materialized());
        assert_eq!(data.hash.as_deref(), Some(hash_of(9).to_hex().as_str()));

        let scratch = &parsed.entries["scratch"];
        assert!(scratch.is_materialized());
        assert!(scratch.is_directory());
    }

    #[test]
    fn test_legacy_record_parses_without_inode_numbers() {
        let json = r#"{"entries":{"old.txt":{"mode":33188}}}"#;
        let record: DirRecord = serde_json::from_str(json).unwrap();
        let entry = &record.entries["old.txt"];
        assert_eq!(entry.inode_number, None);
        assert!(entry.is_materialized());
    }

    #[test]
    fn test_empty_hash_string_means_materialized() {
        let entry = RecordEntry {
            mode: 0o100644,
            inode_number: Some(4),
            hash: Some(String::new()),
        };
        assert!(entry.is_materialized());
    }
}
