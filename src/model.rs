//! Source-control object model: hashes, tree entries, trees, and blobs.
//!
//! These are the immutable snapshot-side types. The overlay-side types
//! (directory entries keyed by inode number) live in `overlay::types`.

use std::fmt;
use std::sync::Arc;

/// Width of an object hash in bytes.
pub const HASH_LEN: usize = 20;

/// An opaque fixed-width identifier for an object in the object store.
///
/// Two hashes are equal iff their byte contents are equal. The "empty"
/// hash never appears here: materialized overlay entries carry no hash at
/// all (`Option<Hash>` is `None`), so every `Hash` value references a real
/// object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Hash(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; HASH_LEN] = bytes.try_into().ok()?;
        Some(Hash(bytes))
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != HASH_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; HASH_LEN];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(Hash(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The kind of a source-control tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEntryType {
    Tree,
    Regular,
    Executable,
    Symlink,
}

impl TreeEntryType {
    pub fn is_tree(self) -> bool {
        matches!(self, TreeEntryType::Tree)
    }
}

/// One name in a source-control snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub mode: u32,
    pub entry_type: TreeEntryType,
    pub hash: Hash,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, mode: u32, entry_type: TreeEntryType, hash: Hash) -> Self {
        TreeEntry {
            name: name.into(),
            mode,
            entry_type,
            hash,
        }
    }
}

/// A source-control directory snapshot: entries ordered by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Tree { entries }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn get_entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

/// A file body loaded from the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    hash: Hash,
    contents: Arc<Vec<u8>>,
}

impl Blob {
    pub fn new(hash: Hash, contents: Vec<u8>) -> Self {
        Blob {
            hash,
            contents: Arc::new(contents),
        }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}
