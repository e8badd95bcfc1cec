//! Shared fixtures: an in-memory object store and a fake inode layer that
//! records the structural mutations a checkout asks for.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sapwood::{
    Blob, CheckoutContext, DirectoryInode, FileInode, Hash, InodeNumber, InodePtr, ObjectStore,
    Result, Tree, TreeEntry,
};

pub const HASH_LEN: usize = 20;

#[allow(dead_code)]
pub fn hash_of(byte: u8) -> Hash {
    Hash::from_bytes([byte; HASH_LEN])
}

/// An object store backed by two hash maps. Missing objects fail the load
/// future, which is how load-error propagation is exercised.
#[derive(Default)]
pub struct MemoryObjectStore {
    trees: HashMap<Hash, Arc<Tree>>,
    blobs: HashMap<Hash, Arc<Blob>>,
}

#[allow(dead_code)]
impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tree(&mut self, hash: Hash, tree: Tree) {
        self.trees.insert(hash, Arc::new(tree));
    }

    pub fn insert_blob(&mut self, hash: Hash, contents: &[u8]) {
        self.blobs.insert(hash, Arc::new(Blob::new(hash, contents.to_vec())));
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_tree(&self, hash: &Hash) -> Result<Arc<Tree>> {
        self.trees.get(hash).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no tree {} in store", hash),
            )
            .into()
        })
    }

    async fn get_blob(&self, hash: &Hash) -> Result<Arc<Blob>> {
        self.blobs.get(hash).cloned().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no blob {} in store", hash),
            )
            .into()
        })
    }
}

/// Every structural mutation a fake directory was asked to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirCall {
    Checkout {
        old_tree: Option<Hash>,
        new_tree_first_entry: Option<String>,
    },
    ReplaceEntry {
        child: InodeNumber,
        entry: TreeEntry,
    },
    RemoveChild {
        name: String,
        child: InodeNumber,
    },
}

pub struct FakeDirectory {
    ino: InodeNumber,
    parent: Option<Arc<FakeDirectory>>,
    calls: Mutex<Vec<DirCall>>,
}

#[allow(dead_code)]
impl FakeDirectory {
    pub fn new(ino: u64, parent: Option<Arc<FakeDirectory>>) -> Arc<Self> {
        Arc::new(FakeDirectory {
            ino: InodeNumber::new(ino),
            parent,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<DirCall> {
        self.calls.lock().clone()
    }
}

impl sapwood::checkout::InodeBase for FakeDirectory {
    fn ino(&self) -> InodeNumber {
        self.ino
    }

    fn parent_dir(&self) -> Arc<dyn DirectoryInode> {
        let parent = self.parent.clone().expect("fake directory has no parent");
        parent
    }
}

#[async_trait]
impl DirectoryInode for FakeDirectory {
    async fn checkout(
        &self,
        _ctx: &CheckoutContext,
        old_tree: Option<Arc<Tree>>,
        new_tree: Arc<Tree>,
    ) -> Result<()> {
        self.calls.lock().push(DirCall::Checkout {
            old_tree: old_tree
                .and_then(|tree| tree.entries().first().map(|e| e.hash)),
            new_tree_first_entry: new_tree.entries().first().map(|e| e.name.clone()),
        });
        Ok(())
    }

    async fn checkout_replace_entry(
        &self,
        _ctx: &CheckoutContext,
        child: InodePtr,
        entry: &TreeEntry,
    ) -> Result<()> {
        self.calls.lock().push(DirCall::ReplaceEntry {
            child: child.ino(),
            entry: entry.clone(),
        });
        Ok(())
    }

    async fn checkout_remove_child(
        &self,
        _ctx: &CheckoutContext,
        name: &str,
        child: InodePtr,
    ) -> Result<()> {
        self.calls.lock().push(DirCall::RemoveChild {
            name: name.to_string(),
            child: child.ino(),
        });
        Ok(())
    }
}

pub struct FakeFile {
    ino: InodeNumber,
    parent: Arc<FakeDirectory>,
    contents: Vec<u8>,
    mode: u32,
}

#[allow(dead_code)]
impl FakeFile {
    pub fn new(ino: u64, parent: Arc<FakeDirectory>, contents: &[u8], mode: u32) -> Arc<Self> {
        Arc::new(FakeFile {
            ino: InodeNumber::new(ino),
            parent,
            contents: contents.to_vec(),
            mode,
        })
    }
}

impl sapwood::checkout::InodeBase for FakeFile {
    fn ino(&self) -> InodeNumber {
        self.ino
    }

    fn parent_dir(&self) -> Arc<dyn DirectoryInode> {
        self.parent.clone()
    }
}

#[async_trait]
impl FileInode for FakeFile {
    async fn is_same_as(&self, blob: &Blob, mode: u32) -> Result<bool> {
        Ok(self.contents == blob.contents() && self.mode == mode)
    }
}
