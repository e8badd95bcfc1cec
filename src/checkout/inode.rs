//! The inode-layer interface the checkout consumes.
//!
//! The tree of live inodes (caching, locking, path resolution) lives above
//! this crate; the per-entry checkout only needs to ask an inode what it
//! is, compare a file against a blob, and hand structural mutations to the
//! parent directory.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::checkout::context::{CheckoutContext, RenameLockToken};
use crate::error::Result;
use crate::model::{Blob, Tree, TreeEntry};
use crate::overlay::InodeNumber;

/// A not-yet-resolved inode load, as produced by the containing directory
/// while the entry's inode is still being constructed.
pub type InodeFuture = BoxFuture<'static, Result<InodePtr>>;

pub trait InodeBase: Send + Sync {
    fn ino(&self) -> InodeNumber;

    /// The containing directory. Callers must not ask for the parent of
    /// the root inode.
    fn parent_dir(&self) -> Arc<dyn DirectoryInode>;
}

#[async_trait]
pub trait FileInode: InodeBase {
    /// Whether this file's content and mode match `blob` under `mode`.
    async fn is_same_as(&self, blob: &Blob, mode: u32) -> Result<bool>;
}

#[async_trait]
pub trait DirectoryInode: InodeBase {
    /// Recursively reconcile this directory from `old_tree` to `new_tree`.
    async fn checkout(
        &self,
        ctx: &CheckoutContext,
        old_tree: Option<Arc<Tree>>,
        new_tree: Arc<Tree>,
    ) -> Result<()>;

    /// Replace whatever `child` currently is in this directory with `entry`.
    async fn checkout_replace_entry(
        &self,
        ctx: &CheckoutContext,
        child: InodePtr,
        entry: &TreeEntry,
    ) -> Result<()>;

    /// Remove `child`, known to this directory as `name`.
    async fn checkout_remove_child(
        &self,
        ctx: &CheckoutContext,
        name: &str,
        child: InodePtr,
    ) -> Result<()>;
}

/// A reference to a live inode of either kind.
#[derive(Clone)]
pub enum InodePtr {
    File(Arc<dyn FileInode>),
    Directory(Arc<dyn DirectoryInode>),
}

impl InodePtr {
    pub fn ino(&self) -> InodeNumber {
        match self {
            InodePtr::File(file) => file.ino(),
            InodePtr::Directory(dir) => dir.ino(),
        }
    }

    pub fn as_file(&self) -> Option<Arc<dyn FileInode>> {
        match self {
            InodePtr::File(file) => Some(Arc::clone(file)),
            InodePtr::Directory(_) => None,
        }
    }

    pub fn as_directory(&self) -> Option<Arc<dyn DirectoryInode>> {
        match self {
            InodePtr::Directory(dir) => Some(Arc::clone(dir)),
            InodePtr::File(_) => None,
        }
    }

    /// The parent directory. Requires the rename lock: mutating directory
    /// structure through the parent is only safe inside the
    /// rename-exclusion region.
    pub fn parent(&self, _rename_lock: &RenameLockToken) -> Arc<dyn DirectoryInode> {
        match self {
            InodePtr::File(file) => file.parent_dir(),
            InodePtr::Directory(dir) => dir.parent_dir(),
        }
    }
}
