//! The per-entry checkout state machine.
//!
//! One action reconciles a single name in a directory between the old
//! snapshot, the desired new snapshot, and the current on-disk inode. Many
//! actions run concurrently; each fans out up to three loads, inspects the
//! settled results, and applies exactly one outcome: descend into a
//! subtree, replace the entry through the parent, or remove it.

use std::sync::Arc;

use crate::checkout::context::{CheckoutContext, ConflictType};
use crate::checkout::inode::{InodeFuture, InodePtr};
use crate::error::{Result, SapwoodError};
use crate::model::{Tree, TreeEntry};
use crate::store::ObjectStore;

enum LoadedObject {
    Tree(Arc<Tree>),
    Blob(Arc<crate::model::Blob>),
}

enum InodeSource {
    Ready(InodePtr),
    Pending(InodeFuture),
}

pub struct CheckoutAction {
    old_entry: TreeEntry,
    new_entry: Option<TreeEntry>,
    inode: InodeSource,
}

impl CheckoutAction {
    /// An action over an already-resolved inode. `new_entry` is `None`
    /// when the entry is removed in the new snapshot.
    pub fn new(old_entry: TreeEntry, new_entry: Option<TreeEntry>, inode: InodePtr) -> Self {
        CheckoutAction {
            old_entry,
            new_entry,
            inode: InodeSource::Ready(inode),
        }
    }

    /// An action whose inode is still loading; the inode future settles
    /// together with the object loads.
    pub fn with_pending_inode(
        old_entry: TreeEntry,
        new_entry: Option<TreeEntry>,
        inode: InodeFuture,
    ) -> Self {
        CheckoutAction {
            old_entry,
            new_entry,
            inode: InodeSource::Pending(inode),
        }
    }

    pub fn name(&self) -> &str {
        &self.old_entry.name
    }

    /// Resolve all loads, then apply the outcome. Completes after the
    /// resulting on-disk mutation (if any) completes. A recorded conflict
    /// with no mutation is a successful outcome, not an error.
    pub async fn run(self, ctx: &CheckoutContext, store: &dyn ObjectStore) -> Result<()> {
        let CheckoutAction {
            old_entry,
            new_entry,
            inode,
        } = self;

        let old_load = async {
            if old_entry.entry_type.is_tree() {
                store
                    .get_tree(&old_entry.hash)
                    .await
                    .map(LoadedObject::Tree)
                    .map_err(|e| SapwoodError::object_load("old tree", e))
            } else {
                store
                    .get_blob(&old_entry.hash)
                    .await
                    .map(LoadedObject::Blob)
                    .map_err(|e| SapwoodError::object_load("old blob", e))
            }
        };
        let new_load = async {
            match &new_entry {
                None => Ok(None),
                Some(entry) if entry.entry_type.is_tree() => store
                    .get_tree(&entry.hash)
                    .await
                    .map(|tree| Some(LoadedObject::Tree(tree)))
                    .map_err(|e| SapwoodError::object_load("new tree", e)),
                Some(entry) => store
                    .get_blob(&entry.hash)
                    .await
                    .map(|blob| Some(LoadedObject::Blob(blob)))
                    .map_err(|e| SapwoodError::object_load("new blob", e)),
            }
        };
        let inode_load = async {
            match inode {
                InodeSource::Ready(ptr) => Ok(ptr),
                InodeSource::Pending(future) => future
                    .await
                    .map_err(|e| SapwoodError::object_load("inode", e)),
            }
        };

        // All three loads settle before any result is inspected, so the
        // slots need no further synchronization.
        let (old_result, new_result, inode_result) = tokio::join!(old_load, new_load, inode_load);

        let (old_obj, new_obj, inode) = match (old_result, new_result, inode_result) {
            (Ok(old), Ok(new), Ok(inode)) => (old, new, inode),
            (old, new, inode) => {
                let errors: Vec<SapwoodError> = [old.err(), new.err(), inode.err()]
                    .into_iter()
                    .flatten()
                    .collect();
                for error in &errors {
                    tracing::error!(
                        "error performing checkout action for {:?}: {}",
                        old_entry.name,
                        error
                    );
                }
                // Only the first error propagates.
                return match errors.into_iter().next() {
                    Some(first) => Err(first),
                    None => Err(SapwoodError::InvariantViolation(
                        "checkout load failed without a recorded error".to_string(),
                    )),
                };
            }
        };

        let conflict = has_conflict(ctx, &old_entry, &old_obj, &new_obj, &inode).await?;
        if conflict && !ctx.force_update() {
            // The conflict has been recorded; leaving the entry alone is
            // the successful outcome in non-force mode.
            return Ok(());
        }

        // Unmodified on disk and unchanged between snapshots: nothing to do.
        if !conflict && new_entry.as_ref() == Some(&old_entry) {
            return Ok(());
        }

        match (new_obj, &new_entry) {
            (Some(LoadedObject::Tree(new_tree)), Some(entry)) => {
                if let Some(dir) = inode.as_directory() {
                    let old_tree = match &old_obj {
                        LoadedObject::Tree(tree) => Some(Arc::clone(tree)),
                        LoadedObject::Blob(_) => None,
                    };
                    dir.checkout(ctx, old_tree, new_tree).await
                } else {
                    // File becoming a directory: the parent swaps the entry.
                    let parent = inode.parent(ctx.rename_lock());
                    parent.checkout_replace_entry(ctx, inode.clone(), entry).await
                }
            }
            (Some(LoadedObject::Blob(_)), Some(entry)) => {
                let parent = inode.parent(ctx.rename_lock());
                parent.checkout_replace_entry(ctx, inode.clone(), entry).await
            }
            (None, _) => {
                let parent = inode.parent(ctx.rename_lock());
                parent
                    .checkout_remove_child(ctx, &old_entry.name, inode.clone())
                    .await
            }
            (Some(_), None) => Err(SapwoodError::InvariantViolation(
                "checkout action loaded a new object without a new entry".to_string(),
            )),
        }
    }
}

/// Compare the old snapshot entry against the on-disk inode, recording a
/// conflict on the context when they diverge.
async fn has_conflict(
    ctx: &CheckoutContext,
    old_entry: &TreeEntry,
    old_obj: &LoadedObject,
    new_obj: &Option<LoadedObject>,
    inode: &InodePtr,
) -> Result<bool> {
    match old_obj {
        LoadedObject::Tree(_) => {
            if inode.as_directory().is_none() {
                // Was a directory in the old snapshot, replaced with a
                // file on disk.
                ctx.add_conflict(ConflictType::Modified, inode.ino());
                return Ok(true);
            }
            if matches!(new_obj, Some(LoadedObject::Blob(_))) {
                // The directory collapses into a file. No recursion will
                // run to surface modified leaves, so the collapse itself
                // is the conflict.
                ctx.add_conflict(ConflictType::Modified, inode.ino());
                return Ok(true);
            }
            // An intact directory reports conflicts from the recursion on
            // its leaves, not at this level.
            Ok(false)
        }
        LoadedObject::Blob(blob) => {
            let Some(file) = inode.as_file() else {
                // Was a file, replaced with a directory on disk.
                ctx.add_conflict(ConflictType::Modified, inode.ino());
                return Ok(true);
            };
            if !file.is_same_as(blob, old_entry.mode).await? {
                ctx.add_conflict(ConflictType::Modified, inode.ino());
                return Ok(true);
            }
            Ok(false)
        }
    }
}
