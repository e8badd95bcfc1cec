use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

use crate::overlay::InodeNumber;

/// A held token proving the caller is inside the rename-exclusion region.
/// Parent-driven entry replacement and removal require one; recursing into
/// a subdirectory does not.
pub type RenameLockToken = OwnedMutexGuard<()>;

/// The mount-wide rename lock. Held for the duration of a checkout phase
/// so directory structure cannot change underneath the entry actions.
#[derive(Clone, Default)]
pub struct RenameLock {
    inner: Arc<tokio::sync::Mutex<()>>,
}

impl RenameLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> RenameLockToken {
        Arc::clone(&self.inner).lock_owned().await
    }
}

/// The kinds of conflict a checkout can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictType {
    /// An error occurred while processing this entry.
    Error,
    /// The entry differs from the old snapshot on disk.
    Modified,
    /// The new snapshot removes an entry that was modified on disk.
    RemovedModified,
    /// An untracked entry on disk is in the way of the new snapshot.
    UntrackedAdded,
    /// The old snapshot has an entry that is already missing on disk.
    MissingRemoved,
    /// A directory slated for removal still has entries.
    DirectoryNotEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub kind: ConflictType,
    pub inode: InodeNumber,
}

/// Per-checkout shared state consumed by the entry actions.
///
/// Recording a conflict is the normal outcome for a modified file in
/// non-force mode; it is not an error. With `force_update` the conflict is
/// still recorded but reconciliation proceeds anyway.
pub struct CheckoutContext {
    force_update: bool,
    rename_lock: RenameLockToken,
    conflicts: Mutex<Vec<Conflict>>,
}

impl CheckoutContext {
    pub fn new(force_update: bool, rename_lock: RenameLockToken) -> Self {
        CheckoutContext {
            force_update,
            rename_lock,
            conflicts: Mutex::new(Vec::new()),
        }
    }

    pub fn force_update(&self) -> bool {
        self.force_update
    }

    pub fn rename_lock(&self) -> &RenameLockToken {
        &self.rename_lock
    }

    pub fn add_conflict(&self, kind: ConflictType, inode: InodeNumber) {
        tracing::debug!("checkout conflict {:?} on inode {}", kind, inode);
        self.conflicts.lock().push(Conflict { kind, inode });
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        self.conflicts.lock().clone()
    }
}
