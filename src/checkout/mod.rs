mod action;
mod context;
mod inode;

pub use action::CheckoutAction;
pub use context::{CheckoutContext, Conflict, ConflictType, RenameLock, RenameLockToken};
pub use inode::{DirectoryInode, FileInode, InodeBase, InodeFuture, InodePtr};
