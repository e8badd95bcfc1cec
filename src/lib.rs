pub mod checkout;
pub mod error;
pub mod model;
pub mod overlay;
pub mod store;

pub use checkout::{
    CheckoutAction, CheckoutContext, Conflict, ConflictType, DirectoryInode, FileInode,
    InodeFuture, InodePtr, RenameLock, RenameLockToken,
};
pub use error::{Result, SapwoodError};
pub use model::{Blob, Hash, Tree, TreeEntry, TreeEntryType};
pub use overlay::{
    DirContents, DirEntry, InodeMetadata, InodeMetadataTable, InodeNumber, Overlay, OverlayChecker,
    OverlayFile,
};
pub use store::ObjectStore;
