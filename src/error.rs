use thiserror::Error;

use crate::overlay::InodeNumber;

pub type Result<T> = std::result::Result<T, SapwoodError>;

#[derive(Error, Debug)]
pub enum SapwoodError {
    /// A storage operation raced a shutdown. Once the overlay is closed,
    /// every storage operation fails with this without touching disk.
    #[error("overlay is closed")]
    OverlayClosed,

    #[error("corrupt overlay data for inode {inode}: {reason}")]
    Corruption { inode: InodeNumber, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An object-store or inode load failed during a checkout action,
    /// tagged with the stage that failed ("old tree", "new blob", ...).
    #[error("error getting {stage}: {source}")]
    ObjectLoad {
        stage: &'static str,
        source: Box<SapwoodError>,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

impl SapwoodError {
    /// Wrap a load failure with the stage tag of the load that produced it.
    pub fn object_load(stage: &'static str, source: SapwoodError) -> SapwoodError {
        SapwoodError::ObjectLoad {
            stage,
            source: Box::new(source),
        }
    }
}
