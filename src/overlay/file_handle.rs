use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Weak;

use parking_lot::Mutex;

use crate::error::{Result, SapwoodError};
use crate::overlay::backing::FILE_HEADER_LEN;
use crate::overlay::types::InodeNumber;
use crate::overlay::OverlayInner;

/// A handle to one overlay file body.
///
/// The handle holds only a weak reference to the overlay, so a handle that
/// outlives the overlay does not resurrect it: each operation attempts an
/// upgrade and fails with `OverlayClosed` once the overlay is gone. While
/// the upgrade succeeds the operation also occupies a slot on the overlay's
/// I/O gate, so `Overlay::close` waits for it.
pub struct OverlayFile {
    inode: InodeNumber,
    overlay: Weak<OverlayInner>,
    file: Mutex<File>,
}

impl OverlayFile {
    pub(crate) fn new(inode: InodeNumber, overlay: Weak<OverlayInner>, file: File) -> Self {
        OverlayFile {
            inode,
            overlay,
            file: Mutex::new(file),
        }
    }

    pub fn inode(&self) -> InodeNumber {
        self.inode
    }

    fn overlay(&self) -> Result<std::sync::Arc<OverlayInner>> {
        self.overlay.upgrade().ok_or(SapwoodError::OverlayClosed)
    }

    /// Length of the body contents, excluding the header.
    pub fn len(&self) -> Result<u64> {
        let overlay = self.overlay()?;
        let _io = overlay.begin_io()?;
        let file = self.file.lock();
        let total = file.metadata()?.len();
        Ok(total.saturating_sub(FILE_HEADER_LEN))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read_all(&self) -> Result<Vec<u8>> {
        let overlay = self.overlay()?;
        let _io = overlay.begin_io()?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(FILE_HEADER_LEN))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        Ok(contents)
    }

    /// Replace the body contents, leaving the header intact.
    pub fn write_all(&self, contents: &[u8]) -> Result<()> {
        let overlay = self.overlay()?;
        let _io = overlay.begin_io()?;
        let mut file = self.file.lock();
        file.set_len(FILE_HEADER_LEN)?;
        file.seek(SeekFrom::Start(FILE_HEADER_LEN))?;
        file.write_all(contents)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let overlay = self.overlay()?;
        let _io = overlay.begin_io()?;
        let file = self.file.lock();
        file.sync_all()?;
        Ok(())
    }
}
