pub mod backing;
pub mod checker;
mod file_handle;
pub mod metadata;
pub mod types;

pub use backing::{BackingOverlay, InodeContent, OverlayFsStats, FILE_HEADER_ID};
pub use checker::{Anomaly, OverlayChecker};
pub use file_handle::OverlayFile;
pub use metadata::{InodeMetadata, InodeMetadataTable};
pub use types::{DirContents, DirEntry, DirRecord, InodeNumber, RecordEntry};

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use crate::error::{Result, SapwoodError};
use crate::model::Hash;

const IO_COUNT_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;
const IO_CLOSED_MASK: u64 = 1 << 63;

/// Progress reporting for the recovery scan: `(scanned, total)` records.
pub type ProgressCallback = Box<dyn FnMut(u64, u64) + Send>;

/// The concurrency-safe facade over the backing store.
///
/// The overlay owns the monotonic inode-number allocator, the I/O gate
/// that makes shutdown clean, and a single background worker that first
/// runs initialization (including recovery after an unclean shutdown) and
/// then drains the garbage-collection queue. All access to persisted
/// overlay state from the rest of the system goes through this type.
pub struct Overlay {
    inner: Arc<OverlayInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct OverlayInner {
    backing: BackingOverlay,
    // Monotonic allocator cursor. Zero until initialization publishes the
    // starting value; inode numbers are never reused within a lifetime.
    next_inode_number: AtomicU64,
    // Bit 63 is the closed flag, bits 0..62 count in-flight storage
    // operations. See Overlay::close.
    outstanding_io: AtomicU64,
    last_io_drained: Event,
    gc_queue: Mutex<GcQueue>,
    gc_condvar: Condvar,
    metadata: OnceLock<Arc<InodeMetadataTable>>,
    had_clean_startup: AtomicBool,
}

#[derive(Default)]
struct GcQueue {
    items: VecDeque<GcItem>,
    stop: bool,
}

enum GcItem {
    /// Recursively remove everything reachable through this record.
    Remove(DirRecord),
    /// Barrier: completes once every earlier item has been drained.
    Flush(oneshot::Sender<()>),
}

impl Overlay {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Overlay {
            inner: Arc::new(OverlayInner {
                backing: BackingOverlay::new(dir.as_ref()),
                next_inode_number: AtomicU64::new(0),
                outstanding_io: AtomicU64::new(0),
                last_io_drained: Event::default(),
                gc_queue: Mutex::new(GcQueue::default()),
                gc_condvar: Condvar::new(),
                metadata: OnceLock::new(),
                had_clean_startup: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Dispatch initialization to the background worker and return a future
    /// for its completion. On success the worker transitions into the GC
    /// loop; on failure the future carries the initialization error.
    pub fn initialize(
        &self,
        progress: Option<ProgressCallback>,
    ) -> impl std::future::Future<Output = Result<()>> {
        let (tx, rx) = oneshot::channel::<Result<()>>();

        let mut worker = self.worker.lock();
        if worker.is_some() {
            let _ = tx.send(Err(SapwoodError::InvariantViolation(
                "overlay initialized twice".to_string(),
            )));
        } else {
            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name("overlay-gc".to_string())
                .spawn(move || {
                    let result = inner.init_overlay(progress);
                    let ok = result.is_ok();
                    let _ = tx.send(result);
                    if ok {
                        inner.gc_loop();
                    }
                });
            match spawned {
                Ok(handle) => *worker = Some(handle),
                Err(e) => tracing::error!("failed to spawn overlay worker: {}", e),
            }
        }
        drop(worker);

        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(SapwoodError::InvariantViolation(
                    "overlay worker terminated before initialization completed".to_string(),
                )),
            }
        }
    }

    /// Allocate a fresh inode number. Allocation is a total order observed
    /// by all threads; numbers are never reused. Must not be called before
    /// `initialize` has published the starting value.
    pub fn allocate_inode_number(&self) -> InodeNumber {
        let previous = self.inner.next_inode_number.fetch_add(1, Ordering::AcqRel);
        debug_assert_ne!(previous, 0, "allocate_inode_number called before initialize");
        InodeNumber::new(previous)
    }

    /// The highest inode number allocated so far.
    pub fn max_inode_number(&self) -> InodeNumber {
        let next = self.inner.next_inode_number.load(Ordering::Acquire);
        debug_assert!(next > 1, "max_inode_number called before initialize");
        InodeNumber::new(next.saturating_sub(1))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.outstanding_io.load(Ordering::Acquire) & IO_CLOSED_MASK != 0
    }

    /// Whether the last session shut down cleanly (no recovery scan ran).
    pub fn had_clean_startup(&self) -> bool {
        self.inner.had_clean_startup.load(Ordering::Acquire)
    }

    pub fn inode_metadata_table(&self) -> Option<Arc<InodeMetadataTable>> {
        self.inner.metadata.get().cloned()
    }

    /// Load the directory contents for `inode`, migrating legacy records
    /// (children without inode numbers) by allocating fresh numbers and
    /// rewriting the record before returning.
    pub fn load_dir(&self, inode: InodeNumber) -> Result<Option<DirContents>> {
        let _io = self.inner.begin_io()?;
        let Some(record) = self.inner.backing.load_dir(inode)? else {
            return Ok(None);
        };

        let mut migrate = false;
        let mut contents = DirContents::new();
        for (name, entry) in &record.entries {
            let child = match entry.inode_number {
                Some(n) => InodeNumber::new(n),
                None => {
                    migrate = true;
                    self.allocate_inode_number()
                }
            };
            let hash = match &entry.hash {
                None => None,
                Some(hex) if hex.is_empty() => None,
                Some(hex) => Some(Hash::from_hex(hex).ok_or_else(|| SapwoodError::Corruption {
                    inode,
                    reason: format!("entry {:?} has malformed hash {:?}", name, hex),
                })?),
            };
            contents.insert(
                name.clone(),
                DirEntry {
                    initial_mode: entry.mode,
                    inode_number: child,
                    hash,
                },
            );
        }

        if migrate {
            tracing::debug!("migrating legacy directory record for inode {}", inode);
            self.inner.save_dir(inode, &contents)?;
        }
        Ok(Some(contents))
    }

    /// Serialize and persist the contents of `inode`. Every referenced
    /// child must already have an allocated inode number.
    pub fn save_dir(&self, inode: InodeNumber, contents: &DirContents) -> Result<()> {
        let _io = self.inner.begin_io()?;
        self.inner.save_dir(inode, contents)
    }

    /// Remove the directory record, file body, and metadata for `inode`.
    pub fn remove_inode(&self, inode: InodeNumber) -> Result<()> {
        let _io = self.inner.begin_io()?;
        self.inner.remove_inode(inode)
    }

    /// Remove `inode` immediately and hand its former children to the GC
    /// worker. Because the inode itself is gone before this returns, the
    /// caller can reuse the name without racing the worker; the allocator
    /// guarantees the children's numbers are never handed out again.
    pub fn recursively_remove(&self, inode: InodeNumber) -> Result<()> {
        let _io = self.inner.begin_io()?;
        let record = self.inner.backing.load_dir(inode)?;
        self.inner.remove_inode(inode)?;
        if let Some(record) = record {
            let mut queue = self.inner.gc_queue.lock();
            if !queue.stop {
                queue.items.push_back(GcItem::Remove(record));
                self.inner.gc_condvar.notify_one();
            }
        }
        Ok(())
    }

    /// A barrier whose completion proves every previously enqueued GC item
    /// has been drained.
    pub fn flush_pending(&self) -> impl std::future::Future<Output = Result<()>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.gc_queue.lock();
            if queue.stop {
                drop(tx);
            } else {
                queue.items.push_back(GcItem::Flush(tx));
                self.inner.gc_condvar.notify_one();
            }
        }
        async move { rx.await.map_err(|_| SapwoodError::OverlayClosed) }
    }

    pub fn has_inode(&self, inode: InodeNumber) -> Result<bool> {
        let _io = self.inner.begin_io()?;
        Ok(self.inner.backing.has_inode(inode))
    }

    pub fn open_file(&self, inode: InodeNumber, header_id: &[u8; 4]) -> Result<OverlayFile> {
        let _io = self.inner.begin_io()?;
        self.inner.check_allocated(inode, "open_file")?;
        let file = self.inner.backing.open_file(inode, header_id)?;
        Ok(OverlayFile::new(inode, Arc::downgrade(&self.inner), file))
    }

    pub fn open_file_no_verify(&self, inode: InodeNumber) -> Result<OverlayFile> {
        let _io = self.inner.begin_io()?;
        self.inner.check_allocated(inode, "open_file_no_verify")?;
        let file = self.inner.backing.open_file_no_verify(inode)?;
        Ok(OverlayFile::new(inode, Arc::downgrade(&self.inner), file))
    }

    pub fn create_file(&self, inode: InodeNumber, contents: &[u8]) -> Result<OverlayFile> {
        let _io = self.inner.begin_io()?;
        self.inner.check_allocated(inode, "create_file")?;
        let file = self.inner.backing.create_file(inode, contents)?;
        Ok(OverlayFile::new(inode, Arc::downgrade(&self.inner), file))
    }

    pub fn stat_fs(&self) -> Result<OverlayFsStats> {
        let _io = self.inner.begin_io()?;
        self.inner.backing.stat_fs()
    }

    /// Shut the overlay down: stop and join the worker, wait for in-flight
    /// storage operations, flush metadata, and persist the allocator cursor
    /// with the clean-shutdown marker. After this returns no storage
    /// operation is in flight and any new one fails with `OverlayClosed`.
    /// Idempotent.
    pub fn close(&self) {
        {
            let mut queue = self.inner.gc_queue.lock();
            queue.stop = true;
        }
        self.inner.gc_condvar.notify_one();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("overlay worker panicked during shutdown");
            }
        }
        // Unreached flush barriers resolve with OverlayClosed when their
        // senders drop here.
        self.inner.gc_queue.lock().items.clear();

        if !self.inner.backing.initialized() {
            return;
        }

        // The worker is joined, so nobody else can publish a new cursor.
        let next = self.inner.next_inode_number.load(Ordering::Acquire);

        self.inner.close_and_wait_for_io();

        if let Some(table) = self.inner.metadata.get() {
            if let Err(e) = table.flush() {
                tracing::error!("failed to flush inode metadata table: {}", e);
            }
        }

        let next = (next != 0).then(|| InodeNumber::new(next));
        if let Err(e) = self.inner.backing.close(next) {
            tracing::error!("failed to close backing overlay: {}", e);
        }
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.close();
    }
}

impl OverlayInner {
    /// Take one slot on the I/O gate, failing if the overlay is closed.
    pub(crate) fn begin_io(&self) -> Result<IoGuard<'_>> {
        let mut current = self.outstanding_io.load(Ordering::SeqCst);
        while current & IO_CLOSED_MASK == 0 {
            match self.outstanding_io.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(IoGuard { inner: self }),
                Err(actual) => current = actual,
            }
        }
        Err(SapwoodError::OverlayClosed)
    }

    fn close_and_wait_for_io(&self) {
        let outstanding = self.outstanding_io.fetch_or(IO_CLOSED_MASK, Ordering::SeqCst);
        if outstanding & IO_COUNT_MASK != 0 {
            self.last_io_drained.wait();
        }
    }

    fn init_overlay(&self, mut progress: Option<ProgressCallback>) -> Result<()> {
        let _io = self.begin_io()?;

        let next = match self.backing.init()? {
            Some(next) => {
                self.had_clean_startup.store(true, Ordering::Release);
                next
            }
            None => {
                // Missing next-inode-number data means the previous session
                // did not shut down cleanly; scan for damage and recompute
                // the counter while doing so.
                tracing::warn!(
                    "overlay {} was not shut down cleanly, running recovery scan",
                    self.backing.root().display()
                );
                let mut checker = OverlayChecker::new(&self.backing);
                checker.scan(|scanned, total| {
                    if let Some(cb) = progress.as_mut() {
                        cb(scanned, total);
                    }
                })?;
                checker.repair()?;
                checker.next_inode_number()
            }
        };
        self.next_inode_number.store(next.get(), Ordering::Release);

        let table = InodeMetadataTable::open(self.backing.metadata_path())?;
        let _ = self.metadata.set(Arc::new(table));
        Ok(())
    }

    fn check_allocated(&self, inode: InodeNumber, operation: &str) -> Result<()> {
        let cursor = self.next_inode_number.load(Ordering::Acquire);
        if inode.get() >= cursor {
            return Err(SapwoodError::InvariantViolation(format!(
                "{} called with unallocated inode number {} (cursor {})",
                operation, inode, cursor
            )));
        }
        Ok(())
    }

    fn save_dir(&self, inode: InodeNumber, contents: &DirContents) -> Result<()> {
        self.check_allocated(inode, "save_dir")?;
        let cursor = self.next_inode_number.load(Ordering::Acquire);
        for (name, entry) in contents {
            if name.is_empty() {
                return Err(SapwoodError::InvariantViolation(format!(
                    "save_dir called with an empty entry name in inode {}",
                    inode
                )));
            }
            if entry.inode_number.get() >= cursor {
                return Err(SapwoodError::InvariantViolation(format!(
                    "save_dir entry {:?} in inode {} uses unallocated inode number {} (cursor {})",
                    name, inode, entry.inode_number, cursor
                )));
            }
        }
        self.backing.save_dir(inode, &DirRecord::from_contents(contents))
    }

    fn remove_inode(&self, inode: InodeNumber) -> Result<()> {
        if let Some(table) = self.metadata.get() {
            table.free_inode(inode);
        }
        self.backing.remove_inode(inode)
    }

    /// The worker's main loop after initialization: wait for GC work, drain
    /// the queue in FIFO order, and process each batch. Exits once the stop
    /// flag is set and the queue is empty.
    fn gc_loop(&self) {
        loop {
            let batch: Vec<GcItem> = {
                let mut queue = self.gc_queue.lock();
                while queue.items.is_empty() {
                    if queue.stop {
                        return;
                    }
                    self.gc_condvar.wait(&mut queue);
                }
                queue.items.drain(..).collect()
            };

            for item in batch {
                self.handle_gc_item(item);
            }
        }
    }

    fn handle_gc_item(&self, item: GcItem) {
        let record = match item {
            GcItem::Flush(tx) => {
                let _ = tx.send(());
                return;
            }
            GcItem::Remove(record) => record,
        };

        let Ok(_io) = self.begin_io() else {
            // close() joins the worker before setting the closed bit, so
            // this is unreachable in normal operation.
            return;
        };

        // Walk the discarded subtree breadth-first. Only directories are
        // queued; everything else is removed as it is encountered. A
        // failure on one inode never aborts the rest of the walk.
        let mut queue: VecDeque<InodeNumber> = VecDeque::new();
        self.gc_scan_record(&record, &mut queue);

        while let Some(inode) = queue.pop_front() {
            let record = match self.backing.load_dir(inode) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!("gc failed to load directory record for inode {}: {}", inode, e);
                    None
                }
            };
            self.gc_remove(inode);
            if let Some(record) = record {
                self.gc_scan_record(&record, &mut queue);
            }
        }
    }

    fn gc_scan_record(&self, record: &DirRecord, queue: &mut VecDeque<InodeNumber>) {
        for entry in record.entries.values() {
            let Some(inode) = entry.inode_number else {
                // Legacy-only: records written by this version always carry
                // child inode numbers.
                continue;
            };
            let inode = InodeNumber::new(inode);
            if entry.is_directory() {
                queue.push_back(inode);
            } else {
                self.gc_remove(inode);
            }
        }
    }

    fn gc_remove(&self, inode: InodeNumber) {
        if let Err(e) = self.remove_inode(inode) {
            tracing::error!("gc failed to remove overlay data for inode {}: {}", inode, e);
        }
    }
}

pub(crate) struct IoGuard<'a> {
    inner: &'a OverlayInner,
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        let previous = self.inner.outstanding_io.fetch_sub(1, Ordering::SeqCst);
        debug_assert_ne!(previous & IO_COUNT_MASK, 0, "I/O gate underflow");
        // If the overlay closed while we ran and we were the last in-flight
        // operation, wake the closing thread.
        if previous & IO_CLOSED_MASK != 0 && previous & IO_COUNT_MASK == 1 {
            self.inner.last_io_drained.post();
        }
    }
}

/// A single-shot event: `wait` blocks until `post` has been called.
#[derive(Default)]
struct Event {
    posted: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    fn post(&self) {
        *self.posted.lock() = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut posted = self.posted.lock();
        while !*posted {
            self.condvar.wait(&mut posted);
        }
    }
}
