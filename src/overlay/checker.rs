//! Recovery scan for an overlay that was not shut down cleanly.
//!
//! The checker walks every persisted record, logs each anomaly it finds,
//! computes the repairs, and recomputes the next free inode number as
//! `1 + max` over every inode number observed anywhere (including numbers
//! that are referenced but not backed by any record). It runs on a single
//! thread before the overlay accepts traffic.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Result, SapwoodError};
use crate::overlay::backing::{BackingOverlay, InodeContent};
use crate::overlay::types::{DirRecord, InodeNumber};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    CorruptRecord {
        inode: InodeNumber,
        reason: String,
    },
    DanglingChild {
        parent: InodeNumber,
        name: String,
        child: InodeNumber,
    },
    OrphanFileBody {
        inode: InodeNumber,
    },
    /// One inode number carries both a directory record and a file body.
    InodeCollision {
        inode: InodeNumber,
    },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::CorruptRecord { inode, reason } => {
                write!(f, "corrupt directory record for inode {}: {}", inode, reason)
            }
            Anomaly::DanglingChild {
                parent,
                name,
                child,
            } => write!(
                f,
                "directory {} entry {:?} references inode {} with no backing data",
                parent, name, child
            ),
            Anomaly::OrphanFileBody { inode } => {
                write!(f, "file body for inode {} is referenced by no directory", inode)
            }
            Anomaly::InodeCollision { inode } => {
                write!(f, "inode {} has both a directory record and a file body", inode)
            }
        }
    }
}

pub struct OverlayChecker<'a> {
    backing: &'a BackingOverlay,
    anomalies: Vec<Anomaly>,
    max_seen: u64,
    records: BTreeMap<u64, DirRecord>,
    // Repairs computed during scan, applied by repair().
    drop_entries: Vec<(InodeNumber, String)>,
    remove_records: Vec<InodeNumber>,
    remove_bodies: Vec<InodeNumber>,
}

impl<'a> OverlayChecker<'a> {
    pub fn new(backing: &'a BackingOverlay) -> Self {
        OverlayChecker {
            backing,
            anomalies: Vec::new(),
            max_seen: InodeNumber::ROOT.get(),
            records: BTreeMap::new(),
            drop_entries: Vec::new(),
            remove_records: Vec::new(),
            remove_bodies: Vec::new(),
        }
    }

    /// Walk every persisted record and classify the damage. `progress` is
    /// called with `(scanned, total)` as records are visited.
    pub fn scan<F>(&mut self, mut progress: F) -> Result<()>
    where
        F: FnMut(u64, u64),
    {
        let listed = self.backing.list()?;
        let total = listed.len() as u64;

        let mut bodies: BTreeSet<u64> = BTreeSet::new();
        let mut corrupt: BTreeSet<u64> = BTreeSet::new();

        for (scanned, (inode, content)) in listed.into_iter().enumerate() {
            self.max_seen = self.max_seen.max(inode.get());
            match content {
                InodeContent::FileBody => {
                    bodies.insert(inode.get());
                }
                InodeContent::Dir => match self.backing.load_dir(inode) {
                    Ok(Some(record)) => {
                        self.records.insert(inode.get(), record);
                    }
                    Ok(None) => {}
                    Err(SapwoodError::Corruption { reason, .. }) => {
                        corrupt.insert(inode.get());
                        self.note(Anomaly::CorruptRecord { inode, reason });
                        self.remove_records.push(inode);
                    }
                    Err(e) => return Err(e),
                },
            }
            progress(scanned as u64 + 1, total);
        }

        let mut referenced: BTreeSet<u64> = BTreeSet::new();
        let mut dangling: Vec<(InodeNumber, String, InodeNumber)> = Vec::new();
        let mut max_seen = self.max_seen;
        for (parent, record) in &self.records {
            for (name, entry) in &record.entries {
                let Some(child) = entry.inode_number else {
                    // Legacy entries are migrated on first load, not here.
                    continue;
                };
                max_seen = max_seen.max(child);
                referenced.insert(child);

                if !entry.is_materialized() {
                    continue;
                }
                let backed = if entry.is_directory() {
                    self.records.contains_key(&child)
                } else {
                    bodies.contains(&child)
                };
                if !backed {
                    dangling.push((
                        InodeNumber::new(*parent),
                        name.clone(),
                        InodeNumber::new(child),
                    ));
                }
            }
        }
        self.max_seen = max_seen;
        for (parent, name, child) in dangling {
            self.note(Anomaly::DanglingChild {
                parent,
                name: name.clone(),
                child,
            });
            self.drop_entries.push((parent, name));
        }

        for &body in &bodies {
            let inode = InodeNumber::new(body);
            if self.records.contains_key(&body) || corrupt.contains(&body) {
                self.note(Anomaly::InodeCollision { inode });
                self.remove_bodies.push(inode);
            } else if !referenced.contains(&body) && inode != InodeNumber::ROOT {
                self.note(Anomaly::OrphanFileBody { inode });
                self.remove_bodies.push(inode);
            }
        }

        Ok(())
    }

    fn note(&mut self, anomaly: Anomaly) {
        tracing::warn!("fsck: {}", anomaly);
        self.anomalies.push(anomaly);
    }

    /// Apply the repairs computed by `scan`: corrupt records and orphaned
    /// or colliding file bodies are removed, dangling references dropped
    /// from their parent directories.
    pub fn repair(&mut self) -> Result<()> {
        for inode in &self.remove_records {
            self.backing.remove_dir_record(*inode)?;
        }
        for inode in &self.remove_bodies {
            self.backing.remove_file_body(*inode)?;
        }

        let mut rewrite: BTreeMap<u64, DirRecord> = BTreeMap::new();
        for (parent, name) in &self.drop_entries {
            let record = rewrite.entry(parent.get()).or_insert_with(|| {
                self.records
                    .get(&parent.get())
                    .cloned()
                    .unwrap_or_default()
            });
            record.entries.remove(name);
        }
        for (parent, record) in rewrite {
            self.backing.save_dir(InodeNumber::new(parent), &record)?;
        }
        Ok(())
    }

    /// `1 + max` over every inode number observed during the scan.
    pub fn next_inode_number(&self) -> InodeNumber {
        InodeNumber::new(self.max_seen + 1)
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::types::RecordEntry;
    use tempfile::tempdir;

    fn dir_entry(ino: u64) -> RecordEntry {
        RecordEntry {
            mode: libc::S_IFDIR as u32 | 0o755,
            inode_number: Some(ino),
            hash: None,
        }
    }

    fn file_entry(ino: u64) -> RecordEntry {
        RecordEntry {
            mode: 0o100644,
            inode_number: Some(ino),
            hash: None,
        }
    }

    fn scan(backing: &BackingOverlay) -> OverlayChecker<'_> {
        let mut checker = OverlayChecker::new(backing);
        checker.scan(|_, _| {}).unwrap();
        checker
    }

    #[test]
    fn test_empty_overlay_scans_clean() {
        let dir = tempdir().unwrap();
        let backing = BackingOverlay::new(dir.path());
        backing.init().unwrap();

        let checker = scan(&backing);
        assert!(checker.anomalies().is_empty());
        assert_eq!(checker.next_inode_number(), InodeNumber::new(2));
    }

    #[test]
    fn test_next_inode_number_covers_referenced_children() {
        let dir = tempdir().unwrap();
        let backing = BackingOverlay::new(dir.path());
        backing.init().unwrap();

        // Root references an unmaterialized child with a high inode number
        // that has no backing data of its own.
        let mut record = DirRecord::default();
        record.entries.insert(
            "remote".to_string(),
            RecordEntry {
                mode: 0o100644,
                inode_number: Some(90),
                hash: Some("aa".repeat(20)),
            },
        );
        backing.save_dir(InodeNumber::ROOT, &record).unwrap();

        let checker = scan(&backing);
        assert!(checker.anomalies().is_empty());
        assert_eq!(checker.next_inode_number(), InodeNumber::new(91));
    }

    #[test]
    fn test_orphan_body_is_removed() {
        let dir = tempdir().unwrap();
        let backing = BackingOverlay::new(dir.path());
        backing.init().unwrap();

        backing.save_dir(InodeNumber::ROOT, &DirRecord::default()).unwrap();
        backing.create_file(InodeNumber::new(12), b"orphan").unwrap();

        let mut checker = scan(&backing);
        assert_eq!(
            checker.anomalies(),
            &[Anomaly::OrphanFileBody {
                inode: InodeNumber::new(12)
            }]
        );

        checker.repair().unwrap();
        assert!(!backing.has_inode(InodeNumber::new(12)));
        assert_eq!(checker.next_inode_number(), InodeNumber::new(13));
    }

    #[test]
    fn test_dangling_child_is_dropped_from_parent() {
        let dir = tempdir().unwrap();
        let backing = BackingOverlay::new(dir.path());
        backing.init().unwrap();

        let mut record = DirRecord::default();
        record.entries.insert("ghost".to_string(), file_entry(8));
        record.entries.insert("real".to_string(), file_entry(9));
        backing.save_dir(InodeNumber::ROOT, &record).unwrap();
        backing.create_file(InodeNumber::new(9), b"real").unwrap();

        let mut checker = scan(&backing);
        assert_eq!(
            checker.anomalies(),
            &[Anomaly::DanglingChild {
                parent: InodeNumber::ROOT,
                name: "ghost".to_string(),
                child: InodeNumber::new(8),
            }]
        );

        checker.repair().unwrap();
        let repaired = backing.load_dir(InodeNumber::ROOT).unwrap().unwrap();
        assert!(!repaired.entries.contains_key("ghost"));
        assert!(repaired.entries.contains_key("real"));
    }

    #[test]
    fn test_corrupt_record_and_collision() {
        let dir = tempdir().unwrap();
        let backing = BackingOverlay::new(dir.path());
        backing.init().unwrap();

        let mut record = DirRecord::default();
        record.entries.insert("sub".to_string(), dir_entry(4));
        backing.save_dir(InodeNumber::ROOT, &record).unwrap();
        backing.save_dir(InodeNumber::new(4), &DirRecord::default()).unwrap();

        // Same inode also carries a file body.
        backing.create_file(InodeNumber::new(4), b"collide").unwrap();
        // And a third inode holds garbage.
        backing.save_dir(InodeNumber::new(6), &DirRecord::default()).unwrap();
        std::fs::write(dir.path().join("06").join("6.dir"), b"junk").unwrap();

        let mut checker = scan(&backing);
        let kinds: Vec<_> = checker
            .anomalies()
            .iter()
            .map(|a| match a {
                Anomaly::CorruptRecord { inode, .. } => ("corrupt", inode.get()),
                Anomaly::InodeCollision { inode } => ("collision", inode.get()),
                Anomaly::OrphanFileBody { inode } => ("orphan", inode.get()),
                Anomaly::DanglingChild { child, .. } => ("dangling", child.get()),
            })
            .collect();
        assert!(kinds.contains(&("corrupt", 6)));
        assert!(kinds.contains(&("collision", 4)));

        checker.repair().unwrap();
        assert!(backing.load_dir(InodeNumber::new(6)).unwrap().is_none());
        // The directory record survives the collision; the body does not.
        assert!(backing.load_dir(InodeNumber::new(4)).unwrap().is_some());
        assert!(backing.open_file_no_verify(InodeNumber::new(4)).is_err());
    }
}
