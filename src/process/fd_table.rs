use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::fs::file::File;

/// Handles 0..=2 are console sentinels; user files start here.
pub const FD_USER_MIN: usize = 3;
/// Table size; add() fails once every slot below this is taken.
pub const FDCOUNT_LIMIT: usize = 128;

/// One descriptor-table slot. dup2 aliases clone the Arc, so aliased
/// descriptors share the underlying open file (and its offset); the Arc
/// count is the dup count, and the file closes when it reaches zero.
#[derive(Clone)]
pub enum FdEntry {
    Stdin,
    Stdout,
    Stderr,
    File(Arc<Mutex<File>>),
}

/// Per-process map from small integer handles to open files.
pub struct FdTable {
    slots: Vec<Option<FdEntry>>,
}

impl FdTable {
    pub fn new() -> Self {
        let mut slots: Vec<Option<FdEntry>> = alloc::vec![None; FDCOUNT_LIMIT];
        slots[0] = Some(FdEntry::Stdin);
        slots[1] = Some(FdEntry::Stdout);
        slots[2] = Some(FdEntry::Stderr);
        FdTable { slots }
    }

    /// Install FILE at the first free handle >= 3; -1 when full.
    pub fn add(&mut self, file: Arc<Mutex<File>>) -> i32 {
        for fd in FD_USER_MIN..self.slots.len() {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(FdEntry::File(file));
                return fd as i32;
            }
        }
        -1
    }

    pub fn get(&self, fd: i32) -> Option<FdEntry> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize).and_then(|s| s.clone())
    }

    /// Drop handle FD. The console sentinels at 0..=2 are never closed.
    pub fn close(&mut self, fd: i32) -> bool {
        let fd = fd as usize;
        if fd < FD_USER_MIN || fd >= self.slots.len() {
            return false;
        }
        self.slots[fd].take().is_some()
    }

    /// POSIX-style dup2. Aliases share the underlying file object.
    pub fn dup2(&mut self, old_fd: i32, new_fd: i32) -> i32 {
        if new_fd < 0 || new_fd as usize >= self.slots.len() {
            return -1;
        }
        let entry = match self.get(old_fd) {
            Some(e) => e,
            None => return -1,
        };
        if old_fd == new_fd {
            return new_fd;
        }
        // Whatever was open at new_fd is dropped (sentinels have nothing
        // to close).
        self.slots[new_fd as usize] = Some(entry);
        new_fd
    }

    /// Copy for fork: every open file is duplicated, and descriptors that
    /// aliased one file in the parent still alias one file in the child.
    pub fn duplicate(&self) -> FdTable {
        let mut dup_map: BTreeMap<usize, Arc<Mutex<File>>> = BTreeMap::new();
        let slots = self
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref().map(|entry| match entry {
                    FdEntry::File(arc) => {
                        let key = Arc::as_ptr(arc) as usize;
                        let copy = dup_map
                            .entry(key)
                            .or_insert_with(|| Arc::new(Mutex::new(arc.lock().duplicate())));
                        FdEntry::File(copy.clone())
                    }
                    other => other.clone(),
                })
            })
            .collect();
        FdTable { slots }
    }

    pub fn open_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Some(FdEntry::File(_))))
            .count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::file::Node;

    fn open_file(contents: &[u8]) -> Arc<Mutex<File>> {
        let node = Node::new(0);
        node.lock().data = contents.to_vec();
        Arc::new(Mutex::new(File::new(node)))
    }

    #[test]
    fn user_fds_start_at_three() {
        let mut t = FdTable::new();
        assert_eq!(t.add(open_file(b"")), 3);
        assert_eq!(t.add(open_file(b"")), 4);
        t.close(3);
        assert_eq!(t.add(open_file(b"")), 3);
    }

    #[test]
    fn full_table_reports_minus_one() {
        let mut t = FdTable::new();
        for _ in FD_USER_MIN..FDCOUNT_LIMIT {
            assert_ne!(t.add(open_file(b"")), -1);
        }
        assert_eq!(t.add(open_file(b"")), -1);
    }

    #[test]
    fn sentinels_cannot_be_closed() {
        let mut t = FdTable::new();
        assert!(!t.close(0));
        assert!(!t.close(2));
        assert!(matches!(t.get(1), Some(FdEntry::Stdout)));
    }

    #[test]
    fn dup2_shares_the_underlying_offset() {
        let mut t = FdTable::new();
        let fd = t.add(open_file(b"ABCDE"));
        assert_eq!(t.dup2(fd, 5), 5);

        // A read through fd advances the offset seen through 5.
        if let Some(FdEntry::File(f)) = t.get(fd) {
            let mut buf = [0u8; 3];
            assert_eq!(f.lock().read(&mut buf), 3);
        }
        if let Some(FdEntry::File(f)) = t.get(5) {
            assert_eq!(f.lock().tell(), 3);
        }
    }

    #[test]
    fn dup2_edge_cases() {
        let mut t = FdTable::new();
        let fd = t.add(open_file(b"x"));
        assert_eq!(t.dup2(fd, fd), fd);
        assert_eq!(t.dup2(99, 5), -1);
        assert_eq!(t.dup2(fd, -1), -1);
        assert_eq!(t.dup2(fd, FDCOUNT_LIMIT as i32), -1);
        // dup of a sentinel is allowed.
        assert_eq!(t.dup2(0, 7), 7);
        assert!(matches!(t.get(7), Some(FdEntry::Stdin)));
    }

    #[test]
    fn duplicate_preserves_aliases_but_not_sharing_with_parent() {
        let mut t = FdTable::new();
        let fd = t.add(open_file(b"hello"));
        t.dup2(fd, 9);

        let child = t.duplicate();
        let (pa, ca, cb) = match (t.get(fd), child.get(fd), child.get(9)) {
            (Some(FdEntry::File(pa)), Some(FdEntry::File(ca)), Some(FdEntry::File(cb))) => {
                (pa, ca, cb)
            }
            _ => panic!("expected files"),
        };
        // Child aliases stay aliased to each other, not to the parent.
        assert!(Arc::ptr_eq(&ca, &cb));
        assert!(!Arc::ptr_eq(&pa, &ca));

        // Offsets diverge after the fork.
        let mut buf = [0u8; 2];
        ca.lock().read(&mut buf);
        assert_eq!(pa.lock().tell(), 0);
    }
}
