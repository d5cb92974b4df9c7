use super::SharedFile;
use alloc::vec::Vec;

/// Per-process file-descriptor table: 256 slots, of which 0 and 1 are
/// reserved for the console and never allocated.
pub const FD_MAX: usize = 256;
pub const FD_FIRST: usize = 2;

pub struct FdTable {
    slots: Vec<Option<SharedFile>>,
}

impl FdTable {
    pub fn new() -> FdTable {
        let mut slots = Vec::with_capacity(FD_MAX);
        for _ in 0..FD_MAX {
            slots.push(None);
        }
        FdTable { slots }
    }

    /// Claim the lowest free descriptor for `file`. `None` when all 254
    /// allocatable slots are taken.
    pub fn allocate(&mut self, file: SharedFile) -> Option<usize> {
        for fd in FD_FIRST..FD_MAX {
            if self.slots[fd].is_none() {
                self.slots[fd] = Some(file);
                return Some(fd);
            }
        }
        None
    }

    pub fn get(&self, fd: usize) -> Option<SharedFile> {
        if (FD_FIRST..FD_MAX).contains(&fd) {
            self.slots[fd].clone()
        } else {
            None
        }
    }

    /// Drop the entry for `fd`; the file closes when its last reference
    /// goes away.
    pub fn release(&mut self, fd: usize) {
        if (FD_FIRST..FD_MAX).contains(&fd) {
            self.slots[fd] = None;
        }
    }

    /// Close every open descriptor (process exit).
    pub fn close_all(&mut self) {
        for slot in self.slots[FD_FIRST..].iter_mut() {
            *slot = None;
        }
    }

    /// Rebuild this table as a copy of `parent`: each open entry becomes a
    /// distinct handle sharing the inode, position and write-deny included.
    pub fn duplicate_from(&mut self, parent: &FdTable) {
        use alloc::sync::Arc;
        use spin::Mutex;

        for fd in FD_FIRST..FD_MAX {
            self.slots[fd] = parent.slots[fd]
                .as_ref()
                .map(|f| Arc::new(Mutex::new(f.lock().duplicate())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{create, open, remove};
    use alloc::sync::Arc;
    use spin::Mutex;

    fn shared(name: &str) -> SharedFile {
        Arc::new(Mutex::new(open(name).unwrap()))
    }

    #[test]
    fn fills_exactly_254_descriptors() {
        assert!(create("fd-fill", 1));
        let mut table = FdTable::new();
        for expected in FD_FIRST..FD_MAX {
            assert_eq!(table.allocate(shared("fd-fill")), Some(expected));
        }
        // The 255th open finds no slot.
        assert_eq!(table.allocate(shared("fd-fill")), None);
        remove("fd-fill");
    }

    #[test]
    fn release_reuses_lowest_slot() {
        assert!(create("fd-reuse", 1));
        let mut table = FdTable::new();
        let a = table.allocate(shared("fd-reuse")).unwrap();
        let b = table.allocate(shared("fd-reuse")).unwrap();
        assert_eq!((a, b), (2, 3));

        table.release(2);
        assert!(table.get(2).is_none());
        assert_eq!(table.allocate(shared("fd-reuse")), Some(2));
        remove("fd-reuse");
    }

    #[test]
    fn reserved_descriptors_stay_empty() {
        assert!(create("fd-reserved", 1));
        let mut table = FdTable::new();
        table.allocate(shared("fd-reserved"));
        assert!(table.get(0).is_none());
        assert!(table.get(1).is_none());
        remove("fd-reserved");
    }

    #[test]
    fn duplicate_from_clones_positions() {
        assert!(create("fd-dup", 8));
        let mut parent = FdTable::new();
        let fd = parent.allocate(shared("fd-dup")).unwrap();
        parent.get(fd).unwrap().lock().write(b"abcde");

        let mut child = FdTable::new();
        child.duplicate_from(&parent);

        let child_file = child.get(fd).unwrap();
        assert_eq!(child_file.lock().tell(), 5);
        // Child handle moves independently of the parent's.
        child_file.lock().seek(0);
        assert_eq!(parent.get(fd).unwrap().lock().tell(), 5);
        remove("fd-dup");
    }
}
