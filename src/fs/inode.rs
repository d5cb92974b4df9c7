use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

/// An in-memory inode: fixed-size byte contents plus a writer-ban count.
/// Open files share one inode through an `Arc`; the inode disappears once
/// the registry entry and every open handle are gone.
pub struct Inode {
    id: u64,
    data: Mutex<Vec<u8>>,
    /// Number of open handles currently denying writes (a running
    /// executable, typically). Writes are refused while non-zero.
    deny_write_cnt: AtomicUsize,
}

impl Inode {
    pub(super) fn new(id: u64, size: usize) -> Inode {
        Inode {
            id,
            data: Mutex::new(vec![0; size]),
            deny_write_cnt: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn length(&self) -> usize {
        self.data.lock().len()
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the byte
    /// count actually read, short at end of file.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let available = &data[offset..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        n
    }

    /// Write up to `buf.len()` bytes starting at `offset`. The backing
    /// store does not grow, so writes stop at end of file; a write-banned
    /// inode accepts nothing and returns 0.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        if self.deny_write_cnt.load(Ordering::Acquire) > 0 {
            return 0;
        }
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let len = data.len();
        let n = buf.len().min(len - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }

    pub(super) fn deny_write(&self) {
        self.deny_write_cnt.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn allow_write(&self) {
        let prev = self.deny_write_cnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "allow_write without matching deny_write");
    }
}
