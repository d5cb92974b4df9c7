//! File-backed pages: mmap, munmap, and re-readable page contents. Dirty
//! pages are written back to the file on eviction, unmap, and teardown.

use super::{alloc_page_with_initializer, LoadInfo, PageKind, PageType};
use crate::fs::SharedFile;
use crate::memory::PAGE_SIZE;
use crate::thread;
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::VirtAddr;

/// State of a materialized file-backed page. The handle is a reopen of the
/// mapper's descriptor, so its lifetime is independent of the caller's FD
/// table.
pub struct FilePage {
    pub file: SharedFile,
    pub offset: usize,
    pub read_bytes: usize,
    /// Page count of the whole mapping; meaningful on the first page only.
    pub span: usize,
}

impl FilePage {
    pub fn new(info: LoadInfo, span: usize) -> FilePage {
        FilePage {
            file: info.file,
            offset: info.offset,
            read_bytes: info.read_bytes,
            span,
        }
    }

    /// Re-read the page from the backing file. No swap disk involvement.
    pub fn swap_in(&self, contents: &mut [u8]) -> bool {
        crate::fs::FILESYS_SEMA.down();
        let n = self
            .file
            .lock()
            .read_at(&mut contents[..self.read_bytes], self.offset);
        crate::fs::FILESYS_SEMA.up();
        if n != self.read_bytes {
            return false;
        }
        contents[self.read_bytes..].fill(0);
        true
    }

    /// Push the page's live bytes back into the file.
    pub fn write_back(&self, contents: &[u8]) {
        crate::fs::FILESYS_SEMA.down();
        self.file
            .lock()
            .write_at(&contents[..self.read_bytes], self.offset);
        crate::fs::FILESYS_SEMA.up();
    }

    pub fn reopen(&self) -> SharedFile {
        Arc::new(Mutex::new(self.file.lock().reopen()))
    }
}

/// Map `length` bytes of `file` starting at `offset` to `addr`. Pages are
/// registered lazily; nothing is read until first touch. Returns the
/// original `addr`, or `None` on any rejection.
pub fn do_mmap(
    addr: VirtAddr,
    length: usize,
    writable: bool,
    file: &SharedFile,
    offset: usize,
) -> Option<VirtAddr> {
    if addr.as_u64() == 0
        || addr.as_u64() % PAGE_SIZE != 0
        || offset as u64 % PAGE_SIZE != 0
        || length == 0
    {
        return None;
    }

    // A reopened handle shared by every page of the mapping; closing the
    // caller's descriptor must not tear the mapping down.
    let mapped_file = Arc::new(Mutex::new(file.lock().reopen()));
    let file_len = mapped_file.lock().length();
    if offset >= file_len {
        return None;
    }

    let map_bytes = length.min(file_len - offset);
    let total_pages = (map_bytes + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;

    let mut registered = 0;
    for i in 0..total_pages {
        let page_addr = addr + (i as u64) * PAGE_SIZE;
        let page_offset = offset + i * PAGE_SIZE as usize;
        let read_bytes = (map_bytes - i * PAGE_SIZE as usize).min(PAGE_SIZE as usize);
        let span = if i == 0 { total_pages } else { 1 };
        let info = LoadInfo {
            file: mapped_file.clone(),
            offset: page_offset,
            read_bytes,
        };
        if !alloc_page_with_initializer(PageType::File, page_addr, writable, Some(info), span) {
            // Overlap with an existing mapping: roll back what we added.
            let spt = &thread::current().spt;
            for j in 0..registered {
                spt.remove(addr + (j as u64) * PAGE_SIZE);
            }
            return None;
        }
        registered = i + 1;
    }

    Some(addr)
}

/// Unmap the mapping whose first page is at `addr`: write dirty pages back
/// in address order, drop the mappings and descriptors, and let the
/// reopened handle close with the last descriptor.
pub fn do_munmap(addr: VirtAddr) {
    let cur = thread::current();
    let Some(first) = cur.spt.find(addr) else {
        return;
    };
    let span = first.span();
    drop(first);

    for i in 0..span {
        let page_addr = addr + (i as u64) * PAGE_SIZE;
        if let Some(page) = cur.spt.find(page_addr) {
            // Write back while the mapping (and its dirty bit) still
            // exists, then unmap, and only then let the descriptor's
            // destructor return the frame to the pool. The mapping must
            // never outlive the frame it points at.
            if page.is_resident() && page.is_dirty() {
                let kind = page.kind.lock();
                if let PageKind::File(f) = &*kind {
                    if let Some(frame) = page.frame() {
                        f.write_back(unsafe { frame.contents_mut() });
                    }
                }
                drop(kind);
                page.clear_dirty();
            }
            if let Some(pml4) = cur.pml4.lock().as_ref() {
                pml4.clear_page(page_addr);
            }
            drop(page);
            cur.spt.remove(page_addr);
        }
    }
}
