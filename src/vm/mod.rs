//! Virtual-memory core: the supplemental page table, lazy page
//! materialization, and the page-fault path.
//!
//! Every user page is described by a `Page` whose kind is a tagged variant:
//! uninitialized (carrying a lazy load source), anonymous (swap-backed), or
//! file-backed. The first fault on an uninit page runs its loader and
//! transmutes the kind in place.

pub mod anon;
pub mod file;
pub mod frame;

use crate::memory::page_table::Pml4;
use crate::memory::{PAGE_SIZE, USER_LIMIT};
use crate::thread::{self, Thread};
use alloc::sync::{Arc, Weak};
use anon::AnonPage;
use file::FilePage;
use frame::Frame;
use hashbrown::HashMap;
use spin::Mutex;
use x86_64::VirtAddr;

/// Top of the user stack.
pub const USER_STACK: u64 = 0x4748_0000;
/// The stack may grow down to 1 MiB below `USER_STACK`.
pub const STACK_LIMIT: u64 = 0x10_0000;
/// PUSH/CALL write below the stack pointer before it moves.
const STACK_SLACK: u64 = 8;

pub fn init() {
    anon::init();
    crate::log_info!("vm: lazy paging initialized");
}

/// What an uninit page will become on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Anon,
    File,
}

/// Lazy load source: bytes from a file, the rest zeroed. A page with no
/// load source is simply zero-filled.
pub struct LoadInfo {
    pub file: crate::fs::SharedFile,
    pub offset: usize,
    pub read_bytes: usize,
}

impl LoadInfo {
    fn run(&self, slice: &mut [u8]) -> bool {
        crate::fs::FILESYS_SEMA.down();
        let n = self
            .file
            .lock()
            .read_at(&mut slice[..self.read_bytes], self.offset);
        crate::fs::FILESYS_SEMA.up();
        if n != self.read_bytes {
            return false;
        }
        for b in slice[self.read_bytes..].iter_mut() {
            *b = 0;
        }
        true
    }
}

pub enum PageKind {
    Uninit {
        target: PageType,
        load: Option<LoadInfo>,
        /// Page count of the whole mapping, recorded on the first page of
        /// an mmap region; 1 elsewhere.
        span: usize,
    },
    Anon(AnonPage),
    File(FilePage),
}

/// One user virtual page. Resident while `frame` is bound.
pub struct Page {
    vaddr: VirtAddr,
    writable: bool,
    kind: Mutex<PageKind>,
    frame: Mutex<Option<Arc<Frame>>>,
    owner: Weak<Thread>,
}

impl Page {
    fn new(vaddr: VirtAddr, writable: bool, kind: PageKind, owner: &Arc<Thread>) -> Arc<Page> {
        Arc::new(Page {
            vaddr,
            writable,
            kind: Mutex::new(kind),
            frame: Mutex::new(None),
            owner: Arc::downgrade(owner),
        })
    }

    pub fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_resident(&self) -> bool {
        self.frame.lock().is_some()
    }

    pub fn frame(&self) -> Option<Arc<Frame>> {
        self.frame.lock().clone()
    }

    /// The page count recorded for the mapping starting at this page.
    pub fn span(&self) -> usize {
        match &*self.kind.lock() {
            PageKind::Uninit { span, .. } => *span,
            PageKind::File(f) => f.span,
            PageKind::Anon(_) => 1,
        }
    }

    fn with_owner_pml4<R>(&self, f: impl FnOnce(&Pml4) -> R) -> Option<R> {
        let owner = self.owner.upgrade()?;
        let guard = owner.pml4.lock();
        guard.as_ref().map(f)
    }

    pub fn is_accessed(&self) -> bool {
        self.with_owner_pml4(|p| p.is_accessed(self.vaddr)).unwrap_or(false)
    }

    pub fn clear_accessed(&self) {
        self.with_owner_pml4(|p| p.set_accessed(self.vaddr, false));
    }

    pub fn is_dirty(&self) -> bool {
        self.with_owner_pml4(|p| p.is_dirty(self.vaddr)).unwrap_or(false)
    }

    pub fn clear_dirty(&self) {
        self.with_owner_pml4(|p| p.set_dirty(self.vaddr, false));
    }

    pub fn clear_mapping(&self) {
        self.with_owner_pml4(|p| p.clear_page(self.vaddr));
    }

    /// Bring the page's contents into `frame` (already bound and mapped).
    /// For uninit pages this runs the lazy loader and transmutes the kind.
    fn swap_in(&self, frame: &Arc<Frame>) -> bool {
        let slice = unsafe { frame.contents_mut() };
        let mut kind = self.kind.lock();
        match &mut *kind {
            PageKind::Uninit { target, load, span } => {
                let ok = match load {
                    Some(info) => info.run(slice),
                    None => {
                        slice.fill(0);
                        true
                    }
                };
                if !ok {
                    return false;
                }
                *kind = match target {
                    PageType::Anon => PageKind::Anon(AnonPage::new()),
                    PageType::File => {
                        let info = load.take().expect("file page without load source");
                        PageKind::File(FilePage::new(info, *span))
                    }
                };
                true
            }
            PageKind::Anon(a) => a.swap_in(slice),
            PageKind::File(f) => f.swap_in(slice),
        }
    }

    /// Push the page's contents out to its backing store and drop the
    /// mapping; the caller has already detached the frame binding. True on
    /// success.
    pub fn swap_out(&self) -> bool {
        let frame = match self.frame.lock().take() {
            Some(f) => f,
            None => return false,
        };
        let slice = unsafe { frame.contents_mut() };
        let ok = {
            let mut kind = self.kind.lock();
            match &mut *kind {
                PageKind::Anon(a) => a.swap_out(slice),
                PageKind::File(f) => {
                    if self.is_dirty() {
                        f.write_back(slice);
                        self.clear_dirty();
                    }
                    true
                }
                // Uninit pages are never resident.
                PageKind::Uninit { .. } => true,
            }
        };
        self.clear_mapping();
        ok
    }

    /// Release everything the page owns: swap slot, dirty contents, frame.
    /// Clearing the page-table mapping is the caller's concern.
    fn destroy(&self) {
        {
            let mut kind = self.kind.lock();
            match &mut *kind {
                PageKind::Uninit { .. } => {}
                PageKind::Anon(a) => a.release_slot(),
                PageKind::File(f) => {
                    if self.is_resident() && self.is_dirty() {
                        let frame = self.frame.lock().clone().unwrap();
                        f.write_back(unsafe { frame.contents_mut() });
                    }
                }
            }
        }
        if let Some(frame) = self.frame.lock().take() {
            *frame.page.lock() = None;
            frame::free_frame(frame);
        }
    }
}

// ── supplemental page table ─────────────────────────────────────

/// Per-process map from page-aligned user addresses to descriptors.
pub struct SupplementalPageTable {
    pages: Mutex<HashMap<u64, Arc<Page>>>,
}

impl SupplementalPageTable {
    pub fn new() -> SupplementalPageTable {
        SupplementalPageTable {
            pages: Mutex::new(HashMap::new()),
        }
    }

    pub fn find(&self, va: VirtAddr) -> Option<Arc<Page>> {
        let key = va.align_down(PAGE_SIZE).as_u64();
        self.pages.lock().get(&key).cloned()
    }

    /// Insert a descriptor; at most one per address.
    pub fn insert(&self, page: Arc<Page>) -> bool {
        let mut pages = self.pages.lock();
        let key = page.vaddr.as_u64();
        if pages.contains_key(&key) {
            return false;
        }
        pages.insert(key, page);
        true
    }

    /// Remove and destroy the descriptor at `va`, if any.
    pub fn remove(&self, va: VirtAddr) {
        let key = va.align_down(PAGE_SIZE).as_u64();
        let removed = self.pages.lock().remove(&key);
        if let Some(page) = removed {
            page.destroy();
        }
    }

    /// Destroy every descriptor (process teardown). Dirty file pages write
    /// back, swap slots are released, frames freed.
    pub fn kill(&self) {
        let drained: alloc::vec::Vec<Arc<Page>> =
            self.pages.lock().drain().map(|(_, p)| p).collect();
        for page in drained {
            page.destroy();
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    fn addresses(&self) -> alloc::vec::Vec<u64> {
        self.pages.lock().keys().copied().collect()
    }
}

/// Register a lazily-populated page in the current thread's SPT.
/// `vaddr` is rounded down to page alignment; duplicates are rejected.
pub fn alloc_page_with_initializer(
    target: PageType,
    vaddr: VirtAddr,
    writable: bool,
    load: Option<LoadInfo>,
    span: usize,
) -> bool {
    let cur = thread::current();
    let page = Page::new(
        vaddr.align_down(PAGE_SIZE),
        writable,
        PageKind::Uninit { target, load, span },
        &cur,
    );
    cur.spt.insert(page)
}

/// Force immediate materialization of the page at `vaddr`.
pub fn claim_page(vaddr: VirtAddr) -> bool {
    let cur = thread::current();
    match cur.spt.find(vaddr) {
        Some(page) => do_claim(page),
        None => false,
    }
}

/// Obtain a frame, wire up the descriptor/frame links and the hardware
/// mapping, then pull the contents in.
fn do_claim(page: Arc<Page>) -> bool {
    if page.is_resident() {
        return true;
    }
    let frame = frame::get_frame();
    *frame.page.lock() = Some(page.clone());
    *page.frame.lock() = Some(frame.clone());

    let mapped = page
        .with_owner_pml4(|pml4| pml4.map(page.vaddr, frame.kva(), page.writable))
        .unwrap_or(false);
    if !mapped {
        *page.frame.lock() = None;
        *frame.page.lock() = None;
        frame::free_frame(frame);
        return false;
    }

    page.swap_in(&frame)
}

/// Page-fault fixup. Returns true when the fault was a legitimate lazy
/// load or stack growth and the faulting instruction may retry.
pub fn try_handle_fault(
    fault_rsp: u64,
    addr: VirtAddr,
    user: bool,
    write: bool,
    not_present: bool,
) -> bool {
    let va = addr.as_u64();
    if va == 0 || va >= USER_LIMIT {
        return false;
    }
    if !not_present {
        // Present page, rights violation: never fixable.
        return false;
    }

    let cur = thread::current();
    let page_addr = addr.align_down(PAGE_SIZE);

    // Stack growth. For kernel-mode faults (user buffer touched inside a
    // syscall) the user rsp was recorded at syscall entry.
    let rsp = if user {
        fault_rsp
    } else {
        cur.saved_user_rsp.load(core::sync::atomic::Ordering::Acquire)
    };
    let stack_floor = USER_STACK - STACK_LIMIT;
    if (stack_floor..USER_STACK).contains(&va) && va + STACK_SLACK >= rsp {
        grow_stack(&cur, rsp, page_addr);
    }

    let page = match cur.spt.find(addr) {
        Some(p) => p,
        None => return false,
    };
    if write && !page.writable {
        return false;
    }
    do_claim(page)
}

/// Register anonymous zero pages for every missing page between the fault
/// address and the stack pointer's page.
fn grow_stack(cur: &Arc<Thread>, rsp: u64, page_addr: VirtAddr) {
    // An rsp outside the stack region carries no information; cover only
    // the faulting page then.
    let stack_floor = USER_STACK - STACK_LIMIT;
    let rsp_page = if (stack_floor..=USER_STACK).contains(&rsp) {
        VirtAddr::new(rsp.min(USER_STACK - 1)).align_down(PAGE_SIZE)
    } else {
        page_addr
    };
    let low = page_addr.min(rsp_page);
    let high = page_addr.max(rsp_page);
    let mut va = low;
    while va <= high {
        if cur.spt.find(va).is_none() {
            let page = Page::new(va, true, zeroed_anon_kind(), cur);
            cur.spt.insert(page);
        }
        va += PAGE_SIZE;
    }
}

fn zeroed_anon_kind() -> PageKind {
    PageKind::Uninit {
        target: PageType::Anon,
        load: None,
        span: 1,
    }
}

/// Structural copy of `src` into the current (child) thread's SPT, for
/// fork. Uninit descriptors clone their load source; anon and file pages
/// are claimed in the child and their bytes duplicated.
pub fn copy_spt(src: &SupplementalPageTable) -> bool {
    let child = thread::current();
    for va in src.addresses() {
        let va = VirtAddr::new(va);
        let Some(src_page) = src.find(va) else {
            continue;
        };
        if !copy_one(&child, &src_page, va) {
            return false;
        }
    }
    true
}

fn copy_one(child: &Arc<Thread>, src_page: &Arc<Page>, va: VirtAddr) -> bool {
    let src_kind = src_page.kind.lock();
    match &*src_kind {
        PageKind::Uninit { target, load, span } => {
            let load = load.as_ref().map(|i| LoadInfo {
                file: i.file.clone(),
                offset: i.offset,
                read_bytes: i.read_bytes,
            });
            let page = Page::new(
                va,
                src_page.writable,
                PageKind::Uninit {
                    target: *target,
                    load,
                    span: *span,
                },
                child,
            );
            child.spt.insert(page)
        }
        PageKind::Anon(src_anon) => {
            let slot = src_anon.slot();
            drop(src_kind);
            let page = Page::new(va, src_page.writable, zeroed_anon_kind(), child);
            if !child.spt.insert(page) {
                return false;
            }
            if !claim_page(va) {
                return false;
            }
            fill_from_parent(child, src_page, va, slot)
        }
        PageKind::File(src_file) => {
            let info = LoadInfo {
                file: src_file.reopen(),
                offset: src_file.offset,
                read_bytes: src_file.read_bytes,
            };
            let span = src_file.span;
            drop(src_kind);
            let page = Page::new(
                va,
                src_page.writable,
                PageKind::Uninit {
                    target: PageType::File,
                    load: Some(info),
                    span,
                },
                child,
            );
            if !child.spt.insert(page) {
                return false;
            }
            // Resident parent pages may hold writes not yet on disk; claim
            // now and copy the live bytes.
            if src_page.is_resident() {
                if !claim_page(va) {
                    return false;
                }
                return fill_from_parent(child, src_page, va, None);
            }
            true
        }
    }
}

/// Copy one page of content into the child's freshly claimed frame, either
/// from the parent's resident frame or straight from its swap slot.
fn fill_from_parent(
    child: &Arc<Thread>,
    src_page: &Arc<Page>,
    va: VirtAddr,
    src_slot: Option<u32>,
) -> bool {
    let dst_page = child.spt.find(va).expect("child page vanished during fork");
    let dst_frame = dst_page.frame().expect("child page not resident after claim");
    let dst = unsafe { dst_frame.contents_mut() };

    if let Some(src_frame) = src_page.frame() {
        let src = unsafe { src_frame.contents_mut() };
        dst.copy_from_slice(src);
        true
    } else if let Some(slot) = src_slot {
        anon::read_slot(slot, dst);
        true
    } else {
        // Non-resident file page: the lazy loader already filled it.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached_page(vaddr: u64, writable: bool) -> Arc<Page> {
        Arc::new(Page {
            vaddr: VirtAddr::new(vaddr),
            writable,
            kind: Mutex::new(PageKind::Uninit {
                target: PageType::Anon,
                load: None,
                span: 1,
            }),
            frame: Mutex::new(None),
            owner: Weak::new(),
        })
    }

    #[test]
    fn spt_rejects_duplicate_addresses() {
        let spt = SupplementalPageTable::new();
        assert!(spt.insert(detached_page(0x40_0000, true)));
        assert!(!spt.insert(detached_page(0x40_0000, false)));
        assert_eq!(spt.page_count(), 1);
    }

    #[test]
    fn spt_find_rounds_down_to_the_page() {
        let spt = SupplementalPageTable::new();
        assert!(spt.insert(detached_page(0x40_0000, true)));
        let hit = spt.find(VirtAddr::new(0x40_0FFF)).unwrap();
        assert_eq!(hit.vaddr().as_u64(), 0x40_0000);
        assert!(spt.find(VirtAddr::new(0x40_1000)).is_none());
    }

    #[test]
    fn spt_remove_destroys_the_entry() {
        let spt = SupplementalPageTable::new();
        assert!(spt.insert(detached_page(0x40_0000, true)));
        spt.remove(VirtAddr::new(0x40_0000));
        assert!(spt.find(VirtAddr::new(0x40_0000)).is_none());
        assert_eq!(spt.page_count(), 0);
    }

    #[test]
    fn spt_kill_empties_the_table() {
        let spt = SupplementalPageTable::new();
        for i in 0..8u64 {
            assert!(spt.insert(detached_page(0x40_0000 + i * PAGE_SIZE, true)));
        }
        spt.kill();
        assert_eq!(spt.page_count(), 0);
    }
}
