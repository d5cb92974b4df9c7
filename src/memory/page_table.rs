use super::palloc::{self, AllocFlags, Pool};
use super::{PAGE_SIZE, USER_LIMIT};
use spin::Once;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
use x86_64::{PhysAddr, VirtAddr};

/// The boot page-table root. Every per-process root shares its upper half
/// (kernel text, the physical-memory window, the heap).
static BASE_ROOT: Once<PhysFrame> = Once::new();

pub fn init() {
    let (frame, _) = Cr3::read();
    BASE_ROOT.call_once(|| frame);
}

fn table_at(pa: PhysAddr) -> &'static mut PageTable {
    let kva = super::kva(pa);
    unsafe { &mut *kva.as_mut_ptr::<PageTable>() }
}

/// A per-process top-level page table (page map level 4). The lower half
/// belongs to the owning process; entries 256..512 are copied from the boot
/// root at creation so kernel code stays mapped in every address space.
pub struct Pml4 {
    root: PhysFrame,
}

impl Pml4 {
    /// Allocate a fresh root with kernel mappings shared in.
    pub fn new() -> Option<Pml4> {
        let kva = palloc::get_page(Pool::Kernel, AllocFlags::ZERO)?;
        let root = PhysFrame::containing_address(super::pa(kva));
        let new_table = table_at(root.start_address());
        let base_table = table_at(BASE_ROOT.get().expect("paging not initialized").start_address());
        for idx in 256..512 {
            new_table[idx] = base_table[idx].clone();
        }
        Some(Pml4 { root })
    }

    pub fn root_addr(&self) -> PhysAddr {
        self.root.start_address()
    }

    /// Load this root into CR3.
    pub fn activate(&self) {
        unsafe {
            Cr3::write(self.root, Cr3Flags::empty());
        }
    }

    fn is_active(&self) -> bool {
        Cr3::read().0 == self.root
    }

    /// Walk down to the level-1 entry for `va`, optionally creating the
    /// intermediate tables.
    fn leaf_entry(&self, va: VirtAddr, create: bool) -> Option<&'static mut x86_64::structures::paging::page_table::PageTableEntry> {
        let indices = [va.p4_index(), va.p3_index(), va.p2_index()];
        let mut table = table_at(self.root.start_address());
        for idx in indices {
            let entry = &mut table[idx];
            if entry.is_unused() {
                if !create {
                    return None;
                }
                let kva = palloc::get_page(Pool::Kernel, AllocFlags::ZERO)?;
                entry.set_addr(
                    super::pa(kva),
                    PageTableFlags::PRESENT
                        | PageTableFlags::WRITABLE
                        | PageTableFlags::USER_ACCESSIBLE,
                );
            }
            table = table_at(entry.addr());
        }
        Some(&mut table[va.p1_index()])
    }

    /// Map the user page `va` to the frame behind kernel address `kva`.
    /// Fails if `va` is already mapped or an intermediate table cannot be
    /// allocated.
    pub fn map(&self, va: VirtAddr, kva: VirtAddr, writable: bool) -> bool {
        assert_eq!(va.as_u64() % PAGE_SIZE, 0);
        let Some(entry) = self.leaf_entry(va, true) else {
            return false;
        };
        if !entry.is_unused() {
            return false;
        }
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        entry.set_addr(super::pa(kva), flags);
        self.flush(va);
        true
    }

    /// Remove the mapping for `va`, if any. The frame itself is untouched;
    /// frames are owned by the frame table.
    pub fn clear_page(&self, va: VirtAddr) {
        if let Some(entry) = self.leaf_entry(va, false) {
            if !entry.is_unused() {
                entry.set_unused();
                self.flush(va);
            }
        }
    }

    /// Kernel virtual address of the frame mapped at `va`, or `None`.
    pub fn get_page(&self, va: VirtAddr) -> Option<VirtAddr> {
        let entry = self.leaf_entry(va.align_down(PAGE_SIZE), false)?;
        if entry.flags().contains(PageTableFlags::PRESENT) {
            Some(super::kva(entry.addr()) + (va.as_u64() % PAGE_SIZE))
        } else {
            None
        }
    }

    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.leaf_entry(va, false)
            .map(|e| e.flags().contains(PageTableFlags::DIRTY))
            .unwrap_or(false)
    }

    pub fn set_dirty(&self, va: VirtAddr, dirty: bool) {
        if let Some(entry) = self.leaf_entry(va, false) {
            let mut flags = entry.flags();
            flags.set(PageTableFlags::DIRTY, dirty);
            entry.set_flags(flags);
            self.flush(va);
        }
    }

    pub fn is_accessed(&self, va: VirtAddr) -> bool {
        self.leaf_entry(va, false)
            .map(|e| e.flags().contains(PageTableFlags::ACCESSED))
            .unwrap_or(false)
    }

    pub fn set_accessed(&self, va: VirtAddr, accessed: bool) {
        if let Some(entry) = self.leaf_entry(va, false) {
            let mut flags = entry.flags();
            flags.set(PageTableFlags::ACCESSED, accessed);
            entry.set_flags(flags);
            self.flush(va);
        }
    }

    fn flush(&self, va: VirtAddr) {
        if self.is_active() {
            x86_64::instructions::tlb::flush(va);
        }
    }

    /// Free the user-half paging structures. Leaf frames are not freed here;
    /// they belong to the frame table and are released by the SPT teardown.
    fn destroy(&mut self) {
        let root_table = table_at(self.root.start_address());
        for p4e in root_table.iter_mut().take(256) {
            if p4e.is_unused() {
                continue;
            }
            let p3 = table_at(p4e.addr());
            for p3e in p3.iter_mut() {
                if p3e.is_unused() {
                    continue;
                }
                let p2 = table_at(p3e.addr());
                for p2e in p2.iter_mut() {
                    if p2e.is_unused() {
                        continue;
                    }
                    palloc::free_page(super::kva(p2e.addr()));
                }
                palloc::free_page(super::kva(p3e.addr()));
            }
            palloc::free_page(super::kva(p4e.addr()));
            p4e.set_unused();
        }
        palloc::free_page(super::kva(self.root.start_address()));
    }
}

impl Drop for Pml4 {
    fn drop(&mut self) {
        assert!(
            !self.is_active(),
            "destroying the active page-table root"
        );
        self.destroy();
    }
}

/// Switch CR3 back to the boot root (used while tearing a process down, so
/// the dying root is never the active one).
pub fn activate_base() {
    let root = *BASE_ROOT.get().expect("paging not initialized");
    unsafe {
        Cr3::write(root, Cr3Flags::empty());
    }
}

/// True for addresses a user process may legitimately touch.
pub fn is_user_vaddr(va: u64) -> bool {
    va != 0 && va < USER_LIMIT
}
