pub mod allocator;
pub mod bitmap;
pub mod page_table;
pub mod palloc;

use spin::Once;
use x86_64::structures::paging::{FrameAllocator, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

pub const PAGE_SIZE: u64 = 4096;

/// Upper bound of user virtual addresses. Everything above belongs to the
/// kernel half shared between all processes.
pub const USER_LIMIT: u64 = 0x0000_4000_0000_0000;

static PHYS_OFFSET: Once<u64> = Once::new();

/// Kernel virtual address of a physical address, through the boot-time
/// physical-memory window.
pub fn kva(pa: PhysAddr) -> VirtAddr {
    VirtAddr::new(pa.as_u64() + PHYS_OFFSET.get().expect("memory not initialized"))
}

/// Physical address behind a kernel virtual address in the window.
pub fn pa(kva: VirtAddr) -> PhysAddr {
    PhysAddr::new(kva.as_u64() - PHYS_OFFSET.get().expect("memory not initialized"))
}

/// A bump allocator over one physical region, used only while bootstrapping
/// the heap (page-table pages for the heap mapping come from here).
struct BumpFrameAllocator {
    next: PhysFrame,
    limit: PhysFrame,
}

impl BumpFrameAllocator {
    fn new(start: PhysAddr, end: PhysAddr) -> Self {
        BumpFrameAllocator {
            next: PhysFrame::containing_address(start),
            limit: PhysFrame::containing_address(end),
        }
    }
}

unsafe impl FrameAllocator<Size4KiB> for BumpFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        if self.next < self.limit {
            let frame = self.next;
            self.next += 1;
            Some(frame)
        } else {
            None
        }
    }
}

#[cfg(not(test))]
pub fn init(boot_info: &'static bootloader::BootInfo) {
    use bootloader::bootinfo::MemoryRegionType;
    use x86_64::registers::control::Cr3;
    use x86_64::structures::paging::{Mapper, OffsetPageTable, Page, PageTable, PageTableFlags};

    PHYS_OFFSET.call_once(|| boot_info.physical_memory_offset);
    page_table::init();

    // Largest usable region carries the heap and both page pools.
    let region = boot_info
        .memory_map
        .iter()
        .filter(|r| r.region_type == MemoryRegionType::Usable)
        .max_by_key(|r| r.range.end_frame_number - r.range.start_frame_number)
        .expect("no usable memory region");
    let region_start = PhysAddr::new(region.range.start_addr());
    let region_end = PhysAddr::new(region.range.end_addr());

    // Heap frames sit at the front of the region; the bump allocator behind
    // them feeds the page-table pages needed to map the heap itself.
    let heap_phys = region_start;
    let mut bump = BumpFrameAllocator::new(
        heap_phys + allocator::HEAP_SIZE as u64,
        region_end,
    );

    let mut mapper = unsafe {
        let (l4_frame, _) = Cr3::read();
        let l4_va = boot_info.physical_memory_offset + l4_frame.start_address().as_u64();
        let l4_table: *mut PageTable = VirtAddr::new(l4_va).as_mut_ptr();
        OffsetPageTable::new(&mut *l4_table, VirtAddr::new(boot_info.physical_memory_offset))
    };

    let heap_pages = allocator::HEAP_SIZE as u64 / PAGE_SIZE;
    for i in 0..heap_pages {
        let page: Page<Size4KiB> =
            Page::containing_address(VirtAddr::new(allocator::HEAP_START + i * PAGE_SIZE));
        let frame = PhysFrame::containing_address(heap_phys + i * PAGE_SIZE);
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        unsafe {
            mapper
                .map_to(page, frame, flags, &mut bump)
                .expect("heap mapping failed")
                .flush();
        }
    }
    unsafe { allocator::init_heap() };
    crate::log_info!("heap: {} KiB mapped at {:#x}", allocator::HEAP_SIZE / 1024, allocator::HEAP_START);

    // Whatever the bump allocator has not consumed becomes the page pools.
    let pool_base = bump.next.start_address();
    let pool_pages = ((region_end - pool_base) / PAGE_SIZE) as usize;
    palloc::init(pool_base, pool_pages);
}

#[cfg(test)]
pub fn init(_boot_info: &'static ()) {}
