use linked_list_allocator::LockedHeap;

/// Kernel heap placement. The heap lives in the higher half next to the
/// physical-memory window and is backed by frames taken from the boot
/// memory map before the page pools are carved out.
pub const HEAP_START: u64 = 0xffff_9000_0000_0000;
pub const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[cfg_attr(not(test), global_allocator)]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Called once by `memory::init` after the heap range has been mapped.
pub unsafe fn init_heap() {
    ALLOCATOR
        .lock()
        .init(HEAP_START as usize as *mut u8, HEAP_SIZE);
}
