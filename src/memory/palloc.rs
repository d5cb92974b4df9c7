use super::bitmap::Bitmap;
use super::PAGE_SIZE;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::{PhysAddr, VirtAddr};

bitflags::bitflags! {
    #[derive(Clone, Copy)]
    pub struct AllocFlags: u8 {
        /// Return the page zero-filled.
        const ZERO = 1 << 0;
    }
}

/// Which physical pool a page comes from. Kernel data structures (thread
/// pages, page-table pages) come from the kernel pool; user frames come from
/// the user pool so that eviction pressure never eats kernel memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    Kernel,
    User,
}

struct PagePool {
    base: PhysAddr,
    pages: usize,
    used: Bitmap,
}

impl PagePool {
    fn empty() -> PagePool {
        PagePool {
            base: PhysAddr::new(0),
            pages: 0,
            used: Bitmap::new(0),
        }
    }

    fn init(&mut self, base: PhysAddr, pages: usize) {
        self.base = base;
        self.pages = pages;
        self.used = Bitmap::new(pages);
    }

    fn contains(&self, pa: PhysAddr) -> bool {
        pa >= self.base && pa < self.base + (self.pages as u64) * PAGE_SIZE
    }

    fn alloc(&mut self) -> Option<PhysAddr> {
        let idx = self.used.scan_and_flip(0, 1, false)?;
        Some(self.base + (idx as u64) * PAGE_SIZE)
    }

    fn free(&mut self, pa: PhysAddr) {
        let idx = ((pa - self.base) / PAGE_SIZE) as usize;
        assert!(self.used.get(idx), "freeing a page that is not allocated");
        self.used.set(idx, false);
    }
}

lazy_static! {
    static ref KERNEL_POOL: Mutex<PagePool> = Mutex::new(PagePool::empty());
    static ref USER_POOL: Mutex<PagePool> = Mutex::new(PagePool::empty());
}

/// Carve the two page pools out of one contiguous usable physical range.
/// Traditionally the range is split half and half.
pub fn init(base: PhysAddr, pages: usize) {
    let kernel_pages = pages / 2;
    let user_pages = pages - kernel_pages;
    KERNEL_POOL.lock().init(base, kernel_pages);
    USER_POOL
        .lock()
        .init(base + (kernel_pages as u64) * PAGE_SIZE, user_pages);
    crate::log_info!(
        "palloc: {} kernel pages, {} user pages at {:#x}",
        kernel_pages,
        user_pages,
        base.as_u64()
    );
}

fn pool_of(pool: Pool) -> &'static Mutex<PagePool> {
    match pool {
        Pool::Kernel => &KERNEL_POOL,
        Pool::User => &USER_POOL,
    }
}

/// Allocate a single page and return its kernel virtual address.
/// Returns `None` when the pool is exhausted; user-pool callers are expected
/// to react by evicting a frame.
pub fn get_page(pool: Pool, flags: AllocFlags) -> Option<VirtAddr> {
    let pa = x86_64::instructions::interrupts::without_interrupts(|| {
        pool_of(pool).lock().alloc()
    })?;
    let kva = super::kva(pa);
    if flags.contains(AllocFlags::ZERO) {
        unsafe {
            core::ptr::write_bytes(kva.as_mut_ptr::<u8>(), 0, PAGE_SIZE as usize);
        }
    }
    Some(kva)
}

/// Return a page to whichever pool owns it.
pub fn free_page(kva: VirtAddr) {
    let pa = super::pa(kva);
    x86_64::instructions::interrupts::without_interrupts(|| {
        if KERNEL_POOL.lock().contains(pa) {
            KERNEL_POOL.lock().free(pa);
        } else if USER_POOL.lock().contains(pa) {
            USER_POOL.lock().free(pa);
        } else {
            panic!("free_page: {:#x} belongs to no pool", kva.as_u64());
        }
    });
}

/// Size of the user pool, in pages. Used for sizing stress scenarios.
pub fn user_pool_pages() -> usize {
    USER_POOL.lock().pages
}
