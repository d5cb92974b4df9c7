//! The global frame table and second-chance eviction.

use super::Page;
use crate::memory::palloc::{self, AllocFlags, Pool};
use crate::memory::PAGE_SIZE;
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

/// A physical user-pool page. Either free (not in the table) or bound to
/// exactly one resident page descriptor.
pub struct Frame {
    kva: VirtAddr,
    pub(super) page: Mutex<Option<Arc<Page>>>,
}

impl Frame {
    fn new(kva: VirtAddr) -> Arc<Frame> {
        Arc::new(Frame {
            kva,
            page: Mutex::new(None),
        })
    }

    pub fn kva(&self) -> VirtAddr {
        self.kva
    }

    pub fn bound_page(&self) -> Option<Arc<Page>> {
        self.page.lock().clone()
    }

    /// The frame's bytes, through the kernel window.
    ///
    /// # Safety
    /// Callers must be the frame's binder (claim, eviction, teardown); the
    /// slice aliases user memory.
    pub unsafe fn contents_mut(&self) -> &'static mut [u8] {
        core::slice::from_raw_parts_mut(self.kva.as_mut_ptr::<u8>(), PAGE_SIZE as usize)
    }
}

struct FrameTable {
    frames: Vec<Arc<Frame>>,
    /// Clock hand; persists across eviction calls.
    hand: usize,
}

lazy_static! {
    static ref FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable {
        frames: Vec::new(),
        hand: 0,
    });
}

/// Get a zeroed user frame, evicting if the pool is dry. Always succeeds
/// (or panics when there is nothing evictable and no swap left).
pub fn get_frame() -> Arc<Frame> {
    if let Some(kva) = palloc::get_page(Pool::User, AllocFlags::ZERO) {
        let frame = Frame::new(kva);
        let mut table = FRAME_TABLE.lock();
        table.frames.push(frame.clone());
        return frame;
    }
    evict_frame()
}

/// Second-chance scan: a set accessed bit earns the frame another lap; the
/// first frame found with a clear bit is the victim. Two full laps always
/// produce one, since the first lap clears every bit it sees.
fn evict_frame() -> Arc<Frame> {
    let (frame, page) = {
        let mut table = FRAME_TABLE.lock();
        let len = table.frames.len();
        assert!(len > 0, "eviction with an empty frame table");

        let mut chosen = None;
        for _ in 0..2 * len + 1 {
            let idx = table.hand;
            table.hand = (table.hand + 1) % len;
            let frame = table.frames[idx].clone();
            let Some(page) = frame.bound_page() else {
                continue; // free or mid-handoff
            };
            if page.is_accessed() {
                page.clear_accessed();
                continue;
            }
            // Detach the binding; a concurrent evictor skips this frame.
            let taken = frame.page.lock().take();
            if let Some(page) = taken {
                chosen = Some((frame, page));
                break;
            }
        }
        chosen.expect("no evictable frame found")
    };

    // I/O happens outside the table lock: write-back may block on the
    // file-system semaphore.
    if !page.swap_out() {
        panic!("vm: eviction write-out failed");
    }
    unsafe { frame.contents_mut().fill(0) };
    frame
}

/// Release a frame back to the user pool and drop it from the table.
pub fn free_frame(frame: Arc<Frame>) {
    let mut table = FRAME_TABLE.lock();
    if let Some(pos) = table.frames.iter().position(|f| Arc::ptr_eq(f, &frame)) {
        table.frames.remove(pos);
        if table.hand > pos {
            table.hand -= 1;
        }
        let len = table.frames.len();
        if len > 0 {
            table.hand %= len;
        } else {
            table.hand = 0;
        }
    }
    drop(table);
    palloc::free_page(frame.kva);
}

/// Number of frames currently bound to resident pages.
pub fn resident_frames() -> usize {
    FRAME_TABLE
        .lock()
        .frames
        .iter()
        .filter(|f| f.page.lock().is_some())
        .count()
}
