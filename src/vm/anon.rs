//! Anonymous pages and the swap table. An evicted anon page occupies a run
//! of 8 consecutive 512-byte sectors on the raw swap disk; one global
//! bitmap tracks sector allocation.

use crate::devices::ata::{self, SECTOR_SIZE};
use crate::memory::bitmap::Bitmap;
use lazy_static::lazy_static;
use spin::Mutex;

pub const SECTORS_PER_PAGE: usize = crate::memory::PAGE_SIZE as usize / SECTOR_SIZE;

lazy_static! {
    static ref SWAP_TABLE: Mutex<Bitmap> = Mutex::new(Bitmap::new(0));
}

pub fn init() {
    let sectors = ata::SWAP_DISK.lock().sector_count() as usize;
    *SWAP_TABLE.lock() = Bitmap::new(sectors);
    crate::log_info!(
        "swap: {} sectors ({} page slots)",
        sectors,
        sectors / SECTORS_PER_PAGE
    );
}

/// Swap-backed page state: `slot` names the first of 8 sectors holding the
/// contents while evicted, `None` while resident (or never evicted).
pub struct AnonPage {
    slot: Option<u32>,
}

impl AnonPage {
    pub fn new() -> AnonPage {
        AnonPage { slot: None }
    }

    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    /// Read the page back from its swap slot and release the slot.
    pub fn swap_in(&mut self, contents: &mut [u8]) -> bool {
        let slot = match self.slot.take() {
            Some(s) => s,
            // First touch after fork-claim or similar: nothing on disk.
            None => return true,
        };
        read_slot(slot, contents);
        SWAP_TABLE
            .lock()
            .set_multiple(slot as usize, SECTORS_PER_PAGE, false);
        true
    }

    /// Find a free run of 8 sectors and write the page out. Swap space is
    /// unbounded by policy; running out is a kernel panic.
    pub fn swap_out(&mut self, contents: &[u8]) -> bool {
        let slot = SWAP_TABLE
            .lock()
            .scan_and_flip(0, SECTORS_PER_PAGE, false)
            .unwrap_or_else(|| panic!("swap: out of swap space"));
        let disk = ata::SWAP_DISK.lock();
        for i in 0..SECTORS_PER_PAGE {
            let sector: &[u8; SECTOR_SIZE] = contents[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]
                .try_into()
                .unwrap();
            if disk.write_sector(slot as u32 + i as u32, sector).is_err() {
                return false;
            }
        }
        self.slot = Some(slot as u32);
        true
    }

    /// Give the swap slot back, if the page owns one.
    pub fn release_slot(&mut self) {
        if let Some(slot) = self.slot.take() {
            SWAP_TABLE
                .lock()
                .set_multiple(slot as usize, SECTORS_PER_PAGE, false);
        }
    }
}

/// Read a slot's 8 sectors into `contents` without touching the bitmap.
/// Fork uses this to duplicate a parent page straight out of swap.
pub fn read_slot(slot: u32, contents: &mut [u8]) {
    let disk = ata::SWAP_DISK.lock();
    for i in 0..SECTORS_PER_PAGE {
        let mut sector = [0u8; SECTOR_SIZE];
        if disk.read_sector(slot + i as u32, &mut sector).is_ok() {
            contents[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
    }
}

/// True if the slot's sectors are marked allocated (used by invariant
/// checks).
pub fn slot_allocated(slot: u32) -> bool {
    SWAP_TABLE
        .lock()
        .all(slot as usize, SECTORS_PER_PAGE, true)
}
