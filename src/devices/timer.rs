use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::instructions::port::Port;

/// Timer frequency programmed into the PIT.
pub const TICK_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program PIT channel 0 for a periodic interrupt at `TICK_HZ`.
pub fn init() {
    const PIT_BASE_HZ: u32 = 1_193_182;
    let divisor = (PIT_BASE_HZ / TICK_HZ) as u16;
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut data: Port<u8> = Port::new(0x40);
    unsafe {
        cmd.write(0x36); // channel 0, lo/hi byte, square wave
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
    crate::log_info!("timer: PIT programmed for {} Hz", TICK_HZ);
}

/// Advance the tick counter; called from the timer interrupt handler.
pub fn on_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Suspend the caller for at least `duration` ticks.
pub fn sleep(duration: u64) {
    if duration == 0 {
        return;
    }
    crate::thread::sleep_until(ticks() + duration);
}
