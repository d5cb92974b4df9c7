pub mod gdt;
pub mod idt;
pub mod usermode;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Nesting depth of external interrupt handlers. Suspension points assert
/// this is zero; `Semaphore::up` is the one primitive allowed while it is
/// not.
static INTR_DEPTH: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn enter() {
    INTR_DEPTH.fetch_add(1, Ordering::AcqRel);
}

pub(crate) fn leave() {
    INTR_DEPTH.fetch_sub(1, Ordering::AcqRel);
}

/// True while running inside an external interrupt handler.
pub fn intr_context() -> bool {
    INTR_DEPTH.load(Ordering::Acquire) > 0
}

pub fn init() {
    gdt::init();
    idt::init();
    unsafe { idt::PICS.lock().initialize() };
}
