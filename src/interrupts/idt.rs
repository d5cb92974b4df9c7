use super::gdt;
use crate::{log_error, println};
use lazy_static::lazy_static;
use pic8259::ChainedPics;
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Vector of the syscall gate, reachable from Ring 3.
pub const SYSCALL_VECTOR: u8 = 0x80;

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum InterruptIndex {
    Timer = PIC_1_OFFSET,
    Keyboard = PIC_1_OFFSET + 1,
}

impl InterruptIndex {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn as_usize(self) -> usize {
        usize::from(self.as_u8())
    }
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_fault_handler);
        idt[InterruptIndex::Timer.as_usize()].set_handler_fn(timer_interrupt_handler);
        idt[InterruptIndex::Keyboard.as_usize()].set_handler_fn(keyboard_interrupt_handler);
        unsafe {
            idt[SYSCALL_VECTOR as usize]
                .set_handler_addr(x86_64::VirtAddr::new(
                    super::usermode::syscall_entry as *const () as u64,
                ))
                .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        }
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    println!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// Page-fault entry. Legitimate lazy loads and stack growth are fixed up in
/// `vm::try_handle_fault` and the faulting instruction retried; anything
/// else kills the process (user mode) or panics (kernel mode).
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    // CR2 must be read before interrupts are re-enabled; a nested fault
    // would clobber it.
    let fault_addr = Cr2::read();
    let not_present = !error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);
    let write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let user = error_code.contains(PageFaultErrorCode::USER_MODE);
    x86_64::instructions::interrupts::enable();

    let fault_rsp = stack_frame.stack_pointer.as_u64();
    if crate::vm::try_handle_fault(fault_rsp, fault_addr, user, write, not_present) {
        return;
    }

    // User-mode faults and kernel-mode faults on a user address (a syscall
    // touching a bad buffer) kill the process; the rest are kernel bugs.
    if user || fault_addr.as_u64() < crate::memory::USER_LIMIT {
        crate::process::exit(-1);
    }

    log_error!(
        "kernel page fault at {:#x} ({} error, {})",
        fault_addr.as_u64(),
        if not_present { "not present" } else { "rights violation" },
        if write { "writing" } else { "reading" },
    );
    panic!("EXCEPTION: PAGE FAULT\n{:#?}", stack_frame);
}

extern "x86-interrupt" fn timer_interrupt_handler(_stack_frame: InterruptStackFrame) {
    super::enter();
    let now = crate::devices::timer::on_tick();
    crate::thread::tick(now);
    super::leave();

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Timer.as_u8());
    }

    // The handler has unwound; honor a preemption request from `tick` while
    // the interrupt frame is still pending.
    crate::thread::preempt_on_return();
}

extern "x86-interrupt" fn keyboard_interrupt_handler(_stack_frame: InterruptStackFrame) {
    use x86_64::instructions::port::Port;

    super::enter();
    let mut port: Port<u8> = Port::new(0x60);
    let scancode = unsafe { port.read() };
    crate::devices::keyboard::push_scancode(scancode);
    super::leave();

    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(InterruptIndex::Keyboard.as_u8());
    }
}

extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    panic!(
        "EXCEPTION: GENERAL PROTECTION FAULT\nError Code: {error_code}\n{:#?}",
        stack_frame
    );
}
