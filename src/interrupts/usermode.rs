//! The int 0x80 syscall gate and the Ring 3 transition.

use core::arch::naked_asm;

/// The int 0x80 entry — reached from Ring 3. Builds a full
/// `syscall::SyscallFrame` on the kernel stack (the CPU has already pushed
/// RIP/CS/RFLAGS/RSP/SS), hands it to the Rust dispatcher, then restores
/// everything and returns to user mode. The dispatcher writes the result
/// into the frame's `rax` slot.
#[unsafe(naked)]
pub extern "C" fn syscall_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // CPU pushed 5 qwords, we pushed 15: rsp is 8 off a 16-byte
        // boundary, as the System V call sequence expects after one more
        // push. Re-align around the call.
        "mov rdi, rsp",
        "sub rsp, 8",
        "call {handler}",
        "add rsp, 8",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym crate::syscall::syscall_handler,
    );
}

/// Point RSP at a saved frame, restore every register from it, and iretq.
/// Used to enter user mode for the first time after `exec` and to launch a
/// forked child with its parent's registers.
///
/// # Safety
/// `frame` must hold a complete, coherent user-mode register image with
/// Ring 3 selectors; the current kernel stack is abandoned.
#[unsafe(naked)]
pub unsafe extern "C" fn do_iret(frame: *const crate::syscall::SyscallFrame) -> ! {
    naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
    );
}
