//! The syscall boundary: register decode, pointer validation, dispatch.
//!
//! Convention: number in rax; arguments in rdi, rsi, rdx, r10, r8, r9;
//! result back in rax. Pointer arguments are validated against the current
//! address space; a violation terminates the process with status -1.

use crate::fs::{self, SharedFile, FILESYS_SEMA};
use crate::memory::{PAGE_SIZE, USER_LIMIT};
use crate::process;
use crate::thread;
use crate::vm;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use core::sync::atomic::Ordering;
use spin::Mutex;
use x86_64::VirtAddr;

// Syscall numbers, as the user-side library emits them.
pub const SYS_HALT: u64 = 0;
pub const SYS_EXIT: u64 = 1;
pub const SYS_FORK: u64 = 2;
pub const SYS_EXEC: u64 = 3;
pub const SYS_WAIT: u64 = 4;
pub const SYS_CREATE: u64 = 5;
pub const SYS_REMOVE: u64 = 6;
pub const SYS_OPEN: u64 = 7;
pub const SYS_FILESIZE: u64 = 8;
pub const SYS_READ: u64 = 9;
pub const SYS_WRITE: u64 = 10;
pub const SYS_SEEK: u64 = 11;
pub const SYS_TELL: u64 = 12;
pub const SYS_CLOSE: u64 = 13;
pub const SYS_MMAP: u64 = 14;
pub const SYS_MUNMAP: u64 = 15;

const ERR: u64 = u64::MAX;

/// Longest accepted command line / path, bytes.
const STR_MAX: usize = 4096;

/// The register image captured at the int 0x80 gate, low address first.
/// The layout must match the push order in `interrupts::usermode`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SyscallFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    // pushed by the CPU
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl SyscallFrame {
    pub fn zeroed() -> SyscallFrame {
        unsafe { core::mem::zeroed() }
    }
}

pub fn init() {
    crate::log_info!("Syscall interface initialized.");
}

/// Rust-side landing point of the int 0x80 gate.
pub extern "C" fn syscall_handler(frame: &mut SyscallFrame) {
    let cur = thread::current();
    // Faults taken in kernel mode on this thread's behalf consult the user
    // rsp captured here.
    cur.saved_user_rsp.store(frame.rsp, Ordering::Release);

    // The interrupt gate masked IF; syscalls are preemptible.
    x86_64::instructions::interrupts::enable();

    frame.rax = dispatch(frame);
}

fn dispatch(frame: &mut SyscallFrame) -> u64 {
    let (a0, a1, a2, a3, a4) = (frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8);
    match frame.rax {
        SYS_HALT => sys_halt(),
        SYS_EXIT => process::exit(a0 as i64),
        SYS_FORK => sys_fork(a0, frame),
        SYS_EXEC => sys_exec(a0),
        SYS_WAIT => process::wait(a0 as i64) as u64,
        SYS_CREATE => sys_create(a0, a1),
        SYS_REMOVE => sys_remove(a0),
        SYS_OPEN => sys_open(a0),
        SYS_FILESIZE => sys_filesize(a0),
        SYS_READ => sys_read(a0, a1, a2),
        SYS_WRITE => sys_write(a0, a1, a2),
        SYS_SEEK => {
            sys_seek(a0, a1);
            0
        }
        SYS_TELL => sys_tell(a0),
        SYS_CLOSE => {
            sys_close(a0);
            0
        }
        SYS_MMAP => sys_mmap(a0, a1, a2, a3, a4),
        SYS_MUNMAP => {
            sys_munmap(a0);
            0
        }
        nr => {
            crate::log_warn!("syscall: unknown number {}", nr);
            ERR
        }
    }
}

// ── pointer validation ──────────────────────────────────────────

/// A user pointer is fine if it is non-null, below the kernel boundary,
/// and either mapped or covered by a descriptor the fault handler can
/// materialize.
fn validate_ptr(addr: u64) -> bool {
    if addr == 0 || addr >= USER_LIMIT {
        return false;
    }
    let cur = thread::current();
    let va = VirtAddr::new(addr);
    let mapped = cur
        .pml4
        .lock()
        .as_ref()
        .map(|p| p.get_page(va).is_some())
        .unwrap_or(false);
    mapped || cur.spt.find(va).is_some()
}

/// Validate a whole buffer: both ends and every page boundary between.
fn validate_buffer(addr: u64, len: usize) -> bool {
    if len == 0 {
        return true;
    }
    if !validate_ptr(addr) || !validate_ptr(addr + len as u64 - 1) {
        return false;
    }
    let mut at = addr;
    let end = addr + len as u64;
    while at < end {
        if !validate_ptr(at) {
            return false;
        }
        at += PAGE_SIZE;
    }
    true
}

/// Copy a NUL-terminated user string into the kernel, validating page by
/// page. Address violations kill the process.
fn copy_in_str(addr: u64) -> String {
    let mut bytes = alloc::vec::Vec::new();
    let mut at = addr;
    loop {
        if !validate_ptr(at) || bytes.len() > STR_MAX {
            process::exit(-1);
        }
        let b = unsafe { *(at as usize as *const u8) };
        if b == 0 {
            break;
        }
        bytes.push(b);
        at += 1;
    }
    String::from_utf8(bytes).unwrap_or_else(|_| process::exit(-1))
}

fn fd_get(fd: u64) -> Option<SharedFile> {
    let cur = thread::current();
    let table = cur.fd_table.lock();
    table.get(fd as usize)
}

// ── the calls ───────────────────────────────────────────────────

fn sys_halt() -> ! {
    use x86_64::instructions::port::Port;
    thread::print_stats();
    crate::log_info!("halt: powering off");
    // QEMU/Bochs ACPI poweroff port.
    let mut port: Port<u16> = Port::new(0x604);
    unsafe { port.write(0x2000) };
    loop {
        x86_64::instructions::hlt();
    }
}

fn sys_fork(name_ptr: u64, frame: &SyscallFrame) -> u64 {
    if !validate_ptr(name_ptr) {
        process::exit(-1);
    }
    let name = copy_in_str(name_ptr);
    process::fork(&name, frame) as u64
}

fn sys_exec(cmd_ptr: u64) -> u64 {
    if !validate_ptr(cmd_ptr) {
        process::exit(-1);
    }
    let cmd = copy_in_str(cmd_ptr);
    if process::exec(&cmd) < 0 {
        process::exit(-1);
    }
    unreachable!("exec returned on success");
}

fn sys_create(path_ptr: u64, size: u64) -> u64 {
    if !validate_ptr(path_ptr) {
        process::exit(-1);
    }
    let path = copy_in_str(path_ptr);
    FILESYS_SEMA.down();
    let ok = fs::create(&path, size as usize);
    FILESYS_SEMA.up();
    ok as u64
}

fn sys_remove(path_ptr: u64) -> u64 {
    if !validate_ptr(path_ptr) {
        process::exit(-1);
    }
    let path = copy_in_str(path_ptr);
    FILESYS_SEMA.down();
    let ok = fs::remove(&path);
    FILESYS_SEMA.up();
    ok as u64
}

fn sys_open(path_ptr: u64) -> u64 {
    if !validate_ptr(path_ptr) {
        process::exit(-1);
    }
    let path = copy_in_str(path_ptr);

    FILESYS_SEMA.down();
    let file = fs::open(&path);
    FILESYS_SEMA.up();
    let Some(mut file) = file else {
        return ERR;
    };

    // A process that opens its own executable gets a write-banned handle.
    let cur = thread::current();
    if cur.name() == path {
        file.deny_write();
    }

    cur.fd_lock.acquire();
    let fd = cur
        .fd_table
        .lock()
        .allocate(Arc::new(Mutex::new(file)));
    cur.fd_lock.release();

    match fd {
        Some(fd) => fd as u64,
        None => ERR,
    }
}

fn sys_filesize(fd: u64) -> u64 {
    match fd_get(fd) {
        Some(file) => {
            FILESYS_SEMA.down();
            let len = file.lock().length();
            FILESYS_SEMA.up();
            len as u64
        }
        None => ERR,
    }
}

fn sys_read(fd: u64, buf: u64, len: u64) -> u64 {
    let len = len as usize;
    if !validate_buffer(buf, len) {
        process::exit(-1);
    }
    if len == 0 {
        return 0;
    }

    // fd 0 is console input.
    if fd == 0 {
        for i in 0..len {
            let b = crate::devices::keyboard::input_getc();
            unsafe { *((buf as usize + i) as *mut u8) = b };
        }
        return len as u64;
    }

    let Some(file) = fd_get(fd) else {
        return ERR;
    };
    // Bounce through a kernel buffer: touching the user range can fault
    // and fault handling may need the file-system semaphore.
    let mut bounce = vec![0u8; len];
    FILESYS_SEMA.down();
    let n = file.lock().read(&mut bounce);
    FILESYS_SEMA.up();

    let dst = unsafe { core::slice::from_raw_parts_mut(buf as usize as *mut u8, n) };
    dst.copy_from_slice(&bounce[..n]);
    n as u64
}

fn sys_write(fd: u64, buf: u64, len: u64) -> u64 {
    let len = len as usize;
    if fd == 0 {
        return ERR; // stdin
    }
    if !validate_buffer(buf, len) {
        process::exit(-1);
    }
    if len == 0 {
        return 0;
    }

    let src = unsafe { core::slice::from_raw_parts(buf as usize as *const u8, len) };

    // fd 1 goes to the console in one call so process output never
    // interleaves mid-buffer.
    if fd == 1 {
        crate::vga::putbuf(src);
        return len as u64;
    }

    let Some(file) = fd_get(fd) else {
        return ERR;
    };
    let bounce = src.to_vec();
    FILESYS_SEMA.down();
    let n = file.lock().write(&bounce);
    FILESYS_SEMA.up();
    n as u64
}

fn sys_seek(fd: u64, pos: u64) {
    if let Some(file) = fd_get(fd) {
        FILESYS_SEMA.down();
        file.lock().seek(pos as usize);
        FILESYS_SEMA.up();
    }
}

fn sys_tell(fd: u64) -> u64 {
    match fd_get(fd) {
        Some(file) => {
            FILESYS_SEMA.down();
            let pos = file.lock().tell();
            FILESYS_SEMA.up();
            pos as u64
        }
        None => ERR,
    }
}

fn sys_close(fd: u64) {
    let cur = thread::current();
    cur.fd_lock.acquire();
    cur.fd_table.lock().release(fd as usize);
    cur.fd_lock.release();
}

fn sys_mmap(addr: u64, len: u64, writable: u64, fd: u64, offset: u64) -> u64 {
    if addr == 0 || addr.saturating_add(len) >= USER_LIMIT {
        return 0;
    }
    // The console descriptors cannot back a mapping.
    if fd < 2 {
        return 0;
    }
    let Some(file) = fd_get(fd) else {
        return 0;
    };
    match vm::file::do_mmap(
        VirtAddr::new(addr),
        len as usize,
        writable != 0,
        &file,
        offset as usize,
    ) {
        Some(va) => va.as_u64(),
        None => 0,
    }
}

fn sys_munmap(addr: u64) {
    if addr == 0 || addr >= USER_LIMIT {
        return;
    }
    vm::file::do_munmap(VirtAddr::new(addr));
}
