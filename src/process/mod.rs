//! User-process lifecycle: the initial process, fork, exec, wait, exit.

pub mod elf;

use crate::fs::{self, SharedFile, FILESYS_SEMA};
use crate::interrupts::gdt;
use crate::interrupts::usermode::do_iret;
use crate::memory::page_table::{self, Pml4};
use crate::memory::PAGE_SIZE;
use crate::syscall::SyscallFrame;
use crate::thread::{self, Thread, Tid, PRI_DEFAULT, TID_ERROR};
use crate::vm::{self, LoadInfo, PageType, USER_STACK};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use elf::{ExecError, SegmentAction};
use spin::Mutex;
use x86_64::VirtAddr;

/// Whitespace-separated argument limit for a command line.
pub const ARG_MAX: usize = 100;

/// RFLAGS for a fresh user context: interrupts on plus the always-set bit.
const FLAG_IF: u64 = 1 << 9;
const FLAG_MBS: u64 = 1 << 1;

// ── scheduling glue ─────────────────────────────────────────────

/// Activate `next`'s address space and point RSP0 at its kernel stack.
/// Called on every context switch with interrupts disabled.
pub fn activate(next: &Arc<Thread>) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;

    match next.address_space_root() {
        Some(root) => unsafe {
            Cr3::write(
                PhysFrame::containing_address(x86_64::PhysAddr::new(root)),
                Cr3Flags::empty(),
            );
        },
        None => page_table::activate_base(),
    }
    gdt::set_tss_rsp0(next.kernel_stack_top());
}

// ── initial process ─────────────────────────────────────────────

/// Launch the first user process from a command line. Called once at boot;
/// the spawned thread is named after the first token.
pub fn create_init(cmd: &str) -> Tid {
    let name = String::from(cmd.split_whitespace().next().unwrap_or(cmd));
    let cmdline = String::from(cmd);
    thread::create(&name, PRI_DEFAULT, move || {
        if exec(&cmdline) < 0 {
            panic!("failed to launch initial process '{}'", cmdline);
        }
    })
}

// ── exec ────────────────────────────────────────────────────────

/// Replace the current process image with the executable named by the
/// first token of `cmd`. Does not return on success; -1 on failure (the
/// old image is already gone by then, so callers exit).
pub fn exec(cmd: &str) -> i64 {
    // Own the command line before the old address space is torn down; the
    // argument may point into user memory about to be unmapped.
    let cmdline = String::from(cmd);
    match load(&cmdline) {
        Ok(frame) => unsafe { do_iret(&frame) },
        Err(e) => {
            crate::log_warn!("exec: {}: {}", cmdline, e);
            -1
        }
    }
}

fn load(cmdline: &str) -> Result<SyscallFrame, ExecError> {
    let cur = thread::current();

    let argv: Vec<&str> = cmdline.split_whitespace().collect();
    if argv.is_empty() {
        return Err(ExecError::InvalidFormat);
    }
    if argv.len() > ARG_MAX {
        return Err(ExecError::TooManyArgs);
    }

    // Tear down the old user mappings and start over with a fresh root.
    cleanup(&cur);
    let pml4 = Pml4::new().ok_or(ExecError::MemoryError)?;
    cur.set_address_space(pml4);
    activate(&cur);

    FILESYS_SEMA.down();
    let file = fs::open(argv[0]);
    FILESYS_SEMA.up();
    let file = file.ok_or(ExecError::FileNotFound)?;
    let file_len = file.length() as u64;

    let mut header = [0u8; elf::EHDR_SIZE];
    FILESYS_SEMA.down();
    let n = file.read_at(&mut header, 0);
    FILESYS_SEMA.up();
    if n != elf::EHDR_SIZE {
        return Err(ExecError::ReadError);
    }
    let ehdr = elf::ElfHeader::parse(&header)?;

    // Every page of every LOAD segment shares this handle.
    let exec_file: SharedFile = Arc::new(Mutex::new(file));

    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * elf::PHDR_SIZE;
        let mut raw = [0u8; elf::PHDR_SIZE];
        FILESYS_SEMA.down();
        let n = exec_file.lock().read_at(&mut raw, off);
        FILESYS_SEMA.up();
        if n != elf::PHDR_SIZE {
            return Err(ExecError::ReadError);
        }
        let phdr = elf::ProgramHeader::parse(&raw)?;

        match elf::classify_segment(phdr.p_type) {
            SegmentAction::Ignore => continue,
            SegmentAction::Reject => return Err(ExecError::BadSegment),
            SegmentAction::Load => {
                elf::validate_segment(&phdr, file_len)?;
                register_segment(&exec_file, &phdr)?;
            }
        }
    }

    setup_stack()?;
    cur.set_name(argv[0]);

    let mut frame = SyscallFrame::zeroed();
    frame.rip = ehdr.e_entry;
    frame.cs = gdt::user_code_selector().0 as u64;
    frame.ss = gdt::user_data_selector().0 as u64;
    frame.rflags = FLAG_IF | FLAG_MBS;
    frame.rsp = USER_STACK;

    push_args(&argv, &mut frame)?;
    Ok(frame)
}

/// Register each page of a LOAD segment as a lazily-loaded anonymous page.
/// Contents come from the file on first fault and go to swap on eviction.
fn register_segment(file: &SharedFile, phdr: &elf::ProgramHeader) -> Result<(), ExecError> {
    let page_mask = PAGE_SIZE - 1;
    let writable = phdr.writable();
    let mut file_page = phdr.p_offset & !page_mask;
    let mem_page = phdr.p_vaddr & !page_mask;
    let page_offset = phdr.p_vaddr & page_mask;

    let (mut read_bytes, mut zero_bytes) = if phdr.p_filesz > 0 {
        let read = page_offset + phdr.p_filesz;
        let zero = (page_offset + phdr.p_memsz + page_mask) & !page_mask;
        (read, zero - read)
    } else {
        (0, (page_offset + phdr.p_memsz + page_mask) & !page_mask)
    };

    let mut upage = VirtAddr::new(mem_page);
    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = read_bytes.min(PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;

        let load = if page_read > 0 {
            Some(LoadInfo {
                file: file.clone(),
                offset: file_page as usize,
                read_bytes: page_read as usize,
            })
        } else {
            None
        };
        if !vm::alloc_page_with_initializer(PageType::Anon, upage, writable, load, 1) {
            return Err(ExecError::MemoryError);
        }

        read_bytes -= page_read;
        zero_bytes -= page_zero;
        file_page += PAGE_SIZE;
        upage += PAGE_SIZE;
    }
    Ok(())
}

/// One anon page at the top of the stack region, claimed eagerly.
fn setup_stack() -> Result<(), ExecError> {
    let stack_bottom = VirtAddr::new(USER_STACK - PAGE_SIZE);
    if !vm::alloc_page_with_initializer(PageType::Anon, stack_bottom, true, None, 1) {
        return Err(ExecError::MemoryError);
    }
    if !vm::claim_page(stack_bottom) {
        return Err(ExecError::MemoryError);
    }
    Ok(())
}

/// Copy argv onto the (already mapped) user stack and fill the argument
/// registers: rdi = argc, rsi = &argv[0], rsp at the fake return address.
fn push_args(argv: &[&str], frame: &mut SyscallFrame) -> Result<(), ExecError> {
    let image = unsafe {
        core::slice::from_raw_parts_mut(
            (USER_STACK - PAGE_SIZE) as usize as *mut u8,
            PAGE_SIZE as usize,
        )
    };
    let layout = layout_user_stack(argv, image, USER_STACK).ok_or(ExecError::TooManyArgs)?;
    frame.rsp = layout.rsp;
    frame.rdi = argv.len() as u64;
    frame.rsi = layout.argv_base;
    Ok(())
}

pub struct StackLayout {
    pub rsp: u64,
    pub argv_base: u64,
}

/// Lay out the initial user stack in `image`, whose last byte sits just
/// below `top_va`. High to low: argv strings (NUL-terminated, copied last
/// to first), zero padding to 8-byte alignment, the argv pointer vector
/// with a null sentinel, and a fake return address.
pub fn layout_user_stack(argv: &[&str], image: &mut [u8], top_va: u64) -> Option<StackLayout> {
    let base_va = top_va - image.len() as u64;
    let mut sp = top_va;

    let mut string_addrs: Vec<u64> = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        let bytes = arg.as_bytes();
        sp = sp.checked_sub(bytes.len() as u64 + 1)?;
        if sp < base_va {
            return None;
        }
        let at = (sp - base_va) as usize;
        image[at..at + bytes.len()].copy_from_slice(bytes);
        image[at + bytes.len()] = 0;
        string_addrs.push(sp);
    }
    string_addrs.reverse();

    // Word-align, zero-filling the padding.
    while sp % 8 != 0 {
        sp -= 1;
        if sp < base_va {
            return None;
        }
        image[(sp - base_va) as usize] = 0;
    }

    // argv[argc] = null, then argv[argc-1] .. argv[0].
    sp = sp.checked_sub(8 * (argv.len() as u64 + 1))?;
    if sp < base_va {
        return None;
    }
    let argv_base = sp;
    for (i, addr) in string_addrs.iter().enumerate() {
        let at = (sp - base_va) as usize + i * 8;
        image[at..at + 8].copy_from_slice(&addr.to_le_bytes());
    }
    let null_at = (sp - base_va) as usize + argv.len() * 8;
    image[null_at..null_at + 8].fill(0);

    // Fake return address.
    sp = sp.checked_sub(8)?;
    if sp < base_va {
        return None;
    }
    let at = (sp - base_va) as usize;
    image[at..at + 8].fill(0);

    Some(StackLayout {
        rsp: sp,
        argv_base,
    })
}

// ── fork ────────────────────────────────────────────────────────

/// Clone the calling process. The child gets a structural copy of the
/// address space, duplicated descriptors 2..255, and the parent's register
/// frame with rax forced to 0. The parent does not return until the child
/// is usable (or has failed).
pub fn fork(name: &str, frame: &SyscallFrame) -> Tid {
    let parent = thread::current();
    *parent.fork_frame.lock() = *frame;

    let parent_for_child = parent.clone();
    let tid = thread::create(name, PRI_DEFAULT, move || {
        do_fork(parent_for_child);
    });
    if tid == TID_ERROR {
        return TID_ERROR;
    }

    let child = parent
        .children
        .lock()
        .iter()
        .find(|c| c.tid() == tid)
        .cloned();
    match child {
        Some(child) => {
            child.fork_done.down();
            tid
        }
        None => TID_ERROR,
    }
}

/// Child half of fork, running on the new thread.
fn do_fork(parent: Arc<Thread>) {
    let child = thread::current();
    let mut frame = *parent.fork_frame.lock();

    let ok = clone_parent_state(&parent, &child);
    if !ok {
        child.fork_done.up();
        exit(-1);
    }

    // The child observes fork() returning zero.
    frame.rax = 0;
    child.fork_done.up();
    unsafe { do_iret(&frame) };
}

fn clone_parent_state(parent: &Arc<Thread>, child: &Arc<Thread>) -> bool {
    let Some(pml4) = Pml4::new() else {
        return false;
    };
    child.set_address_space(pml4);
    activate(child);

    if !vm::copy_spt(&parent.spt) {
        return false;
    }

    parent.fd_lock.acquire();
    child
        .fd_table
        .lock()
        .duplicate_from(&parent.fd_table.lock());
    parent.fd_lock.release();
    true
}

// ── wait ────────────────────────────────────────────────────────

/// Join a direct child: blocks until it exits, reaps its status, and lets
/// it be destroyed. -1 for non-children, grandchildren, or a second wait
/// on the same child.
pub fn wait(child_tid: Tid) -> i64 {
    if child_tid < 0 {
        return -1;
    }
    let cur = thread::current();

    let child = cur
        .children
        .lock()
        .iter()
        .find(|c| c.tid() == child_tid)
        .cloned();
    let Some(child) = child else {
        return -1;
    };
    if child.already_waited.swap(true, Ordering::AcqRel) {
        return -1;
    }

    child.wait_done.down();
    let status = child.exit_status.load(Ordering::Acquire);

    cur.children.lock().retain(|c| c.tid() != child_tid);
    child.free_gate.up();
    status
}

// ── exit ────────────────────────────────────────────────────────

/// Terminate the calling process with `status`, printing the exit line the
/// whole test harness keys on.
pub fn exit(status: i64) -> ! {
    let cur = thread::current();
    cur.exit_status.store(status, Ordering::Release);
    crate::println!("{}: exit({})", cur.name(), status);
    shutdown();
}

/// A kernel thread's entry closure returned: exit quietly with whatever
/// status is already recorded.
pub fn thread_finished() -> ! {
    shutdown();
}

/// Common teardown: release descriptors, rendezvous with the parent, then
/// destroy the address space and hand the thread to the scheduler as
/// dying.
fn shutdown() -> ! {
    let cur = thread::current();

    cur.fd_lock.acquire();
    cur.fd_table.lock().close_all();
    cur.fd_lock.release();

    // A parent that waits must observe our status before we can be freed;
    // wake it, then hold at the gate until it has reaped us.
    let parent = cur.parent.lock().clone().and_then(|w| w.upgrade());
    if parent.is_some() {
        cur.wait_done.up();
        cur.free_gate.down();
    }

    cleanup(&cur);
    thread::exit();
}

/// Destroy the SPT (writing back or discarding page contents, freeing
/// frames and swap slots), then the page-table root.
fn cleanup(cur: &Arc<Thread>) {
    cur.spt.kill();
    if let Some(pml4) = cur.take_address_space() {
        page_table::activate_base();
        drop(pml4);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u64(image: &[u8], base_va: u64, at: u64) -> u64 {
        let idx = (at - base_va) as usize;
        u64::from_le_bytes(image[idx..idx + 8].try_into().unwrap())
    }

    fn read_cstr(image: &[u8], base_va: u64, at: u64) -> Vec<u8> {
        let mut idx = (at - base_va) as usize;
        let mut out = Vec::new();
        while image[idx] != 0 {
            out.push(image[idx]);
            idx += 1;
        }
        out
    }

    #[test]
    fn stack_layout_matches_the_convention() {
        const TOP: u64 = 0x4748_0000;
        let mut image = vec![0u8; 4096];
        let argv = ["grep", "foo", "bar.txt"];
        let layout = layout_user_stack(&argv, &mut image, TOP).unwrap();
        let base = TOP - 4096;

        // rsp points at the fake return address (zero), argv base is just
        // above it.
        assert_eq!(read_u64(&image, base, layout.rsp), 0);
        assert_eq!(layout.argv_base, layout.rsp + 8);

        // Pointer vector: one entry per arg plus the null sentinel, all
        // 8-byte aligned.
        assert_eq!(layout.argv_base % 8, 0);
        for (i, expected) in argv.iter().enumerate() {
            let str_addr = read_u64(&image, base, layout.argv_base + 8 * i as u64);
            assert_eq!(read_cstr(&image, base, str_addr), expected.as_bytes());
        }
        assert_eq!(
            read_u64(&image, base, layout.argv_base + 8 * argv.len() as u64),
            0
        );
    }

    #[test]
    fn stack_layout_strings_sit_below_the_top() {
        const TOP: u64 = 0x1000_0000;
        let mut image = vec![0u8; 4096];
        let layout = layout_user_stack(&["a"], &mut image, TOP).unwrap();
        // "a\0" occupies the top two bytes.
        assert_eq!(image[4094], b'a');
        assert_eq!(image[4095], 0);
        assert!(layout.rsp < TOP - 2);
    }

    #[test]
    fn stack_layout_rejects_oversized_argv() {
        const TOP: u64 = 0x1000_0000;
        let mut image = vec![0u8; 64];
        let long = "x".repeat(100);
        assert!(layout_user_stack(&[&long], &mut image, TOP).is_none());
    }
}
