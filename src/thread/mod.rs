//! Thread control blocks and the preemptive priority scheduler.
//!
//! Scheduler state (ready queue, sleep queue, destruction queue, current)
//! lives behind one global spinlock that is only ever taken with interrupts
//! disabled, so the timer handler can take it without deadlocking.

pub mod context;

use crate::interrupts;
use crate::memory::page_table::Pml4;
use crate::sync::{Lock, Semaphore};
use crate::syscall::SyscallFrame;
use crate::vm::SupplementalPageTable;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use context::Context;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;

pub type Tid = i64;
pub const TID_ERROR: Tid = -1;

pub const PRI_MIN: u8 = 0;
pub const PRI_DEFAULT: u8 = 31;
pub const PRI_MAX: u8 = 63;

/// Ticks a thread may run before preemption is requested.
const TIME_SLICE: u64 = 4;

/// Kernel stack size per thread (16 KiB).
const STACK_SIZE: usize = 4096 * 4;

/// Written at the very bottom of each kernel stack; a change means the
/// stack grew down into the canary.
const STACK_MAGIC: u64 = 0xcd6a_bf4b_d42d_f210;

const NAME_MAX: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Running = 0,
    Ready = 1,
    Blocked = 2,
    Dying = 3,
}

impl Status {
    fn from_u8(v: u8) -> Status {
        match v {
            0 => Status::Running,
            1 => Status::Ready,
            2 => Status::Blocked,
            _ => Status::Dying,
        }
    }
}

/// A kernel thread or user process. Everything the three cores share about
/// one schedulable entity hangs off this block.
pub struct Thread {
    tid: Tid,
    name: Mutex<String>,
    status: AtomicU8,

    priority_base: AtomicU8,
    priority_effective: AtomicU8,

    /// Tick at which to wake; valid only while parked in the sleep queue.
    wake_tick: AtomicU64,

    /// Address of the `Lock` this thread is blocked acquiring, or 0.
    /// Donation chains are walked through this field.
    waiting_on_lock: AtomicUsize,
    /// Threads currently donating their priority to us, strongest first.
    donations: Mutex<Vec<Arc<Thread>>>,

    context: UnsafeCell<Context>,
    kernel_stack: Box<[u8]>,

    // ── user-process state ──
    pub pml4: Mutex<Option<Pml4>>,
    /// Physical address of the pml4 root (0 = kernel thread), duplicated
    /// out of `pml4` so context switches never contend on its mutex.
    address_space_root: AtomicU64,
    pub spt: SupplementalPageTable,
    pub fd_table: Mutex<crate::fs::fd::FdTable>,
    pub fd_lock: Lock,

    pub parent: Mutex<Option<Weak<Thread>>>,
    pub children: Mutex<Vec<Arc<Thread>>>,

    /// Rendezvous: parent downs this; the child ups it once its clone is
    /// usable (or has failed).
    pub fork_done: Semaphore,
    /// Rendezvous: parent's `wait` downs this; the child ups it on exit.
    pub wait_done: Semaphore,
    /// Rendezvous: the child downs this after exiting; the parent ups it
    /// once it has read the exit status.
    pub free_gate: Semaphore,

    /// Register snapshot taken at the `fork` syscall, consumed by the child.
    pub fork_frame: Mutex<SyscallFrame>,
    /// User stack pointer recorded at syscall entry, for stack-growth
    /// decisions on faults taken in kernel mode.
    pub saved_user_rsp: AtomicU64,

    pub exit_status: AtomicI64,
    pub already_waited: AtomicBool,
}

// The context cell and raw stack are only touched under the scheduler lock
// with interrupts disabled.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn new(name: &str, priority: u8, ctx: Context, stack: Box<[u8]>) -> Thread {
        assert!(priority <= PRI_MAX);
        let mut truncated = String::from(name);
        truncated.truncate(NAME_MAX);
        Thread {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: Mutex::new(truncated),
            status: AtomicU8::new(Status::Blocked as u8),
            priority_base: AtomicU8::new(priority),
            priority_effective: AtomicU8::new(priority),
            wake_tick: AtomicU64::new(0),
            waiting_on_lock: AtomicUsize::new(0),
            donations: Mutex::new(Vec::new()),
            context: UnsafeCell::new(ctx),
            kernel_stack: stack,
            pml4: Mutex::new(None),
            address_space_root: AtomicU64::new(0),
            spt: SupplementalPageTable::new(),
            fd_table: Mutex::new(crate::fs::fd::FdTable::new()),
            fd_lock: Lock::new(),
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            fork_done: Semaphore::new(0),
            wait_done: Semaphore::new(0),
            free_gate: Semaphore::new(0),
            fork_frame: Mutex::new(SyscallFrame::zeroed()),
            saved_user_rsp: AtomicU64::new(0),
            exit_status: AtomicI64::new(0),
            already_waited: AtomicBool::new(false),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        let mut truncated = String::from(name);
        truncated.truncate(NAME_MAX);
        *self.name.lock() = truncated;
    }

    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, s: Status) {
        self.status.store(s as u8, Ordering::Release);
    }

    pub fn base_priority(&self) -> u8 {
        self.priority_base.load(Ordering::Acquire)
    }

    pub fn effective_priority(&self) -> u8 {
        self.priority_effective.load(Ordering::Acquire)
    }

    pub fn set_effective_priority(&self, p: u8) {
        self.priority_effective.store(p, Ordering::Release);
    }

    pub fn wake_tick(&self) -> u64 {
        self.wake_tick.load(Ordering::Acquire)
    }

    pub fn waiting_on(&self) -> Option<usize> {
        match self.waiting_on_lock.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn set_waiting_on(&self, lock_addr: Option<usize>) {
        self.waiting_on_lock
            .store(lock_addr.unwrap_or(0), Ordering::Release);
    }

    /// Record `donor` as donating to this thread, strongest donor first.
    pub fn add_donation(&self, donor: Arc<Thread>) {
        let mut donations = self.donations.lock();
        let pos = donations
            .iter()
            .position(|t| t.effective_priority() < donor.effective_priority())
            .unwrap_or(donations.len());
        donations.insert(pos, donor);
    }

    /// Withdraw every donation made for `lock_addr` (its waiters stop
    /// donating once the lock changes hands).
    pub fn remove_donations_for(&self, lock_addr: usize) {
        self.donations
            .lock()
            .retain(|d| d.waiting_on() != Some(lock_addr));
    }

    /// Recompute the effective priority from the base and the strongest
    /// remaining donor.
    pub fn refresh_priority(&self) {
        let mut donations = self.donations.lock();
        donations.sort_by(|a, b| b.effective_priority().cmp(&a.effective_priority()));
        let donated = donations.first().map(|t| t.effective_priority());
        drop(donations);
        let base = self.base_priority();
        self.set_effective_priority(donated.map_or(base, |d| d.max(base)));
    }

    /// True while this thread is a user process (owns an address space).
    pub fn is_user(&self) -> bool {
        self.address_space_root.load(Ordering::Acquire) != 0
    }

    /// Install a fresh page-table root for this thread.
    pub fn set_address_space(&self, pml4: Pml4) {
        self.address_space_root
            .store(pml4.root_addr().as_u64(), Ordering::Release);
        *self.pml4.lock() = Some(pml4);
    }

    /// Detach the page-table root, reverting this thread to a kernel-only
    /// address space. The caller destroys the returned root.
    pub fn take_address_space(&self) -> Option<Pml4> {
        self.address_space_root.store(0, Ordering::Release);
        self.pml4.lock().take()
    }

    pub fn address_space_root(&self) -> Option<u64> {
        match self.address_space_root.load(Ordering::Acquire) {
            0 => None,
            root => Some(root),
        }
    }

    fn context_ptr(&self) -> *mut Context {
        self.context.get()
    }

    pub fn kernel_stack_top(&self) -> u64 {
        if self.kernel_stack.is_empty() {
            return 0;
        }
        let top = self.kernel_stack.as_ptr() as u64 + self.kernel_stack.len() as u64;
        top & !0xF
    }

    fn plant_canary(&mut self) {
        if self.kernel_stack.len() >= 8 {
            self.kernel_stack[..8].copy_from_slice(&STACK_MAGIC.to_ne_bytes());
        }
    }

    fn check_canary(&self) {
        if self.kernel_stack.len() >= 8 {
            let mut word = [0u8; 8];
            word.copy_from_slice(&self.kernel_stack[..8]);
            assert_eq!(
                u64::from_ne_bytes(word),
                STACK_MAGIC,
                "kernel stack overflow in thread {}",
                self.tid
            );
        }
    }
}

// ── global scheduler state ──────────────────────────────────────

struct Scheduler {
    /// Ordered by effective priority, highest first.
    ready: Vec<Arc<Thread>>,
    /// Ordered by wake tick, earliest first.
    sleeping: Vec<Arc<Thread>>,
    /// Dying threads whose pages are reclaimed on the next schedule pass.
    destruction: Vec<Arc<Thread>>,
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
}

lazy_static! {
    static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler {
        ready: Vec::new(),
        sleeping: Vec::new(),
        destruction: Vec::new(),
        current: None,
        idle: None,
    });
}

static NEXT_TID: AtomicI64 = AtomicI64::new(1);
static SLICE_TICKS: AtomicU64 = AtomicU64::new(0);
static PREEMPT_REQUESTED: AtomicBool = AtomicBool::new(false);

static IDLE_TICKS: AtomicU64 = AtomicU64::new(0);
static KERNEL_TICKS: AtomicU64 = AtomicU64::new(0);
static USER_TICKS: AtomicU64 = AtomicU64::new(0);

fn insert_ready(sched: &mut Scheduler, t: Arc<Thread>) {
    let pos = sched
        .ready
        .iter()
        .position(|r| r.effective_priority() < t.effective_priority())
        .unwrap_or(sched.ready.len());
    t.set_status(Status::Ready);
    sched.ready.insert(pos, t);
}

fn next_thread(sched: &mut Scheduler) -> Arc<Thread> {
    if sched.ready.is_empty() {
        sched.idle.clone().expect("scheduler has no idle thread")
    } else {
        sched.ready.remove(0)
    }
}

/// Pick and switch to the next thread. The caller has already repositioned
/// the current thread (ready queue, sleep queue, a waiters list, or the
/// destruction queue) and holds the scheduler lock with interrupts off.
fn schedule(mut sched: spin::MutexGuard<'_, Scheduler>, dying: bool) {
    let prev = sched.current.take().expect("schedule without current");
    if !dying {
        // Reclaim threads that finished on an earlier pass. Never done on
        // the dying path: the thread being pushed is still on its stack.
        sched.destruction.clear();
    }

    let next = next_thread(&mut sched);
    prev.check_canary();
    next.check_canary();
    next.set_status(Status::Running);
    SLICE_TICKS.store(0, Ordering::Release);

    crate::process::activate(&next);

    sched.current = Some(next.clone());

    if Arc::ptr_eq(&prev, &next) {
        return;
    }

    let prev_ctx = prev.context_ptr();
    let next_ctx = next.context_ptr();
    drop(sched);
    drop(next);

    unsafe {
        if dying {
            drop(prev);
            context::restore_context(next_ctx);
        } else {
            drop(prev);
            context::switch_context(prev_ctx, next_ctx);
        }
    }
}

// ── public scheduler API ────────────────────────────────────────

/// Convert the boot CPU context into the first thread.
pub fn init() {
    let mut sched = SCHEDULER.lock();
    let main = Arc::new(Thread::new("main", PRI_DEFAULT, Context::empty(), Box::new([])));
    main.set_status(Status::Running);
    sched.current = Some(main);
    crate::log_info!("scheduler: boot thread converted to 'main'");
}

/// Create the idle thread and enable preemptive scheduling.
pub fn start() {
    let idle_started = Arc::new(Semaphore::new(0));
    let started = idle_started.clone();
    create("idle", PRI_MIN, move || {
        let me = current();
        SCHEDULER.lock().idle = Some(me);
        started.up();
        loop {
            // Block until re-selected, then halt with interrupts atomically
            // re-enabled so the next timer tick can run.
            x86_64::instructions::interrupts::disable();
            block();
            x86_64::instructions::interrupts::enable_and_hlt();
        }
    });
    x86_64::instructions::interrupts::enable();
    idle_started.down();
    crate::log_info!("scheduler: preemption enabled");
}

/// Rust-side landing point for brand-new threads; `raw` is the boxed entry
/// closure parked in r12 by `create`.
pub(crate) extern "C" fn thread_main(raw: *mut Box<dyn FnOnce() + Send>) -> ! {
    x86_64::instructions::interrupts::enable();
    let func = unsafe { Box::from_raw(raw) };
    func();
    // Normal return: tear down as a silent exit so a waiting parent still
    // gets its rendezvous.
    crate::process::thread_finished();
}

/// Spawn a kernel thread running `func`. The new thread becomes a child of
/// the caller. Returns its tid.
pub fn create<F>(name: &str, priority: u8, func: F) -> Tid
where
    F: FnOnce() + Send + 'static,
{
    let stack = vec![0u8; STACK_SIZE].into_boxed_slice();
    let stack_top = stack.as_ptr() as u64 + STACK_SIZE as u64;

    let entry: Box<dyn FnOnce() + Send> = Box::new(func);
    let raw = Box::into_raw(Box::new(entry));

    let ctx = Context::new(
        context::thread_entry_trampoline as *const () as u64,
        stack_top,
        raw as u64,
    );

    let mut thread = Thread::new(name, priority, ctx, stack);
    thread.plant_canary();
    let thread = Arc::new(thread);
    let tid = thread.tid();

    without_interrupts(|| {
        let parent = current();
        *thread.parent.lock() = Some(Arc::downgrade(&parent));
        parent.children.lock().push(thread.clone());
        unblock(thread.clone());
    });

    if thread.effective_priority() > current().effective_priority() {
        yield_now();
    }
    tid
}

/// The running thread.
pub fn current() -> Arc<Thread> {
    without_interrupts(|| {
        SCHEDULER
            .lock()
            .current
            .clone()
            .expect("no current thread")
    })
}

/// Suspend the running thread. The caller has already queued it somewhere
/// it can be found again (a waiters list, the sleep queue). Interrupts must
/// be disabled.
pub fn block() {
    assert!(!interrupts::intr_context());
    let sched = SCHEDULER.lock();
    let cur = sched.current.clone().expect("block without current");
    cur.set_status(Status::Blocked);
    schedule(sched, false);
}

/// Move a blocked thread to the ready queue. Never preempts the caller;
/// callers that want preemption follow up with `check_yield`.
pub fn unblock(t: Arc<Thread>) {
    without_interrupts(|| {
        assert_eq!(t.status(), Status::Blocked, "unblocking a non-blocked thread");
        let mut sched = SCHEDULER.lock();
        insert_ready(&mut sched, t);
    });
}

/// Give up the CPU; the caller is reinserted by priority and may be
/// rescheduled immediately if it still outranks everyone.
pub fn yield_now() {
    assert!(!interrupts::intr_context());
    without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current.clone().unwrap();
        let is_idle = sched
            .idle
            .as_ref()
            .map(|i| Arc::ptr_eq(i, &cur))
            .unwrap_or(false);
        if !is_idle {
            insert_ready(&mut sched, cur);
        }
        schedule(sched, false);
    });
}

/// Yield only if a ready thread strictly outranks the caller. Safe to call
/// after wakeups or priority changes; a no-op from interrupt context.
pub fn check_yield() {
    if interrupts::intr_context() {
        return;
    }
    let should = without_interrupts(|| {
        let sched = SCHEDULER.lock();
        match (sched.ready.first(), sched.current.as_ref()) {
            (Some(front), Some(cur)) => front.effective_priority() > cur.effective_priority(),
            _ => false,
        }
    });
    if should {
        yield_now();
    }
}

/// Sleep until the given tick. The sleep queue is kept ordered by wake
/// tick so the timer only ever inspects its head.
pub fn sleep_until(wake_tick: u64) {
    assert!(!interrupts::intr_context());
    without_interrupts(|| {
        let mut sched = SCHEDULER.lock();
        let cur = sched.current.clone().unwrap();
        let is_idle = sched
            .idle
            .as_ref()
            .map(|i| Arc::ptr_eq(i, &cur))
            .unwrap_or(false);
        if is_idle {
            return;
        }
        cur.wake_tick.store(wake_tick, Ordering::Release);
        cur.set_status(Status::Blocked);
        let pos = sched
            .sleeping
            .iter()
            .position(|t| t.wake_tick() > wake_tick)
            .unwrap_or(sched.sleeping.len());
        sched.sleeping.insert(pos, cur);
        schedule(sched, false);
    });
}

/// Wake every sleeper whose tick has arrived. Driven by the timer tick.
pub fn wake_up_to(now: u64) {
    loop {
        let woken = without_interrupts(|| {
            let mut sched = SCHEDULER.lock();
            match sched.sleeping.first() {
                Some(front) if front.wake_tick() <= now => Some(sched.sleeping.remove(0)),
                _ => None,
            }
        });
        match woken {
            Some(t) => unblock(t),
            None => break,
        }
    }
}

/// Per-tick bookkeeping, called from the timer interrupt: statistics,
/// sleeper wakeups, and the preemption request at end of slice.
pub fn tick(now: u64) {
    let cur = current();
    let is_idle = without_interrupts(|| {
        SCHEDULER
            .lock()
            .idle
            .as_ref()
            .map(|i| Arc::ptr_eq(i, &cur))
            .unwrap_or(false)
    });
    if is_idle {
        IDLE_TICKS.fetch_add(1, Ordering::Relaxed);
    } else if cur.is_user() {
        USER_TICKS.fetch_add(1, Ordering::Relaxed);
    } else {
        KERNEL_TICKS.fetch_add(1, Ordering::Relaxed);
    }

    wake_up_to(now);

    if SLICE_TICKS.fetch_add(1, Ordering::Relaxed) + 1 >= TIME_SLICE {
        PREEMPT_REQUESTED.store(true, Ordering::Release);
    }
}

/// Called by the timer path once the handler proper has unwound (EOI sent,
/// interrupt-context flag dropped): performs the preemption `tick`
/// requested.
pub fn preempt_on_return() {
    if PREEMPT_REQUESTED.swap(false, Ordering::AcqRel) {
        if SCHEDULER.lock().idle.is_none() {
            return; // scheduling not started yet
        }
        yield_now();
    }
}

/// Change the caller's base priority, rebuild the effective priority from
/// live donations, and step aside if someone now outranks us.
pub fn set_priority(new_priority: u8) {
    assert!(new_priority <= PRI_MAX);
    let cur = current();
    cur.priority_base.store(new_priority, Ordering::Release);
    cur.refresh_priority();
    check_yield();
}

pub fn get_priority() -> u8 {
    current().effective_priority()
}

/// Terminate the running thread. User-process teardown (status print, FD
/// close, parent rendezvous, address-space destruction) happens in
/// `process::shutdown` before this is reached.
pub fn exit() -> ! {
    assert!(!interrupts::intr_context());
    x86_64::instructions::interrupts::disable();
    let mut sched = SCHEDULER.lock();
    let cur = sched.current.clone().unwrap();
    cur.set_status(Status::Dying);
    sched.destruction.push(cur);
    schedule(sched, true);
    unreachable!("schedule returned to a dying thread");
}

pub fn print_stats() {
    crate::println!(
        "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        IDLE_TICKS.load(Ordering::Relaxed),
        KERNEL_TICKS.load(Ordering::Relaxed),
        USER_TICKS.load(Ordering::Relaxed)
    );
}
