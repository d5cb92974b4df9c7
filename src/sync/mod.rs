//! Counting semaphores, donation-aware locks, and Mesa-style condition
//! variables. These are the only suspension points in the kernel besides the
//! scheduler itself; none of them may be entered from interrupt context
//! (except `Semaphore::up`, which interrupt handlers use for wakeups).

use crate::interrupts;
use crate::thread::{self, Thread, PRI_MIN};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;

// ── Semaphore ───────────────────────────────────────────────────

struct SemaInner {
    value: usize,
    /// Kept ordered by effective priority, highest first. Re-sorted on `up`
    /// because a waiter's priority may have risen through donation since it
    /// queued.
    waiters: Vec<Arc<Thread>>,
}

pub struct Semaphore {
    inner: Mutex<SemaInner>,
}

impl Semaphore {
    pub const fn new(value: usize) -> Semaphore {
        Semaphore {
            inner: Mutex::new(SemaInner {
                value,
                waiters: Vec::new(),
            }),
        }
    }

    /// Down / "P". Suspends until the counter is positive.
    pub fn down(&self) {
        assert!(!interrupts::intr_context());
        without_interrupts(|| loop {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                return;
            }
            let cur = thread::current();
            let pos = inner
                .waiters
                .iter()
                .position(|t| t.effective_priority() < cur.effective_priority())
                .unwrap_or(inner.waiters.len());
            inner.waiters.insert(pos, cur);
            drop(inner);
            thread::block();
        });
    }

    /// Nonblocking down. May be called from interrupt context.
    pub fn try_down(&self) -> bool {
        without_interrupts(|| {
            let mut inner = self.inner.lock();
            if inner.value > 0 {
                inner.value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// Up / "V". Wakes the highest-priority waiter, if any. Safe from
    /// interrupt context.
    pub fn up(&self) {
        without_interrupts(|| {
            let woken = {
                let mut inner = self.inner.lock();
                inner.value += 1;
                inner
                    .waiters
                    .sort_by(|a, b| b.effective_priority().cmp(&a.effective_priority()));
                if inner.waiters.is_empty() {
                    None
                } else {
                    Some(inner.waiters.remove(0))
                }
            };
            if let Some(t) = woken {
                thread::unblock(t);
            }
            thread::check_yield();
        });
    }

    /// Effective priority of the highest-priority thread blocked here, if
    /// any. Condition variables order their waiter list with this.
    fn front_priority(&self) -> Option<u8> {
        let inner = self.inner.lock();
        inner.waiters.iter().map(|t| t.effective_priority()).max()
    }
}

// ── Lock ────────────────────────────────────────────────────────

/// A non-reentrant binary lock with priority donation. Acquiring a lock the
/// current thread already holds is a contract violation (and what makes the
/// donation graph acyclic by construction).
pub struct Lock {
    holder: Mutex<Option<Arc<Thread>>>,
    sema: Semaphore,
}

impl Lock {
    pub const fn new() -> Lock {
        Lock {
            holder: Mutex::new(None),
            sema: Semaphore::new(1),
        }
    }

    /// Acquire, donating priority along the `waiting_on_lock` chain while
    /// the lock is held by someone else.
    pub fn acquire(&self) {
        assert!(!interrupts::intr_context());
        assert!(!self.held_by_current(), "recursive lock acquire");

        without_interrupts(|| {
            let cur = thread::current();
            let holder = self.holder.lock().clone();
            if let Some(holder) = holder {
                cur.set_waiting_on(Some(self as *const Lock as usize));
                holder.add_donation(cur.clone());

                // Chase holders transitively; priorities only ever rise.
                let mut donor = cur;
                while let Some(addr) = donor.waiting_on() {
                    let lock = unsafe { &*(addr as *const Lock) };
                    let Some(next) = lock.holder.lock().clone() else {
                        break;
                    };
                    if next.effective_priority() < donor.effective_priority() {
                        next.set_effective_priority(donor.effective_priority());
                    }
                    donor = next;
                }
            }

            self.sema.down();
            let cur = thread::current();
            cur.set_waiting_on(None);
            *self.holder.lock() = Some(cur);
        });
    }

    /// Nonblocking acquire; true on success.
    pub fn try_acquire(&self) -> bool {
        assert!(!self.held_by_current(), "recursive lock acquire");
        without_interrupts(|| {
            if self.sema.try_down() {
                *self.holder.lock() = Some(thread::current());
                true
            } else {
                false
            }
        })
    }

    /// Release. Withdraws every donation tied to this lock, recomputes the
    /// holder's effective priority, then wakes the next waiter. If that
    /// waiter outranks us, `sema.up` yields on the way out.
    pub fn release(&self) {
        assert!(self.held_by_current(), "lock released by non-owner");

        without_interrupts(|| {
            let cur = thread::current();
            cur.remove_donations_for(self as *const Lock as usize);
            cur.refresh_priority();
            *self.holder.lock() = None;
            self.sema.up();
        });
    }

    pub fn held_by_current(&self) -> bool {
        without_interrupts(|| match &*self.holder.lock() {
            Some(holder) => holder.tid() == thread::current().tid(),
            None => false,
        })
    }
}

// ── Condition variable ──────────────────────────────────────────

/// Mesa-style condition variable. Each waiter parks on its own single-shot
/// semaphore so that `signal` can always pick the highest-priority sleeper,
/// even across a broadcast.
pub struct Condvar {
    waiters: Mutex<Vec<Arc<Semaphore>>>,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Atomically release `lock` and sleep until signalled; re-acquires
    /// `lock` before returning. The caller rechecks its condition in a loop.
    pub fn wait(&self, lock: &Lock) {
        assert!(!interrupts::intr_context());
        assert!(lock.held_by_current());

        let waiter = Arc::new(Semaphore::new(0));
        without_interrupts(|| {
            self.waiters.lock().push(waiter.clone());
        });
        lock.release();
        waiter.down();
        lock.acquire();
    }

    /// Wake the highest-priority waiter, if any.
    pub fn signal(&self, lock: &Lock) {
        assert!(!interrupts::intr_context());
        assert!(lock.held_by_current());

        without_interrupts(|| {
            let front = {
                let mut waiters = self.waiters.lock();
                waiters.sort_by(|a, b| {
                    let pa = a.front_priority().unwrap_or(PRI_MIN);
                    let pb = b.front_priority().unwrap_or(PRI_MIN);
                    pb.cmp(&pa)
                });
                if waiters.is_empty() {
                    None
                } else {
                    Some(waiters.remove(0))
                }
            };
            if let Some(w) = front {
                w.up();
            }
        });
    }

    /// Wake everyone, in priority order.
    pub fn broadcast(&self, lock: &Lock) {
        while !self.waiters.lock().is_empty() {
            self.signal(lock);
        }
    }
}
