//! In-kernel self-tests for the scheduler and synchronization primitives,
//! run once at boot after preemption is enabled. Each test panics on
//! failure; a quiet boot means they all passed.

use crate::devices::timer;
use crate::process;
use crate::sync::{Condvar, Lock, Semaphore};
use crate::thread::{self, PRI_DEFAULT};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

pub fn run_all() {
    sema_self_test();
    donation_test();
    condvar_test();
    alarm_test();
    crate::log_info!("selftest: all passed");
}

/// Ping-pong a pair of semaphores with a helper thread, ten rounds each
/// way.
fn sema_self_test() {
    let ping = Arc::new(Semaphore::new(0));
    let pong = Arc::new(Semaphore::new(0));

    let (ping_h, pong_h) = (ping.clone(), pong.clone());
    let helper = thread::create("sema-test", PRI_DEFAULT, move || {
        for _ in 0..10 {
            ping_h.down();
            pong_h.up();
        }
    });

    for _ in 0..10 {
        ping.up();
        pong.down();
    }
    process::wait(helper);
    crate::log_info!("selftest: semaphore ping-pong ok");
}

/// Nested donation: the running thread (A, priority 31) holds a lock; a
/// priority-33 thread then a priority-32 thread block on it. A's effective
/// priority must rise to 33, drop back to 31 on release, and the waiters
/// must finish in priority order.
fn donation_test() {
    thread::set_priority(31);
    let lock = Arc::new(Lock::new());
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    lock.acquire();

    let (l, o) = (lock.clone(), order.clone());
    let high = thread::create("donate-high", 33, move || {
        l.acquire();
        o.lock().push("high");
        l.release();
    });
    // donate-high outranks us, runs immediately, and is now blocked on the
    // lock; its priority must have been donated.
    assert_eq!(thread::get_priority(), 33, "donation did not raise holder");

    let (l, o) = (lock.clone(), order.clone());
    let mid = thread::create("donate-mid", 32, move || {
        l.acquire();
        o.lock().push("mid");
        l.release();
    });
    // donate-mid ranks below our donated priority and needs the CPU to
    // reach the lock; sleep so it can block and join the donor set.
    timer::sleep(5);
    assert_eq!(thread::get_priority(), 33, "second donor changed the max");

    lock.release();
    process::wait(high);
    process::wait(mid);

    assert_eq!(thread::get_priority(), 31, "priority not restored");
    assert_eq!(&*order.lock(), &["high", "mid"], "waiters ran out of order");
    thread::set_priority(PRI_DEFAULT);
    crate::log_info!("selftest: priority donation ok");
}

/// One consumer parks on a condition variable; the main thread flips the
/// condition and signals.
fn condvar_test() {
    let lock = Arc::new(Lock::new());
    let cond = Arc::new(Condvar::new());
    let flag = Arc::new(AtomicBool::new(false));

    let (l, c, f) = (lock.clone(), cond.clone(), flag.clone());
    let consumer = thread::create("cond-test", PRI_DEFAULT, move || {
        l.acquire();
        while !f.load(Ordering::Acquire) {
            c.wait(&l);
        }
        l.release();
    });

    // Let the consumer reach its wait.
    thread::yield_now();

    lock.acquire();
    flag.store(true, Ordering::Release);
    cond.signal(&lock);
    lock.release();

    process::wait(consumer);
    crate::log_info!("selftest: condition variable ok");
}

/// Two sleepers with different wake ticks must wake in deadline order.
fn alarm_test() {
    let order: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let mut tids = Vec::new();
    for ticks in [30u64, 10u64] {
        let o = order.clone();
        tids.push(thread::create("alarm-test", PRI_DEFAULT, move || {
            timer::sleep(ticks);
            o.lock().push(ticks);
        }));
    }
    for tid in tids {
        process::wait(tid);
    }

    assert_eq!(&*order.lock(), &[10u64, 30u64], "sleepers woke out of order");
    crate::log_info!("selftest: alarm ordering ok");
}
