//! Parkable wake-up point shared by every blocking wait in the engine.
//!
//! A waiter parks until its own predicate holds; a notifier only says
//! "something changed". Two notify flavours exist:
//!
//! - [`Signal::notify`] takes the lock, so it can never slip past a waiter that
//!   is between its predicate check and its park. Control and worker threads use it.
//! - [`Signal::notify_rt`] never takes the lock and is the only flavour the audio
//!   callback may use. A wake-up it loses is picked up by the waiter's periodic
//!   re-check instead, so the cost is bounded by [`RECHECK_INTERVAL`].

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const RECHECK_INTERVAL: Duration = Duration::from_millis(2);

pub struct Signal {
    lock: Mutex<()>,
    cond: Condvar,
    waiters: AtomicUsize,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Blocks until `ready()` returns true.
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        if ready() {
            return;
        }
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);
        while !ready() {
            self.cond.wait_for(&mut guard, RECHECK_INTERVAL);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn notify(&self) {
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Lock-free notify for the audio thread.
    pub fn notify_rt(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 {
            self.cond.notify_all();
        }
    }

    /// Number of threads currently parked on this signal.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }
}
