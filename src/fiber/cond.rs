//! Condition variables for fibers.
//!
//! A cond is a synchronization primitive that lets fibers yield until some
//! predicate is satisfied: [`CondVar::wait`] suspends the fiber (releasing
//! the protecting mutex) until [`CondVar::signal`] or [`CondVar::broadcast`]
//! is called.
//!
//! There are no spurious wakeups by construction, but a broadcast may wake
//! several waiters whose predicate holds for only one of them, so callers
//! should still re-check in a loop:
//!
//! ```no_run
//! # let rt = fibrio::fiber::Runtime::new().unwrap();
//! # let ready = std::cell::Cell::new(false);
//! use fibrio::fiber::{CondVar, Mutex};
//!
//! let m = Mutex::new(&rt);
//! let c = CondVar::new(&rt);
//! m.lock().unwrap();
//! while !ready.get() {
//!     c.wait(&m).unwrap();
//! }
//! m.unlock();
//! ```

use std::rc::{Rc, Weak};

use crate::error::Result;
use crate::fiber::{Event, Mutex, Runtime, WaitEntry, WaitQueue};

/// A condition variable. Cloning yields another handle to the same queue.
/// It does not own the protecting mutex; any mutex may be paired with it.
#[derive(Clone)]
pub struct CondVar {
    rt: Runtime,
    waiting: Rc<WaitQueue>,
}

impl CondVar {
    pub fn new(rt: &Runtime) -> CondVar {
        CondVar {
            rt: rt.clone(),
            waiting: Rc::new(WaitQueue::default()),
        }
    }

    pub(crate) fn from_queue(rt: &Runtime, waiting: Rc<WaitQueue>) -> CondVar {
        CondVar {
            rt: rt.clone(),
            waiting,
        }
    }

    /// Suspend until signalled. The mutex must be held by the calling fiber;
    /// it is released for the duration of the wait and re-acquired before
    /// returning. Fails with `Invalid` when the mutex is not held.
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        self.rt.wait_one(&Event::Cond(self, mutex))
    }

    /// Wake the first waiter, if any. Does not yield.
    pub fn signal(&self) {
        loop {
            let entry = match self.waiting.pop_front() {
                Some(e) => e,
                None => return,
            };
            if self.rt.is_reclaimed(entry.fiber) {
                continue;
            }
            self.rt
                .post_arrival(entry.fiber, entry.ev_idx, entry.wait_seq);
            self.rt.schedule_pending(entry.fiber, entry.ticket);
            return;
        }
    }

    /// Wake all waiters in FIFO order, appending them to the pending-run
    /// queue in one step. Does not yield.
    pub fn broadcast(&self) {
        for entry in self.waiting.drain() {
            if self.rt.is_reclaimed(entry.fiber) {
                continue;
            }
            self.rt
                .post_arrival(entry.fiber, entry.ev_idx, entry.wait_seq);
            self.rt.schedule_pending(entry.fiber, entry.ticket);
        }
    }

    pub(crate) fn push_waiter(&self, e: WaitEntry) {
        self.waiting.push(e);
    }

    pub(crate) fn queue_weak(&self) -> Weak<WaitQueue> {
        Rc::downgrade(&self.waiting)
    }
}

impl std::fmt::Debug for CondVar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CondVar").finish_non_exhaustive()
    }
}
