//! Mutual exclusion for fibers.
//!
//! Since the runtime is single threaded, this mutex does not guard against
//! parallel access but against *interleaving across yields*: the region
//! between [`Mutex::lock`] and [`Mutex::unlock`] may suspend freely and no
//! other fiber will enter it.
//!
//! Waiters are queued FIFO and the lock is handed over in queue order, one
//! waiter per unlock.

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::error::Result;
use crate::fiber::{Event, FiberId, Runtime, WaitEntry, WaitQueue};

pub(crate) struct MutexState {
    locked_by: Cell<FiberId>,
    pending: Rc<WaitQueue>,
}

/// A fiber mutex. Cloning yields another handle to the same lock.
#[derive(Clone)]
pub struct Mutex {
    rt: Runtime,
    state: Rc<MutexState>,
}

impl Mutex {
    pub fn new(rt: &Runtime) -> Mutex {
        Mutex {
            rt: rt.clone(),
            state: Rc::new(MutexState {
                locked_by: Cell::new(FiberId::NULL),
                pending: Rc::new(WaitQueue::default()),
            }),
        }
    }

    /// Acquire the mutex, suspending the fiber while it is taken.
    pub fn lock(&self) -> Result<()> {
        self.rt.wait_one(&Event::Mutex(self))?;
        debug_assert_eq!(self.state.locked_by.get(), self.rt.self_id());
        Ok(())
    }

    /// Acquire the mutex if it is free. Never suspends.
    pub fn try_lock(&self) -> bool {
        if self.state.locked_by.get().is_null() {
            self.state.locked_by.set(self.rt.self_id());
            true
        } else {
            false
        }
    }

    /// Release the mutex. If fibers are queued, ownership moves to the first
    /// live one immediately and it is scheduled to run on an upcoming loop
    /// iteration.
    ///
    /// Panics when the calling fiber is not the holder.
    pub fn unlock(&self) {
        let me = self.rt.self_id();
        assert_eq!(
            self.state.locked_by.get(),
            me,
            "unlock of a mutex not held by the current fiber"
        );
        loop {
            let entry = match self.state.pending.pop_front() {
                Some(e) => e,
                None => {
                    self.state.locked_by.set(FiberId::NULL);
                    return;
                }
            };
            if self.rt.is_reclaimed(entry.fiber) {
                log::warn!("skipping a stale waiter while unlocking a mutex");
                continue;
            }
            self.state.locked_by.set(entry.fiber);
            self.rt
                .post_arrival(entry.fiber, entry.ev_idx, entry.wait_seq);
            self.rt.schedule_pending(entry.fiber, entry.ticket);
            return;
        }
    }

    /// Current holder, [`FiberId::NULL`] when unlocked.
    pub fn locked_by(&self) -> FiberId {
        self.state.locked_by.get()
    }

    pub fn is_locked(&self) -> bool {
        !self.state.locked_by.get().is_null()
    }

    /// Acquire and return a guard that unlocks on drop. Prefer this over a
    /// bare [`Mutex::lock`] wherever the critical section may exit early.
    pub fn guard(&self) -> Result<MutexGuard<'_>> {
        self.lock()?;
        Ok(MutexGuard { mutex: self })
    }

    pub(crate) fn grab(&self, owner: FiberId) {
        debug_assert!(self.state.locked_by.get().is_null());
        self.state.locked_by.set(owner);
    }

    pub(crate) fn push_waiter(&self, e: WaitEntry) {
        self.state.pending.push(e);
    }

    pub(crate) fn queue_weak(&self) -> Weak<WaitQueue> {
        Rc::downgrade(&self.state.pending)
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex")
            .field("locked_by", &self.state.locked_by.get())
            .finish_non_exhaustive()
    }
}

////////////////////////////////////////////////////////////////////////////////
// MutexGuard
////////////////////////////////////////////////////////////////////////////////

/// An RAII scoped lock of a [`Mutex`]. The lock is released when the guard
/// goes out of scope.
///
/// Note that a fiber reclaimed while suspended does not unwind its stack, so
/// a guard alone does not protect a critical section that blocks against
/// reclamation; register a destructor or complete the section before any
/// reclaim can happen.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
