//! Cooperative multitasking module.
//!
//! A *fiber* is a unit of execution with its own stack, scheduled
//! cooperatively on a single thread. Fibers call apparently-blocking
//! operations ([`Runtime::sleep`], the [`coio`](crate::coio) wrappers, a
//! [`Mutex`] lock); under the hood the operation arms an event on the
//! reactor, yields, and the fiber is resumed when the event fires. The result
//! is sequential-looking code on top of an event-driven core.
//!
//! The whole runtime state lives in a [`Runtime`] handle which is passed into
//! every fiber entry function; there are no process-wide globals. The *root*
//! fiber is the one that created the runtime: it runs the event loop via
//! [`Runtime::run`] and never yields.
//!
//! ```no_run
//! use fibrio::fiber::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! let fiber = rt.create("greeter", |rt| {
//!     rt.sleep(std::time::Duration::from_millis(10));
//!     println!("hello from a fiber");
//! }).unwrap();
//! rt.transfer(fiber).unwrap();
//! rt.run();
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use context::stack::{ProtectedFixedSizeStack, StackError};
use context::{Context, Transfer};

use crate::error::{Error, Result};
use crate::reactor::{IoInterest, Reactor, WatcherToken};

pub mod channel;
pub mod cond;
pub mod csw;
pub mod mutex;

pub use channel::{channel, Receiver, Sender};
pub use cond::CondVar;
pub use csw::{check_yield, YieldResult};
pub use mutex::{Mutex, MutexGuard};

use std::os::unix::io::RawFd;

/// Maximum allowed nesting of [`Runtime::transfer`] calls.
pub const CALL_STACK_SIZE: usize = 16;
/// Default fiber stack size of 64 KiB.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;
/// Fiber names longer than this are truncated.
pub const MAX_NAME_LEN: usize = 63;
/// Maximum number of fiber-local keys.
pub const MAX_KEYS: usize = 64;
/// Maximum number of events in a single wait set.
pub const MAX_WAIT_EVENTS: usize = 64;

const RUN_QUEUE_WARN: usize = 1000;

////////////////////////////////////////////////////////////////////////////////
// FiberId
////////////////////////////////////////////////////////////////////////////////

/// Opaque fiber identity: a slot plus a generation tag.
///
/// Slots are recycled after reclaim with a bumped generation, so an id held
/// past the fiber's lifetime goes stale instead of aliasing the new occupant.
/// A stale id makes every operation fail with [`Error::NoFiber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    slot: u32,
    gen: u64,
}

impl FiberId {
    /// An id that compares unequal to any live fiber.
    pub const NULL: FiberId = FiberId {
        slot: u32::MAX,
        gen: 0,
    };

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    #[inline]
    fn slot_index(&self) -> usize {
        self.slot as usize
    }
}

impl Default for FiberId {
    fn default() -> Self {
        Self::NULL
    }
}

////////////////////////////////////////////////////////////////////////////////
// Handles
////////////////////////////////////////////////////////////////////////////////

/// Handle of a registered fiber destructor, see [`Runtime::add_destructor`].
#[derive(Debug, Clone, Copy)]
pub struct DtorHandle {
    fiber: FiberId,
    seq: u64,
}

/// Handle of a value parked in a fiber's scratch pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolId {
    fiber: FiberId,
    seq: u64,
}

/// A fiber-local storage key, see [`Runtime::key_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(u32);

////////////////////////////////////////////////////////////////////////////////
// Events
////////////////////////////////////////////////////////////////////////////////

/// One thing a fiber may block on. A fiber suspends by passing a set of
/// events to [`Runtime::wait`]; it resumes once at least one has arrived.
#[derive(Clone, Copy)]
pub enum Event<'a> {
    /// An armed reactor watcher (fd readiness, timer or async wakeup).
    Watcher(&'a Watcher),
    /// Acquisition of a mutex.
    Mutex(&'a Mutex),
    /// A condition variable signal; the second field is the protecting mutex,
    /// which must be held on entry and is re-acquired before the wait
    /// returns.
    Cond(&'a CondVar, &'a Mutex),
}

/// Entry of a primitive's waiter queue.
pub(crate) struct WaitEntry {
    pub fiber: FiberId,
    pub ticket: u64,
    pub ev_idx: u32,
    pub wait_seq: u64,
}

/// FIFO of fibers waiting on one primitive. Entries carry a unique ticket so
/// destructors can surgically remove them from whatever queue they are in.
#[derive(Default)]
pub(crate) struct WaitQueue {
    entries: RefCell<VecDeque<WaitEntry>>,
}

impl WaitQueue {
    pub fn push(&self, e: WaitEntry) {
        self.entries.borrow_mut().push_back(e);
    }

    pub fn pop_front(&self) -> Option<WaitEntry> {
        self.entries.borrow_mut().pop_front()
    }

    pub fn drain(&self) -> Vec<WaitEntry> {
        self.entries.borrow_mut().drain(..).collect()
    }

    pub fn remove_ticket(&self, ticket: u64) {
        self.entries.borrow_mut().retain(|e| e.ticket != ticket);
    }
}

enum Prep {
    /// The event arrived during prepare (e.g. an uncontended mutex).
    Arrived,
    /// A queue entry was added, paired with its removal destructor.
    Queued { dtor: DtorHandle },
    /// A watcher was pointed at the waiting fiber.
    WatcherArmed { tok: WatcherToken },
}

////////////////////////////////////////////////////////////////////////////////
// Watcher
////////////////////////////////////////////////////////////////////////////////

/// Handle of an armed reactor watcher. Obtained from
/// [`Runtime::io_watcher`], [`Runtime::timer_watcher`],
/// [`Runtime::periodic_watcher`] or [`Runtime::async_watcher`] and passed to
/// [`Runtime::wait`] wrapped in [`Event::Watcher`].
///
/// Watchers are not stopped implicitly: pair every start with a
/// [`Watcher::stop`] on all exit paths, usually backed by a fiber destructor.
#[derive(Clone)]
pub struct Watcher {
    rt: Runtime,
    inner: Rc<WatcherHandle>,
}

struct WatcherHandle {
    token: Cell<Option<WatcherToken>>,
}

impl Watcher {
    /// Whether the watcher is still armed on the loop. A fired one-shot
    /// timer is no longer active.
    pub fn is_active(&self) -> bool {
        match self.inner.token.get() {
            Some(tok) => self.rt.inner.reactor.borrow().is_active(tok),
            None => false,
        }
    }

    /// Stop the watcher and cancel any pending wakeup. Idempotent.
    pub fn stop(&self) {
        if let Some(tok) = self.inner.token.take() {
            self.rt.inner.reactor.borrow_mut().stop(tok);
        }
    }

    /// Signal an async watcher; its waiter runs on the next loop iteration.
    /// Returns false for stopped or non-async watchers.
    pub fn send(&self) -> bool {
        match self.inner.token.get() {
            Some(tok) => self.rt.inner.reactor.borrow_mut().async_send(tok),
            None => false,
        }
    }

    fn token(&self) -> Option<WatcherToken> {
        self.inner.token.get()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber slot
////////////////////////////////////////////////////////////////////////////////

struct DtorEntry {
    seq: u64,
    func: Box<dyn FnOnce(&Runtime)>,
}

struct PoolEntry {
    seq: u64,
    value: Box<dyn Any>,
    dtor: Option<Box<dyn FnOnce(&Runtime, &mut dyn Any)>>,
}

struct FiberSlot {
    gen: u64,
    live: bool,
    name: String,
    entry: Option<Rc<dyn Fn(&Runtime)>>,
    stack: Option<ProtectedFixedSizeStack>,
    stack_size: usize,
    /// The continuation of a suspended fiber. `None` while the fiber is on
    /// the scheduler call stack (its state then lives in the machine
    /// registers of whoever it resumed).
    ctx: Option<Context>,
    parent: FiberId,
    children: Vec<FiberId>,
    dtors: Vec<DtorEntry>,
    pool: Vec<PoolEntry>,
    keys: Vec<Option<Rc<dyn Any>>>,
    user_data: Option<Rc<dyn Any>>,
    no_reclaim: bool,
    want_reclaim: bool,
    reclaim_cond: Rc<WaitQueue>,
    /// Bitmask of arrived events of the wait in progress.
    ev_arrived: u64,
    /// Identifies the wait in progress; deliveries tagged with an older
    /// sequence are ignored.
    wait_seq: u64,
}

impl FiberSlot {
    fn vacant(gen: u64) -> FiberSlot {
        FiberSlot {
            gen,
            live: false,
            name: String::new(),
            entry: None,
            stack: None,
            stack_size: 0,
            ctx: None,
            parent: FiberId::NULL,
            children: Vec::new(),
            dtors: Vec::new(),
            pool: Vec::new(),
            keys: Vec::new(),
            user_data: None,
            no_reclaim: false,
            want_reclaim: false,
            reclaim_cond: Rc::new(WaitQueue::default()),
            ev_arrived: 0,
            wait_seq: 0,
        }
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_owned();
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_owned()
}

////////////////////////////////////////////////////////////////////////////////
// Runtime internals
////////////////////////////////////////////////////////////////////////////////

/// Where the continuation arriving at the next switch landing belongs.
#[derive(Clone, Copy)]
enum StoreInto {
    Slot(u32),
    /// The switching fiber is gone; drop its continuation.
    Discard,
}

struct RunItem {
    id: FiberId,
    ticket: u64,
}

pub(crate) struct RtInner {
    pub(crate) reactor: RefCell<Reactor>,
    fibers: RefCell<Vec<FiberSlot>>,
    free_slots: RefCell<Vec<u32>>,
    call_stack: RefCell<Vec<FiberId>>,
    run_q: RefCell<VecDeque<RunItem>>,
    store_into: Cell<StoreInto>,
    next_gen: Cell<u64>,
    next_ticket: Cell<u64>,
    key_mask: Cell<u64>,
    csw: Cell<u64>,
    stopped: Cell<bool>,
    panic_payload: RefCell<Option<Box<dyn Any + Send>>>,
}

/// File the continuation that arrived with a switch landing into the slot
/// recorded by the switch initiator.
fn file_context(inner: &RtInner, ctx: Context) {
    match inner.store_into.replace(StoreInto::Discard) {
        StoreInto::Slot(idx) => {
            inner.fibers.borrow_mut()[idx as usize].ctx = Some(ctx);
        }
        StoreInto::Discard => drop(ctx),
    }
}

/// Leave the current (already cleaned up) fiber forever, resuming the top of
/// the call stack.
fn exit_current(inner: &RtInner) -> ! {
    let to = *inner
        .call_stack
        .borrow()
        .last()
        .expect("the root fiber is never reclaimed");
    let ctx = inner.fibers.borrow_mut()[to.slot_index()]
        .ctx
        .take()
        .expect("resume target has a saved context");
    inner.store_into.set(StoreInto::Discard);
    inner.csw.set(inner.csw.get() + 1);
    let data = inner as *const RtInner as usize;
    let _ = unsafe { ctx.resume(data) };
    unreachable!("a reclaimed fiber was resumed");
}

extern "C" fn fiber_trampoline(t: Transfer) -> ! {
    let inner = unsafe { &*(t.data as *const RtInner) };
    file_context(inner, t.context);

    // Borrowed runtime handle: never dropped, does not bump the refcount.
    // The runtime is kept alive by whoever resumed this fiber.
    let rt = ManuallyDrop::new(Runtime {
        inner: unsafe { Rc::from_raw(inner as *const RtInner) },
    });

    let me = rt.self_id();
    let entry = rt.inner.fibers.borrow()[me.slot_index()]
        .entry
        .clone()
        .expect("a running fiber has an entry function");
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry(&*rt))) {
        log::error!(
            "fiber '{}' panicked, reclaiming it",
            rt.name(me).unwrap_or_default()
        );
        *inner.panic_payload.borrow_mut() = Some(payload);
    }
    drop(entry);

    rt.reclaim(me).expect("self-reclaim of a live fiber");
    unreachable!("fiber continued after self-reclaim");
}

////////////////////////////////////////////////////////////////////////////////
// Runtime
////////////////////////////////////////////////////////////////////////////////

/// The fiber runtime: event loop, scheduler and fiber table in one handle.
///
/// Cloning is cheap (reference counted) and every clone refers to the same
/// runtime. The handle is not `Send`: the whole runtime is single threaded by
/// construction, mutexes here guard against interleaving across yields, not
/// against other threads.
pub struct Runtime {
    pub(crate) inner: Rc<RtInner>,
}

impl Clone for Runtime {
    fn clone(&self) -> Self {
        Runtime {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime together with its event loop and root fiber. The
    /// calling context becomes the root fiber.
    pub fn new() -> Result<Runtime> {
        let reactor = Reactor::new().map_err(Error::System)?;
        let rt = Runtime {
            inner: Rc::new(RtInner {
                reactor: RefCell::new(reactor),
                fibers: RefCell::new(Vec::new()),
                free_slots: RefCell::new(Vec::new()),
                call_stack: RefCell::new(Vec::with_capacity(CALL_STACK_SIZE)),
                run_q: RefCell::new(VecDeque::new()),
                store_into: Cell::new(StoreInto::Discard),
                next_gen: Cell::new(1),
                next_ticket: Cell::new(1),
                key_mask: Cell::new(u64::MAX),
                csw: Cell::new(0),
                stopped: Cell::new(false),
                panic_payload: RefCell::new(None),
            }),
        };
        let root_gen = rt.alloc_gen();
        let mut root = FiberSlot::vacant(root_gen);
        root.live = true;
        root.name = "root".to_owned();
        rt.inner.fibers.borrow_mut().push(root);
        rt.inner
            .call_stack
            .borrow_mut()
            .push(FiberId { slot: 0, gen: root_gen });
        Ok(rt)
    }

    /// Reclaim all fibers created under the root. Must be called from the
    /// root fiber. Dropping the last handle releases memory but does not run
    /// fiber destructors; call this first if they matter.
    pub fn destroy(&self) {
        self.assert_root("destroy");
        let children = self.inner.fibers.borrow()[0].children.clone();
        for child in children {
            let _ = self.reclaim(child);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Identity & attributes
    ////////////////////////////////////////////////////////////////////////////

    /// Id of the running fiber (the root included).
    pub fn self_id(&self) -> FiberId {
        *self
            .inner
            .call_stack
            .borrow()
            .last()
            .expect("call stack is never empty")
    }

    fn root_id(&self) -> FiberId {
        self.inner.call_stack.borrow()[0]
    }

    /// Parent of the running fiber, `None` when the parent is the root.
    pub fn parent(&self) -> Option<FiberId> {
        let me = self.self_id();
        let p = self
            .with_slot(me, |s| s.parent)
            .expect("current fiber is live");
        if p.is_null() || p == self.root_id() {
            None
        } else {
            Some(p)
        }
    }

    /// Move the running fiber under a new parent (the root when `None`).
    pub fn disown(&self, new_parent: Option<FiberId>) -> Result<()> {
        let me = self.self_id();
        if me == self.root_id() {
            return Err(Error::Invalid("the root fiber cannot be disowned"));
        }
        let parent = match new_parent {
            Some(p) => {
                self.with_slot(p, |_| ())?;
                p
            }
            None => self.root_id(),
        };
        let old = self.with_slot(me, |s| s.parent)?;
        let _ = self.with_slot(old, |s| s.children.retain(|c| *c != me));
        self.with_slot(parent, |s| s.children.push(me))?;
        self.with_slot(me, |s| s.parent = parent)?;
        Ok(())
    }

    /// True once the id went stale (the fiber was reclaimed, or never was).
    pub fn is_reclaimed(&self, id: FiberId) -> bool {
        self.with_slot(id, |_| ()).is_err()
    }

    pub fn name(&self, id: FiberId) -> Result<String> {
        self.with_slot(id, |s| s.name.clone())
    }

    /// Rename a fiber. Names are truncated to [`MAX_NAME_LEN`] bytes.
    pub fn set_name(&self, id: FiberId, name: &str) -> Result<()> {
        self.with_slot(id, |s| s.name = truncate_name(name))
    }

    pub fn set_user_data<T: Any>(&self, id: FiberId, value: T) -> Result<()> {
        self.with_slot(id, |s| s.user_data = Some(Rc::new(value)))
    }

    /// Typed access to a fiber's user data. `None` if unset or of another
    /// type.
    pub fn user_data<T: Any>(&self, id: FiberId) -> Result<Option<Rc<T>>> {
        self.with_slot(id, |s| s.user_data.clone())
            .map(|v| v.and_then(|rc| rc.downcast::<T>().ok()))
    }

    /// Number of context switches performed so far. Mostly useful in tests,
    /// see [`check_yield`].
    pub fn csw(&self) -> u64 {
        self.inner.csw.get()
    }

    /// Loop begin time: cheap, monotonic, updated once per loop iteration.
    pub fn now(&self) -> Instant {
        self.inner.reactor.borrow().now()
    }

    /// Force a timestamp update between loop iterations.
    pub fn update_now(&self) {
        self.inner.reactor.borrow_mut().update_now();
    }

    ////////////////////////////////////////////////////////////////////////////
    // Creation & reclamation
    ////////////////////////////////////////////////////////////////////////////

    /// Create a fiber with the default stack size. The fiber does not run
    /// until somebody transfers to it (or it is scheduled and the loop picks
    /// it up).
    pub fn create<F>(&self, name: &str, f: F) -> Result<FiberId>
    where
        F: Fn(&Runtime) + 'static,
    {
        Builder::new().name(name).create(self, f)
    }

    fn create_inner(
        &self,
        name: String,
        entry: Rc<dyn Fn(&Runtime)>,
        stack_size: usize,
    ) -> Result<FiberId> {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let parent = self.self_id();
        let recycled = self.inner.free_slots.borrow_mut().pop();
        let id = match recycled {
            Some(idx) => {
                // a recycled slot keeps its mapped stack
                let mut fibers = self.inner.fibers.borrow_mut();
                let slot = &mut fibers[idx as usize];
                let stack = slot.stack.as_ref().expect("recycled slot keeps its stack");
                slot.ctx = Some(unsafe { Context::new(stack, fiber_trampoline) });
                slot.live = true;
                slot.name = truncate_name(&name);
                slot.entry = Some(entry);
                slot.parent = parent;
                FiberId {
                    slot: idx,
                    gen: slot.gen,
                }
            }
            None => {
                let stack =
                    ProtectedFixedSizeStack::new(stack_size).map_err(map_stack_error)?;
                let ctx = unsafe { Context::new(&stack, fiber_trampoline) };
                let gen = self.alloc_gen();
                let mut slot = FiberSlot::vacant(gen);
                slot.live = true;
                slot.name = truncate_name(&name);
                slot.entry = Some(entry);
                slot.stack = Some(stack);
                slot.stack_size = stack_size;
                slot.ctx = Some(ctx);
                slot.parent = parent;
                let mut fibers = self.inner.fibers.borrow_mut();
                fibers.push(slot);
                FiberId {
                    slot: (fibers.len() - 1) as u32,
                    gen,
                }
            }
        };
        self.with_slot(parent, |s| s.children.push(id))
            .expect("parent is live");
        log::debug!("created fiber {:?}", id);
        Ok(id)
    }

    /// Reclaim a fiber and all of its children, depth first. Runs the
    /// fiber's destructors in registration order, then recycles the slot
    /// (keeping the mapped stack) under a bumped generation.
    ///
    /// If the target set itself `no_reclaim`, the call blocks until the flag
    /// is cleared; reclaiming an already-gone fiber during that window is a
    /// success. Self-reclaim never returns.
    pub fn reclaim(&self, id: FiberId) -> Result<()> {
        self.with_slot(id, |_| ())?;

        let m = Mutex::new(self);
        m.lock()?;
        loop {
            let flags = self.with_slot(id, |s| (s.no_reclaim, Rc::clone(&s.reclaim_cond)));
            let (no_reclaim, cond_q) = match flags {
                Ok(v) => v,
                Err(_) => {
                    // gone while we were waiting for permission
                    m.unlock();
                    return Ok(());
                }
            };
            if !no_reclaim {
                break;
            }
            let _ = self.with_slot(id, |s| s.want_reclaim = true);
            assert!(
                id != self.self_id(),
                "reclaiming self while no_reclaim is set would block forever"
            );
            let cond = CondVar::from_queue(self, cond_q);
            cond.wait(&m)?;
        }
        m.unlock();

        if self.with_slot(id, |_| ()).is_err() {
            return Ok(());
        }
        let was_current = self.self_id() == id;
        self.reclaim_now(id);
        if was_current {
            exit_current(&self.inner);
        }
        Ok(())
    }

    fn reclaim_now(&self, id: FiberId) {
        log::debug!("reclaiming fiber {:?}", id);

        let children = self
            .with_slot(id, |s| s.children.clone())
            .expect("validated by the caller");
        for child in children {
            let _ = self.reclaim(child);
        }

        let parent = self.with_slot(id, |s| s.parent).expect("still live");
        if !parent.is_null() {
            let _ = self.with_slot(parent, |s| s.children.retain(|c| *c != id));
        }

        // destructors fire in registration order, while the id is still valid
        let dtors = self
            .with_slot(id, |s| std::mem::take(&mut s.dtors))
            .expect("still live");
        for d in dtors {
            (d.func)(self);
        }

        let pool = self
            .with_slot(id, |s| std::mem::take(&mut s.pool))
            .expect("still live");
        for mut e in pool {
            if let Some(d) = e.dtor.take() {
                d(self, e.value.as_mut());
            }
        }

        let next_gen = self.alloc_gen();
        // entry, keys and user data may run arbitrary Drop code that calls
        // back into the runtime; move them out and drop them unborrowed
        let dropped = {
            let mut fibers = self.inner.fibers.borrow_mut();
            let slot = &mut fibers[id.slot_index()];
            slot.live = false;
            slot.gen = next_gen;
            slot.ctx = None;
            slot.children.clear();
            slot.no_reclaim = false;
            slot.want_reclaim = false;
            slot.ev_arrived = 0;
            slot.wait_seq = 0;
            slot.reclaim_cond = Rc::new(WaitQueue::default());
            (
                slot.entry.take(),
                slot.user_data.take(),
                std::mem::take(&mut slot.keys),
            )
        };
        self.inner.free_slots.borrow_mut().push(id.slot);
        self.inner
            .call_stack
            .borrow_mut()
            .retain(|f| *f != id);
        drop(dropped);
    }

    /// Reclaim a fiber and re-create it with the recorded name, entry
    /// function and stack size. Returns the new id.
    pub fn restart(&self, id: FiberId) -> Result<FiberId> {
        let (name, entry, stack_size) =
            self.with_slot(id, |s| (s.name.clone(), s.entry.clone(), s.stack_size))?;
        let entry = entry.ok_or(Error::Invalid("the root fiber cannot be restarted"))?;
        self.reclaim(id)?;
        self.create_inner(name, entry, stack_size)
    }

    /// Forbid reclaiming of a fiber; [`Runtime::reclaim`] will block until
    /// the flag is cleared with [`Runtime::set_reclaim`].
    pub fn set_noreclaim(&self, id: FiberId) -> Result<()> {
        self.with_slot(id, |s| s.no_reclaim = true)
    }

    /// Allow reclaiming again and wake all blocked reclaimers.
    pub fn set_reclaim(&self, id: FiberId) -> Result<()> {
        let cond_q = self.with_slot(id, |s| {
            s.no_reclaim = false;
            Rc::clone(&s.reclaim_cond)
        })?;
        CondVar::from_queue(self, cond_q).broadcast();
        Ok(())
    }

    /// True when somebody is blocked trying to reclaim this fiber.
    pub fn want_reclaim(&self, id: FiberId) -> Result<bool> {
        self.with_slot(id, |s| s.want_reclaim)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Scheduling
    ////////////////////////////////////////////////////////////////////////////

    /// Switch to the given fiber; returns when it yields back. Fails with
    /// [`Error::NoFiber`] for a stale id.
    pub fn transfer(&self, to: FiberId) -> Result<()> {
        let ctx = {
            let mut fibers = self.inner.fibers.borrow_mut();
            let slot = fibers
                .get_mut(to.slot_index())
                .filter(|s| s.live && s.gen == to.gen)
                .ok_or(Error::NoFiber)?;
            slot.ctx
                .take()
                .ok_or(Error::Invalid("fiber is already on the call stack"))?
        };
        let from = self.self_id();
        {
            let mut cs = self.inner.call_stack.borrow_mut();
            assert!(cs.len() < CALL_STACK_SIZE, "fiber call stack overflow");
            cs.push(to);
        }
        self.switch(ctx, StoreInto::Slot(from.slot));
        self.check_panic();
        Ok(())
    }

    /// Return execution to the fiber that transferred to us. Panics when
    /// invoked from the root fiber.
    pub fn yield_now(&self) {
        let (me, to) = {
            let mut cs = self.inner.call_stack.borrow_mut();
            assert!(cs.len() > 1, "attempt to yield in the root fiber");
            let me = cs.pop().expect("checked non-empty");
            (me, *cs.last().expect("the root remains"))
        };
        let ctx = self.inner.fibers.borrow_mut()[to.slot_index()]
            .ctx
            .take()
            .expect("transferring fiber has a saved context");
        self.switch(ctx, StoreInto::Slot(me.slot));
    }

    /// Voluntarily give other fibers a chance to run: arms a one-shot async
    /// wakeup, waits on it and returns on a following loop iteration.
    pub fn cooperate(&self) {
        let wakeup = self.async_watcher();
        let guard = self.add_destructor({
            let w = wakeup.clone();
            move |_| w.stop()
        });
        wakeup.send();
        let _ = self.wait_one(&Event::Watcher(&wakeup));
        self.remove_destructor(guard, false);
        wakeup.stop();
    }

    /// Put the fiber to sleep for at least `duration`. Returns the remaining
    /// time in case of an early wakeup, zero on overrun.
    pub fn sleep(&self, duration: Duration) -> Duration {
        let expected = self.now() + duration;
        let timer = self.timer_watcher(duration);
        let guard = self.add_destructor({
            let t = timer.clone();
            move |_| t.stop()
        });
        let _ = self.wait_one(&Event::Watcher(&timer));
        self.remove_destructor(guard, false);
        timer.stop();
        expected.saturating_duration_since(self.now())
    }

    fn switch(&self, ctx: Context, store: StoreInto) {
        let inner = &self.inner;
        inner.store_into.set(store);
        inner.csw.set(inner.csw.get() + 1);
        let data = Rc::as_ptr(inner) as usize;
        let t = unsafe { ctx.resume(data) };
        file_context(inner, t.context);
    }

    fn check_panic(&self) {
        let payload = self.inner.panic_payload.borrow_mut().take();
        if let Some(p) = payload {
            panic::resume_unwind(p);
        }
    }

    /// Append a fiber to the pending-run queue; the loop transfers to one
    /// queued fiber per iteration.
    pub(crate) fn schedule_pending(&self, id: FiberId, ticket: u64) {
        {
            let mut q = self.inner.run_q.borrow_mut();
            q.push_back(RunItem { id, ticket });
            if q.len() == RUN_QUEUE_WARN + 1 {
                log::warn!("pending run queue grew past {} entries", RUN_QUEUE_WARN);
            }
        }
        self.inner.reactor.borrow().wake();
    }

    pub(crate) fn remove_run_ticket(&self, ticket: u64) {
        self.inner
            .run_q
            .borrow_mut()
            .retain(|it| it.ticket != ticket);
    }

    /// Mark an event of the target's wait in progress as arrived. Ignored
    /// (returning false) when the delivery is aimed at an older wait.
    pub(crate) fn post_arrival(&self, id: FiberId, ev_idx: u32, wait_seq: u64) -> bool {
        self.with_slot(id, |s| {
            if s.wait_seq == wait_seq {
                s.ev_arrived |= 1u64 << ev_idx;
                true
            } else {
                false
            }
        })
        .unwrap_or(false)
    }

    pub(crate) fn alloc_ticket(&self) -> u64 {
        let t = self.inner.next_ticket.get();
        self.inner.next_ticket.set(t + 1);
        t
    }

    fn alloc_gen(&self) -> u64 {
        let g = self.inner.next_gen.get();
        self.inner.next_gen.set(g + 1);
        g
    }

    fn with_slot<R>(&self, id: FiberId, f: impl FnOnce(&mut FiberSlot) -> R) -> Result<R> {
        let mut fibers = self.inner.fibers.borrow_mut();
        let slot = fibers
            .get_mut(id.slot_index())
            .filter(|s| s.live && s.gen == id.gen)
            .ok_or(Error::NoFiber)?;
        Ok(f(slot))
    }

    fn assert_root(&self, what: &str) {
        assert!(
            self.inner.call_stack.borrow().len() == 1,
            "{} may only be called from the root fiber",
            what
        );
    }

    ////////////////////////////////////////////////////////////////////////////
    // Wait multiplexer
    ////////////////////////////////////////////////////////////////////////////

    /// Block the fiber until at least one of the events arrives; returns how
    /// many did. This is the single point at which fibers suspend.
    pub fn wait(&self, events: &[Event]) -> Result<usize> {
        Ok(self.wait_mask(events)?.count_ones() as usize)
    }

    /// [`Runtime::wait`] for a single event.
    pub fn wait_one(&self, event: &Event) -> Result<()> {
        let mask = self.wait_mask(std::slice::from_ref(event))?;
        debug_assert_eq!(mask, 1);
        Ok(())
    }

    /// [`Runtime::wait`] with an upper bound: an internal timer is added to
    /// the set and subtracted from the result, so a return of zero means the
    /// timeout expired first.
    pub fn wait_timeout(&self, events: &[Event], timeout: Duration) -> Result<usize> {
        let timer = self.timer_watcher(timeout);
        let guard = self.add_destructor({
            let t = timer.clone();
            move |_| t.stop()
        });
        let mut all: Vec<Event> = Vec::with_capacity(events.len() + 1);
        all.extend_from_slice(events);
        all.push(Event::Watcher(&timer));
        let res = self.wait_mask(&all);
        self.remove_destructor(guard, true);
        let mask = res?;
        let mut n = mask.count_ones() as usize;
        if mask & (1u64 << events.len()) != 0 {
            n -= 1;
        }
        Ok(n)
    }

    fn wait_mask(&self, events: &[Event]) -> Result<u64> {
        assert!(
            events.len() <= MAX_WAIT_EVENTS,
            "too many events in one wait set"
        );
        let me = self.self_id();
        let wait_seq = self.alloc_ticket();
        self.with_slot(me, |s| {
            s.ev_arrived = 0;
            s.wait_seq = wait_seq;
        })
        .expect("current fiber is live");

        let mut preps: Vec<Prep> = Vec::with_capacity(events.len());
        for (i, ev) in events.iter().enumerate() {
            match self.prepare_event(me, i as u32, wait_seq, ev) {
                Ok(Prep::Arrived) => {
                    let _ = self.with_slot(me, |s| s.ev_arrived |= 1u64 << i);
                    preps.push(Prep::Arrived);
                }
                Ok(p) => preps.push(p),
                Err(e) => {
                    self.unwind_prepared(events, &preps);
                    let _ = self.with_slot(me, |s| s.wait_seq = 0);
                    return Err(e);
                }
            }
        }

        loop {
            let arrived = self
                .with_slot(me, |s| s.ev_arrived)
                .expect("current fiber is live");
            if arrived != 0 {
                break;
            }
            self.yield_now();
        }

        let mask = self
            .with_slot(me, |s| {
                s.wait_seq = 0;
                s.ev_arrived
            })
            .expect("current fiber is live");

        for (i, (ev, prep)) in events.iter().zip(preps.into_iter()).enumerate() {
            match prep {
                Prep::WatcherArmed { tok } => {
                    self.inner.reactor.borrow_mut().set_target(tok, None);
                }
                Prep::Queued { dtor } => {
                    self.remove_destructor(dtor, true);
                }
                Prep::Arrived => {}
            }
            if mask & (1u64 << i) != 0 {
                if let Event::Cond(_, m) = ev {
                    m.lock()?;
                }
            }
        }
        Ok(mask)
    }

    fn prepare_event(
        &self,
        me: FiberId,
        idx: u32,
        wait_seq: u64,
        ev: &Event,
    ) -> Result<Prep> {
        match ev {
            Event::Watcher(w) => {
                let tok = w
                    .token()
                    .ok_or(Error::Invalid("watcher is not active"))?;
                let mut reactor = self.inner.reactor.borrow_mut();
                if !reactor.is_active(tok) {
                    return Err(Error::Invalid("watcher is not active"));
                }
                reactor.set_target(tok, Some((me, idx, wait_seq)));
                Ok(Prep::WatcherArmed { tok })
            }
            Event::Mutex(m) => {
                if m.locked_by().is_null() {
                    m.grab(me);
                    return Ok(Prep::Arrived);
                }
                let ticket = self.alloc_ticket();
                m.push_waiter(WaitEntry {
                    fiber: me,
                    ticket,
                    ev_idx: idx,
                    wait_seq,
                });
                let dtor = self.queue_removal_dtor(m.queue_weak(), ticket);
                Ok(Prep::Queued { dtor })
            }
            Event::Cond(c, m) => {
                if m.locked_by() != me {
                    return Err(Error::Invalid(
                        "condition variable wait requires the mutex to be held",
                    ));
                }
                let ticket = self.alloc_ticket();
                c.push_waiter(WaitEntry {
                    fiber: me,
                    ticket,
                    ev_idx: idx,
                    wait_seq,
                });
                let dtor = self.queue_removal_dtor(c.queue_weak(), ticket);
                m.unlock();
                Ok(Prep::Queued { dtor })
            }
        }
    }

    /// Roll back the events prepared before one failed.
    fn unwind_prepared(&self, events: &[Event], preps: &[Prep]) {
        for (ev, prep) in events.iter().zip(preps.iter()) {
            match prep {
                Prep::WatcherArmed { tok } => {
                    self.inner.reactor.borrow_mut().set_target(*tok, None);
                }
                Prep::Queued { dtor } => {
                    self.remove_destructor(*dtor, true);
                }
                Prep::Arrived => {
                    if let Event::Mutex(m) = ev {
                        m.unlock();
                    }
                }
            }
        }
    }

    /// A destructor that pulls a wait-queue entry out of whatever queue it
    /// currently sits in (the primitive's own, or the pending-run queue).
    fn queue_removal_dtor(&self, queue: Weak<WaitQueue>, ticket: u64) -> DtorHandle {
        self.add_destructor(move |rt| {
            if let Some(q) = queue.upgrade() {
                q.remove_ticket(ticket);
            }
            rt.remove_run_ticket(ticket);
        })
    }

    ////////////////////////////////////////////////////////////////////////////
    // Watcher constructors
    ////////////////////////////////////////////////////////////////////////////

    fn wrap_watcher(&self, tok: WatcherToken) -> Watcher {
        Watcher {
            rt: self.clone(),
            inner: Rc::new(WatcherHandle {
                token: Cell::new(Some(tok)),
            }),
        }
    }

    /// Arm an fd readiness watcher.
    pub fn io_watcher(&self, fd: RawFd, interest: IoInterest) -> Result<Watcher> {
        let tok = self.inner.reactor.borrow_mut().start_io(fd, interest)?;
        Ok(self.wrap_watcher(tok))
    }

    /// Arm a one-shot timer.
    pub fn timer_watcher(&self, after: Duration) -> Watcher {
        let tok = self.inner.reactor.borrow_mut().start_timer(after, None);
        self.wrap_watcher(tok)
    }

    /// Arm a repeating timer.
    pub fn periodic_watcher(&self, after: Duration, period: Duration) -> Watcher {
        let tok = self
            .inner
            .reactor
            .borrow_mut()
            .start_timer(after, Some(period));
        self.wrap_watcher(tok)
    }

    /// Arm an async wakeup watcher; signal it with [`Watcher::send`].
    pub fn async_watcher(&self) -> Watcher {
        let tok = self.inner.reactor.borrow_mut().start_async();
        self.wrap_watcher(tok)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Destructors, pool, keys
    ////////////////////////////////////////////////////////////////////////////

    /// Register a cleanup hook on the running fiber. Hooks run in
    /// registration order when the fiber is reclaimed, on every exit path;
    /// this is the universal resource-release discipline of the runtime.
    pub fn add_destructor<F>(&self, f: F) -> DtorHandle
    where
        F: FnOnce(&Runtime) + 'static,
    {
        let me = self.self_id();
        let seq = self.alloc_ticket();
        self.with_slot(me, |s| {
            s.dtors.push(DtorEntry {
                seq,
                func: Box::new(f),
            })
        })
        .expect("current fiber is live");
        DtorHandle { fiber: me, seq }
    }

    /// Unregister a destructor, optionally invoking it. Returns false when
    /// it already ran (or its fiber is gone).
    pub fn remove_destructor(&self, h: DtorHandle, call: bool) -> bool {
        let func = match self.with_slot(h.fiber, |s| {
            s.dtors
                .iter()
                .position(|d| d.seq == h.seq)
                .map(|i| s.dtors.remove(i).func)
        }) {
            Ok(Some(f)) => f,
            _ => return false,
        };
        if call {
            func(self);
        }
        true
    }

    /// Park a value in the running fiber's scratch pool; it is dropped when
    /// the fiber is reclaimed.
    pub fn pool_put<T: Any>(&self, value: T) -> PoolId {
        self.pool_insert(Box::new(value), None)
    }

    /// Like [`Runtime::pool_put`] with a hook invoked right before the value
    /// is dropped (on [`Runtime::pool_free`] or reclaim).
    pub fn pool_put_with<T, F>(&self, value: T, dtor: F) -> PoolId
    where
        T: Any,
        F: FnOnce(&Runtime, &mut T) + 'static,
    {
        let hook = Box::new(move |rt: &Runtime, any: &mut dyn Any| {
            let v = any.downcast_mut::<T>().expect("pool entry type is fixed");
            dtor(rt, v);
        });
        self.pool_insert(Box::new(value), Some(hook))
    }

    fn pool_insert(
        &self,
        value: Box<dyn Any>,
        dtor: Option<Box<dyn FnOnce(&Runtime, &mut dyn Any)>>,
    ) -> PoolId {
        let me = self.self_id();
        let seq = self.alloc_ticket();
        self.with_slot(me, |s| s.pool.push(PoolEntry { seq, value, dtor }))
            .expect("current fiber is live");
        PoolId { fiber: me, seq }
    }

    /// Drop a pooled value now, running its hook.
    pub fn pool_free(&self, id: PoolId) -> Result<()> {
        let entry = self.with_slot(id.fiber, |s| {
            s.pool
                .iter()
                .position(|e| e.seq == id.seq)
                .map(|i| s.pool.remove(i))
        })?;
        let mut entry = entry.ok_or(Error::Invalid("unknown pool entry"))?;
        if let Some(d) = entry.dtor.take() {
            d(self, entry.value.as_mut());
        }
        Ok(())
    }

    /// Move a pooled value out, skipping its hook.
    pub fn pool_take<T: Any>(&self, id: PoolId) -> Result<T> {
        let entry = self.with_slot(id.fiber, |s| {
            let i = s
                .pool
                .iter()
                .position(|e| e.seq == id.seq && e.value.is::<T>())?;
            Some(s.pool.remove(i))
        })?;
        let entry = entry.ok_or(Error::Invalid("unknown pool entry"))?;
        let value = entry.value.downcast::<T>().expect("type checked above");
        Ok(*value)
    }

    /// Allocate a fiber-local storage key. Panics when all [`MAX_KEYS`] are
    /// taken.
    pub fn key_create(&self) -> Key {
        let mask = self.inner.key_mask.get();
        let k = mask.trailing_zeros();
        assert!((k as usize) < MAX_KEYS, "no free fiber-local keys");
        self.inner.key_mask.set(mask & !(1u64 << k));
        Key(k)
    }

    /// Release a key. Values stored under it become unreachable.
    pub fn key_delete(&self, key: Key) -> Result<()> {
        let mask = self.inner.key_mask.get();
        if mask & (1u64 << key.0) != 0 {
            return Err(Error::NoKey);
        }
        self.inner.key_mask.set(mask | (1u64 << key.0));
        Ok(())
    }

    fn key_registered(&self, key: Key) -> bool {
        (key.0 as usize) < MAX_KEYS && self.inner.key_mask.get() & (1u64 << key.0) == 0
    }

    pub fn key_set<T: Any>(&self, id: FiberId, key: Key, value: T) -> Result<()> {
        if !self.key_registered(key) {
            return Err(Error::NoKey);
        }
        self.with_slot(id, |s| {
            let i = key.0 as usize;
            if s.keys.len() <= i {
                s.keys.resize_with(i + 1, || None);
            }
            s.keys[i] = Some(Rc::new(value));
        })
    }

    /// Typed read of a fiber-local value. `None` if unset or of another type.
    pub fn key_get<T: Any>(&self, id: FiberId, key: Key) -> Result<Option<Rc<T>>> {
        if !self.key_registered(key) {
            return Err(Error::NoKey);
        }
        self.with_slot(id, |s| s.keys.get(key.0 as usize).cloned().flatten())
            .map(|v| v.and_then(|rc| rc.downcast::<T>().ok()))
    }

    ////////////////////////////////////////////////////////////////////////////
    // Event loop
    ////////////////////////////////////////////////////////////////////////////

    /// Run the event loop until [`Runtime::stop`] is called or nothing is
    /// armed anymore (no watchers, empty pending-run queue). Must be called
    /// from the root fiber.
    pub fn run(&self) {
        loop {
            if self.inner.stopped.replace(false) {
                break;
            }
            if !self.run_once() {
                break;
            }
        }
    }

    /// One loop iteration: poll (blocking until something is due), dispatch
    /// fired watchers, then transfer to at most one pending-run fiber.
    /// Returns false when there was nothing to wait for.
    pub fn run_once(&self) -> bool {
        self.assert_root("run_once");

        let runq_pending = !self.inner.run_q.borrow().is_empty();
        let timeout = {
            let mut reactor = self.inner.reactor.borrow_mut();
            if !runq_pending && !reactor.has_work() {
                return false;
            }
            if runq_pending || reactor.async_pending() {
                Some(Duration::from_millis(0))
            } else {
                reactor.next_timer_in()
            }
        };

        let fired = match self.inner.reactor.borrow_mut().poll(timeout) {
            Ok(f) => f,
            Err(e) => {
                log::error!("event loop poll failed: {}", e);
                return true;
            }
        };

        for tok in fired {
            // the target is re-read here: a watcher stopped by a destructor
            // in the meantime must not wake anybody
            let target = self.inner.reactor.borrow().current_target(tok);
            let (id, ev_idx, wait_seq) = match target {
                Some(t) => t,
                None => continue,
            };
            assert!(
                !self.is_reclaimed(id),
                "watcher fired for a fiber that no longer exists"
            );
            if !self.post_arrival(id, ev_idx, wait_seq) {
                continue;
            }
            self.transfer(id).expect("fiber was just validated");
        }

        let item = self.inner.run_q.borrow_mut().pop_front();
        if let Some(item) = item {
            if self.is_reclaimed(item.id) {
                log::warn!("dropping pending fiber {:?}: no such fiber", item.id);
            } else {
                self.transfer(item.id).expect("fiber was just validated");
            }
        }
        true
    }

    /// Make [`Runtime::run`] return after the current iteration.
    pub fn stop(&self) {
        self.inner.stopped.set(true);
        self.inner.reactor.borrow().wake();
    }

    /// Log the scheduler call stack at error level.
    pub fn dump_stack(&self) {
        log::error!("fiber call stack:");
        for id in self.inner.call_stack.borrow().iter().rev() {
            let name = self.name(*id).unwrap_or_else(|_| "<gone>".into());
            log::error!("  {:?} '{}'", id, name);
        }
    }

}

fn map_stack_error(e: StackError) -> Error {
    match e {
        StackError::ExceedsMaximumSize(_) => Error::Invalid("stack size exceeds platform maximum"),
        StackError::IoError(e) => Error::System(e),
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the new
/// fiber.
///
/// ```no_run
/// # let rt = fibrio::fiber::Runtime::new().unwrap();
/// use fibrio::fiber::Builder;
///
/// let worker = Builder::new()
///     .name("worker")
///     .stack_size(256 * 1024)
///     .create(&rt, |rt| { /* ... */ })
///     .unwrap();
/// rt.transfer(worker).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber-to-be.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stack size in bytes; zero selects [`DEFAULT_STACK_SIZE`]. The actual
    /// stack is rounded up to the page size and guarded below.
    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Create the fiber in a suspended state and return its id.
    ///
    /// The entry function is `Fn` rather than `FnOnce` so the runtime can
    /// re-run it on [`Runtime::restart`]; keep one-shot state in cells.
    pub fn create<F>(self, rt: &Runtime, f: F) -> Result<FiberId>
    where
        F: Fn(&Runtime) + 'static,
    {
        let name = self.name.unwrap_or_else(|| "<fiber>".into());
        rt.create_inner(name, Rc::new(f), self.stack_size)
    }
}
