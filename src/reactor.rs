//! Event loop adapter.
//!
//! A thin layer over [`mio::Poll`] exposing the reactor surface the fiber
//! runtime needs: fd readiness watchers, one-shot and repeating timers, async
//! wakeups, and a cached monotonic timestamp. The adapter never transfers
//! control itself, it only reports which watchers fired; scheduling decisions
//! belong to the runtime.
//!
//! Watcher handles are generation tagged, so a stale token (a slot recycled
//! after stop) is recognized and ignored by every entry point. Firings are
//! reported as tokens and the dispatch target is re-read at delivery time:
//! stopping a watcher between poll and dispatch cancels its pending firing,
//! which is what lets fiber destructors reliably suppress wakeups of
//! reclaimed fibers.

use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::error::{Error, Result};
use crate::fiber::FiberId;

bitflags::bitflags! {
    /// Readiness interest of an fd watcher.
    pub struct IoInterest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 256;

/// Generation-tagged reference to a reactor watcher slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WatcherToken {
    idx: usize,
    gen: u64,
}

/// The fiber, wait-set position and wait sequence number a firing should be
/// delivered to. The sequence lets the runtime ignore deliveries aimed at a
/// wait that has already finished.
pub(crate) type WatchTarget = (FiberId, u32, u64);

enum WatcherKind {
    Io { fd: RawFd, interest: IoInterest },
    Timer { deadline: Instant, period: Option<Duration> },
    Async { sent: bool },
}

struct WatcherEntry {
    gen: u64,
    kind: WatcherKind,
    target: Option<WatchTarget>,
    /// A fired one-shot timer: no longer active, but the slot is kept until
    /// an explicit stop so the pending firing can still be delivered.
    dead: bool,
}

/// Per-direction registration refcounts of one fd. mio allows a single
/// registration per fd, so concurrent watchers share it with union interest.
#[derive(Default)]
struct FdReg {
    read: usize,
    write: usize,
}

impl FdReg {
    fn interest(&self) -> Option<Interest> {
        match (self.read > 0, self.write > 0) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Entry of the timer heap; ordered by nearest deadline first.
struct TimerKey {
    deadline: Instant,
    idx: usize,
    gen: u64,
}

impl PartialEq for TimerKey {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerKey {}
impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap, invert to pop the nearest deadline
        other.deadline.cmp(&self.deadline)
    }
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    waker: Waker,
    entries: Slab<WatcherEntry>,
    fd_regs: HashMap<RawFd, FdReg>,
    timers: BinaryHeap<TimerKey>,
    next_gen: u64,
    now: Instant,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Reactor {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            entries: Slab::new(),
            fd_regs: HashMap::new(),
            timers: BinaryHeap::new(),
            next_gen: 1,
            now: Instant::now(),
        })
    }

    /// Loop begin time, cheap to read. Monotonic.
    #[inline]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Force a timestamp update outside of the regular once-per-iteration one.
    #[inline]
    pub fn update_now(&mut self) {
        self.now = Instant::now();
    }

    /// Interrupt a blocking poll. Safe to call at any point.
    pub fn wake(&self) {
        let _ = self.waker.wake();
    }

    fn alloc_gen(&mut self) -> u64 {
        let gen = self.next_gen;
        self.next_gen += 1;
        gen
    }

    fn entry(&self, tok: WatcherToken) -> Option<&WatcherEntry> {
        self.entries.get(tok.idx).filter(|e| e.gen == tok.gen)
    }

    fn entry_mut(&mut self, tok: WatcherToken) -> Option<&mut WatcherEntry> {
        self.entries.get_mut(tok.idx).filter(|e| e.gen == tok.gen)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Watcher arming
    ////////////////////////////////////////////////////////////////////////////

    pub fn start_io(&mut self, fd: RawFd, interest: IoInterest) -> Result<WatcherToken> {
        if interest.is_empty() {
            return Err(Error::Invalid("io watcher needs a non-empty interest"));
        }
        let reg = self.fd_regs.entry(fd).or_default();
        let before = reg.interest();
        if interest.contains(IoInterest::READ) {
            reg.read += 1;
        }
        if interest.contains(IoInterest::WRITE) {
            reg.write += 1;
        }
        let after = reg.interest().expect("at least one direction was added");
        let registry = self.poll.registry();
        let res = match before {
            None => registry.register(&mut SourceFd(&fd), Token(fd as usize), after),
            Some(prev) if prev != after => {
                registry.reregister(&mut SourceFd(&fd), Token(fd as usize), after)
            }
            Some(_) => Ok(()),
        };
        if let Err(e) = res {
            self.io_unref(fd, interest);
            return Err(Error::System(e));
        }
        let gen = self.alloc_gen();
        let idx = self.entries.insert(WatcherEntry {
            gen,
            kind: WatcherKind::Io { fd, interest },
            target: None,
            dead: false,
        });
        Ok(WatcherToken { idx, gen })
    }

    pub fn start_timer(&mut self, after: Duration, period: Option<Duration>) -> WatcherToken {
        let deadline = self.now + after;
        let gen = self.alloc_gen();
        let idx = self.entries.insert(WatcherEntry {
            gen,
            kind: WatcherKind::Timer { deadline, period },
            target: None,
            dead: false,
        });
        self.timers.push(TimerKey { deadline, idx, gen });
        WatcherToken { idx, gen }
    }

    pub fn start_async(&mut self) -> WatcherToken {
        let gen = self.alloc_gen();
        let idx = self.entries.insert(WatcherEntry {
            gen,
            kind: WatcherKind::Async { sent: false },
            target: None,
            dead: false,
        });
        WatcherToken { idx, gen }
    }

    /// Signal an async watcher; its target fires on the next iteration.
    /// Re-entrant: signalling an already-signalled watcher is a no-op.
    pub fn async_send(&mut self, tok: WatcherToken) -> bool {
        let armed = match self.entry_mut(tok) {
            Some(WatcherEntry { kind: WatcherKind::Async { sent }, .. }) => {
                *sent = true;
                true
            }
            _ => false,
        };
        if armed {
            self.waker.wake().ok();
        }
        armed
    }

    /// Stop a watcher and cancel any pending firing. Idempotent: stale tokens
    /// are ignored.
    pub fn stop(&mut self, tok: WatcherToken) {
        if self.entry(tok).is_none() {
            return;
        }
        let entry = self.entries.remove(tok.idx);
        if let WatcherKind::Io { fd, interest } = entry.kind {
            self.io_unref(fd, interest);
        }
        // timer heap entries are skipped lazily by generation
    }

    fn io_unref(&mut self, fd: RawFd, interest: IoInterest) {
        let reg = match self.fd_regs.get_mut(&fd) {
            Some(reg) => reg,
            None => return,
        };
        let before = reg.interest();
        if interest.contains(IoInterest::READ) {
            reg.read = reg.read.saturating_sub(1);
        }
        if interest.contains(IoInterest::WRITE) {
            reg.write = reg.write.saturating_sub(1);
        }
        let after = reg.interest();
        let registry = self.poll.registry();
        let res = match after {
            None => {
                self.fd_regs.remove(&fd);
                registry.deregister(&mut SourceFd(&fd))
            }
            cur if cur != before => registry.reregister(
                &mut SourceFd(&fd),
                Token(fd as usize),
                cur.expect("narrowed interest is still non-empty"),
            ),
            _ => Ok(()),
        };
        if let Err(e) = res {
            // the fd may already be closed by the caller, nothing to salvage
            log::debug!("failed to update fd {} registration: {}", fd, e);
        }
    }

    pub fn is_active(&self, tok: WatcherToken) -> bool {
        self.entry(tok).map_or(false, |e| !e.dead)
    }

    pub fn set_target(&mut self, tok: WatcherToken, target: Option<WatchTarget>) -> bool {
        match self.entry_mut(tok) {
            Some(e) => {
                e.target = target;
                true
            }
            None => false,
        }
    }

    /// Target as of right now; the runtime reads this at dispatch time so
    /// that watchers stopped after polling do not deliver stale wakeups.
    pub fn current_target(&self, tok: WatcherToken) -> Option<WatchTarget> {
        self.entry(tok).and_then(|e| e.target)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Polling
    ////////////////////////////////////////////////////////////////////////////

    /// True while any watcher is armed; the loop has something to wait for.
    pub fn has_work(&self) -> bool {
        self.entries.iter().any(|(_, e)| !e.dead)
    }

    /// True if some async watcher has been signalled and not yet dispatched.
    pub fn async_pending(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, e)| matches!(e.kind, WatcherKind::Async { sent: true }))
    }

    /// Time until the nearest armed timer, zero if one is already due.
    /// Prunes stale heap entries on the way.
    pub fn next_timer_in(&mut self) -> Option<Duration> {
        loop {
            let (deadline, idx, gen) = match self.timers.peek() {
                Some(k) => (k.deadline, k.idx, k.gen),
                None => return None,
            };
            let valid = self
                .entries
                .get(idx)
                .map_or(false, |e| e.gen == gen && !e.dead);
            if !valid {
                self.timers.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(self.now));
        }
    }

    /// Run one poll step and collect fired watchers in dispatch order:
    /// I/O readiness, expired timers, signalled asyncs. One-shot timers are
    /// disarmed (kept until stop), periodic ones rearmed.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<WatcherToken>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.now = Instant::now();

        let mut fired = Vec::new();

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            for (idx, entry) in self.entries.iter() {
                if entry.dead {
                    continue;
                }
                if let WatcherKind::Io { fd: wfd, interest } = entry.kind {
                    if wfd != fd {
                        continue;
                    }
                    let hit = (readable && interest.contains(IoInterest::READ))
                        || (writable && interest.contains(IoInterest::WRITE));
                    if hit {
                        fired.push(WatcherToken { idx, gen: entry.gen });
                    }
                }
            }
        }

        loop {
            let (deadline, idx, gen) = match self.timers.peek() {
                Some(k) => (k.deadline, k.idx, k.gen),
                None => break,
            };
            let valid = self
                .entries
                .get(idx)
                .map_or(false, |e| e.gen == gen && !e.dead);
            if !valid {
                self.timers.pop();
                continue;
            }
            if deadline > self.now {
                break;
            }
            self.timers.pop();
            fired.push(WatcherToken { idx, gen });
            let rearm = {
                let entry = &mut self.entries[idx];
                match entry.kind {
                    WatcherKind::Timer { ref mut deadline, period: Some(period) } => {
                        *deadline += period;
                        Some(*deadline)
                    }
                    _ => {
                        entry.dead = true;
                        None
                    }
                }
            };
            if let Some(deadline) = rearm {
                self.timers.push(TimerKey { deadline, idx, gen });
            }
        }

        for (idx, entry) in self.entries.iter_mut() {
            if let WatcherKind::Async { ref mut sent } = entry.kind {
                if *sent {
                    *sent = false;
                    fired.push(WatcherToken { idx, gen: entry.gen });
                }
            }
        }

        Ok(fired)
    }
}
