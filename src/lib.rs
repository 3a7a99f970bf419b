//! Cooperative fiber runtime on top of a [mio] event loop.
//!
//! This library contains:
//!
//! - [Fibers](fiber): creation, scheduling, reclamation, fiber-local storage
//!   and scoped destructors
//! - [Synchronization](fiber): [`fiber::Mutex`], [`fiber::CondVar`] and a
//!   typed [channel](mod@fiber::channel)
//! - [Cooperative I/O](coio): blocking-style reads, writes, accepts and
//!   connects that suspend the fiber instead of the thread
//! - [Mirrored ring buffer](vrb) and the [transactional byte pipe](buffer)
//!   built on it
//! - [Error handling](error)
//!
//! A fiber is a unit of execution with its own stack, scheduled
//! cooperatively on a single thread. Whenever a fiber is about to block — on
//! a socket, a timer, a mutex — the runtime arms an event on the loop and
//! yields; the fiber resumes when the event fires. From the fiber's point of
//! view all operations are blocking; in reality the other fibers run while
//! it waits.
//!
//! ```no_run
//! use std::time::Duration;
//! use fibrio::fiber::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! let f = rt.create("ticker", |rt| {
//!     for _ in 0..3 {
//!         rt.sleep(Duration::from_millis(100));
//!         println!("tick");
//!     }
//! }).unwrap();
//! rt.transfer(f).unwrap();
//! rt.run();
//! ```
//!
//! The runtime is strictly single threaded: no fiber ever runs in parallel
//! with another, and none of the handles are `Send`. Mutexes here protect
//! invariants across suspension points, not against data races.
//!
//! [mio]: https://docs.rs/mio/

pub mod buffer;
pub mod coio;
pub mod error;
pub mod fiber;
pub mod reactor;
pub mod vrb;

pub use error::{Error, ErrorCode, Result};
pub use fiber::{Builder, Event, FiberId, Runtime, Watcher};
pub use reactor::IoInterest;
