//! Inter-fiber byte pipe with transactional access.
//!
//! A [`Buffer`] is a [`Vrb`](crate::vrb::Vrb) plus the synchronization that
//! turns it into a blocking producer/consumer channel. Writers reserve a
//! contiguous span with [`Buffer::alloc_prepare`], fill it in place and make
//! it visible with [`Buffer::alloc_commit`]; readers borrow a contiguous
//! span with [`Buffer::read_address`] and consume it with
//! [`Buffer::read_advance`]. Both sides suspend when the buffer cannot
//! satisfy them and are woken by the opposite side.
//!
//! Prepare/commit pairs are serialized per side by an internal mutex, so at
//! most one write and one read transaction are outstanding at any time; the
//! two sides proceed in parallel. Mixing the transactional API with the raw
//! [`Buffer::data_ptr`]/[`Buffer::space_ptr`] access is undefined.

use std::cell::{Cell, RefCell};

use crate::error::{Error, Result};
use crate::fiber::{CondVar, Mutex, Runtime};
use crate::vrb::Vrb;

pub struct Buffer {
    vrb: RefCell<Vrb>,
    prepared_bytes: Cell<usize>,
    waiting_bytes: Cell<usize>,
    committed_cond: CondVar,
    bytes_freed_cond: CondVar,
    write_mutex: Mutex,
    read_mutex: Mutex,
}

impl Buffer {
    /// Allocate a buffer holding at least `size` bytes (rounded up to a page
    /// multiple).
    pub fn new(rt: &Runtime, size: usize) -> Result<Buffer> {
        Ok(Buffer {
            vrb: RefCell::new(Vrb::new(size, None)?),
            prepared_bytes: Cell::new(0),
            waiting_bytes: Cell::new(0),
            committed_cond: CondVar::new(rt),
            bytes_freed_cond: CondVar::new(rt),
            write_mutex: Mutex::new(rt),
            read_mutex: Mutex::new(rt),
        })
    }

    ////////////////////////////////////////////////////////////////////////////
    // Write side
    ////////////////////////////////////////////////////////////////////////////

    /// Reserve a contiguous span of `size` bytes for writing, suspending
    /// while another write transaction is open or while the buffer lacks
    /// space. The span contents become visible to the reader only after
    /// [`Buffer::alloc_commit`].
    ///
    /// The returned slice is valid until commit/abort; a later
    /// [`Buffer::resize`] invalidates it.
    pub fn alloc_prepare(&self, size: usize) -> Result<&mut [u8]> {
        if size == 0 {
            return Err(Error::Invalid("zero-size write transaction"));
        }
        if size > self.capacity() {
            return Err(Error::Invalid("write transaction exceeds buffer capacity"));
        }

        self.write_mutex.lock()?;

        while self.prepared_bytes.get() > 0 {
            self.committed_cond.wait(&self.write_mutex)?;
        }
        self.prepared_bytes.set(size);

        while self.vrb.borrow().space_len() < size {
            self.bytes_freed_cond.wait(&self.write_mutex)?;
        }

        let ptr = self.vrb.borrow().space_ptr();
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, size) })
    }

    /// Publish the prepared bytes and close the write transaction.
    pub fn alloc_commit(&self) {
        let prepared = self.prepared_bytes.replace(0);
        self.vrb
            .borrow_mut()
            .give(prepared)
            .expect("prepared span fits by construction");
        self.committed_cond.signal();
        self.write_mutex.unlock();
    }

    /// Discard the prepared bytes and close the write transaction.
    pub fn alloc_abort(&self) {
        self.prepared_bytes.set(0);
        self.committed_cond.signal();
        self.write_mutex.unlock();
    }

    ////////////////////////////////////////////////////////////////////////////
    // Read side
    ////////////////////////////////////////////////////////////////////////////

    /// Borrow a contiguous span of `size` readable bytes, suspending until
    /// the writer has committed enough. The span stays consumable until
    /// [`Buffer::read_advance`] or [`Buffer::read_discard`].
    pub fn read_address(&self, size: usize) -> Result<&[u8]> {
        if size == 0 {
            return Err(Error::Invalid("zero-size read transaction"));
        }
        if size > self.capacity() {
            return Err(Error::Invalid("read transaction exceeds buffer capacity"));
        }

        self.read_mutex.lock()?;

        while self.vrb.borrow().data_len() < size {
            self.committed_cond.wait(&self.read_mutex)?;
        }
        self.waiting_bytes.set(size);

        let ptr = self.vrb.borrow().data_ptr();
        Ok(unsafe { std::slice::from_raw_parts(ptr, size) })
    }

    /// Consume the span returned by the last [`Buffer::read_address`] and
    /// close the read transaction.
    pub fn read_advance(&self) {
        self.vrb
            .borrow_mut()
            .take(self.waiting_bytes.get())
            .expect("span was available at read_address");
        self.bytes_freed_cond.signal();
        self.read_mutex.unlock();
    }

    /// Close the read transaction without consuming anything.
    pub fn read_discard(&self) {
        self.read_mutex.unlock();
    }

    ////////////////////////////////////////////////////////////////////////////
    // Introspection & maintenance
    ////////////////////////////////////////////////////////////////////////////

    /// Bytes committed and not yet consumed. Can be used to check whether
    /// [`Buffer::read_address`] would suspend.
    pub fn bytes(&self) -> usize {
        self.vrb.borrow().data_len()
    }

    /// Free bytes. Can be used to check whether [`Buffer::alloc_prepare`]
    /// would suspend.
    pub fn free_bytes(&self) -> usize {
        self.vrb.borrow().space_len()
    }

    pub fn capacity(&self) -> usize {
        self.vrb.borrow().capacity()
    }

    /// Raw read cursor; see the module note on mixing access styles.
    pub fn data_ptr(&self) -> *const u8 {
        self.vrb.borrow().data_ptr()
    }

    /// Raw write cursor; see the module note on mixing access styles.
    pub fn space_ptr(&self) -> *mut u8 {
        self.vrb.borrow().space_ptr()
    }

    /// Mark the whole contents as consumed. Not safe while other fibers use
    /// the buffer.
    pub fn reset(&self) {
        let mut vrb = self.vrb.borrow_mut();
        let len = vrb.data_len();
        vrb.take(len).expect("taking exactly what is available");
    }

    /// Grow the underlying mapping to at least `size` bytes, copying live
    /// data over. Pointers and spans into the old mapping are invalidated.
    pub fn resize(&self, size: usize) -> Result<()> {
        self.vrb.borrow_mut().resize(size, None)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("bytes", &self.bytes())
            .field("free_bytes", &self.free_bytes())
            .finish_non_exhaustive()
    }
}
