//! Mirrored ring buffer.
//!
//! A ring buffer whose backing pages are mapped twice into adjacent virtual
//! regions, so any contiguous span of up to the full capacity can be
//! addressed without wrap-around handling: bytes written past the end of the
//! first mapping are visible from the start of the second one and vice
//! versa.
//!
//! The layout of the reserved region:
//!
//! ```text
//! | guard page | capacity (mapping #1) | capacity (mapping #2) | guard page |
//!                ^lower                  ^upper
//! ```
//!
//! Both mappings are views of the same unlinked temporary file. The file
//! name is built from the `pattern` argument, the `BUFFER_FILE_PATTERN`
//! environment variable, or a `/dev/shm` default, in that order.

use std::env;
use std::ffi::CString;
use std::io;
use std::ptr;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

const DEFAULT_FILE_PATTERN: &str = "/dev/shm/fibrio.XXXXXX";

static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

fn round_up_to_page_size(size: usize) -> usize {
    let page = *PAGE_SIZE;
    let remainder = size % page;
    if remainder == 0 {
        size
    } else {
        size + page - remainder
    }
}

/// The virtual ring buffer. Plain data, no fiber involvement; the blocking
/// producer/consumer channel on top of it lives in [`crate::buffer`].
pub struct Vrb {
    mem: *mut libc::c_void,
    mem_size: usize,
    lower: *mut u8,
    upper: *mut u8,
    cap: usize,
    data: *mut u8,
    space: *mut u8,
}

impl Vrb {
    /// Map a buffer of at least `size` bytes (rounded up to a page
    /// multiple). The backing file is created from `pattern` (a `mkstemp`
    /// template) and unlinked immediately.
    pub fn new(size: usize, pattern: Option<&str>) -> Result<Vrb> {
        let cap = round_up_to_page_size(size.max(1));
        let page = *PAGE_SIZE;

        let pattern = match pattern {
            Some(p) => p.to_owned(),
            None => env::var("BUFFER_FILE_PATTERN")
                .unwrap_or_else(|_| DEFAULT_FILE_PATTERN.to_owned()),
        };
        let template =
            CString::new(pattern).map_err(|_| Error::Invalid("file pattern contains NUL"))?;
        let mut template = template.into_bytes_with_nul();

        let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
        if fd < 0 {
            return Err(Error::System(io::Error::last_os_error()));
        }
        unsafe { libc::unlink(template.as_ptr() as *const libc::c_char) };
        if unsafe { libc::ftruncate(fd, cap as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::System(err));
        }

        // reserve the whole region with inaccessible guards on both ends
        let mem_size = 2 * cap + 2 * page;
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mem_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::BufferMmap(err));
        }

        let lower = unsafe { (mem as *mut u8).add(page) };
        let upper = unsafe { lower.add(cap) };
        for half in &[lower, upper] {
            let mapped = unsafe {
                libc::mmap(
                    **half as *mut libc::c_void,
                    cap,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_FIXED | libc::MAP_SHARED,
                    fd,
                    0,
                )
            };
            if mapped != unsafe { **half as *mut libc::c_void } {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::munmap(mem, mem_size);
                    libc::close(fd);
                }
                return Err(Error::BufferMmap(err));
            }
        }
        unsafe { libc::close(fd) };

        Ok(Vrb {
            mem,
            mem_size,
            lower,
            upper,
            cap,
            data: lower,
            space: lower,
        })
    }

    /// Bytes currently filled with data.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.space as usize - self.data as usize
    }

    /// Bytes of free space.
    #[inline]
    pub fn space_len(&self) -> usize {
        self.cap - self.data_len()
    }

    /// Maximum length of data this buffer can hold. May be larger than
    /// originally requested due to page rounding.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Start of the data area, contiguous for [`Vrb::data_len`] bytes.
    #[inline]
    pub fn data_ptr(&self) -> *const u8 {
        self.data
    }

    /// Start of the space area, contiguous for [`Vrb::space_len`] bytes.
    #[inline]
    pub fn space_ptr(&self) -> *mut u8 {
        self.space
    }

    /// The data area as a slice.
    #[inline]
    pub fn data_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.data_len()) }
    }

    /// The space area as a slice, to be filled before [`Vrb::give`].
    #[inline]
    pub fn space_slice_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.space, self.space_len()) }
    }

    /// Mark `size` bytes of the space area (which the caller has filled) as
    /// data.
    pub fn give(&mut self, size: usize) -> Result<()> {
        if size > self.space_len() {
            return Err(Error::BufferNoSpace);
        }
        self.space = unsafe { self.space.add(size) };
        Ok(())
    }

    /// Mark `size` bytes of the data area as consumed. When the read cursor
    /// crosses into the upper mirror, both cursors shift down by one
    /// capacity, preserving their relative positions without copying.
    pub fn take(&mut self, size: usize) -> Result<()> {
        if size > self.data_len() {
            return Err(Error::Invalid("take size exceeds available data"));
        }
        self.data = unsafe { self.data.add(size) };
        if self.data >= self.upper {
            self.data = unsafe { self.data.sub(self.cap) };
            self.space = unsafe { self.space.sub(self.cap) };
        }
        Ok(())
    }

    /// Reset both cursors, marking the buffer empty.
    pub fn reset(&mut self) {
        self.data = self.lower;
        self.space = self.lower;
    }

    /// Grow the buffer to at least `new_size`, copying the live data into a
    /// fresh mapping. A no-op when the current capacity suffices. All
    /// pointers into the old mapping are invalidated.
    pub fn resize(&mut self, new_size: usize, pattern: Option<&str>) -> Result<()> {
        if self.cap >= new_size {
            return Ok(());
        }
        let mut new = Vrb::new(new_size, pattern)?;
        let len = self.data_len();
        unsafe {
            ptr::copy_nonoverlapping(self.data, new.space, len);
        }
        new.give(len).expect("fresh buffer is larger than the old one");
        std::mem::swap(self, &mut new);
        Ok(())
    }
}

impl Drop for Vrb {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem, self.mem_size);
        }
    }
}

impl std::fmt::Debug for Vrb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vrb")
            .field("capacity", &self.cap)
            .field("data_len", &self.data_len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_after_init() {
        let vrb = Vrb::new(1, None).unwrap();
        assert_eq!(vrb.data_len(), 0);
        assert_eq!(vrb.space_len(), vrb.capacity());
        assert!(vrb.capacity() >= *PAGE_SIZE);
    }

    #[test]
    fn give_take_round_trip() {
        let mut vrb = Vrb::new(1, None).unwrap();
        let cap = vrb.capacity();

        vrb.space_slice_mut()[..4].copy_from_slice(b"ping");
        vrb.give(4).unwrap();
        assert_eq!(vrb.data_len(), 4);
        assert_eq!(vrb.space_len(), cap - 4);
        assert_eq!(vrb.data_slice(), b"ping");

        vrb.take(4).unwrap();
        assert_eq!(vrb.data_len(), 0);
        assert_eq!(vrb.data_len() + vrb.space_len(), cap);
    }

    #[test]
    fn mirroring_across_the_boundary() {
        let mut vrb = Vrb::new(1, None).unwrap();
        let cap = vrb.capacity();

        // park the cursors eight bytes before the boundary
        vrb.space_slice_mut()[..cap - 8].iter_mut().for_each(|b| *b = b'a');
        vrb.give(cap - 8).unwrap();
        vrb.take(cap - 8).unwrap();
        assert_eq!(vrb.data_len(), 0);

        // this write crosses the mirror boundary
        vrb.space_slice_mut()[..16].copy_from_slice(b"0123456789abcdef");
        vrb.give(16).unwrap();
        assert_eq!(vrb.data_slice(), b"0123456789abcdef");

        // consuming past the boundary shifts both cursors down
        vrb.take(12).unwrap();
        assert_eq!(vrb.data_slice(), b"cdef");
        assert!(vrb.data_ptr() >= vrb.lower as *const u8);
        assert!(vrb.data_ptr() < vrb.upper as *const u8);
        assert_eq!(vrb.data_len() + vrb.space_len(), cap);
    }

    #[test]
    fn take_more_than_data_fails() {
        let mut vrb = Vrb::new(1, None).unwrap();
        assert!(vrb.take(1).is_err());
        vrb.give(8).unwrap();
        assert!(vrb.take(9).is_err());
    }

    #[test]
    fn give_more_than_space_fails() {
        let mut vrb = Vrb::new(1, None).unwrap();
        let cap = vrb.capacity();
        assert!(vrb.give(cap + 1).is_err());
        vrb.give(cap).unwrap();
        assert!(vrb.give(1).is_err());
    }

    #[test]
    fn reset_empties() {
        let mut vrb = Vrb::new(1, None).unwrap();
        vrb.give(100).unwrap();
        vrb.reset();
        assert_eq!(vrb.data_len(), 0);
    }

    #[test]
    fn resize_preserves_data() {
        let mut vrb = Vrb::new(1, None).unwrap();
        let old_cap = vrb.capacity();
        vrb.space_slice_mut()[..5].copy_from_slice(b"hello");
        vrb.give(5).unwrap();

        vrb.resize(old_cap * 4, None).unwrap();
        assert!(vrb.capacity() >= old_cap * 4);
        assert_eq!(vrb.data_slice(), b"hello");

        // shrinking requests are a no-op
        let cap = vrb.capacity();
        vrb.resize(1, None).unwrap();
        assert_eq!(vrb.capacity(), cap);
    }
}
