//! Cooperative input/output.
//!
//! Fiber-blocking wrappers around the usual fd syscalls. Each wrapper arms a
//! readiness watcher on the event loop, registers a destructor that stops it
//! on every exit path (including reclamation of the fiber mid-wait), waits,
//! then performs the syscall in a retry loop that absorbs `EINTR`.
//!
//! All functions expect the fd to be non-blocking; see [`fd_nonblock`].
//!
//! [`CoIOStream`] and [`CoIOListener`] wrap TCP sockets into
//! [`std::io::Read`]/[`std::io::Write`] adapters on top of these wrappers.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::ptr;
use std::time::Duration;

use libc::{c_int, c_void};

use crate::error::{Error, Result};
use crate::fiber::{DtorHandle, Event, Runtime, Watcher};
use crate::reactor::IoInterest;

/// Switch an fd into non-blocking mode.
pub fn fd_nonblock(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    Ok(())
}

/// An armed readiness watcher paired with the destructor that stops it.
struct IoWait {
    watcher: Watcher,
    dtor: DtorHandle,
}

impl IoWait {
    fn start(rt: &Runtime, fd: RawFd, interest: IoInterest) -> Result<IoWait> {
        let watcher = rt.io_watcher(fd, interest)?;
        let dtor = rt.add_destructor({
            let w = watcher.clone();
            move |_| w.stop()
        });
        Ok(IoWait { watcher, dtor })
    }

    fn wait(&self, rt: &Runtime) -> Result<()> {
        rt.wait_one(&Event::Watcher(&self.watcher))
    }

    fn finish(self, rt: &Runtime) {
        rt.remove_destructor(self.dtor, false);
        self.watcher.stop();
    }
}

/// Retry a syscall until it stops failing with `EINTR`.
fn retry_intr(mut f: impl FnMut() -> isize) -> io::Result<usize> {
    loop {
        let r = f();
        if r >= 0 {
            return Ok(r as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Read once from the fd, waiting for readability first. Returns the number
/// of bytes read, zero at end of stream.
pub fn read(rt: &Runtime, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let io = IoWait::start(rt, fd, IoInterest::READ)?;
    let res = io.wait(rt).and_then(|()| {
        retry_intr(|| unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) })
            .map_err(Error::System)
    });
    io.finish(rt);
    res
}

/// Read until `buf` is full or end of stream. Transient not-ready conditions
/// re-wait on the same watcher.
pub fn read_all(rt: &Runtime, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let io = IoWait::start(rt, fd, IoInterest::READ)?;
    let mut done = 0;
    let res = loop {
        if done == buf.len() {
            break Ok(done);
        }
        if let Err(e) = io.wait(rt) {
            break Err(e);
        }
        let eof = loop {
            let r = unsafe {
                libc::read(
                    fd,
                    buf[done..].as_mut_ptr() as *mut c_void,
                    buf.len() - done,
                )
            };
            if r < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => break false,
                    _ => return finish_err(rt, io, err),
                }
            }
            if r == 0 {
                break true;
            }
            done += r as usize;
            break false;
        };
        if eof {
            break Ok(done);
        }
    };
    io.finish(rt);
    res
}

fn finish_err<T>(rt: &Runtime, io: IoWait, err: io::Error) -> Result<T> {
    io.finish(rt);
    Err(Error::System(err))
}

/// Read a line, one byte at a time, until a newline, end of stream or
/// `buf.len() - 1` stored bytes. A terminating NUL is stored after the data;
/// the tail of an over-long line is consumed and discarded up to the
/// newline. Returns the number of stored data bytes (the NUL not included).
pub fn readline(rt: &Runtime, fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    if buf.is_empty() {
        return Err(Error::Invalid("readline needs a non-empty buffer"));
    }
    let mut total = 0;
    loop {
        let mut ch = [0u8; 1];
        let n = read(rt, fd, &mut ch)?;
        if n == 0 {
            if total == 0 {
                return Ok(0);
            }
            break;
        }
        if total < buf.len() - 1 {
            buf[total] = ch[0];
            total += 1;
        }
        if ch[0] == b'\n' {
            break;
        }
    }
    buf[total] = 0;
    Ok(total)
}

/// Write once to the fd, waiting for writability first.
pub fn write(rt: &Runtime, fd: RawFd, buf: &[u8]) -> Result<usize> {
    let io = IoWait::start(rt, fd, IoInterest::WRITE)?;
    let res = io.wait(rt).and_then(|()| {
        retry_intr(|| unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) })
            .map_err(Error::System)
    });
    io.finish(rt);
    res
}

/// Write the whole buffer, re-waiting on transient not-ready conditions.
pub fn write_all(rt: &Runtime, fd: RawFd, buf: &[u8]) -> Result<usize> {
    let io = IoWait::start(rt, fd, IoInterest::WRITE)?;
    let mut done = 0;
    let res = loop {
        if done == buf.len() {
            break Ok(done);
        }
        if let Err(e) = io.wait(rt) {
            break Err(e);
        }
        loop {
            let r = unsafe {
                libc::write(
                    fd,
                    buf[done..].as_ptr() as *const c_void,
                    buf.len() - done,
                )
            };
            if r < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => break,
                    _ => return finish_err(rt, io, err),
                }
            }
            done += r as usize;
            break;
        }
    };
    io.finish(rt);
    res
}

/// `recv(2)` after waiting for readability.
pub fn recv(rt: &Runtime, fd: RawFd, buf: &mut [u8], flags: c_int) -> Result<usize> {
    let io = IoWait::start(rt, fd, IoInterest::READ)?;
    let res = io.wait(rt).and_then(|()| {
        retry_intr(|| unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
        })
        .map_err(Error::System)
    });
    io.finish(rt);
    res
}

/// `recvfrom(2)` after waiting for readability. Also returns the peer
/// address when the protocol provides one.
pub fn recvfrom(
    rt: &Runtime,
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
) -> Result<(usize, Option<SocketAddr>)> {
    let io = IoWait::start(rt, fd, IoInterest::READ)?;
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = io.wait(rt).and_then(|()| {
        retry_intr(|| unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                flags,
                &mut ss as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        })
        .map_err(Error::System)
    });
    io.finish(rt);
    res.map(|n| (n, sockaddr_to_std(&ss)))
}

/// `send(2)` after waiting for writability.
pub fn send(rt: &Runtime, fd: RawFd, buf: &[u8], flags: c_int) -> Result<usize> {
    let io = IoWait::start(rt, fd, IoInterest::WRITE)?;
    let res = io.wait(rt).and_then(|()| {
        retry_intr(|| unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) })
            .map_err(Error::System)
    });
    io.finish(rt);
    res
}

/// `sendto(2)` after waiting for writability.
pub fn sendto(
    rt: &Runtime,
    fd: RawFd,
    buf: &[u8],
    flags: c_int,
    addr: &SocketAddr,
) -> Result<usize> {
    let (ss, len) = sockaddr_from_std(addr);
    let io = IoWait::start(rt, fd, IoInterest::WRITE)?;
    let res = io.wait(rt).and_then(|()| {
        retry_intr(|| unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                flags,
                &ss as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        })
        .map_err(Error::System)
    });
    io.finish(rt);
    res
}

/// Accept a connection, waiting for the listening socket to become readable.
/// Returns the raw connected fd (still blocking, see [`fd_nonblock`]) and
/// the peer address.
pub fn accept(rt: &Runtime, fd: RawFd) -> Result<(RawFd, Option<SocketAddr>)> {
    let io = IoWait::start(rt, fd, IoInterest::READ)?;
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let res = io.wait(rt).and_then(|()| {
        retry_intr(|| unsafe {
            libc::accept(
                fd,
                &mut ss as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            ) as isize
        })
        .map_err(Error::System)
    });
    io.finish(rt);
    res.map(|conn| (conn as RawFd, sockaddr_to_std(&ss)))
}

/// Connect a non-blocking socket: issue the syscall and, if it reports
/// in-progress, wait for writability and check `SO_ERROR`.
pub fn connect(rt: &Runtime, fd: RawFd, addr: &SocketAddr) -> Result<()> {
    let (ss, len) = sockaddr_from_std(addr);
    let r = unsafe {
        libc::connect(
            fd,
            &ss as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if r == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        return Err(Error::System(err));
    }

    let io = IoWait::start(rt, fd, IoInterest::WRITE)?;
    let res = io.wait(rt);
    io.finish(rt);
    res?;

    let mut so_error: c_int = 0;
    let mut optlen = mem::size_of::<c_int>() as libc::socklen_t;
    let r = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut c_int as *mut c_void,
            &mut optlen,
        )
    };
    if r < 0 {
        return Err(Error::System(io::Error::last_os_error()));
    }
    if so_error != 0 {
        return Err(Error::System(io::Error::from_raw_os_error(so_error)));
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Socket address conversion
////////////////////////////////////////////////////////////////////////////////

fn sockaddr_from_std(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut ss: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_be_bytes(v4.ip().octets()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin as *const libc::sockaddr_in as *const u8,
                    &mut ss as *mut libc::sockaddr_storage as *mut u8,
                    mem::size_of::<libc::sockaddr_in>(),
                );
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    &sin6 as *const libc::sockaddr_in6 as *const u8,
                    &mut ss as *mut libc::sockaddr_storage as *mut u8,
                    mem::size_of::<libc::sockaddr_in6>(),
                );
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (ss, len as libc::socklen_t)
}

fn sockaddr_to_std(ss: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match ss.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(ss as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(ss as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIOStream
////////////////////////////////////////////////////////////////////////////////

/// A connected socket driven through the fiber I/O wrappers.
pub struct CoIOStream {
    rt: Runtime,
    fd: RawFd,
}

impl CoIOStream {
    /// Take ownership of an fd-like object and switch it to non-blocking.
    pub fn new<T>(rt: &Runtime, inner: T) -> Result<CoIOStream>
    where
        T: IntoRawFd,
    {
        let fd = inner.into_raw_fd();
        fd_nonblock(fd)?;
        Ok(CoIOStream { rt: rt.clone(), fd })
    }

    /// Open a TCP connection; suspends the fiber until it is established.
    pub fn connect<A: ToSocketAddrs>(rt: &Runtime, addr: A) -> Result<CoIOStream> {
        let mut last_err = Error::Invalid("no socket addresses to connect to");
        for addr in addr.to_socket_addrs().map_err(Error::System)? {
            let family = match addr {
                SocketAddr::V4(_) => libc::AF_INET,
                SocketAddr::V6(_) => libc::AF_INET6,
            };
            let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
            if fd < 0 {
                return Err(Error::System(io::Error::last_os_error()));
            }
            match fd_nonblock(fd).and_then(|()| connect(rt, fd, &addr)) {
                Ok(()) => return Ok(CoIOStream { rt: rt.clone(), fd }),
                Err(e) => {
                    unsafe { libc::close(fd) };
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        read(&self.rt, self.fd, buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        write(&self.rt, self.fd, buf)
    }
}

impl AsRawFd for CoIOStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for CoIOStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl io::Read for CoIOStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        CoIOStream::read(self, buf).map_err(into_io_error)
    }
}

impl io::Write for CoIOStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        CoIOStream::write(self, buf).map_err(into_io_error)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for CoIOStream {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

fn into_io_error(e: Error) -> io::Error {
    match e {
        Error::System(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoIOListener
////////////////////////////////////////////////////////////////////////////////

/// A TCP listener whose `accept` suspends the fiber instead of blocking the
/// thread.
pub struct CoIOListener {
    rt: Runtime,
    inner: TcpListener,
}

impl CoIOListener {
    pub fn bind<A: ToSocketAddrs>(rt: &Runtime, addr: A) -> Result<CoIOListener> {
        let inner = TcpListener::bind(addr).map_err(Error::System)?;
        inner.set_nonblocking(true).map_err(Error::System)?;
        Ok(CoIOListener {
            rt: rt.clone(),
            inner,
        })
    }

    pub fn from_std(rt: &Runtime, inner: TcpListener) -> Result<CoIOListener> {
        inner.set_nonblocking(true).map_err(Error::System)?;
        Ok(CoIOListener {
            rt: rt.clone(),
            inner,
        })
    }

    /// Accept a new incoming connection from this listener.
    pub fn accept(&self) -> Result<CoIOStream> {
        let (fd, _peer) = accept(&self.rt, self.inner.as_raw_fd())?;
        fd_nonblock(fd)?;
        Ok(CoIOStream {
            rt: self.rt.clone(),
            fd,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Error::System)
    }

    pub fn inner_listener(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

/// Sleep primitive re-exported next to its I/O siblings.
///
/// Equivalent to [`Runtime::sleep`].
pub fn sleep(rt: &Runtime, duration: Duration) -> Duration {
    rt.sleep(duration)
}
