//! Cooperative, fiber-friendly syscall wrappers (component G).
//!
//! Two shapes, per spec 4.E:
//! - the read family (`co_read`, `co_readv`, `co_recv`, `co_recvfrom`,
//!   `co_recvmsg`) suspends until the fd is readable, then calls the
//!   syscall exactly once and returns whatever it returns, verbatim;
//! - the write family (`co_write`, `co_writev`, `co_send`, `co_sendto`,
//!   `co_sendmsg`) loops: call the syscall, and only suspend-and-retry on
//!   `EAGAIN`/`EWOULDBLOCK` (a short or even zero write is not an error).
//!
//! `co_accept`/`co_connect` wait for the right readiness event first;
//! `co_connect` additionally checks `SO_ERROR` after the fd becomes
//! writable, since a failed non-blocking connect is only observable that
//! way. `co_poll` is the single-fd poll-equivalent spec 4.E asks for.

use std::ffi::c_void;
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::error::Result;
use crate::io as fiber_io;
use crate::scheduler;

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK)
    )
}

/// Suspends until `fd` is readable, then calls `read(2)` exactly once.
pub fn co_read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    fiber_io::wait_readable(fd).map_err(to_io_error)?;
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Suspends until `fd` is readable, then calls `readv(2)` exactly once.
pub fn co_readv(fd: RawFd, iov: &mut [libc::iovec]) -> io::Result<usize> {
    fiber_io::wait_readable(fd).map_err(to_io_error)?;
    let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as i32) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Suspends until `fd` is readable, then calls `recv(2)` exactly once.
pub fn co_recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    fiber_io::wait_readable(fd).map_err(to_io_error)?;
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Suspends until `fd` is readable, then calls `recvfrom(2)` exactly once.
pub fn co_recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
) -> io::Result<(usize, Option<SocketAddr>)> {
    fiber_io::wait_readable(fd).map_err(to_io_error)?;
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((n as usize, sockaddr_storage_to_socket_addr(&storage)))
}

/// Suspends until `fd` is readable, then calls `recvmsg(2)` exactly once.
pub fn co_recvmsg(fd: RawFd, msg: &mut libc::msghdr, flags: i32) -> io::Result<usize> {
    fiber_io::wait_readable(fd).map_err(to_io_error)?;
    let n = unsafe { libc::recvmsg(fd, msg, flags) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Writes the whole buffer via `write(2)`, suspending on `fd` writability
/// between short writes and on `EAGAIN`.
pub fn co_write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        let n = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr() as *const c_void,
                buf.len() - written,
            )
        };
        if n >= 0 {
            written += n as usize;
            continue;
        }
        let err = io::Error::last_os_error();
        if !would_block(&err) {
            return Err(err);
        }
        fiber_io::wait_writable(fd).map_err(to_io_error)?;
    }
    Ok(written)
}

/// Like [`co_write`] but for `writev(2)`; retries the whole vector on
/// `EAGAIN` (no partial-iovec bookkeeping — callers needing that should
/// shrink the vector themselves between calls).
pub fn co_writev(fd: RawFd, iov: &[libc::iovec]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as i32) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if !would_block(&err) {
            return Err(err);
        }
        fiber_io::wait_writable(fd).map_err(to_io_error)?;
    }
}

/// Calls `send(2)` once readiness allows, retrying on `EAGAIN`.
pub fn co_send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if !would_block(&err) {
            return Err(err);
        }
        fiber_io::wait_writable(fd).map_err(to_io_error)?;
    }
}

/// Calls `sendto(2)` once readiness allows, retrying on `EAGAIN`.
pub fn co_sendto(fd: RawFd, buf: &[u8], flags: i32, addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = socket_addr_to_sockaddr_storage(addr);
    loop {
        let n = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const c_void,
                buf.len(),
                flags,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if !would_block(&err) {
            return Err(err);
        }
        fiber_io::wait_writable(fd).map_err(to_io_error)?;
    }
}

/// Calls `sendmsg(2)` once readiness allows, retrying on `EAGAIN`.
pub fn co_sendmsg(fd: RawFd, msg: &libc::msghdr, flags: i32) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::sendmsg(fd, msg, flags) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if !would_block(&err) {
            return Err(err);
        }
        fiber_io::wait_writable(fd).map_err(to_io_error)?;
    }
}

/// Waits for a new connection and returns the accepted, non-blocking
/// socket.
pub fn co_accept(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(true)?;
                return Ok((stream, addr));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                fiber_io::wait_readable(listener.as_raw_fd()).map_err(to_io_error)?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connects to `addr` without blocking the OS thread: waits for the
/// connecting socket to become writable, then inspects `SO_ERROR` since
/// that's the only way a failed non-blocking `connect(2)` surfaces.
pub fn co_connect<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
    let addr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no addresses to try"))?;
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fd)?;

    let (storage, len) = socket_addr_to_sockaddr_storage(&addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok(unsafe { TcpStream::from_raw_fd(fd) });
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::EINPROGRESS) {
        unsafe { libc::close(fd) };
        return Err(err);
    }

    fiber_io::wait_writable(fd).map_err(to_io_error)?;

    let mut sockerr: libc::c_int = 0;
    let mut sockerr_len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut sockerr as *mut _ as *mut c_void,
            &mut sockerr_len,
        )
    };
    if rc != 0 {
        unsafe { libc::close(fd) };
        return Err(io::Error::last_os_error());
    }
    if sockerr != 0 {
        unsafe { libc::close(fd) };
        return Err(io::Error::from_raw_os_error(sockerr));
    }
    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

/// Waits for `fd` to become ready for the directions set in `interest` (a
/// `libc::POLLIN`/`POLLOUT` bitmask), or for `timeout` to elapse, and
/// returns the `revents` a plain `poll(2)` would have reported. A timeout
/// races a timer-list entry against the reactor registration, the same
/// pattern the fiber mutex (component I) uses for its own timeout.
pub fn co_poll(fd: RawFd, interest: i16, timeout: Option<Duration>) -> Result<i16> {
    let me = scheduler::with_current(|s| s.current())?
        .expect("co_poll called outside a fiber");

    scheduler::with_current(|s| -> Result<()> {
        s.ensure_io_started()?;
        if interest & libc::POLLIN != 0 {
            s.io_mut().reactor_mut().wait_readable(fd, me)?;
        }
        if interest & libc::POLLOUT != 0 {
            s.io_mut().reactor_mut().wait_writable(fd, me)?;
        }
        Ok(())
    })??;

    if let Some(d) = timeout {
        fiber_io::register_timeout(me, d)?;
    }
    scheduler::with_current(|s| s.fiber_switch())?;
    if timeout.is_some() {
        fiber_io::cancel_timeout(me);
    }
    // Either the reactor or the timer woke us; a fiber never knows which,
    // so settle it with a non-blocking poll(2) and drop any leftover
    // registration for the direction that didn't fire.
    scheduler::try_with_current(|s| s.io_mut().reactor_mut().cancel(fd));
    let mut pfd = libc::pollfd {
        fd,
        events: interest,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(pfd.revents)
}

fn to_io_error(e: crate::error::Error) -> io::Error {
    match e {
        crate::error::Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

fn sockaddr_storage_to_socket_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            let addr: libc::sockaddr_in =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = std::net::Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
        }
        libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 =
                unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = std::net::Ipv6Addr::from(addr.sin6_addr.s6_addr);
            Some(SocketAddr::new(ip.into(), u16::from_be(addr.sin6_port)))
        }
        _ => None,
    }
}

fn socket_addr_to_sockaddr_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t
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
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t
        }
    };
    (storage, len)
}

/// A non-blocking TCP stream whose reads and writes suspend the calling
/// fiber instead of blocking the OS thread.
pub struct CoIoStream {
    inner: TcpStream,
}

impl CoIoStream {
    pub fn new(inner: TcpStream) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(CoIoStream { inner })
    }

    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(CoIoStream {
            inner: co_connect(addr)?,
        })
    }
}

impl io::Read for CoIoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        co_read(self.inner.as_raw_fd(), buf)
    }
}

impl io::Write for CoIoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        co_write(self.inner.as_raw_fd(), buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoIoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// A non-blocking TCP listener whose `accept` suspends the calling fiber.
pub struct CoIoListener {
    inner: TcpListener,
}

impl CoIoListener {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(CoIoListener { inner })
    }

    pub fn accept(&self) -> io::Result<(CoIoStream, SocketAddr)> {
        let (stream, addr) = co_accept(&self.inner)?;
        Ok((CoIoStream { inner: stream }, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsRawFd for CoIoListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
