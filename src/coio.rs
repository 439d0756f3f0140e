//! Cooperative input/output.
//!
//! Rust cannot interpose libc symbols, so the hooked syscall surface lives
//! here as explicit runtime APIs: call [`coio::read`](read) instead of
//! `read(2)`, [`coio::sleep`](sleep) instead of `sleep(3)`, and so on. On a
//! reactor worker these park the current fiber instead of blocking the
//! thread; anywhere else (or on fds the user made nonblocking themselves)
//! they behave exactly like the plain syscall.
//!
//! Every operation follows the same *do-io* discipline:
//!
//! 1. pass through unless hooks are on, the fd is a known socket and the
//!    user did not request nonblocking mode;
//! 2. try the real syscall, retrying on `EINTR`;
//! 3. on `EAGAIN`, arm a conditional timeout timer (from the fd's
//!    `SO_RCVTIMEO`/`SO_SNDTIMEO` bookkeeping), register interest with the
//!    reactor and yield;
//! 4. on wake, surface `ETIMEDOUT` if the timer fired, otherwise retry.
//!
//! [`CoStream`] and [`CoListener`] wrap connected sockets and listeners on
//! top of this surface, including `Read`/`Write` impls.

use std::cell::Cell;
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::clock::TIMEOUT_INFINITE;
use crate::config::{self, ConfigVar};
use crate::fd::{fd_manager, FdCtx};
use crate::fiber;
use crate::io::{Event, IoManager};

static CONNECT_TIMEOUT: Lazy<ConfigVar<u64>> = Lazy::new(|| {
    config::lookup("tcp.connect.timeout", 5000, "tcp connect timeout in ms")
        .expect("tcp.connect.timeout registration cannot fail")
});

thread_local! {
    // Workers of an IoManager run with hooks on; everything else sees plain
    // blocking behavior.
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether cooperative IO is active on this thread.
#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

/// Toggle cooperative IO for this thread. Reactor workers set this on entry.
pub fn set_hook_enabled(enabled: bool) {
    HOOK_ENABLED.with(|h| h.set(enabled));
}

// Per-wait shared marker; the timeout timer strengthens a weak reference to
// it, so a wait that already returned turns the timer into a no-op.
#[derive(Default)]
struct IoCond {
    cancelled: AtomicI32,
}

#[inline]
fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Run `syscall` to completion, retrying on `EINTR`; the blocking fallback
/// of every hooked operation.
fn retry_eintr<F>(mut syscall: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
{
    loop {
        let n = syscall();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

/// The do-io pattern: try, park on `event`, retry; see module docs.
fn do_io<F, T>(fd: RawFd, event: Event, timeout_of: T, mut syscall: F) -> io::Result<usize>
where
    F: FnMut() -> libc::ssize_t,
    T: Fn(&FdCtx) -> u64,
{
    if !is_hook_enabled() {
        return retry_eintr(syscall);
    }
    let io = match IoManager::current() {
        Some(io) => io,
        None => return retry_eintr(syscall),
    };
    let ctx = match fd_manager().get(fd, false) {
        Some(ctx) => ctx,
        None => return retry_eintr(syscall),
    };
    if ctx.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return retry_eintr(syscall);
    }

    let timeout = timeout_of(&ctx);
    loop {
        let n = syscall();
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            libc::EINTR => continue,
            libc::EAGAIN => {}
            _ => return Err(io::Error::last_os_error()),
        }

        let cond = Arc::new(IoCond::default());
        let timer = if timeout != TIMEOUT_INFINITE {
            let weak_cond = Arc::downgrade(&cond);
            let weak_io = Arc::downgrade(&io);
            Some(io.add_conditional_timer(
                timeout,
                move || {
                    let (cond, io) = match (weak_cond.upgrade(), weak_io.upgrade()) {
                        (Some(cond), Some(io)) => (cond, io),
                        _ => return,
                    };
                    if cond.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    cond.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    io.cancel_event(fd, event);
                },
                &cond,
                false,
            ))
        } else {
            None
        };

        if let Err(e) = io.add_event(fd, event, None) {
            log::error!("do_io add_event failed fd={} event={:?}: {}", fd, event, e);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return Err(e);
        }

        fiber::yield_to_hold();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = cond.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            return Err(io::Error::from_raw_os_error(cancelled));
        }
        // Woken by the fd: take it from the top.
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sleeps
////////////////////////////////////////////////////////////////////////////////

/// Put the current fiber to sleep for at least `dur`, without blocking its
/// worker thread. Outside the runtime this is `std::thread::sleep`.
pub fn sleep(dur: Duration) {
    sleep_ms(dur.as_millis() as u64)
}

/// [`sleep`] with a millisecond count.
pub fn sleep_ms(ms: u64) {
    let io = match IoManager::current() {
        Some(io) if is_hook_enabled() => io,
        _ => return std::thread::sleep(Duration::from_millis(ms)),
    };
    let cur = fiber::this_fiber();
    let weak_io = Arc::downgrade(&io);
    io.add_timer(
        ms,
        move || {
            if let Some(io) = weak_io.upgrade() {
                io.schedule_fiber(cur.clone());
            }
        },
        false,
    );
    fiber::yield_to_hold();
}

/// [`sleep`] with a microsecond count (rounded down to milliseconds).
pub fn usleep(us: u64) {
    sleep_ms(us / 1000)
}

////////////////////////////////////////////////////////////////////////////////
// Socket lifecycle
////////////////////////////////////////////////////////////////////////////////

/// `socket(2)`, with the result registered in the fd registry (which also
/// forces it nonblocking under the covers).
pub fn socket(domain: i32, ty: i32, protocol: i32) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if is_hook_enabled() {
        fd_manager().get(fd, true);
    }
    Ok(fd)
}

/// `close(2)`: cancels any parked waiters, drops the registry entry, then
/// closes the fd.
///
/// The registry entry goes away no matter which thread closes - the kernel
/// may hand the integer right back, and a fresh socket must not inherit
/// stale bookkeeping.
pub fn close(fd: RawFd) -> io::Result<()> {
    if let Some(ctx) = fd_manager().get(fd, false) {
        ctx.set_closed();
        if let Some(io) = IoManager::current() {
            io.cancel_all(fd);
        }
        fd_manager().del(fd);
    }
    let rt = unsafe { libc::close(fd) };
    if rt != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `connect(2)` with the configured `tcp.connect.timeout`.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, CONNECT_TIMEOUT.value())
}

/// `connect(2)` bounded by `timeout_ms` ([`TIMEOUT_INFINITE`] waits
/// forever). A timed-out attempt reports `ETIMEDOUT` without consulting
/// `SO_ERROR`.
pub fn connect_with_timeout(fd: RawFd, addr: &SocketAddr, timeout_ms: u64) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let raw_connect =
        || unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };

    let hooked = is_hook_enabled()
        && fd_manager()
            .get(fd, false)
            .map_or(false, |ctx| {
                !ctx.is_closed() && ctx.is_socket() && !ctx.user_nonblock()
            });
    if !hooked {
        let rt = raw_connect();
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }
    let io = match IoManager::current() {
        Some(io) => io,
        None => {
            let rt = raw_connect();
            if rt != 0 {
                return Err(io::Error::last_os_error());
            }
            return Ok(());
        }
    };

    let rt = raw_connect();
    if rt == 0 {
        return Ok(());
    }
    if errno() != libc::EINPROGRESS {
        return Err(io::Error::last_os_error());
    }

    let cond = Arc::new(IoCond::default());
    let timer = if timeout_ms != TIMEOUT_INFINITE {
        let weak_cond = Arc::downgrade(&cond);
        let weak_io = Arc::downgrade(&io);
        Some(io.add_conditional_timer(
            timeout_ms,
            move || {
                let (cond, io) = match (weak_cond.upgrade(), weak_io.upgrade()) {
                    (Some(cond), Some(io)) => (cond, io),
                    _ => return,
                };
                if cond.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                cond.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                io.cancel_event(fd, Event::WRITE);
            },
            &cond,
            false,
        ))
    } else {
        None
    };

    io.add_event(fd, Event::WRITE, None)?;
    fiber::yield_to_hold();

    if let Some(timer) = &timer {
        timer.cancel();
    }
    if cond.cancelled.load(Ordering::Acquire) != 0 {
        // The timeout fired; SO_ERROR is not meaningful on this path.
        return Err(io::Error::from_raw_os_error(
            cond.cancelled.load(Ordering::Acquire),
        ));
    }

    let mut so_error: libc::c_int = 0;
    let mut so_len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut libc::c_void,
            &mut so_len,
        )
    };
    if rt != 0 {
        return Err(io::Error::last_os_error());
    }
    if so_error != 0 {
        return Err(io::Error::from_raw_os_error(so_error));
    }
    Ok(())
}

/// `accept(2)`; the accepted fd is registered in the fd registry. Honors the
/// listener's receive timeout.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let accepted = do_io(fd, Event::READ, FdCtx::recv_timeout, || unsafe {
        libc::accept(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ) as libc::ssize_t
    })? as RawFd;

    if is_hook_enabled() {
        fd_manager().get(accepted, true);
    }
    let addr = sockaddr_to(&storage).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "accepted non-inet address")
    })?;
    Ok((accepted, addr))
}

////////////////////////////////////////////////////////////////////////////////
// Read family
////////////////////////////////////////////////////////////////////////////////

/// `read(2)`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, Event::READ, FdCtx::recv_timeout, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

/// `readv(2)`.
pub fn readv(fd: RawFd, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, Event::READ, FdCtx::recv_timeout, || unsafe {
        libc::readv(
            fd,
            bufs.as_mut_ptr() as *mut libc::iovec,
            bufs.len() as libc::c_int,
        )
    })
}

/// `recv(2)`.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> io::Result<usize> {
    do_io(fd, Event::READ, FdCtx::recv_timeout, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

/// `recvfrom(2)`. Raw-pointer variant kept libc-shaped.
///
/// # Safety
/// `addr`/`addrlen` must be null or valid for the kernel to fill in.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> io::Result<usize> {
    do_io(fd, Event::READ, FdCtx::recv_timeout, || {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

/// `recvmsg(2)`. Raw-pointer variant kept libc-shaped.
///
/// # Safety
/// `msg` must point to a valid, initialized `msghdr`.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> io::Result<usize> {
    do_io(fd, Event::READ, FdCtx::recv_timeout, || {
        libc::recvmsg(fd, msg, flags)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Write family
////////////////////////////////////////////////////////////////////////////////

/// `write(2)`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, Event::WRITE, FdCtx::send_timeout, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

/// `writev(2)`.
pub fn writev(fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, Event::WRITE, FdCtx::send_timeout, || unsafe {
        libc::writev(
            fd,
            bufs.as_ptr() as *const libc::iovec,
            bufs.len() as libc::c_int,
        )
    })
}

/// `send(2)`.
pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> io::Result<usize> {
    do_io(fd, Event::WRITE, FdCtx::send_timeout, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

/// `sendto(2)`. Raw-pointer variant kept libc-shaped.
///
/// # Safety
/// `addr` must be null or point to `addrlen` valid bytes of address.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> io::Result<usize> {
    do_io(fd, Event::WRITE, FdCtx::send_timeout, || {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            flags,
            addr,
            addrlen,
        )
    })
}

/// `sendmsg(2)`. Raw-pointer variant kept libc-shaped.
///
/// # Safety
/// `msg` must point to a valid, initialized `msghdr`.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> io::Result<usize> {
    do_io(fd, Event::WRITE, FdCtx::send_timeout, || {
        libc::sendmsg(fd, msg, flags)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Fd options
////////////////////////////////////////////////////////////////////////////////

/// The `F_SETFL`/`FIONBIO` discipline: record the *user's* nonblocking
/// intent in the registry; the kernel flag additionally stays forced on for
/// runtime-managed sockets.
pub fn set_nonblocking(fd: RawFd, on: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if let Some(ctx) = fd_manager().get(fd, false) {
        if ctx.is_socket() && !ctx.is_closed() {
            ctx.set_user_nonblock(on);
            if ctx.sys_nonblock() {
                flags |= libc::O_NONBLOCK;
            }
        }
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The `F_GETFL` discipline: for runtime-managed sockets this reflects the
/// user's intent, not the forced kernel flag.
pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if let Some(ctx) = fd_manager().get(fd, false) {
        if ctx.is_socket() && !ctx.is_closed() {
            return Ok(ctx.user_nonblock());
        }
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// The `SO_RCVTIMEO` discipline: remember the timeout in ms for the do-io
/// path and forward it to the kernel.
pub fn set_recv_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    set_timeout(fd, libc::SO_RCVTIMEO, timeout)
}

/// The `SO_SNDTIMEO` discipline, see [`set_recv_timeout`].
pub fn set_send_timeout(fd: RawFd, timeout: Option<Duration>) -> io::Result<()> {
    set_timeout(fd, libc::SO_SNDTIMEO, timeout)
}

fn set_timeout(fd: RawFd, opt: libc::c_int, timeout: Option<Duration>) -> io::Result<()> {
    let ms = timeout.map_or(TIMEOUT_INFINITE, |d| d.as_millis() as u64);
    if let Some(ctx) = fd_manager().get(fd, false) {
        if opt == libc::SO_RCVTIMEO {
            ctx.set_recv_timeout(ms);
        } else {
            ctx.set_send_timeout(ms);
        }
    }
    let tv = libc::timeval {
        tv_sec: timeout.map_or(0, |d| d.as_secs()) as libc::time_t,
        tv_usec: timeout.map_or(0, |d| d.subsec_micros()) as libc::suseconds_t,
    };
    let rt = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if rt != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Address plumbing
////////////////////////////////////////////////////////////////////////////////

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            std::mem::size_of::<libc::sockaddr_in>()
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
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            Some(SocketAddr::from((
                u32::from_be(sin.sin_addr.s_addr).to_be_bytes(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::from((
                sin6.sin6_addr.s6_addr,
                u16::from_be(sin6.sin6_port),
            )))
        }
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoStream
////////////////////////////////////////////////////////////////////////////////

/// A connected TCP socket doing cooperative IO.
pub struct CoStream {
    fd: RawFd,
}

impl CoStream {
    /// Take ownership of an fd-like object and register it with the runtime
    /// (which forces it nonblocking).
    pub fn new<T: IntoRawFd>(inner: T) -> io::Result<CoStream> {
        let fd = inner.into_raw_fd();
        fd_manager().get(fd, true);
        Ok(CoStream { fd })
    }

    /// Connect to the first resolvable address, with the configured
    /// `tcp.connect.timeout` per attempt.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<CoStream> {
        Self::connect_ms(addr, CONNECT_TIMEOUT.value())
    }

    /// Connect with an explicit per-attempt timeout.
    pub fn connect_timeout<A: ToSocketAddrs>(addr: A, timeout: Duration) -> io::Result<CoStream> {
        Self::connect_ms(addr, timeout.as_millis() as u64)
    }

    fn connect_ms<A: ToSocketAddrs>(addr: A, timeout_ms: u64) -> io::Result<CoStream> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            let domain = match addr {
                SocketAddr::V4(_) => libc::AF_INET,
                SocketAddr::V6(_) => libc::AF_INET6,
            };
            let fd = socket(domain, libc::SOCK_STREAM, 0)?;
            match connect_with_timeout(fd, &addr, timeout_ms) {
                Ok(()) => {
                    // Register even when built outside a worker; cooperative
                    // use later relies on the forced-nonblock entry.
                    fd_manager().get(fd, true);
                    return Ok(CoStream { fd });
                }
                Err(e) => {
                    let _ = close(fd);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address to connect to")
        }))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rt = unsafe {
            libc::getpeername(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet peer"))
    }

    /// Set the receive timeout used by cooperative reads.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_recv_timeout(self.fd, timeout)
    }

    /// Set the send timeout used by cooperative writes.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        set_send_timeout(self.fd, timeout)
    }

    /// Write the whole buffer, surfacing partial-write progress as a loop.
    pub fn write_all(&mut self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = write(self.fd, buf)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

impl io::Read for CoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read(self.fd, buf)
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        readv(self.fd, bufs)
    }
}

impl io::Write for CoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write(self.fd, buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        writev(self.fd, bufs)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl std::os::unix::io::FromRawFd for CoStream {
    /// Wrap an fd already registered with the runtime (e.g. one returned by
    /// [`accept`]).
    unsafe fn from_raw_fd(fd: RawFd) -> CoStream {
        CoStream { fd }
    }
}

impl IntoRawFd for CoStream {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for CoStream {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

impl std::fmt::Debug for CoStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("CoStream");
        d.field("fd", &self.fd);
        if let Ok(peer) = self.peer_addr() {
            d.field("peer", &peer);
        }
        d.finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// CoListener
////////////////////////////////////////////////////////////////////////////////

/// A bound TCP listener doing cooperative accepts.
pub struct CoListener {
    fd: RawFd,
}

impl CoListener {
    /// Bind (with `SO_REUSEADDR`) and listen on the first resolvable
    /// address.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<CoListener> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match Self::bind_one(&addr) {
                Ok(listener) => return Ok(listener),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address to bind to")
        }))
    }

    fn bind_one(addr: &SocketAddr) -> io::Result<CoListener> {
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = socket(domain, libc::SOCK_STREAM, 0)?;
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let (storage, len) = sockaddr_from(addr);
        let rt =
            unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            let _ = close(fd);
            return Err(err);
        }
        let rt = unsafe { libc::listen(fd, libc::SOMAXCONN) };
        if rt != 0 {
            let err = io::Error::last_os_error();
            let _ = close(fd);
            return Err(err);
        }
        // Listeners are usually bound before the reactor's workers exist;
        // register here so a worker's accept parks instead of blocking.
        fd_manager().get(fd, true);
        Ok(CoListener { fd })
    }

    /// Accept one connection, yielding the fiber until a client arrives.
    pub fn accept(&self) -> io::Result<(CoStream, SocketAddr)> {
        let (fd, addr) = accept(self.fd)?;
        Ok((CoStream { fd }, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rt = unsafe {
            libc::getsockname(
                self.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rt != 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-inet listener"))
    }
}

impl AsRawFd for CoListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CoListener {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

impl std::fmt::Debug for CoListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoListener").field("fd", &self.fd).finish()
    }
}
