//! Per-fd metadata registry.
//!
//! The cooperative IO layer consults this registry on every operation: is
//! the fd a socket (only sockets are parked on the reactor), did the *user*
//! ask for nonblocking mode (then the runtime stays out of the way), has it
//! been closed, and what send/receive timeouts apply.
//!
//! Entries are created lazily. First registration `fstat`s the fd; sockets
//! get `O_NONBLOCK` forced on (recorded as *sys nonblock* so the user-visible
//! flags can keep pretending otherwise) and their timeouts seeded from
//! `SO_SNDTIMEO`/`SO_RCVTIMEO`.

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::clock::TIMEOUT_INFINITE;

/// Cached metadata of one file descriptor.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    // The runtime forced O_NONBLOCK on this fd.
    sys_nonblock: AtomicBool,
    // The user asked for nonblocking behavior themselves.
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    // Milliseconds; TIMEOUT_INFINITE when unset.
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        let is_socket = unsafe { libc::fstat(fd, stat.as_mut_ptr()) } == 0
            && unsafe { stat.assume_init() }.st_mode & libc::S_IFMT == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        let mut recv_timeout = TIMEOUT_INFINITE;
        let mut send_timeout = TIMEOUT_INFINITE;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
            recv_timeout = sockopt_timeout(fd, libc::SO_RCVTIMEO);
            send_timeout = sockopt_timeout(fd, libc::SO_SNDTIMEO);
        }

        FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(recv_timeout),
            send_timeout: AtomicU64::new(send_timeout),
        }
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline(always)]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub(crate) fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    /// Receive timeout in ms, [`TIMEOUT_INFINITE`] when unset.
    #[inline(always)]
    pub fn recv_timeout(&self) -> u64 {
        self.recv_timeout.load(Ordering::Acquire)
    }

    /// Send timeout in ms, [`TIMEOUT_INFINITE`] when unset.
    #[inline(always)]
    pub fn send_timeout(&self) -> u64 {
        self.send_timeout.load(Ordering::Acquire)
    }

    pub(crate) fn set_recv_timeout(&self, ms: u64) {
        self.recv_timeout.store(ms, Ordering::Release);
    }

    pub(crate) fn set_send_timeout(&self, ms: u64) {
        self.send_timeout.store(ms, Ordering::Release);
    }
}

fn sockopt_timeout(fd: RawFd, opt: libc::c_int) -> u64 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let mut len = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &mut tv as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rt != 0 || (tv.tv_sec == 0 && tv.tv_usec == 0) {
        return TIMEOUT_INFINITE;
    }
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

/// Registry of [`FdCtx`] entries indexed by raw fd.
pub struct FdManager {
    datas: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            datas: RwLock::new(Vec::new()),
        }
    }

    /// Fetch the entry for `fd`; with `auto_create` a missing entry is built
    /// on the spot. Negative fds never have entries.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let datas = self.datas.read().expect("fd registry poisoned");
            match datas.get(idx) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                _ if !auto_create => return None,
                _ => {}
            }
        }

        let mut datas = self.datas.write().expect("fd registry poisoned");
        if datas.len() <= idx {
            let grown = std::cmp::max(idx + 1, datas.len() * 3 / 2);
            datas.resize_with(grown, || None);
        }
        if datas[idx].is_none() {
            datas[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        datas[idx].clone()
    }

    /// Drop the entry for `fd` (on close; the integer may be reused by the
    /// kernel immediately after).
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut datas = self.datas.write().expect("fd registry poisoned");
        if let Some(slot) = datas.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

static FD_MANAGER: Lazy<FdManager> = Lazy::new(FdManager::new);

/// The process-wide fd registry.
pub fn fd_manager() -> &'static FdManager {
    &FD_MANAGER
}
