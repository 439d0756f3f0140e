//! TCP accept/serve shell.
//!
//! A [`TcpServer`] binds one or more addresses on an [`IoManager`], runs one
//! accept fiber per listener and hands every accepted connection to a
//! [`TcpHandler`] scheduled as its own fiber. [`stop`](TcpServer::stop)
//! closes the listeners, which wakes the parked accept fibers through the
//! close-cancels-waiters path of the cooperative IO layer.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::coio::{self, CoListener, CoStream};
use crate::config::{self, ConfigVar};
use crate::io::IoManager;

static READ_TIMEOUT: Lazy<ConfigVar<u64>> = Lazy::new(|| {
    config::lookup(
        "tcp_server.read_timeout",
        2 * 60 * 1000,
        "tcp server client read timeout in ms",
    )
    .expect("tcp_server.read_timeout registration cannot fail")
});

/// Per-connection behavior of a [`TcpServer`].
pub trait TcpHandler: Send + Sync + 'static {
    /// Runs in its own fiber; the connection closes when it returns.
    fn handle_client(&self, client: CoStream);
}

impl<F> TcpHandler for F
where
    F: Fn(CoStream) + Send + Sync + 'static,
{
    fn handle_client(&self, client: CoStream) {
        self(client)
    }
}

/// Multi-listener TCP server over an [`IoManager`].
pub struct TcpServer {
    io: Arc<IoManager>,
    handler: Arc<dyn TcpHandler>,
    name: String,
    listeners: Mutex<Vec<CoListener>>,
    stopped: AtomicBool,
    // Self-handle for the accept fibers.
    me: Weak<TcpServer>,
}

impl TcpServer {
    pub fn new<H: TcpHandler>(io: &Arc<IoManager>, handler: H) -> Arc<TcpServer> {
        Self::with_name(io, handler, "tcp")
    }

    pub fn with_name<H: TcpHandler>(
        io: &Arc<IoManager>,
        handler: H,
        name: &str,
    ) -> Arc<TcpServer> {
        Arc::new_cyclic(|me: &Weak<TcpServer>| TcpServer {
            io: io.clone(),
            handler: Arc::new(handler),
            name: name.to_owned(),
            listeners: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind and listen; returns the actual local address (useful with port
    /// 0). Call once per address before [`start`](Self::start).
    pub fn bind<A: ToSocketAddrs>(&self, addr: A) -> io::Result<SocketAddr> {
        let listener = CoListener::bind(addr)?;
        let local = listener.local_addr()?;
        log::info!("{}: listening on {}", self.name, local);
        self.listeners
            .lock()
            .expect("listener set poisoned")
            .push(listener);
        Ok(local)
    }

    /// Launch one accept fiber per bound listener.
    pub fn start(&self) {
        let listeners = self.listeners.lock().expect("listener set poisoned");
        assert!(!listeners.is_empty(), "start() before bind()");
        for listener in listeners.iter() {
            let fd = listener.as_raw_fd();
            let server = self.me.upgrade().expect("server outlived its own handle");
            self.io.schedule(move || server.accept_loop(fd));
        }
    }

    /// Stop accepting and close the listeners; connections already handed to
    /// the handler run to completion.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let listeners = {
            let mut guard = self.listeners.lock().expect("listener set poisoned");
            std::mem::take(&mut *guard)
        };
        // Close on a worker so the hooked close path cancels the parked
        // accept fibers.
        let name = self.name.clone();
        self.io.schedule(move || {
            drop(listeners);
            log::info!("{}: stopped", name);
        });
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn accept_loop(self: Arc<Self>, fd: RawFd) {
        while !self.is_stopped() {
            match coio::accept(fd) {
                Ok((client_fd, addr)) => {
                    log::info!("{}: client connected from {}", self.name, addr);
                    let _ = coio::set_recv_timeout(
                        client_fd,
                        Some(Duration::from_millis(READ_TIMEOUT.value())),
                    );
                    let client = unsafe { CoStream::from_raw_fd(client_fd) };
                    let server = self.clone();
                    self.io.schedule(move || server.handler.handle_client(client));
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    if !self.is_stopped() {
                        log::error!("{}: accept error: {}", self.name, e);
                    }
                    break;
                }
            }
        }
        log::debug!("{}: accept fiber exiting", self.name);
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
