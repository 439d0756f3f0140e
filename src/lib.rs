//! Stackful fiber runtime with an epoll reactor and cooperative IO.
//!
//! The crate is built around three pieces:
//!
//! - [Fibers](fiber): stackful coroutines over the platform's `ucontext`
//!   switching, cooperatively scheduled
//! - [Scheduler](sched): a worker-thread pool running fibers FIFO, with
//!   optional per-job thread affinity
//! - [IoManager](io): a scheduler specialization that parks fibers on epoll
//!   fd readiness and on [timers](timer)
//!
//! Around them sit the layers a server needs:
//!
//! - [CoIO](coio): the blocking-syscall surface (`read`, `write`, `connect`,
//!   `accept`, `sleep`, ...) re-expressed so it yields the calling fiber
//!   instead of blocking its thread, plus [`CoStream`](coio::CoStream) /
//!   [`CoListener`](coio::CoListener) socket wrappers
//! - [Fd registry](fd): per-fd socket/nonblock/timeout bookkeeping behind the
//!   CoIO surface
//! - [TcpServer](server) and a small [HTTP/1.x stack](http)
//! - [Configuration](config) (YAML-backed vars with change listeners),
//!   [clocks](clock), [threads](thread) and [sync primitives](sync)
//!
//! Scheduling is cooperative: a fiber runs until it yields, sleeps, or a
//! hooked IO call would block. There is no preemption and no work stealing;
//! within one worker, fibers run FIFO.
//!
//! ```no_run
//! use fiberio::{coio, io::IoManager};
//! use std::time::Duration;
//!
//! let io = IoManager::new(2, false, "demo");
//! io.schedule(|| {
//!     coio::sleep(Duration::from_secs(1));
//!     println!("one second later, without holding a thread hostage");
//! });
//! io.stop();
//! ```

pub mod clock;
pub mod coio;
pub mod config;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod http;
pub mod io;
pub mod sched;
pub mod server;
pub mod sync;
pub mod thread;
pub mod timer;

pub use error::{Error, Result};
