//! Named worker threads.
//!
//! The scheduler pins work to workers by kernel thread id, so it must know a
//! worker's tid before `start()` returns. [`Thread::spawn`] runs the supplied
//! closure on a named OS thread and blocks on a semaphore barrier until the
//! thread has published its tid.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::sync::Semaphore;

/// Kernel id of the calling thread.
#[inline(always)]
pub fn gettid() -> i64 {
    // gettid(2) cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as i64 }
}

/// A named OS thread whose kernel tid is known as soon as the handle exists.
pub struct Thread {
    name: String,
    tid: i64,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawn `f` on a new named thread.
    ///
    /// Returns only after the thread is running and its tid has been
    /// captured, so affinity decisions made right after spawning are valid.
    pub fn spawn<F>(name: &str, f: F) -> std::io::Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let started = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI64::new(-1));

        let barrier = started.clone();
        let tid_slot = tid.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                tid_slot.store(gettid(), Ordering::Release);
                barrier.notify();
                f();
            })?;

        started.wait();
        Ok(Thread {
            name: name.to_owned(),
            tid: tid.load(Ordering::Acquire),
            handle: Some(handle),
        })
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel id of the spawned thread.
    #[inline(always)]
    pub fn tid(&self) -> i64 {
        self.tid
    }

    /// Wait for the thread to finish. Joining from the thread itself would
    /// deadlock; the handle is detached instead.
    pub fn join(mut self) {
        if self.tid == gettid() {
            log::warn!("thread {} detached instead of self-joining", self.name);
            return;
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("thread {} panicked", self.name);
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Detach if never joined.
        if let Some(handle) = self.handle.take() {
            drop(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_is_captured() {
        let t = Thread::spawn("probe", || {}).unwrap();
        assert!(t.tid() > 0);
        assert_ne!(t.tid(), gettid());
        t.join();
    }

    #[test]
    fn named() {
        let t = Thread::spawn("worker_0", || {
            assert_eq!(std::thread::current().name(), Some("worker_0"));
        })
        .unwrap();
        assert_eq!(t.name(), "worker_0");
        t.join();
    }
}
