//! Thread synchronization primitives the runtime needs beyond what `std`
//! ships: a counting [`Semaphore`] (worker start barrier) and a [`SpinLock`]
//! with an RAII guard (run-queue protection, where critical sections are a
//! few pointer moves).
//!
//! Plain mutexes and read/write locks come from `std::sync` - they already
//! carry the scoped-guard discipline this runtime relies on.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

////////////////////////////////////////////////////////////////////////////////
// Semaphore
////////////////////////////////////////////////////////////////////////////////

/// A counting semaphore.
///
/// `wait` blocks the calling OS thread until a permit is available; `notify`
/// releases one permit. This is a thread-level primitive: it must never be
/// used from fiber context where a yield is expected instead.
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `count` initial permits.
    pub fn new(count: u32) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        while *count == 0 {
            count = self.cond.wait(count).expect("semaphore poisoned");
        }
        *count -= 1;
    }

    /// Release one permit and wake a single waiter.
    pub fn notify(&self) {
        let mut count = self.count.lock().expect("semaphore poisoned");
        *count += 1;
        self.cond.notify_one();
    }
}

////////////////////////////////////////////////////////////////////////////////
// SpinLock
////////////////////////////////////////////////////////////////////////////////

/// A test-and-set spin lock protecting `T`.
///
/// Locking returns a [`SpinLockGuard`] which releases on drop. Only suitable
/// for critical sections that never block and never yield.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `locked`.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub fn new(t: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(t),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Spin until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }
}

/// RAII guard of a [`SpinLock`]; unlocks when dropped.
pub struct SpinLockGuard<'a, T: ?Sized + 'a> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn semaphore_barrier() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let t = std::thread::spawn(move || {
            sem2.notify();
        });
        sem.wait();
        t.join().unwrap();
    }

    #[test]
    fn spinlock_counts() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut threads = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            threads.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
