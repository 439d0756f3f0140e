//! Deadline-ordered timers.
//!
//! A [`TimerManager`] keeps live timers in a set strictly ordered by
//! `(deadline, id)` under a read/write lock. The reactor asks it for
//! [`next_timeout`](TimerManager::next_timeout) before blocking in
//! `epoll_wait` and drains due callbacks with
//! [`collect_expired`](TimerManager::collect_expired) afterwards; inserting a
//! new head timer fires a notification hook so a blocked reactor re-arms its
//! timeout.
//!
//! Deadlines are monotonic milliseconds ([`clock::monotonic_ms`]). If the
//! observed time ever jumps backwards by more than an hour the whole set is
//! flushed as expired rather than stalling until the old deadlines come
//! around again.
//!
//! A *conditional* timer carries a weak reference; expiry with a dead
//! reference is a silent no-op, which makes it safe to arm timers against
//! state owned by a fiber that may be gone by the time they fire.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use once_cell::sync::OnceCell;

use crate::clock::{self, TIMEOUT_INFINITE};

/// Shared callback of a timer.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

static TIMER_IDS: AtomicU64 = AtomicU64::new(0);

// Clock adjustments smaller than this are treated as jitter, not rollover.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

struct TimerInner {
    id: u64,
    // Period and absolute deadline, only mutated under the manager's write
    // lock.
    ms: AtomicU64,
    next: AtomicU64,
    recurring: bool,
    cb: Mutex<Option<TimerCallback>>,
}

impl TimerInner {
    #[inline]
    fn key(&self) -> (u64, u64) {
        (self.next.load(Ordering::Relaxed), self.id)
    }
}

struct TimerSet {
    timers: BTreeMap<(u64, u64), Arc<TimerInner>>,
    previous_time: u64,
}

struct MgrInner {
    set: RwLock<TimerSet>,
    // Debounces front-insert notifications until the reactor reads the next
    // timeout again.
    tickled: AtomicBool,
    on_front: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

/// Handle to a live timer. Dropping the handle does not cancel the timer.
pub struct Timer {
    inner: Arc<TimerInner>,
    mgr: Weak<MgrInner>,
}

/// Ordered set of deadlines with conditional callbacks and rollover
/// detection.
pub struct TimerManager {
    inner: Arc<MgrInner>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager {
            inner: Arc::new(MgrInner {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous_time: clock::monotonic_ms(),
                }),
                tickled: AtomicBool::new(false),
                on_front: OnceCell::new(),
            }),
        }
    }

    /// Install the hook fired when an insertion becomes the new head of the
    /// set. The reactor uses it to interrupt a long `epoll_wait`.
    pub(crate) fn set_front_notify<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.inner.on_front.set(Box::new(f)).is_err() {
            panic!("timer manager front notification already installed");
        }
    }

    /// Arm a timer firing `ms` milliseconds from now; `recurring` timers
    /// re-arm themselves with `deadline += ms` on every expiry.
    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_cb(ms, Arc::new(f), recurring)
    }

    fn add_timer_cb(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Timer {
        let inner = Arc::new(TimerInner {
            id: TIMER_IDS.fetch_add(1, Ordering::Relaxed) + 1,
            ms: AtomicU64::new(ms),
            next: AtomicU64::new(clock::monotonic_ms() + ms),
            recurring,
            cb: Mutex::new(Some(cb)),
        });
        self.inner.insert(inner.clone());
        Timer {
            inner,
            mgr: Arc::downgrade(&self.inner),
        }
    }

    /// Arm a timer whose callback only runs if `cond` is still alive at
    /// expiry.
    pub fn add_conditional_timer<F, T>(
        &self,
        ms: u64,
        f: F,
        cond: &Arc<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let weak = Arc::downgrade(cond);
        self.add_timer(
            ms,
            move || {
                // Strengthen the guard first; a dead guard means whoever
                // armed the timer is gone.
                if let Some(_guard) = weak.upgrade() {
                    f();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: 0 when past due,
    /// [`TIMEOUT_INFINITE`] when no timer is armed. Clears the notification
    /// debounce.
    pub fn next_timeout(&self) -> u64 {
        self.inner.tickled.store(false, Ordering::Release);
        let set = self.inner.set.read().expect("timer set poisoned");
        match set.timers.keys().next() {
            None => TIMEOUT_INFINITE,
            Some(&(deadline, _)) => deadline.saturating_sub(clock::monotonic_ms()),
        }
    }

    /// True if any timer is armed.
    pub fn has_timer(&self) -> bool {
        !self.inner.set.read().expect("timer set poisoned").timers.is_empty()
    }

    /// Pop every timer whose deadline has passed and return its callback;
    /// recurring timers are re-armed, one-shot timers are detached.
    pub fn collect_expired(&self) -> Vec<TimerCallback> {
        self.collect_expired_at(clock::monotonic_ms())
    }

    fn collect_expired_at(&self, now_ms: u64) -> Vec<TimerCallback> {
        let mut set = self.inner.set.write().expect("timer set poisoned");
        if set.timers.is_empty() {
            return Vec::new();
        }

        let rollover = detect_rollover(&mut set.previous_time, now_ms);
        if !rollover {
            match set.timers.keys().next() {
                Some(&(deadline, _)) if deadline > now_ms => return Vec::new(),
                _ => {}
            }
        }

        let expired = if rollover {
            std::mem::take(&mut set.timers)
        } else {
            // Everything with deadline <= now, deadline == now included.
            let rest = set.timers.split_off(&(now_ms + 1, 0));
            std::mem::replace(&mut set.timers, rest)
        };

        let mut cbs = Vec::with_capacity(expired.len());
        for timer in expired.into_values() {
            let mut cb = timer.cb.lock().expect("timer callback poisoned");
            let callback = match &*cb {
                Some(callback) => callback.clone(),
                // Cancelled entries never stay in the set.
                None => continue,
            };
            cbs.push(callback);
            if timer.recurring {
                timer
                    .next
                    .store(now_ms + timer.ms.load(Ordering::Relaxed), Ordering::Relaxed);
                drop(cb);
                let key = timer.key();
                set.timers.insert(key, timer);
            } else {
                *cb = None;
            }
        }
        cbs
    }
}

impl MgrInner {
    fn insert(&self, timer: Arc<TimerInner>) {
        let at_front;
        {
            let mut set = self.set.write().expect("timer set poisoned");
            let key = timer.key();
            set.timers.insert(key, timer);
            let is_head = set.timers.keys().next() == Some(&key);
            at_front = is_head && !self.tickled.swap(true, Ordering::AcqRel);
        }
        if at_front {
            if let Some(f) = self.on_front.get() {
                f();
            }
        }
    }
}

fn detect_rollover(previous_time: &mut u64, now_ms: u64) -> bool {
    let rollover =
        now_ms < *previous_time && now_ms < previous_time.saturating_sub(ROLLOVER_WINDOW_MS);
    *previous_time = now_ms;
    rollover
}

impl Timer {
    /// Detach the callback and remove the timer from its manager.
    ///
    /// Returns `false` if the timer already fired (one-shot), was cancelled
    /// before, or outlived its manager.
    pub fn cancel(&self) -> bool {
        let mgr = match self.mgr.upgrade() {
            Some(mgr) => mgr,
            None => return false,
        };
        let mut set = mgr.set.write().expect("timer set poisoned");
        let mut cb = self.inner.cb.lock().expect("timer callback poisoned");
        if cb.is_none() {
            return false;
        }
        *cb = None;
        set.timers.remove(&self.inner.key());
        true
    }

    /// Re-anchor the deadline to `now + period`.
    pub fn refresh(&self) -> bool {
        let mgr = match self.mgr.upgrade() {
            Some(mgr) => mgr,
            None => return false,
        };
        let mut set = mgr.set.write().expect("timer set poisoned");
        if self.inner.cb.lock().expect("timer callback poisoned").is_none() {
            return false;
        }
        if set.timers.remove(&self.inner.key()).is_none() {
            return false;
        }
        let next = clock::monotonic_ms() + self.inner.ms.load(Ordering::Relaxed);
        self.inner.next.store(next, Ordering::Relaxed);
        set.timers.insert(self.inner.key(), self.inner.clone());
        true
    }

    /// Change the period. With `from_now` the new deadline is `now + ms`,
    /// otherwise the original start point is kept: `(deadline - old_period)
    /// + ms`.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        if ms == self.inner.ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        let mgr = match self.mgr.upgrade() {
            Some(mgr) => mgr,
            None => return false,
        };
        {
            let mut set = mgr.set.write().expect("timer set poisoned");
            if self.inner.cb.lock().expect("timer callback poisoned").is_none() {
                return false;
            }
            if set.timers.remove(&self.inner.key()).is_none() {
                return false;
            }
            let old_ms = self.inner.ms.load(Ordering::Relaxed);
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                self.inner.next.load(Ordering::Relaxed).saturating_sub(old_ms)
            };
            self.inner.ms.store(ms, Ordering::Relaxed);
            self.inner.next.store(start + ms, Ordering::Relaxed);
        }
        // Reinsert through the front-notification path; the new deadline may
        // now be the earliest one.
        mgr.insert(self.inner.clone());
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("id", &self.inner.id)
            .field("ms", &self.inner.ms.load(Ordering::Relaxed))
            .field("recurring", &self.inner.recurring)
            .finish()
    }
}
