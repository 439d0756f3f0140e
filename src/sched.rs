//! Fiber scheduler: N worker threads multiplexing fibers over a shared FIFO
//! run queue.
//!
//! A queue entry is either a ready [`Fiber`] handle or a plain closure
//! (wrapped into a reusable fiber by the worker that picks it up), optionally
//! pinned to a worker by kernel thread id. Workers scan the queue head first,
//! skipping entries pinned elsewhere (waking the pinned worker with a
//! [`tickle`](Scheduler::tickle)) and fibers that are still `Exec` on another
//! worker.
//!
//! With `use_caller` the constructing thread becomes an extra worker: it gets
//! a *root fiber* running the same loop, swapped in when [`Scheduler::stop`]
//! drains the queue.
//!
//! An [`IoManager`](crate::io::IoManager) extends the scheduler with an epoll
//! reactor; the scheduler consults the back-link installed at construction
//! for its `tickle`/`idle`/`stopping` behavior.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use once_cell::sync::OnceCell;

use crate::fiber::{self, Fiber, FiberFn, State};
use crate::io::IoManager;
use crate::sync::SpinLock;
use crate::thread::{gettid, Thread};

thread_local! {
    // Scheduler driving this thread.
    static SCHEDULER: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
    // The fiber workers swap back to: the thread's bootstrap fiber on pool
    // workers, the root fiber on a use_caller thread.
    static SCHED_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// A unit of schedulable work.
pub enum Job {
    /// A fiber handle; resumed with its own stack and state.
    Fiber(Arc<Fiber>),
    /// A closure; the worker wraps it into a reusable fiber.
    Call(FiberFn),
}

impl Job {
    pub fn from_fn<F>(f: F) -> Job
    where
        F: FnOnce() + Send + 'static,
    {
        Job::Call(Box::new(f))
    }
}

impl From<Arc<Fiber>> for Job {
    fn from(fiber: Arc<Fiber>) -> Self {
        Job::Fiber(fiber)
    }
}

struct Entry {
    job: Job,
    // Kernel tid this entry is pinned to, -1 for any worker.
    thread: i64,
}

/// Worker-thread pool over fibers.
pub struct Scheduler {
    name: String,
    queue: SpinLock<VecDeque<Entry>>,
    threads: Mutex<Vec<Thread>>,
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    auto_stop: AtomicBool,
    // Caller thread's tid when use_caller, -1 otherwise.
    root_tid: i64,
    root_fiber: Option<Arc<Fiber>>,
    // Self-handle for worker closures and thread-local publication.
    me: Weak<Scheduler>,
    // Back-link to the owning IoManager, when there is one.
    io: OnceCell<Weak<IoManager>>,
}

impl Scheduler {
    /// Create a scheduler with `threads` workers.
    ///
    /// With `use_caller` the calling thread is counted as one of the workers:
    /// it only participates once [`stop`](Self::stop) swaps into the root
    /// fiber to drain the queue.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads > 0, "scheduler needs at least one thread");

        let sched = Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let mut thread_count = threads;
            let mut root_fiber = None;
            let mut root_tid = -1;

            if use_caller {
                fiber::this_fiber();
                thread_count -= 1;
                assert!(
                    Scheduler::current().is_none(),
                    "caller thread already belongs to a scheduler"
                );

                let root_weak = weak.clone();
                root_fiber = Some(Fiber::new_with_attr(
                    move || {
                        if let Some(sched) = root_weak.upgrade() {
                            sched.run();
                        }
                    },
                    0,
                    true,
                ));
                root_tid = gettid();
            }

            Scheduler {
                name: name.to_owned(),
                me: weak.clone(),
                queue: SpinLock::new(VecDeque::new()),
                threads: Mutex::new(Vec::new()),
                thread_count,
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
                stopping: AtomicBool::new(true),
                auto_stop: AtomicBool::new(false),
                root_tid,
                root_fiber,
                io: OnceCell::new(),
            }
        });

        if use_caller {
            SCHEDULER.with(|s| *s.borrow_mut() = Some(sched.clone()));
            SCHED_MAIN.with(|m| *m.borrow_mut() = sched.root_fiber.clone());
        }
        sched
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduler driving the current thread, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        SCHEDULER.with(|s| s.borrow().clone())
    }

    /// The fiber the current worker swaps task fibers against.
    pub fn main_fiber() -> Option<Arc<Fiber>> {
        SCHED_MAIN.with(|m| m.borrow().clone())
    }

    pub(crate) fn set_io(&self, io: Weak<IoManager>) {
        self.io
            .set(io)
            .unwrap_or_else(|_| panic!("scheduler {} already has a reactor", self.name));
    }

    pub(crate) fn io(&self) -> Option<Arc<IoManager>> {
        self.io.get().and_then(Weak::upgrade)
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.thread_count
    }

    /// Flag shutdown without waking anyone; the reactor's drop path writes
    /// its own tickles because the weak back-link is dead by then.
    pub(crate) fn request_stop(&self) {
        self.auto_stop.store(true, Ordering::Release);
        self.stopping.store(true, Ordering::Release);
    }

    pub(crate) fn join_threads(&self) {
        let threads = {
            let mut guard = self.threads.lock().expect("scheduler threads poisoned");
            std::mem::take(&mut *guard)
        };
        for thread in threads {
            thread.join();
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Submission
    ////////////////////////////////////////////////////////////////////////

    /// Run `f` on any worker.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Job::from_fn(f), -1);
    }

    /// Run `f` on the worker with kernel thread id `thread`.
    pub fn schedule_on<F>(&self, f: F, thread: i64)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Job::from_fn(f), thread);
    }

    /// Resume `fiber` on any worker.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.submit(Job::Fiber(fiber), -1);
    }

    /// Resume `fiber` on the worker with kernel thread id `thread`.
    pub fn schedule_fiber_on(&self, fiber: Arc<Fiber>, thread: i64) {
        self.submit(Job::Fiber(fiber), thread);
    }

    /// Enqueue a batch, waking a worker at most once.
    pub fn schedule_batch<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job>,
    {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            for job in jobs {
                queue.push_back(Entry { job, thread: -1 });
            }
            was_empty && !queue.is_empty()
        };
        if need_tickle {
            self.tickle();
        }
    }

    fn submit(&self, job: Job, thread: i64) {
        let need_tickle = {
            let mut queue = self.queue.lock();
            let was_empty = queue.is_empty();
            queue.push_back(Entry { job, thread });
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Lifecycle
    ////////////////////////////////////////////////////////////////////////

    /// Spawn the worker pool. Idempotent while running.
    pub fn start(&self) {
        let mut threads = self.threads.lock().expect("scheduler threads poisoned");
        if !self.stopping.load(Ordering::Acquire) {
            return;
        }
        self.stopping.store(false, Ordering::Release);
        assert!(threads.is_empty());

        for i in 0..self.thread_count {
            let sched = self.me.upgrade().expect("scheduler outlived its own handle");
            let name = format!("{}_{}", self.name, i);
            let thread = Thread::spawn(&name, move || sched.run())
                .unwrap_or_else(|e| panic!("failed to spawn worker {}: {}", name, e));
            threads.push(thread);
        }
    }

    /// Graceful shutdown: flag auto-stop, wake every worker, drain on the
    /// caller thread when `use_caller`, and join the pool.
    ///
    /// In-flight fibers finish what they are doing; nothing is killed.
    pub fn stop(&self) {
        self.auto_stop.store(true, Ordering::Release);

        if let Some(root) = &self.root_fiber {
            if self.thread_count == 0
                && matches!(root.state(), State::Term | State::Init)
            {
                log::info!("scheduler {} stopped", self.name);
                self.stopping.store(true, Ordering::Release);
                if self.stopping() {
                    return;
                }
            }
        }

        if self.root_tid != -1 {
            // use_caller schedulers must be stopped from the caller thread.
            let current = Scheduler::current();
            assert!(
                current.map_or(false, |c| std::ptr::eq(Arc::as_ptr(&c), self)),
                "use_caller scheduler stopped from a foreign thread"
            );
        }

        self.stopping.store(true, Ordering::Release);
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if self.root_fiber.is_some() {
            self.tickle();
        }

        if let Some(root) = &self.root_fiber {
            if !self.stopping() {
                root.call();
            }
        }

        self.join_threads();
    }

    /// True once shutdown was requested, the queue is drained and no worker
    /// is busy. The reactor adds its own condition (no pending fd events).
    pub(crate) fn stopping(&self) -> bool {
        let base = self.auto_stop.load(Ordering::Acquire)
            && self.stopping.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0;
        match self.io() {
            Some(io) => base && io.pending_events() == 0,
            None => base,
        }
    }

    /// Wake one worker. The base scheduler has nobody asleep in the kernel,
    /// so this only logs; the reactor overrides it with a self-pipe write.
    fn tickle(&self) {
        match self.io() {
            Some(io) => io.tickle(),
            None => log::trace!("tickle"),
        }
    }

    fn idle(&self) {
        match self.io.get().cloned() {
            Some(weak) => loop {
                // Hold the reactor only for the duration of one round: a
                // strong handle parked across the swap would keep the
                // IoManager alive forever.
                let more = match weak.upgrade() {
                    Some(io) => io.idle_round(),
                    None => false,
                };
                if !more {
                    break;
                }
                fiber::this_fiber().swap_out();
            },
            None => {
                log::trace!("idle");
                while !self.stopping() {
                    fiber::yield_to_hold();
                }
            }
        }
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::Acquire) > 0
    }

    ////////////////////////////////////////////////////////////////////////
    // Run loop
    ////////////////////////////////////////////////////////////////////////

    fn run(self: Arc<Self>) {
        log::debug!("scheduler {} worker starting", self.name);

        if self.io().is_some() {
            crate::coio::set_hook_enabled(true);
        }
        SCHEDULER.with(|s| *s.borrow_mut() = Some(self.clone()));
        let tid = gettid();
        if tid != self.root_tid {
            // Pool worker: swap target is this thread's bootstrap fiber.
            SCHED_MAIN.with(|m| *m.borrow_mut() = Some(fiber::this_fiber()));
        }

        let sched = self.clone();
        let idle_fiber = Fiber::new(move || sched.idle());
        // Reusable wrapper for closure jobs.
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_me = false;
            let mut taken: Option<Job> = None;

            {
                let mut queue = self.queue.lock();
                let mut i = 0;
                while i < queue.len() {
                    let entry = &queue[i];
                    if entry.thread != -1 && entry.thread != tid {
                        // Pinned elsewhere; leave in place, wake the owner.
                        tickle_me = true;
                        i += 1;
                        continue;
                    }
                    if let Job::Fiber(f) = &entry.job {
                        if f.state() == State::Exec {
                            // Still running on another worker; it will
                            // re-queue itself or park.
                            i += 1;
                            continue;
                        }
                    }
                    let entry = queue.remove(i).expect("index checked above");
                    taken = Some(entry.job);
                    tickle_me = false;
                    self.active_threads.fetch_add(1, Ordering::AcqRel);
                    break;
                }
            }

            if tickle_me {
                self.tickle();
            }

            match taken {
                Some(Job::Fiber(f))
                    if !matches!(f.state(), State::Term | State::Except) =>
                {
                    f.swap_in();
                    self.active_threads.fetch_sub(1, Ordering::AcqRel);

                    match f.state() {
                        State::Ready => self.schedule_fiber(f),
                        State::Term | State::Except => {}
                        // Parked: some timer or fd event owns the wake-up.
                        _ => f.set_state(State::Hold),
                    }
                }
                Some(Job::Fiber(_)) => {
                    // Finished fiber was still queued; just drop it.
                    self.active_threads.fetch_sub(1, Ordering::AcqRel);
                }
                Some(Job::Call(cb)) => {
                    let f = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => Fiber::new(cb),
                    };
                    f.swap_in();
                    self.active_threads.fetch_sub(1, Ordering::AcqRel);

                    match f.state() {
                        State::Ready => self.schedule_fiber(f),
                        // Keep the wrapper around for the next closure.
                        State::Term | State::Except => cb_fiber = Some(f),
                        _ => f.set_state(State::Hold),
                    }
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        log::debug!("scheduler {} idle fiber term", self.name);
                        break;
                    }

                    self.idle_threads.fetch_add(1, Ordering::AcqRel);
                    idle_fiber.swap_in();
                    self.idle_threads.fetch_sub(1, Ordering::AcqRel);

                    if !matches!(idle_fiber.state(), State::Term | State::Except) {
                        idle_fiber.set_state(State::Hold);
                    }
                }
            }
        }

        log::debug!("scheduler {} worker exiting", self.name);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.thread_count)
            .finish_non_exhaustive()
    }
}
