//! IO fiber scheduler basing on epoll.
//!
//! An [`IoManager`] is a [`Scheduler`] extended with an epoll reactor and a
//! [`TimerManager`]: besides plain jobs, fibers can park on fd readiness
//! ([`add_event`](IoManager::add_event)) and on deadlines
//! ([`add_timer`](IoManager::add_timer)). Idle workers sit in `epoll_wait`
//! with a timeout bounded by the earliest deadline; a self-pipe registered in
//! the epoll set lets any thread interrupt that wait
//! ([`tickle`](IoManager::tickle)).
//!
//! Per fd the manager keeps one slot with a mutex, the current interest set
//! and one *event context* per direction holding the scheduler plus either a
//! parked fiber or a closure. The epoll registration is rewritten
//! (edge-triggered, union of interests) on every mutation, so the kernel
//! interest always equals the slot's interest.
//!
//! Lock order: slot vector lock, then slot mutex, then scheduler queue.
//! Never the reverse.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bitflags::bitflags;

use crate::fiber::{self, Fiber, FiberFn, State};
use crate::sched::{Job, Scheduler};
use crate::timer::{Timer, TimerManager};

bitflags! {
    /// Fd event kinds. The values are the epoll encoding (`EPOLLIN`,
    /// `EPOLLOUT`); the gap at 0x2 is deliberate.
    pub struct Event: u32 {
        const READ = 0x1;
        const WRITE = 0x4;
    }
}

/// Work parked on one direction of one fd.
struct EventCtx {
    sched: Weak<Scheduler>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl EventCtx {
    fn empty() -> EventCtx {
        EventCtx {
            sched: Weak::new(),
            fiber: None,
            cb: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }

    fn reset(&mut self) {
        self.sched = Weak::new();
        self.fiber = None;
        self.cb = None;
    }
}

struct SlotState {
    events: Event,
    read: EventCtx,
    write: EventCtx,
}

impl SlotState {
    fn ctx_mut(&mut self, event: Event) -> &mut EventCtx {
        match event {
            Event::READ => &mut self.read,
            Event::WRITE => &mut self.write,
            _ => unreachable!("event context for {:?}", event),
        }
    }
}

struct FdSlot {
    fd: RawFd,
    state: Mutex<SlotState>,
}

impl FdSlot {
    fn new(fd: RawFd) -> FdSlot {
        FdSlot {
            fd,
            state: Mutex::new(SlotState {
                events: Event::empty(),
                read: EventCtx::empty(),
                write: EventCtx::empty(),
            }),
        }
    }
}

const MAX_EPOLL_EVENTS: usize = 256;
// Upper bound for one epoll_wait nap even with no armed timer.
const MAX_TIMEOUT_MS: u64 = 5000;

/// Scheduler + epoll reactor + timer manager.
///
/// Construction starts the worker pool immediately. Shut down with
/// [`stop`](IoManager::stop); dropping the last handle performs a best-effort
/// shutdown as well, but cannot drain a `use_caller` scheduler.
pub struct IoManager {
    sched: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    // [read end, write end]; one byte through here is a tickle.
    tickle_fds: [RawFd; 2],
    pending: AtomicUsize,
    slots: RwLock<Vec<Option<Arc<FdSlot>>>>,
}

impl IoManager {
    /// Create the reactor and start `threads` workers.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<IoManager> {
        let sched = Scheduler::new(threads, use_caller, name);

        let epfd = unsafe { libc::epoll_create1(0) };
        if epfd < 0 {
            panic!("epoll_create1 failed: {}", std::io::Error::last_os_error());
        }
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            panic!("pipe failed: {}", std::io::Error::last_os_error());
        }
        let rt = unsafe { libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        assert!(rt == 0, "fcntl(tickle pipe) failed");

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: fds[0] as u64,
        };
        let rt = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, fds[0], &mut ev) };
        assert!(rt == 0, "epoll_ctl(tickle pipe) failed");

        let io = Arc::new(IoManager {
            sched,
            timers: TimerManager::new(),
            epfd,
            tickle_fds: fds,
            pending: AtomicUsize::new(0),
            slots: RwLock::new(Vec::new()),
        });

        io.sched.set_io(Arc::downgrade(&io));
        let weak = Arc::downgrade(&io);
        io.timers.set_front_notify(move || {
            // A new earliest deadline: interrupt whoever naps in epoll_wait.
            if let Some(io) = weak.upgrade() {
                io.tickle();
            }
        });
        io.grow_slots(32);

        io.sched.start();
        io
    }

    /// IoManager driving the current worker thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        Scheduler::current().and_then(|s| s.io())
    }

    #[inline(always)]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        self.sched.name()
    }

    /// Number of fd interests currently armed.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    ////////////////////////////////////////////////////////////////////////
    // Scheduler delegation
    ////////////////////////////////////////////////////////////////////////

    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule(f);
    }

    pub fn schedule_on<F>(&self, f: F, thread: i64)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule_on(f, thread);
    }

    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        self.sched.schedule_fiber(fiber);
    }

    pub fn schedule_batch<I>(&self, jobs: I)
    where
        I: IntoIterator<Item = Job>,
    {
        self.sched.schedule_batch(jobs);
    }

    /// Graceful shutdown: waits for queued work, parked events and workers.
    pub fn stop(&self) {
        self.sched.stop();
    }

    ////////////////////////////////////////////////////////////////////////
    // Timer delegation
    ////////////////////////////////////////////////////////////////////////

    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, f, recurring)
    }

    pub fn add_conditional_timer<F, T>(&self, ms: u64, f: F, cond: &Arc<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_conditional_timer(ms, f, cond, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    ////////////////////////////////////////////////////////////////////////
    // Event registration
    ////////////////////////////////////////////////////////////////////////

    /// Arm a one-shot interest in `event` on `fd`.
    ///
    /// With `cb = None` the *current fiber* (which must be `Exec`) is parked
    /// and resumed when the event fires; otherwise the closure is scheduled.
    /// Arming an event that is already armed on this fd is a contract
    /// violation and panics.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> std::io::Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one of READ/WRITE, got {:?}",
            event
        );
        let slot = self.ensure_slot(fd);
        let mut state = slot.state.lock().expect("fd slot poisoned");

        if state.events.contains(event) {
            log::error!(
                "add_event: fd={} event={:?} already armed (current={:?})",
                fd,
                event,
                state.events
            );
            panic!("add_event: duplicate interest on fd {}", fd);
        }

        let new_events = state.events | event;
        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        self.epoll_rewrite(fd, op, new_events)?;

        self.pending.fetch_add(1, Ordering::AcqRel);
        state.events = new_events;

        let ctx = state.ctx_mut(event);
        debug_assert!(ctx.is_empty(), "event context of fd {} not reset", fd);
        ctx.sched = Arc::downgrade(
            &Scheduler::current().expect("add_event outside of a scheduler thread"),
        );
        match cb {
            Some(cb) => ctx.cb = Some(cb),
            None => {
                let cur = fiber::this_fiber();
                assert_eq!(cur.state(), State::Exec);
                ctx.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Disarm `event` on `fd` *without* running the parked work.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let slot = match self.slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().expect("fd slot poisoned");
        if !state.events.contains(event) {
            return false;
        }

        let new_events = state.events - event;
        let op = if new_events.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_rewrite(fd, op, new_events).is_err() {
            return false;
        }

        self.pending.fetch_sub(1, Ordering::AcqRel);
        state.events = new_events;
        state.ctx_mut(event).reset();
        true
    }

    /// Disarm `event` on `fd` and run the parked work as if the event fired
    /// (through the scheduler, never inline).
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let slot = match self.slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().expect("fd slot poisoned");
        if !state.events.contains(event) {
            return false;
        }

        let new_events = state.events - event;
        let op = if new_events.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_rewrite(fd, op, new_events).is_err() {
            return false;
        }

        Self::trigger(&mut state, event);
        self.pending.fetch_sub(1, Ordering::AcqRel);
        true
    }

    /// Disarm everything on `fd`, firing any parked work.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let slot = match self.slot(fd) {
            Some(slot) => slot,
            None => return false,
        };
        let mut state = slot.state.lock().expect("fd slot poisoned");
        if state.events.is_empty() {
            return false;
        }

        if self.epoll_rewrite(fd, libc::EPOLL_CTL_DEL, Event::empty()).is_err() {
            return false;
        }

        if state.events.contains(Event::READ) {
            Self::trigger(&mut state, Event::READ);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        if state.events.contains(Event::WRITE) {
            Self::trigger(&mut state, Event::WRITE);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        debug_assert!(state.events.is_empty());
        true
    }

    /// Wake one idle worker by writing a byte into the self-pipe. No-op when
    /// nobody is idle (a busy worker re-scans the queue anyway).
    pub(crate) fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rt = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        assert!(rt == 1, "tickle pipe write failed");
    }

    ////////////////////////////////////////////////////////////////////////
    // Idle loop
    ////////////////////////////////////////////////////////////////////////

    /// One reactor round for an idle worker: wait for fd events or the next
    /// deadline, dispatch, hand expired timer callbacks to the scheduler.
    ///
    /// Returns `false` when the scheduler is stopping and the idle fiber
    /// should terminate.
    pub(crate) fn idle_round(&self) -> bool {
        if self.sched.stopping() {
            // Pass the wake-up on so peers parked in epoll_wait notice the
            // shutdown now instead of at their timeout.
            self.tickle();
            log::info!("name={} idle stopping exit", self.name());
            return false;
        }

        let mut events =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EPOLL_EVENTS];
        let timeout = std::cmp::min(self.timers.next_timeout(), MAX_TIMEOUT_MS) as libc::c_int;

        let count = loop {
            let rt = unsafe {
                libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EPOLL_EVENTS as i32, timeout)
            };
            if rt >= 0 {
                break rt as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::error!("epoll_wait({}): {}", self.epfd, err);
            break 0;
        };

        for i in 0..count {
            let ev = events[i];
            if ev.u64 == self.tickle_fds[0] as u64 {
                self.drain_tickle_pipe();
                continue;
            }
            self.dispatch(ev.u64 as RawFd, ev.events);
        }

        let expired = self.timers.collect_expired();
        if !expired.is_empty() {
            log::debug!("{} timer callback(s) expired", expired.len());
            self.sched
                .schedule_batch(expired.into_iter().map(|cb| Job::from_fn(move || cb())));
        }
        true
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rt = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rt <= 0 {
                break;
            }
        }
    }

    /// Route one epoll report to the parked work of its slot.
    fn dispatch(&self, fd: RawFd, revents: u32) {
        let slot = match self.slot(fd) {
            Some(slot) => slot,
            None => return,
        };
        let mut state = slot.state.lock().expect("fd slot poisoned");

        let mut revents = revents;
        if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
            // Errors and hang-ups wake every parked direction.
            revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.events.bits();
        }
        let mut real = Event::empty();
        if revents & libc::EPOLLIN as u32 != 0 {
            real |= Event::READ;
        }
        if revents & libc::EPOLLOUT as u32 != 0 {
            real |= Event::WRITE;
        }
        if (state.events & real).is_empty() {
            return;
        }

        let rest = state.events - real;
        let op = if rest.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self.epoll_rewrite(fd, op, rest).is_err() {
            return;
        }

        if real.contains(Event::READ) && state.events.contains(Event::READ) {
            Self::trigger(&mut state, Event::READ);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        if real.contains(Event::WRITE) && state.events.contains(Event::WRITE) {
            Self::trigger(&mut state, Event::WRITE);
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Re-submit the parked work of `event` via its scheduler and clear the
    /// context. Caller holds the slot mutex and fixes the pending counter.
    fn trigger(state: &mut SlotState, event: Event) {
        assert!(state.events.contains(event));
        state.events -= event;

        let ctx = state.ctx_mut(event);
        let sched = ctx.sched.upgrade();
        let job = if let Some(cb) = ctx.cb.take() {
            Some(Job::Call(cb))
        } else {
            ctx.fiber.take().map(Job::Fiber)
        };
        ctx.reset();

        match (sched, job) {
            (Some(sched), Some(job)) => sched.schedule_batch(std::iter::once(job)),
            _ => log::warn!("event fired with no live scheduler to run it"),
        }
    }

    fn epoll_rewrite(&self, fd: RawFd, op: libc::c_int, events: Event) -> std::io::Result<()> {
        let mut ep = libc::epoll_event {
            events: libc::EPOLLET as u32 | events.bits(),
            u64: fd as u64,
        };
        let rt = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ep) };
        if rt != 0 {
            let err = std::io::Error::last_os_error();
            log::error!(
                "epoll_ctl({}, {}, {}, {:?}): {}",
                self.epfd,
                op,
                fd,
                events,
                err
            );
            return Err(err);
        }
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Slots
    ////////////////////////////////////////////////////////////////////////

    fn slot(&self, fd: RawFd) -> Option<Arc<FdSlot>> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.read().expect("fd slots poisoned");
        slots.get(fd as usize).and_then(|s| s.clone())
    }

    fn ensure_slot(&self, fd: RawFd) -> Arc<FdSlot> {
        assert!(fd >= 0, "invalid fd {}", fd);
        if let Some(slot) = self.slot(fd) {
            return slot;
        }
        let mut slots = self.slots.write().expect("fd slots poisoned");
        let idx = fd as usize;
        if slots.len() <= idx {
            let grown = std::cmp::max(idx * 3 / 2 + 1, slots.len());
            self.grow_locked(&mut slots, grown);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdSlot::new(fd)));
        }
        slots[idx].clone().expect("just created")
    }

    fn grow_slots(&self, size: usize) {
        let mut slots = self.slots.write().expect("fd slots poisoned");
        self.grow_locked(&mut slots, size);
    }

    fn grow_locked(&self, slots: &mut Vec<Option<Arc<FdSlot>>>, size: usize) {
        if slots.len() < size {
            slots.resize_with(size, || None);
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Best effort: stop() is the documented shutdown path, but make sure
        // workers are gone before the epoll fd goes away. Tickles must be
        // written directly here - the scheduler's weak back-link is already
        // dead at this point.
        self.sched.request_stop();
        for _ in 0..=self.sched.worker_count() {
            let rt = unsafe {
                libc::write(self.tickle_fds[1], b"T".as_ptr() as *const libc::c_void, 1)
            };
            let _ = rt;
        }
        self.sched.join_threads();

        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("name", &self.name())
            .field("pending_events", &self.pending_events())
            .finish_non_exhaustive()
    }
}
