//! Cooperative multitasking module.
//!
//! A [`Fiber`] is a stackful coroutine: it owns a stack, a saved machine
//! context and an entry closure, and is switched in and out with the
//! platform's `ucontext` primitives. Fibers yield voluntarily - there is no
//! preemption - and are driven either by a [`Scheduler`] worker or directly
//! by the thread that created them.
//!
//! Every thread that touches fibers has:
//! - a *bootstrap fiber*: the thread's original context, created lazily by
//!   [`this_fiber`] and used to return from directly-driven fibers;
//! - a *current fiber* pointer, maintained by every switch.
//!
//! State machine: `Init` on creation and [`Fiber::reset`], `Exec` while
//! running, `Ready`/`Hold` after a voluntary yield, `Term` after the entry
//! closure returns, `Except` if it panics.
//!
//! [`Scheduler`]: crate::sched::Scheduler

use std::alloc::{alloc, dealloc, Layout};
use std::backtrace::Backtrace;
use std::cell::{RefCell, UnsafeCell};
use std::mem::MaybeUninit;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;

use crate::config::{self, ConfigVar};
use crate::sched::Scheduler;

/// Entry closure of a fiber.
pub type FiberFn = Box<dyn FnOnce() + Send + 'static>;

static FIBER_IDS: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

static STACK_SIZE: Lazy<ConfigVar<u32>> = Lazy::new(|| {
    config::lookup("fiber.stack_size", 128 * 1024, "fiber stack size")
        .expect("fiber.stack_size registration cannot fail")
});

thread_local! {
    // Fiber currently executing on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    // The thread's original context, owner of all `call`/`back` switches.
    static BOOTSTRAP: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// Log and abort; context switch failures leave the runtime in an
/// unknowable state (spec'd as fatal).
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        log::error!("{}", Backtrace::force_capture());
        std::process::abort();
    }};
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle states of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Created or reset, never run since.
    Init = 0,
    /// Yielded, waiting for an external wake-up (timer, fd event).
    Hold = 1,
    /// Currently running on some thread.
    Exec = 2,
    /// Entry closure returned normally.
    Term = 3,
    /// Yielded, wants to run again as soon as a worker is free.
    Ready = 4,
    /// Entry closure panicked.
    Except = 5,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Init,
            1 => State::Hold,
            2 => State::Exec,
            3 => State::Term,
            4 => State::Ready,
            5 => State::Except,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

/// A stackful coroutine.
///
/// Handles are reference counted; the scheduler holds one while the fiber is
/// queued, an fd event context holds one while the fiber is parked on IO.
/// The stack is released when the last handle drops, which is only legal in
/// `Term`, `Init` or `Except` state.
pub struct Fiber {
    id: u64,
    stack: *mut u8,
    stack_size: usize,
    state: AtomicU8,
    // Context and closure are only touched by the thread currently driving
    // this fiber; the state machine serializes drivers.
    ctx: UnsafeCell<libc::ucontext_t>,
    cb: UnsafeCell<Option<FiberFn>>,
    use_caller: bool,
    // Self-handle; switches publish it as the thread's current fiber.
    me: Weak<Fiber>,
}

// Safety: `ctx` and `cb` are accessed only by the single thread that is
// currently driving the fiber (enforced by the Exec-state discipline and the
// scheduler queue); everything else is atomic or immutable.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with the default stack size that returns to the
    /// scheduler's main fiber on yield.
    pub fn new<F>(f: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new_with_attr(f, 0, false)
    }

    /// Create a fiber with an explicit stack size (`0` means the configured
    /// default) and trampoline selection: `use_caller = true` makes the
    /// fiber return to the thread's bootstrap fiber instead of the
    /// scheduler's main fiber.
    pub fn new_with_attr<F>(f: F, stack_size: usize, use_caller: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = FIBER_IDS.fetch_add(1, Ordering::Relaxed) + 1;
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        let stack_size = if stack_size != 0 {
            stack_size
        } else {
            STACK_SIZE.value() as usize
        };
        let layout = stack_layout(stack_size);
        let stack = unsafe { alloc(layout) };
        if stack.is_null() {
            fatal!("fiber stack allocation failed, size={}", stack_size);
        }

        let fiber = Arc::new_cyclic(|me: &Weak<Fiber>| Fiber {
            id,
            stack,
            stack_size,
            state: AtomicU8::new(State::Init as u8),
            ctx: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            cb: UnsafeCell::new(Some(Box::new(f))),
            use_caller,
            me: me.clone(),
        });
        unsafe { fiber.make_context() };

        log::trace!("fiber created id={}", id);
        fiber
    }

    /// The thread's bootstrap fiber: no stack of its own, state `Exec`.
    fn bootstrap() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new_cyclic(|me: &Weak<Fiber>| Fiber {
            id: 0,
            stack: std::ptr::null_mut(),
            stack_size: 0,
            state: AtomicU8::new(State::Exec as u8),
            ctx: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            cb: UnsafeCell::new(None),
            use_caller: false,
            me: me.clone(),
        });
        if unsafe { libc::getcontext(fiber.ctx.get()) } != 0 {
            fatal!("getcontext failed: {}", std::io::Error::last_os_error());
        }
        fiber
    }

    /// Strong self-handle, for publishing into thread-local state.
    fn handle(&self) -> Arc<Fiber> {
        self.me.upgrade().expect("fiber outlived its own handle")
    }

    /// Capture a fresh context pointing at the trampoline.
    ///
    /// Safety: the fiber must not be running.
    unsafe fn make_context(&self) {
        let ctx = self.ctx.get();
        if libc::getcontext(ctx) != 0 {
            fatal!("getcontext failed: {}", std::io::Error::last_os_error());
        }
        (*ctx).uc_link = std::ptr::null_mut();
        (*ctx).uc_stack.ss_sp = self.stack as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = self.stack_size;
        let entry: extern "C" fn() = if self.use_caller {
            caller_trampoline
        } else {
            sched_trampoline
        };
        libc::makecontext(ctx, entry, 0);
    }

    /// Reuse the stack for a new entry closure.
    ///
    /// Only legal in `Init`, `Term` or `Except` state; the fiber comes out
    /// in `Init`.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(!self.stack.is_null(), "cannot reset the bootstrap fiber");
        let state = self.state();
        assert!(
            matches!(state, State::Init | State::Term | State::Except),
            "fiber {} reset in state {:?}",
            self.id,
            state
        );
        unsafe {
            *self.cb.get() = Some(Box::new(f));
            self.make_context();
        }
        self.set_state(State::Init);
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Switch from the scheduler's main fiber into this fiber.
    pub fn swap_in(&self) {
        let main = Scheduler::main_fiber().expect("swap_in outside of a scheduler thread");
        assert!(self.state() != State::Exec, "fiber {} is already running", self.id);
        set_current(self.handle());
        self.set_state(State::Exec);
        unsafe { switch(main.ctx.get(), self.ctx.get()) };
    }

    /// Switch back to the scheduler's main fiber, saving this fiber's
    /// context for the next [`swap_in`](Self::swap_in).
    pub fn swap_out(&self) {
        let main = Scheduler::main_fiber().expect("swap_out outside of a scheduler thread");
        set_current(main.clone());
        unsafe { switch(self.ctx.get(), main.ctx.get()) };
    }

    /// Switch from the thread's bootstrap fiber into this fiber (used when
    /// the caller thread drives a fiber directly).
    pub fn call(&self) {
        let boot = bootstrap_fiber();
        set_current(self.handle());
        self.set_state(State::Exec);
        unsafe { switch(boot.ctx.get(), self.ctx.get()) };
    }

    /// Inverse of [`call`](Self::call): return to the bootstrap fiber.
    pub fn back(&self) {
        let boot = bootstrap_fiber();
        set_current(boot.clone());
        unsafe { switch(self.ctx.get(), boot.ctx.get()) };
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if !self.stack.is_null() {
            let state = self.state();
            assert!(
                matches!(state, State::Term | State::Init | State::Except),
                "fiber {} dropped while in state {:?}",
                self.id,
                state
            );
            unsafe { dealloc(self.stack, stack_layout(self.stack_size)) };
        } else {
            // Bootstrap fiber going away with its thread.
            debug_assert_eq!(self.state(), State::Exec);
        }
        log::trace!("fiber dropped id={}", self.id);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn stack_layout(size: usize) -> Layout {
    Layout::from_size_align(size, 16).expect("invalid fiber stack size")
}

unsafe fn switch(save: *mut libc::ucontext_t, to: *mut libc::ucontext_t) {
    if libc::swapcontext(save, to) != 0 {
        fatal!("swapcontext failed: {}", std::io::Error::last_os_error());
    }
}

////////////////////////////////////////////////////////////////////////////////
// Thread-local surface
////////////////////////////////////////////////////////////////////////////////

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

fn bootstrap_fiber() -> Arc<Fiber> {
    this_fiber();
    BOOTSTRAP.with(|b| b.borrow().clone().expect("bootstrap fiber must exist"))
}

/// Handle of the fiber currently running on this thread.
///
/// The first call on a thread creates the bootstrap fiber (no stack, state
/// `Exec`) and makes it current.
pub fn this_fiber() -> Arc<Fiber> {
    if let Some(cur) = CURRENT.with(|c| c.borrow().clone()) {
        return cur;
    }
    let boot = Fiber::bootstrap();
    BOOTSTRAP.with(|b| *b.borrow_mut() = Some(boot.clone()));
    set_current(boot.clone());
    boot
}

/// Id of the current fiber, 0 when called outside any fiber.
pub fn fiber_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id()).unwrap_or(0))
}

/// Number of live fibers in the process (bootstrap fibers included).
pub fn total_fibers() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Yield the current fiber in `Ready` state: it will be re-queued by the
/// scheduler and resumed as soon as a worker is free.
pub fn yield_to_ready() {
    yield_with(State::Ready)
}

/// Yield the current fiber in `Hold` state: it stays dormant until some
/// external event (timer, fd readiness, explicit schedule) re-submits it.
pub fn yield_to_hold() {
    yield_with(State::Hold)
}

fn yield_with(state: State) {
    let cur = this_fiber();
    cur.set_state(state);
    if Scheduler::main_fiber().is_some() {
        cur.swap_out();
    } else {
        cur.back();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Trampolines
////////////////////////////////////////////////////////////////////////////////

extern "C" fn sched_trampoline() {
    run_entry(false)
}

extern "C" fn caller_trampoline() {
    run_entry(true)
}

fn run_entry(use_caller: bool) {
    let cur = this_fiber();
    let cb = unsafe { (*cur.cb.get()).take() }.expect("fiber started without an entry closure");

    match std::panic::catch_unwind(AssertUnwindSafe(cb)) {
        Ok(()) => cur.set_state(State::Term),
        Err(payload) => {
            cur.set_state(State::Except);
            log::error!(
                "fiber except: {} fiber id={}\n{}",
                panic_message(&payload),
                cur.id(),
                Backtrace::force_capture()
            );
        }
    }

    // Drop every handle held on this stack before the final switch; the
    // stack is freed by whoever holds the last reference.
    let raw: *const Fiber = Arc::as_ptr(&cur);
    drop(cur);
    unsafe {
        if use_caller {
            (*raw).back();
        } else {
            (*raw).swap_out();
        }
    }
    fatal!("terminated fiber resumed");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // Directly drive a fiber from the test thread with call/back, the way
    // the caller-thread trampoline is used.
    #[test]
    fn call_and_yield() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new_with_attr(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                yield_to_hold();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        );

        assert_eq!(fiber.state(), State::Init);
        fiber.call();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Hold);
        fiber.call();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_reuses_the_stack() {
        let fiber = Fiber::new_with_attr(|| {}, 16 * 1024, true);
        fiber.call();
        assert_eq!(fiber.state(), State::Term);

        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        fiber.reset(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), State::Init);
        fiber.call();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn panicking_fiber_goes_to_except() {
        let fiber = Fiber::new_with_attr(|| panic!("boom"), 0, true);
        fiber.call();
        assert_eq!(fiber.state(), State::Except);
    }

    #[test]
    fn ids_are_assigned() {
        let a = Fiber::new_with_attr(|| {}, 16 * 1024, true);
        let b = Fiber::new_with_attr(|| {}, 16 * 1024, true);
        assert!(b.id() > a.id());
        a.call();
        b.call();
    }

    #[test]
    fn this_fiber_is_bootstrap_outside_workers() {
        let me = this_fiber();
        assert_eq!(me.id(), 0);
        assert_eq!(me.state(), State::Exec);
    }
}
