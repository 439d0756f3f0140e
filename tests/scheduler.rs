use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fiberio::fiber;
use fiberio::sched::Scheduler;
use fiberio::sync::Semaphore;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn closures_run_on_workers() {
    init();
    let sched = Scheduler::new(3, false, "pool");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Semaphore::new(0));
    for _ in 0..100 {
        let count = count.clone();
        let done = done.clone();
        sched.schedule(move || {
            count.fetch_add(1, Ordering::SeqCst);
            done.notify();
        });
    }
    for _ in 0..100 {
        done.wait();
    }
    assert_eq!(count.load(Ordering::SeqCst), 100);
    sched.stop();
}

#[test]
fn ready_yield_requeues_the_fiber() {
    init();
    let sched = Scheduler::new(1, false, "yield");
    sched.start();

    let steps = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Semaphore::new(0));
    {
        let steps = steps.clone();
        let done = done.clone();
        sched.schedule(move || {
            steps.fetch_add(1, Ordering::SeqCst);
            fiber::yield_to_ready();
            steps.fetch_add(1, Ordering::SeqCst);
            done.notify();
        });
    }
    done.wait();
    assert_eq!(steps.load(Ordering::SeqCst), 2);
    sched.stop();
}

#[test]
fn fibers_can_be_scheduled_directly() {
    init();
    let sched = Scheduler::new(2, false, "fibers");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Semaphore::new(0));
    for _ in 0..10 {
        let count = count.clone();
        let done = done.clone();
        sched.schedule_fiber(fiber::Fiber::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
            done.notify();
        }));
    }
    for _ in 0..10 {
        done.wait();
    }
    assert_eq!(count.load(Ordering::SeqCst), 10);
    sched.stop();
}

#[test]
fn use_caller_drains_on_stop() {
    init();
    // One thread and use_caller means no pool threads at all: everything
    // runs when stop() swaps into the caller's root fiber.
    let sched = Scheduler::new(1, true, "caller");
    sched.start();

    let count = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let count = count.clone();
        sched.schedule(move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    assert_eq!(count.load(Ordering::SeqCst), 0, "nothing ran before stop");
    sched.stop();
    assert_eq!(count.load(Ordering::SeqCst), 5);
}

#[test]
fn panicking_job_does_not_kill_the_worker() {
    init();
    let sched = Scheduler::new(1, false, "panicky");
    sched.start();

    let done = Arc::new(Semaphore::new(0));
    sched.schedule(|| panic!("job blew up"));
    {
        let done = done.clone();
        sched.schedule(move || done.notify());
    }
    // The worker survives the Except fiber and runs the next job.
    done.wait();
    sched.stop();
}
