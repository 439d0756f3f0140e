use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fiberio::coio;
use fiberio::io::IoManager;
use fiberio::sync::Semaphore;
use fiberio::timer::Timer;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn sleeps_share_one_worker() {
    init();
    let io = IoManager::new(1, false, "sleeps");
    let done = Arc::new(Semaphore::new(0));

    let started = Instant::now();
    for ms in [200u64, 300] {
        let done = done.clone();
        io.schedule(move || {
            coio::sleep(Duration::from_millis(ms));
            log::info!("slept {} ms", ms);
            done.notify();
        });
    }
    done.wait();
    done.wait();
    let elapsed = started.elapsed();

    // Cooperative sleeps overlap even on a single worker.
    assert!(elapsed >= Duration::from_millis(290), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(450), "elapsed {:?}", elapsed);
    io.stop();
}

#[test]
fn recurring_timer_reset_and_cancel() {
    init();
    let io = IoManager::new(2, false, "recurring");
    let fired = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Semaphore::new(0));
    let slot: Arc<Mutex<Option<Timer>>> = Arc::new(Mutex::new(None));

    let timer = {
        let fired = fired.clone();
        let done = done.clone();
        let slot = slot.clone();
        io.add_timer(
            40,
            move || {
                let guard = slot.lock().unwrap();
                let timer = match guard.as_ref() {
                    Some(timer) => timer,
                    // Fired before the handle landed in the slot; skip.
                    None => return,
                };
                let n = fired.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 3 {
                    // Speed up after three firings.
                    assert!(timer.reset(25, true));
                } else if n == 6 {
                    assert!(timer.cancel());
                    done.notify();
                }
            },
            true,
        )
    };
    *slot.lock().unwrap() = Some(timer);

    done.wait();
    // Give a cancelled timer every chance to misfire before checking.
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 6);
    io.stop();
}

#[test]
fn conditional_timer_skips_after_guard_drop() {
    init();
    let io = IoManager::new(1, false, "cond");
    let fired = Arc::new(AtomicUsize::new(0));

    let guard = Arc::new("resource");
    {
        let fired = fired.clone();
        io.add_conditional_timer(
            50,
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
            &guard,
            false,
        );
    }
    drop(guard);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    io.stop();
}

#[test]
fn one_shot_timer_fires_once() {
    init();
    let io = IoManager::new(1, false, "oneshot");
    let fired = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Semaphore::new(0));

    {
        let fired = fired.clone();
        let done = done.clone();
        io.add_timer(
            30,
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                done.notify();
            },
            false,
        );
    }
    done.wait();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    io.stop();
}

#[test]
fn timer_refresh_defers_expiry() {
    init();
    let io = IoManager::new(1, false, "refresh");
    let fired = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Semaphore::new(0));

    let timer = {
        let fired = fired.clone();
        let done = done.clone();
        io.add_timer(
            120,
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
                done.notify();
            },
            false,
        )
    };

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(timer.refresh());
    // The refreshed deadline starts counting from now.
    std::thread::sleep(Duration::from_millis(80));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    done.wait();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    io.stop();
}
