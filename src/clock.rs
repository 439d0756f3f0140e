//! The `clock` module returns time values derived from the Posix / C
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! function.
//!
//! The runtime keeps all deadlines in milliseconds:
//!
//! - [monotonic_ms()](fn.monotonic_ms.html) - monotonic time, the timer wheel's clock
//! - [time_ms()](fn.time_ms.html) - wall clock time
//! - [monotonic()](fn.monotonic.html) / [time()](fn.time.html) - second-resolution variants

use std::mem::MaybeUninit;

/// Sentinel returned by timer queries when no deadline exists.
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

#[inline]
fn gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    // CLOCK_MONOTONIC/CLOCK_REALTIME cannot fail with a valid timespec.
    unsafe {
        libc::clock_gettime(clock, ts.as_mut_ptr());
        ts.assume_init()
    }
}

/// The monotonic time in milliseconds since boot.
///
/// Not affected by wall-clock adjustments; this is the clock deadlines are
/// computed against.
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// The wall clock time in milliseconds since epoch.
#[inline(always)]
pub fn time_ms() -> u64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}

/// The monotonic time in seconds since boot.
#[inline(always)]
pub fn monotonic() -> f64 {
    let ts = gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// The wall clock time in seconds since epoch (1970-01-01 00:00:00).
#[inline(always)]
pub fn time() -> f64 {
    let ts = gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_monotonic() {
        let a = monotonic_ms();
        let b = monotonic_ms();
        assert!(b >= a);
    }

    #[test]
    fn ms_matches_seconds() {
        let s = time();
        let ms = time_ms();
        assert!((ms as f64 / 1000.0 - s).abs() < 2.0);
    }
}
