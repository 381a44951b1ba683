//! Millisecond/nanosecond wall-aligned monotonic clock.
//!
//! All statistics code reads time through this module so that every bucket
//! start computed anywhere in the process agrees on the same timeline. The
//! clock is a TSC-calibrated [`quanta::Clock`] anchored once at first use,
//! offset by the Unix epoch so bucket starts line up with real seconds.

use std::sync::OnceLock;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use quanta::Clock;
use quanta::Instant;

struct EpochClock {
    clock: Clock,
    anchor: Instant,
    epoch_offset_nanos: u64,
}

static EPOCH_CLOCK: OnceLock<EpochClock> = OnceLock::new();

fn epoch_clock() -> &'static EpochClock {
    EPOCH_CLOCK.get_or_init(|| {
        let clock = Clock::new();
        let anchor = clock.now();
        let epoch_offset_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        EpochClock {
            clock,
            anchor,
            epoch_offset_nanos,
        }
    })
}

/// Current Unix time in nanoseconds, monotonic after the first call.
#[inline]
pub fn now_nanos() -> u64 {
    let ec = epoch_clock();
    ec.epoch_offset_nanos + ec.clock.now().duration_since(ec.anchor).as_nanos() as u64
}

/// Current Unix time in milliseconds.
#[inline]
pub fn now_millis() -> u64 {
    now_nanos() / 1_000_000
}

/// Park the current thread for the given number of nanoseconds.
#[inline]
pub fn sleep_nanos(nanos: u64) {
    std::thread::sleep(Duration::from_nanos(nanos));
}
