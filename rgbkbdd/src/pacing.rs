//! Tick pacing on the monotonic clock.
//!
//! Each tick sends at most one packet per device, so a frame is spread over
//! several ticks. Firmware 1.20 and later keeps up with twelve ticks per
//! frame; older firmware gets five.

use nix::errno::Errno;
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};
use rgbkbd_common::tracing;
use std::time::Duration;
use tracing::warn;

/// Shortest sleep between ticks
pub const SLEEP_FLOOR: Duration = Duration::from_micros(100);

/// Ticks per frame
pub fn fan_out(v120: bool) -> u32 {
    if v120 {
        12
    } else {
        5
    }
}

/// Target tick length at `fps` frames per second
pub fn tick_interval(fps: u32, v120: bool) -> Duration {
    Duration::from_secs(1) / fps.max(1) / fan_out(v120)
}

/// When the next tick should begin: one tick interval after `tick_start`,
/// but never sooner than the sleep floor from `now`
pub fn next_deadline(tick_start: Duration, now: Duration, fps: u32, v120: bool) -> Duration {
    (tick_start + tick_interval(fps, v120)).max(now + SLEEP_FLOOR)
}

/// Current CLOCK_MONOTONIC time
pub fn monotonic_now() -> Duration {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => Duration::new(ts.tv_sec() as u64, ts.tv_nsec() as u32),
        Err(e) => {
            warn!("Monotonic clock unavailable: {}", e);
            Duration::ZERO
        }
    }
}

/// Sleep until an absolute CLOCK_MONOTONIC deadline, restarting after signals
pub fn sleep_until(deadline: Duration) {
    let ts = TimeSpec::from_duration(deadline);
    loop {
        match clock_nanosleep(ClockId::CLOCK_MONOTONIC, ClockNanosleepFlags::TIMER_ABSTIME, &ts) {
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("Tick sleep failed: {}", e);
                break;
            }
            Ok(_) => break,
        }
    }
}
