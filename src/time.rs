//! Process clock
//!
//! Purge bounds and arrival rates only ever compare timestamps produced
//! inside this one process, so the clock needs three things: it must be
//! cheap to read from hot paths, fine-grained enough to divide an event
//! count by, and it must never run backwards mid-window the way the wall
//! clock can under an NTP step. To get all three, the wall clock is sampled
//! exactly once and every later reading is that anchor plus a monotonic
//! `Instant` delta.

use chrono::offset::Utc;
use std::time::Instant;

lazy_static! {
    static ref ANCHOR: (f64, Instant) = (
        Utc::now().timestamp_millis() as f64 / 1000.0,
        Instant::now(),
    );
}

/// Current time as epoch seconds. Monotonic for the life of the process;
/// only approximately wall-accurate over very long uptimes, which the
/// sliding windows do not care about.
pub fn now() -> f64 {
    let (epoch, started) = *ANCHOR;
    epoch + started.elapsed().as_secs_f64()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clock_is_recent_and_monotonic() {
        let a = now();
        let b = now();
        // sometime after 2017, and never backwards
        assert!(a > 1_500_000_000.0);
        assert!(b >= a);
    }
}
