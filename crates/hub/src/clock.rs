//! Wall-clock source for the controllers. Every component receives an
//! `Arc<dyn Clock>` at construction so tests can drive time by hand.

use chrono::{Local, NaiveDateTime};

pub trait Clock: Send + Sync {
    /// Current local wall-clock time. Schedules are expressed as local
    /// times of day, so no timezone travels with the value.
    fn now(&self) -> NaiveDateTime;
}

/// Production clock backed by the host's local time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_tracks_local_time() {
        let before = Local::now().naive_local();
        let now = SystemClock.now();
        let after = Local::now().naive_local();
        assert!(before <= now && now <= after);
    }
}
