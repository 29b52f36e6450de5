use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A value together with the moment it last changed.
///
/// `update` moves both the value and the timestamp; `update_value_only`
/// corrects the value while keeping its age, which is what a running
/// extremum needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample<T> {
    pub time: NaiveDateTime,
    pub value: T,
}

impl<T> Sample<T> {
    pub fn new(time: NaiveDateTime, value: T) -> Self {
        Self { time, value }
    }

    pub fn update(&mut self, value: T, now: NaiveDateTime) {
        self.time = now;
        self.value = value;
    }

    pub fn update_value_only(&mut self, value: T) {
        self.value = value;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn update_moves_time_and_value() {
        let mut s = Sample::new(t(1), 10.0);
        s.update(12.5, t(3));
        assert_eq!(s.time, t(3));
        assert_eq!(s.value, 12.5);
    }

    #[test]
    fn update_value_only_keeps_age() {
        let mut s = Sample::new(t(1), 10.0);
        s.update_value_only(14.0);
        assert_eq!(s.time, t(1));
        assert_eq!(s.value, 14.0);
    }

    #[test]
    fn serializes_time_and_value() {
        let s = Sample::new(t(2), true);
        let json = serde_json::to_value(s).unwrap();
        assert_eq!(json["value"], true);
        assert_eq!(json["time"], "2024-06-01T02:00:00");
    }
}
