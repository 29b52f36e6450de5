//! Garden watering valve: one scheduled run per day plus one-shot manual
//! sessions, with a hard one-hour safety cutoff.

use anyhow::Result;
use chrono::{Duration, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::cycles::Cycle;
use crate::hardware::{Hardware, PinName};
use crate::settings::PoolSettings;
use crate::state::SystemState;

/// The valve is never left open longer than this, whatever the flags say.
const SAFETY_CUTOFF_MINUTES: i64 = 60;

/// Used when a configured duration is outside 1..=59 minutes.
const DEFAULT_DURATION_MINUTES: i64 = 5;

pub fn clamp_duration(minutes: i32) -> Duration {
    if (1..60).contains(&minutes) {
        Duration::minutes(i64::from(minutes))
    } else {
        Duration::minutes(DEFAULT_DURATION_MINUTES)
    }
}

/// First occurrence of `time` at or after `now`.
fn first_occurrence(now: NaiveDateTime, time: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(time);
    if now.time() > time {
        today + Duration::days(1)
    } else {
        today
    }
}

pub struct WateringController {
    clock: Arc<dyn Clock>,
    schedule_time: NaiveTime,
    next_scheduled_start: NaiveDateTime,
    next_off: Option<NaiveDateTime>,
    last_on_at: Option<NaiveDateTime>,
    /// The current run was started by the manual flag, so clearing the
    /// flag cancels it.
    manual_session: bool,
}

impl WateringController {
    pub fn new(clock: Arc<dyn Clock>, settings: &PoolSettings) -> Self {
        let schedule_time = settings.watering_schedule_time;
        let next_scheduled_start = first_occurrence(clock.now(), schedule_time);
        Self {
            clock,
            schedule_time,
            next_scheduled_start,
            next_off: None,
            last_on_at: None,
            manual_session: false,
        }
    }

    pub fn next_schedule(&self) -> NaiveDateTime {
        self.next_scheduled_start
    }

    /// Recompute the next scheduled start from new settings.
    pub fn reset_settings(&mut self, settings: &PoolSettings) {
        self.schedule_time = settings.watering_schedule_time;
        self.next_scheduled_start = first_occurrence(self.clock.now(), self.schedule_time);
    }

    /// The running window, or the next scheduled one when enabled.
    pub fn cycles(&self, state: &SystemState) -> Vec<Cycle> {
        if let Some(end) = self.next_off {
            return vec![Cycle {
                start: self.last_on_at.unwrap_or(end),
                end,
            }];
        }
        if state.watering_schedule_enabled.value {
            let start = self.next_scheduled_start;
            return vec![Cycle {
                start,
                end: start + clamp_duration(state.watering_schedule_duration.value),
            }];
        }
        Vec::new()
    }

    pub fn process(&mut self, state: &mut SystemState, hw: &mut dyn Hardware) -> Result<()> {
        let now = self.clock.now();
        let current = hw.output(PinName::Watering);

        if let Some(on_at) = self.last_on_at {
            if now - on_at > Duration::minutes(SAFETY_CUTOFF_MINUTES) {
                warn!(since = %on_at, "watering safety cutoff");
                if current {
                    hw.write(PinName::Watering, false)?;
                }
                self.end_session(state, now);
                return Ok(());
            }
        }

        let mut watering = current;
        let mut started = false;

        if state.watering_schedule_enabled.value && now >= self.next_scheduled_start {
            let duration = clamp_duration(state.watering_schedule_duration.value);
            watering = true;
            started = true;
            self.last_on_at = Some(now);
            self.next_off = Some(now + duration);
            self.manual_session = false;
            while self.next_scheduled_start <= now {
                self.next_scheduled_start += Duration::days(1);
            }
            info!(
                minutes = duration.num_minutes(),
                next = %self.next_scheduled_start,
                "scheduled watering"
            );
        }

        if state.watering_manual_on.value && !watering {
            let duration = clamp_duration(state.watering_manual_duration.value);
            watering = true;
            started = true;
            self.last_on_at = Some(now);
            self.next_off = Some(now + duration);
            self.manual_session = true;
            info!(minutes = duration.num_minutes(), "manual watering");
        }

        if !started && watering && self.manual_session && !state.watering_manual_on.value {
            info!("manual watering cancelled");
            watering = false;
        }

        if self.next_off.is_some_and(|off| now >= off) {
            watering = false;
        }

        if watering != current {
            hw.write(PinName::Watering, watering)?;
            if !watering {
                self.end_session(state, now);
                info!("watering stopped");
            }
        }
        Ok(())
    }

    /// Any session ends one-shot: the manual flag drops with it.
    fn end_session(&mut self, state: &mut SystemState, now: NaiveDateTime) {
        self.next_off = None;
        self.last_on_at = None;
        self.manual_session = false;
        if state.watering_manual_on.value {
            state.watering_manual_on.update(false, now);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, FakeHardware, ManualClock};

    fn setup(now: NaiveDateTime) -> (Arc<ManualClock>, WateringController, FakeHardware) {
        let clock = ManualClock::new(now);
        let watering = WateringController::new(clock.clone(), &PoolSettings::default());
        (clock, watering, FakeHardware::new())
    }

    // -- Duration clamp ---------------------------------------------------

    #[test]
    fn clamp_keeps_valid_durations() {
        assert_eq!(clamp_duration(1), Duration::minutes(1));
        assert_eq!(clamp_duration(59), Duration::minutes(59));
    }

    #[test]
    fn clamp_replaces_out_of_range_durations() {
        assert_eq!(clamp_duration(0), Duration::minutes(5));
        assert_eq!(clamp_duration(60), Duration::minutes(5));
        assert_eq!(clamp_duration(-3), Duration::minutes(5));
    }

    // -- Initial schedule -------------------------------------------------

    #[test]
    fn first_schedule_is_today_before_the_time() {
        let (_clock, w, _hw) = setup(at(1, 6, 0));
        assert_eq!(w.next_schedule(), at(1, 7, 0));
    }

    #[test]
    fn first_schedule_is_tomorrow_after_the_time() {
        let (_clock, w, _hw) = setup(at(1, 7, 1));
        assert_eq!(w.next_schedule(), at(2, 7, 0));
    }

    #[test]
    fn reset_settings_recomputes_schedule() {
        let (_clock, mut w, _hw) = setup(at(1, 6, 0));
        let settings = PoolSettings {
            watering_schedule_time: NaiveTime::from_hms_opt(5, 30, 0).unwrap(),
            ..PoolSettings::default()
        };
        w.reset_settings(&settings);
        assert_eq!(w.next_schedule(), at(2, 5, 30));
    }

    // -- Schedule -----------------------------------------------------------

    #[test]
    fn schedule_runs_for_configured_duration() {
        let (clock, mut w, mut hw) = setup(at(1, 6, 0));
        let mut state = SystemState::default();
        state.watering_schedule_enabled.update(true, at(1, 6, 0));

        clock.set(at(1, 7, 0));
        w.process(&mut state, &mut hw).unwrap();
        assert!(hw.output(PinName::Watering));
        assert_eq!(w.next_schedule(), at(2, 7, 0));

        // Manual flag is off, but a scheduled run is not cancelled by it.
        clock.set(at(1, 7, 1));
        w.process(&mut state, &mut hw).unwrap();
        assert!(hw.output(PinName::Watering));

        clock.set(at(1, 7, 15));
        w.process(&mut state, &mut hw).unwrap();
        assert!(!hw.output(PinName::Watering));
        assert_eq!(
            hw.take_writes(),
            vec![(PinName::Watering, true), (PinName::Watering, false)]
        );
    }

    #[test]
    fn disabled_schedule_does_nothing() {
        let (clock, mut w, mut hw) = setup(at(1, 6, 0));
        let mut state = SystemState::default();
        clock.set(at(1, 7, 30));
        w.process(&mut state, &mut hw).unwrap();
        assert!(hw.take_writes().is_empty());
    }

    #[test]
    fn missed_schedules_are_skipped_to_the_future() {
        let (clock, mut w, mut hw) = setup(at(1, 6, 0));
        let mut state = SystemState::default();
        state.watering_schedule_enabled.update(true, at(1, 6, 0));

        clock.set(at(4, 8, 0));
        w.process(&mut state, &mut hw).unwrap();
        assert_eq!(w.next_schedule(), at(5, 7, 0));
    }

    // -- Manual -------------------------------------------------------------

    #[test]
    fn manual_out_of_range_duration_uses_default_and_resets_flag() {
        let (clock, mut w, mut hw) = setup(at(1, 12, 0));
        let mut state = SystemState::default();
        state.watering_manual_duration.update(70, at(1, 12, 0));
        state.watering_manual_on.update(true, at(1, 12, 0));

        w.process(&mut state, &mut hw).unwrap();
        assert!(hw.output(PinName::Watering));
        assert_eq!(w.cycles(&state)[0].end, at(1, 12, 5));

        clock.set(at(1, 12, 4));
        w.process(&mut state, &mut hw).unwrap();
        assert!(hw.output(PinName::Watering));

        clock.set(at(1, 12, 5));
        w.process(&mut state, &mut hw).unwrap();
        assert!(!hw.output(PinName::Watering));
        assert!(!state.watering_manual_on.value);
        assert_eq!(state.watering_manual_on.time, at(1, 12, 5));
    }

    #[test]
    fn clearing_manual_flag_cancels_manual_session() {
        let (clock, mut w, mut hw) = setup(at(1, 12, 0));
        let mut state = SystemState::default();
        state.watering_manual_on.update(true, at(1, 12, 0));
        w.process(&mut state, &mut hw).unwrap();

        state.watering_manual_on.update(false, at(1, 12, 1));
        clock.set(at(1, 12, 1));
        w.process(&mut state, &mut hw).unwrap();
        assert!(!hw.output(PinName::Watering));
        assert!(w.cycles(&state).is_empty());
    }

    // -- Safety -------------------------------------------------------------

    #[test]
    fn safety_cutoff_after_one_hour() {
        let (clock, mut w, mut hw) = setup(at(1, 12, 0));
        let mut state = SystemState::default();
        state.watering_manual_duration.update(59, at(1, 12, 0));
        state.watering_manual_on.update(true, at(1, 12, 0));
        w.process(&mut state, &mut hw).unwrap();

        // Simulate the valve being kept open past its planned stop.
        w.next_off = None;
        clock.set(at(1, 13, 0));
        w.process(&mut state, &mut hw).unwrap();
        assert!(hw.output(PinName::Watering), "exactly one hour is allowed");

        clock.set(at(1, 13, 1));
        w.process(&mut state, &mut hw).unwrap();
        assert!(!hw.output(PinName::Watering));
        assert!(!state.watering_manual_on.value);
    }

    // -- Display ------------------------------------------------------------

    #[test]
    fn cycles_show_next_scheduled_window() {
        let (_clock, w, _hw) = setup(at(1, 6, 0));
        let mut state = SystemState::default();
        assert!(w.cycles(&state).is_empty());

        state.watering_schedule_enabled.update(true, at(1, 6, 0));
        assert_eq!(
            w.cycles(&state),
            vec![Cycle {
                start: at(1, 7, 0),
                end: at(1, 7, 15)
            }]
        );
    }
}
