//! Expands the cycle templates of the governing group into dated pump
//! cycles, several days ahead.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::settings::{CycleKind, PumpCycleGroup, PumpCycleTemplate};

/// Ratios outside this range are treated as 1.
const RATIO_RANGE: std::ops::RangeInclusive<f64> = 0.5..=4.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cycle {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PumpCycle {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub chlorine_inhibition: bool,
    pub ph_inhibition: bool,
}

/// One template with its share of the daily budget already resolved.
struct Slot {
    time: NaiveTime,
    kind: CycleKind,
    duration: Duration,
    chlorine_inhibition: bool,
    ph_inhibition: bool,
}

impl Slot {
    fn on(&self, day: NaiveDate) -> PumpCycle {
        let anchor = day.and_time(self.time);
        let (start, end) = match self.kind {
            CycleKind::StartAt => (anchor, anchor + self.duration),
            CycleKind::StopAt => (anchor - self.duration, anchor),
        };
        PumpCycle {
            start,
            end,
            chlorine_inhibition: self.chlorine_inhibition,
            ph_inhibition: self.ph_inhibition,
        }
    }
}

/// Pick the group with the greatest minimum temperature not above
/// `temperature`, falling back to the lowest-threshold group.
pub fn select_group(groups: &[PumpCycleGroup], temperature: f64) -> Option<&PumpCycleGroup> {
    let mut sorted: Vec<&PumpCycleGroup> = groups.iter().collect();
    sorted.sort_by(|a, b| a.minimum_temperature.total_cmp(&b.minimum_temperature));

    sorted
        .iter()
        .rev()
        .find(|g| g.minimum_temperature <= temperature)
        .or(sorted.first())
        .copied()
}

fn effective_ratio(template: &PumpCycleTemplate) -> f64 {
    if RATIO_RANGE.contains(&template.ratio) {
        template.ratio
    } else {
        1.0
    }
}

fn slots(group: &PumpCycleGroup, daily: Duration) -> Vec<Slot> {
    let total: f64 = group.cycles.iter().map(effective_ratio).sum();
    let daily_minutes = daily.num_seconds() as f64 / 60.0;

    group
        .cycles
        .iter()
        .map(|t| Slot {
            time: t.decision_time,
            kind: t.kind,
            duration: Duration::minutes((daily_minutes * effective_ratio(t) / total).round() as i64),
            chlorine_inhibition: t.chlorine_inhibition,
            ph_inhibition: t.ph_inhibition,
        })
        .collect()
}

/// Dated cycles for `days` calendar days starting at `now`'s date.
///
/// Cycles already finished at `now` are dropped. Order is day by day, then
/// template declaration order within a day; the result is not sorted by
/// start time.
pub fn project(
    groups: &[PumpCycleGroup],
    temperature: f64,
    daily: Duration,
    now: NaiveDateTime,
    days: u32,
) -> Vec<PumpCycle> {
    let Some(group) = select_group(groups, temperature) else {
        return Vec::new();
    };
    let slots = slots(group, daily);
    let today = now.date();

    (0..days)
        .map(|offset| today + Duration::days(i64::from(offset)))
        .flat_map(|day| slots.iter().map(move |slot| slot.on(day)))
        .filter(|cycle| cycle.end > now)
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
