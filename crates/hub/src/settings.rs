//! Operator-editable pool settings: pumping cycle templates per season, the
//! temperature to run-time table, frost protection and the watering time.
//!
//! Settings are replaced wholesale on save and are never mutated while a
//! tick is using them.

use anyhow::Result;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::config::report;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkingMode {
    Summer,
    Winter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// The cycle starts at the decision time.
    StartAt,
    /// The cycle ends at the decision time.
    StopAt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpCycleTemplate {
    pub decision_time: NaiveTime,
    pub kind: CycleKind,
    #[serde(default)]
    pub chlorine_inhibition: bool,
    #[serde(default)]
    pub ph_inhibition: bool,
    /// Share of the daily pumping budget, relative to the other templates
    /// of the same group.
    #[serde(default = "default_ratio")]
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpCycleGroup {
    pub minimum_temperature: f64,
    #[serde(default)]
    pub cycles: Vec<PumpCycleTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureRunTime {
    pub temperature: f64,
    pub run_time_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrostProtection {
    pub activation_temperature: f64,
    pub recycling_duration_minutes: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    pub working_mode: WorkingMode,
    pub cover_cycle_duration_secs: u32,
    pub summer_cycles: Vec<PumpCycleGroup>,
    pub winter_cycles: Vec<PumpCycleGroup>,
    pub temperature_run_time: Vec<TemperatureRunTime>,
    pub frost_protection: FrostProtection,
    pub watering_schedule_time: NaiveTime,
}

fn default_ratio() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default()
}

fn template(hour: u32, kind: CycleKind) -> PumpCycleTemplate {
    PumpCycleTemplate {
        decision_time: hm(hour, 0),
        kind,
        chlorine_inhibition: false,
        ph_inhibition: false,
        ratio: 1.0,
    }
}

impl Default for FrostProtection {
    fn default() -> Self {
        Self {
            activation_temperature: 7.0,
            recycling_duration_minutes: 15.0,
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        let run_time = [
            (15.0, 1.0),
            (18.0, 2.0),
            (20.0, 3.0),
            (21.0, 4.0),
            (22.0, 5.0),
            (23.0, 8.0),
            (25.0, 10.0),
            (26.0, 12.0),
            (28.0, 14.0),
            (30.0, 16.0),
        ];

        Self {
            working_mode: WorkingMode::Summer,
            cover_cycle_duration_secs: 90,
            summer_cycles: vec![PumpCycleGroup {
                minimum_temperature: 0.0,
                cycles: vec![
                    template(5, CycleKind::StopAt),
                    template(11, CycleKind::StartAt),
                    template(18, CycleKind::StopAt),
                ],
            }],
            winter_cycles: vec![PumpCycleGroup {
                minimum_temperature: 0.0,
                cycles: vec![template(4, CycleKind::StartAt)],
            }],
            temperature_run_time: run_time
                .iter()
                .map(|&(temperature, run_time_hours)| TemperatureRunTime {
                    temperature,
                    run_time_hours,
                })
                .collect(),
            frost_protection: FrostProtection::default(),
            watering_schedule_time: hm(7, 0),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries & validation
// ---------------------------------------------------------------------------

impl PoolSettings {
    /// Reject settings the controllers cannot run with. Every violation is
    /// reported, not just the first one.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.summer_cycles.is_empty() {
            errors.push("summer_cycles must contain at least one cycle group".into());
        }
        if self.winter_cycles.is_empty() {
            errors.push("winter_cycles must contain at least one cycle group".into());
        }

        report("settings", errors)
    }

    /// Cycle groups governing the current working mode.
    pub fn groups_for_mode(&self) -> &[PumpCycleGroup] {
        match self.working_mode {
            WorkingMode::Summer => &self.summer_cycles,
            WorkingMode::Winter => &self.winter_cycles,
        }
    }

    /// Daily pumping budget for a decision temperature: the run time of the
    /// highest table entry not above `temperature`, the lowest entry when
    /// none qualifies, or zero for an empty table.
    pub fn pumping_hours(&self, temperature: f64) -> f64 {
        let mut table: Vec<&TemperatureRunTime> = self.temperature_run_time.iter().collect();
        table.sort_by(|a, b| a.temperature.total_cmp(&b.temperature));

        table
            .iter()
            .rev()
            .find(|entry| entry.temperature <= temperature)
            .or(table.first())
            .map(|entry| entry.run_time_hours)
            .unwrap_or(0.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_validation_err(settings: &PoolSettings, needle: &str) {
        let err = settings.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Defaults ---------------------------------------------------------

    #[test]
    fn defaults_are_valid() {
        PoolSettings::default().validate().unwrap();
    }

    #[test]
    fn defaults_match_factory_schedule() {
        let s = PoolSettings::default();
        assert_eq!(s.working_mode, WorkingMode::Summer);
        assert_eq!(s.cover_cycle_duration_secs, 90);
        assert_eq!(s.summer_cycles[0].cycles.len(), 3);
        assert_eq!(s.summer_cycles[0].cycles[0].kind, CycleKind::StopAt);
        assert_eq!(s.winter_cycles[0].cycles[0].decision_time, hm(4, 0));
        assert_eq!(s.temperature_run_time.len(), 10);
        assert_eq!(s.frost_protection.activation_temperature, 7.0);
        assert_eq!(s.watering_schedule_time, hm(7, 0));
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn empty_summer_groups_rejected() {
        let s = PoolSettings {
            summer_cycles: vec![],
            ..PoolSettings::default()
        };
        assert_validation_err(&s, "summer_cycles");
    }

    #[test]
    fn empty_winter_groups_rejected() {
        let s = PoolSettings {
            winter_cycles: vec![],
            ..PoolSettings::default()
        };
        assert_validation_err(&s, "winter_cycles");
    }

    #[test]
    fn both_empty_reports_two_errors() {
        let s = PoolSettings {
            summer_cycles: vec![],
            winter_cycles: vec![],
            ..PoolSettings::default()
        };
        assert_validation_err(&s, "(2 errors)");
    }

    // -- Run-time lookup ----------------------------------------------------

    #[test]
    fn pumping_hours_is_a_step_function() {
        let s = PoolSettings::default();
        assert_eq!(s.pumping_hours(15.0), 1.0);
        assert_eq!(s.pumping_hours(19.9), 2.0);
        assert_eq!(s.pumping_hours(25.0), 10.0);
        assert_eq!(s.pumping_hours(35.0), 16.0);
    }

    #[test]
    fn pumping_hours_below_table_uses_first_entry() {
        assert_eq!(PoolSettings::default().pumping_hours(3.0), 1.0);
    }

    #[test]
    fn pumping_hours_empty_table_is_zero() {
        let s = PoolSettings {
            temperature_run_time: vec![],
            ..PoolSettings::default()
        };
        assert_eq!(s.pumping_hours(25.0), 0.0);
    }

    #[test]
    fn groups_follow_working_mode() {
        let mut s = PoolSettings::default();
        assert_eq!(s.groups_for_mode(), s.summer_cycles.as_slice());
        s.working_mode = WorkingMode::Winter;
        assert_eq!(s.groups_for_mode(), s.winter_cycles.as_slice());
    }

    // -- Serde --------------------------------------------------------------

    #[test]
    fn missing_ratio_defaults_to_one() {
        let json = r#"{"decision_time":"08:00:00","kind":"start_at"}"#;
        let t: PumpCycleTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(t.ratio, 1.0);
        assert!(!t.chlorine_inhibition);
    }

    #[test]
    fn json_roundtrip_preserves_settings() {
        let s = PoolSettings::default();
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"working_mode\":\"summer\""));
        let back: PoolSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
