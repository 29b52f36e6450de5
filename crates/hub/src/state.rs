use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::cover::CoverState;
use crate::cycles::{Cycle, PumpCycle};
use crate::hardware::{OutputState, PinName};
use crate::sample::Sample;
use crate::settings::{PoolSettings, WorkingMode};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedStatus = Arc<RwLock<Snapshot>>;

// ---------------------------------------------------------------------------
// Persisted system state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub water_temperature: Sample<f64>,
    pub pool_temperature: Sample<f64>,
    pub air_temperature: Sample<f64>,
    pub pool_temperature_decision: Sample<f64>,
    pub pool_temperature_min_of_day: Sample<f64>,
    pub pool_temperature_max_of_day: Sample<f64>,
    pub pumping_duration_per_day_hours: Sample<f64>,
    pub pump: Sample<bool>,
    pub pump_force_on: Sample<bool>,
    pub pump_force_off: Sample<bool>,
    pub watering_schedule_enabled: Sample<bool>,
    pub watering_manual_on: Sample<bool>,
    /// Minutes.
    pub watering_schedule_duration: Sample<i32>,
    /// Minutes.
    pub watering_manual_duration: Sample<i32>,
}

/// Timestamp of every sample in a fresh state, old enough that the first
/// tick refreshes readings and rolls the day over.
fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

impl Default for SystemState {
    fn default() -> Self {
        let t = epoch();
        Self {
            water_temperature: Sample::new(t, 23.0),
            pool_temperature: Sample::new(t, 23.0),
            air_temperature: Sample::new(t, 23.0),
            pool_temperature_decision: Sample::new(t, 23.0),
            pool_temperature_min_of_day: Sample::new(t, -1.0),
            pool_temperature_max_of_day: Sample::new(t, -1.0),
            pumping_duration_per_day_hours: Sample::new(t, 1.0),
            pump: Sample::new(t, false),
            pump_force_on: Sample::new(t, false),
            pump_force_off: Sample::new(t, false),
            watering_schedule_enabled: Sample::new(t, false),
            watering_manual_on: Sample::new(t, false),
            watering_schedule_duration: Sample::new(t, 15),
            watering_manual_duration: Sample::new(t, 10),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Variable {
    pub name: &'static str,
    pub value: Value,
    pub time: NaiveDateTime,
}

fn variable<T: Serialize>(name: &'static str, sample: &Sample<T>) -> Variable {
    Variable {
        name,
        value: serde_json::to_value(&sample.value).unwrap_or(Value::Null),
        time: sample.time,
    }
}

impl SystemState {
    /// Readings and the pump relay describe the physical world at the
    /// moment they were taken; after a restart they are re-acquired rather
    /// than trusted.
    pub fn reset_volatile(&mut self) {
        let fresh = SystemState::default();
        self.air_temperature = fresh.air_temperature;
        self.water_temperature = fresh.water_temperature;
        self.pump = fresh.pump;
    }

    /// Flat listing of every sample, for the diagnostics page.
    pub fn variables(&self) -> Vec<Variable> {
        vec![
            variable("water_temperature", &self.water_temperature),
            variable("pool_temperature", &self.pool_temperature),
            variable("air_temperature", &self.air_temperature),
            variable("pool_temperature_decision", &self.pool_temperature_decision),
            variable("pool_temperature_min_of_day", &self.pool_temperature_min_of_day),
            variable("pool_temperature_max_of_day", &self.pool_temperature_max_of_day),
            variable(
                "pumping_duration_per_day_hours",
                &self.pumping_duration_per_day_hours,
            ),
            variable("pump", &self.pump),
            variable("pump_force_on", &self.pump_force_on),
            variable("pump_force_off", &self.pump_force_off),
            variable("watering_schedule_enabled", &self.watering_schedule_enabled),
            variable("watering_manual_on", &self.watering_manual_on),
            variable("watering_schedule_duration", &self.watering_schedule_duration),
            variable("watering_manual_duration", &self.watering_manual_duration),
        ]
    }
}

// ---------------------------------------------------------------------------
// Published snapshot (what the API reads)
// ---------------------------------------------------------------------------

pub struct Snapshot {
    pub started_at: Instant,
    pub state: SystemState,
    pub settings: Arc<PoolSettings>,
    pub outputs: Vec<OutputState>,
    pub pump_cycles: Vec<PumpCycle>,
    pub frost_protection_until: Option<NaiveDateTime>,
    pub cover: CoverState,
    pub watering_cycles: Vec<Cycle>,
    pub next_watering: NaiveDateTime,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: NaiveDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Pump,
    Cover,
    Watering,
    Settings,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub summer_mode: bool,
    pub status: String,
    pub water_temperature: f64,
    pub pool_temperature: f64,
    pub air_temperature: f64,
    pub pool_temperature_decision: f64,
    pub pumping_duration_per_day_hours: f64,
    pub pump: bool,
    pub pump_force_on: bool,
    pub pump_force_off: bool,
    pub chlorine_inhibition: bool,
    pub ph_regulation_inhibition: bool,
    pub watering: bool,
    pub swimming_pool_light: bool,
    pub deck_light: bool,
    pub cover: CoverState,
    pub uptime_secs: u64,
}

#[derive(Serialize)]
pub struct DetailsResponse {
    pub state: SystemState,
    pub settings: PoolSettings,
    pub outputs: Vec<OutputState>,
    pub pump_cycles: Vec<PumpCycle>,
    pub frost_protection_until: Option<NaiveDateTime>,
    pub cover: CoverState,
    pub watering_cycles: Vec<Cycle>,
    pub next_watering: NaiveDateTime,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Snapshot {
    pub fn new(state: SystemState, settings: Arc<PoolSettings>, next_watering: NaiveDateTime) -> Self {
        Self {
            started_at: Instant::now(),
            state,
            settings,
            outputs: Vec::new(),
            pump_cycles: Vec::new(),
            frost_protection_until: None,
            cover: CoverState::Idle,
            watering_cycles: Vec::new(),
            next_watering,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn output(&self, pin: PinName) -> bool {
        self.outputs
            .iter()
            .find(|o| o.pin == pin)
            .is_some_and(|o| o.state)
    }

    /// One-line human summary of what the pump is doing.
    pub fn status_text(&self) -> String {
        let forced = self.state.pump_force_on.value || self.state.pump_force_off.value;
        if forced {
            return "manual mode".to_string();
        }
        if let Some(until) = self.frost_protection_until {
            return format!("frost protection until {}", until.format("%H:%M"));
        }
        match self.pump_cycles.first() {
            Some(c) if self.output(PinName::Pump) => {
                format!("running until {}", c.end.format("%H:%M"))
            }
            Some(c) => format!(
                "next cycle from {} to {}",
                c.start.format("%H:%M"),
                c.end.format("%H:%M")
            ),
            None => "no cycle scheduled".to_string(),
        }
    }

    /// Build the JSON-serialisable general status.
    pub fn to_status(&self) -> StatusResponse {
        let s = &self.state;
        StatusResponse {
            summer_mode: self.settings.working_mode == WorkingMode::Summer,
            status: self.status_text(),
            water_temperature: s.water_temperature.value,
            pool_temperature: s.pool_temperature.value,
            air_temperature: s.air_temperature.value,
            pool_temperature_decision: s.pool_temperature_decision.value,
            pumping_duration_per_day_hours: s.pumping_duration_per_day_hours.value,
            pump: self.output(PinName::Pump),
            pump_force_on: s.pump_force_on.value,
            pump_force_off: s.pump_force_off.value,
            chlorine_inhibition: self.output(PinName::ChlorineInhibition),
            ph_regulation_inhibition: self.output(PinName::PhRegulationInhibition),
            watering: self.output(PinName::Watering),
            swimming_pool_light: self.output(PinName::SwimmingPoolLight),
            deck_light: self.output(PinName::DeckLight),
            cover: self.cover,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn to_details(&self) -> DetailsResponse {
        DetailsResponse {
            state: self.state.clone(),
            settings: self.settings.as_ref().clone(),
            outputs: self.outputs.clone(),
            pump_cycles: self.pump_cycles.clone(),
            frost_protection_until: self.frost_protection_until,
            cover: self.cover,
            watering_cycles: self.watering_cycles.clone(),
            next_watering: self.next_watering,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    pub fn push_event(&mut self, ts: NaiveDateTime, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent { ts, kind, detail });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
