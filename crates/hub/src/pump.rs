//! Filtration pump control.
//!
//! Each tick runs, in order: forcing decay, temperature acquisition, daily
//! rollover of the decision temperature, arbitration between forcing,
//! scheduled cycles and frost protection, and finally the relay switch.

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::cycles::{self, PumpCycle};
use crate::hardware::{round1, Hardware, PinName, TemperatureSensor};
use crate::settings::{PoolSettings, WorkingMode};
use crate::state::SystemState;

/// Minimum age of a reading before the sensor is polled again.
const READING_INTERVAL_SECS: i64 = 60;
/// Water at the probe stands for the pool only after this much circulation.
const WARM_UP_SECS: i64 = 900;
/// A forcing flag left set longer than this is cleared.
const FORCING_TIMEOUT_HOURS: i64 = 36;
/// Days projected ahead, and the queue length below which we re-project.
const PROJECTION_DAYS: u32 = 3;
/// Pause between the inhibition relays and the pump relay.
const INHIBITION_SETTLE: std::time::Duration = std::time::Duration::from_millis(200);

/// What the pump is doing this tick, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PumpDirective {
    Off,
    Forced { on: bool },
    Scheduled(PumpCycle),
    FrostProtection { until: NaiveDateTime },
}

/// The run currently holding the pump on, when no forcing interferes.
#[derive(Debug, Clone, PartialEq)]
enum ActiveRun {
    Scheduled(PumpCycle),
    FrostProtection { until: NaiveDateTime },
}

impl ActiveRun {
    fn end(&self) -> NaiveDateTime {
        match self {
            ActiveRun::Scheduled(c) => c.end,
            ActiveRun::FrostProtection { until } => *until,
        }
    }

    /// (chlorine, ph) inhibition levels to apply while this run pumps.
    fn inhibitions(&self) -> (bool, bool) {
        match self {
            ActiveRun::Scheduled(c) => (c.chlorine_inhibition, c.ph_inhibition),
            ActiveRun::FrostProtection { .. } => (false, false),
        }
    }
}

pub struct PumpController {
    clock: Arc<dyn Clock>,
    active: Option<ActiveRun>,
    next_cycles: VecDeque<PumpCycle>,
    pump_on: bool,
    /// (chlorine, ph) levels last written.
    inhibitions: (bool, bool),
    directive: PumpDirective,
}

impl PumpController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            active: None,
            next_cycles: VecDeque::new(),
            pump_on: false,
            inhibitions: (false, false),
            directive: PumpDirective::Off,
        }
    }

    pub fn directive(&self) -> &PumpDirective {
        &self.directive
    }

    /// Drop the projected queue; the next tick projects from the new settings.
    pub fn reset_settings(&mut self) {
        self.next_cycles.clear();
    }

    /// Running scheduled cycle first, then the pending queue.
    pub fn cycles(&self) -> Vec<PumpCycle> {
        let current = match &self.active {
            Some(ActiveRun::Scheduled(c)) => Some(c.clone()),
            _ => None,
        };
        current
            .into_iter()
            .chain(self.next_cycles.iter().cloned())
            .collect()
    }

    pub fn frost_protection_until(&self) -> Option<NaiveDateTime> {
        match self.active {
            Some(ActiveRun::FrostProtection { until }) => Some(until),
            _ => None,
        }
    }

    pub async fn process(
        &mut self,
        settings: &PoolSettings,
        state: &mut SystemState,
        hw: &mut dyn Hardware,
    ) -> Result<()> {
        let now = self.clock.now();

        decay_forcing(state, now);
        acquire_temperatures(state, hw, now);
        if state.pool_temperature_max_of_day.time.date() < now.date() {
            self.rollover(settings, state, now);
        }

        let directive = self.arbitrate(settings, state, now);
        let on = match directive {
            PumpDirective::Off => false,
            PumpDirective::Forced { on } => on,
            PumpDirective::Scheduled(_) | PumpDirective::FrostProtection { .. } => true,
        };
        self.directive = directive;

        if on != self.pump_on {
            self.switch(on, state, hw, now).await?;
        } else if on {
            self.follow_run_inhibitions(hw)?;
        }
        Ok(())
    }

    fn arbitrate(
        &mut self,
        settings: &PoolSettings,
        state: &SystemState,
        now: NaiveDateTime,
    ) -> PumpDirective {
        if state.pump_force_off.value {
            return PumpDirective::Forced { on: false };
        }
        if state.pump_force_on.value {
            return PumpDirective::Forced { on: true };
        }

        if let Some(ActiveRun::Scheduled(cycle)) = &self.active {
            if now < cycle.end {
                return PumpDirective::Scheduled(cycle.clone());
            }
        }

        if let Some(run) = &self.active {
            if now >= run.end() {
                info!(end = %run.end(), "pump run finished");
                self.active = None;
                self.project(settings, state, now);
            }
        } else if self.next_cycles.len() < PROJECTION_DAYS as usize {
            self.project(settings, state, now);
        }

        // A due cycle takes over from a running frost protection run.
        if let Some(cycle) = self.promote(now) {
            info!(start = %cycle.start, end = %cycle.end, "pump cycle started");
            let run = ActiveRun::Scheduled(cycle);
            let directive = directive_for(&run);
            self.active = Some(run);
            return directive;
        }
        if let Some(run) = &self.active {
            return directive_for(run);
        }

        if settings.working_mode == WorkingMode::Winter
            && state.water_temperature.value < settings.frost_protection.activation_temperature
        {
            let minutes = settings.frost_protection.recycling_duration_minutes;
            let until = now + Duration::seconds((minutes * 60.0).round() as i64);
            info!(
                water = state.water_temperature.value,
                until = %until,
                "frost protection"
            );
            let run = ActiveRun::FrostProtection { until };
            let directive = directive_for(&run);
            self.active = Some(run);
            return directive;
        }

        PumpDirective::Off
    }

    /// Once per calendar day: derive the decision temperature from
    /// yesterday's extremes, reseed them, and re-project.
    fn rollover(&mut self, settings: &PoolSettings, state: &mut SystemState, now: NaiveDateTime) {
        let min = state.pool_temperature_min_of_day.value;
        let max = state.pool_temperature_max_of_day.value;

        if plausible(min) && plausible(max) {
            let decision = round1((min + max) / 2.0);
            let hours = settings.pumping_hours(decision);
            state.pool_temperature_decision.update(decision, now);
            state.pumping_duration_per_day_hours.update(hours, now);
            info!(min, max, decision, hours, "daily rollover");
        } else {
            info!(min, max, "daily rollover without usable extremes");
        }

        let pool = state.pool_temperature.value;
        state.pool_temperature_min_of_day.update(pool, now);
        state.pool_temperature_max_of_day.update(pool, now);
        self.project(settings, state, now);
    }

    /// Drop every expired cycle and take the first one whose start has
    /// arrived, wherever it sits in the queue.
    fn promote(&mut self, now: NaiveDateTime) -> Option<PumpCycle> {
        self.next_cycles.retain(|c| {
            if c.end <= now {
                debug!(start = %c.start, end = %c.end, "dropping expired cycle");
            }
            c.end > now
        });
        let index = self.next_cycles.iter().position(|c| c.start <= now)?;
        self.next_cycles.remove(index)
    }

    fn project(&mut self, settings: &PoolSettings, state: &SystemState, now: NaiveDateTime) {
        let daily = Duration::seconds(
            (state.pumping_duration_per_day_hours.value * 3600.0).round() as i64,
        );
        let mut next = cycles::project(
            settings.groups_for_mode(),
            state.pool_temperature_decision.value,
            daily,
            now,
            PROJECTION_DAYS,
        );
        if let Some(ActiveRun::Scheduled(current)) = &self.active {
            next.retain(|c| c != current);
        }
        debug!(count = next.len(), "pump cycles projected");
        self.next_cycles = next.into();
    }

    /// On: inhibitions first, then flow. Off: flow stops, then dosing is
    /// released.
    async fn switch(
        &mut self,
        on: bool,
        state: &mut SystemState,
        hw: &mut dyn Hardware,
        now: NaiveDateTime,
    ) -> Result<()> {
        if on {
            if let Some(run) = &self.active {
                let (chlorine, ph) = run.inhibitions();
                hw.write(PinName::ChlorineInhibition, chlorine)?;
                hw.write(PinName::PhRegulationInhibition, ph)?;
                self.inhibitions = (chlorine, ph);
                tokio::time::sleep(INHIBITION_SETTLE).await;
            }
            hw.write(PinName::Pump, true)?;
        } else {
            hw.write(PinName::Pump, false)?;
            tokio::time::sleep(INHIBITION_SETTLE).await;
            hw.write(PinName::ChlorineInhibition, false)?;
            hw.write(PinName::PhRegulationInhibition, false)?;
            self.inhibitions = (false, false);
        }
        self.pump_on = on;
        state.pump.update(on, now);
        info!(on, "pump switched");
        Ok(())
    }

    /// Pump already running: a run handing over to another one brings its
    /// own inhibition levels.
    fn follow_run_inhibitions(&mut self, hw: &mut dyn Hardware) -> Result<()> {
        let Some(run) = &self.active else {
            return Ok(());
        };
        let wanted = run.inhibitions();
        if wanted != self.inhibitions {
            hw.write(PinName::ChlorineInhibition, wanted.0)?;
            hw.write(PinName::PhRegulationInhibition, wanted.1)?;
            self.inhibitions = wanted;
            debug!(chlorine = wanted.0, ph = wanted.1, "inhibitions follow the active run");
        }
        Ok(())
    }
}

fn directive_for(run: &ActiveRun) -> PumpDirective {
    match run {
        ActiveRun::Scheduled(c) => PumpDirective::Scheduled(c.clone()),
        ActiveRun::FrostProtection { until } => PumpDirective::FrostProtection { until: *until },
    }
}

/// Daily extremes outside (0, 40) mean the day was not sampled.
fn plausible(temperature: f64) -> bool {
    temperature > 0.0 && temperature < 40.0
}

fn decay_forcing(state: &mut SystemState, now: NaiveDateTime) {
    let timeout = Duration::hours(FORCING_TIMEOUT_HOURS);
    for (name, flag) in [
        ("force_on", &mut state.pump_force_on),
        ("force_off", &mut state.pump_force_off),
    ] {
        if flag.value && now - flag.time > timeout {
            info!(flag = name, since = %flag.time, "pump forcing expired");
            flag.update(false, now);
        }
    }
}

fn acquire_temperatures(state: &mut SystemState, hw: &mut dyn Hardware, now: NaiveDateTime) {
    let interval = Duration::seconds(READING_INTERVAL_SECS);

    if now - state.air_temperature.time >= interval {
        let air = hw.read_temperature(TemperatureSensor::AirTemperature);
        state.air_temperature.update(air, now);
    }

    if now - state.water_temperature.time < interval {
        return;
    }
    let water = hw.read_temperature(TemperatureSensor::WaterTemperature);
    state.water_temperature.update(water, now);

    let warmed_up = state.pump.value && now - state.pump.time >= Duration::seconds(WARM_UP_SECS);
    if !warmed_up {
        return;
    }
    state.pool_temperature.update(water, now);
    let min = &mut state.pool_temperature_min_of_day;
    if min.value <= 0.0 || water < min.value {
        min.update_value_only(water);
    }
    let max = &mut state.pool_temperature_max_of_day;
    if water > max.value {
        max.update_value_only(water);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
