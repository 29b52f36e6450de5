//! Test doubles shared by the controller tests.

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::hardware::{Hardware, OutputState, PinName, TemperatureSensor};

/// June 2024, so day numbers map straight to dates.
pub fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .expect("valid test timestamp")
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

/// In-memory outputs plus an ordered log of every write.
pub struct FakeHardware {
    outputs: Vec<OutputState>,
    temperatures: HashMap<TemperatureSensor, f64>,
    writes: Vec<(PinName, bool)>,
}

impl FakeHardware {
    pub fn new() -> Self {
        let outputs = PinName::ALL
            .into_iter()
            .filter(|p| !p.is_input())
            .map(|pin| OutputState {
                pin,
                state: false,
                description: pin.to_string(),
            })
            .collect();
        let temperatures = HashMap::from([
            (TemperatureSensor::WaterTemperature, 20.0),
            (TemperatureSensor::AirTemperature, 15.0),
        ]);
        Self {
            outputs,
            temperatures,
            writes: Vec::new(),
        }
    }

    pub fn set_temperature(&mut self, sensor: TemperatureSensor, value: f64) {
        self.temperatures.insert(sensor, value);
    }

    /// Writes since the last call, oldest first.
    pub fn take_writes(&mut self) -> Vec<(PinName, bool)> {
        std::mem::take(&mut self.writes)
    }
}

impl Hardware for FakeHardware {
    fn write(&mut self, pin: PinName, on: bool) -> Result<()> {
        let Some(o) = self.outputs.iter_mut().find(|o| o.pin == pin) else {
            bail!("pin '{pin}' is not an output");
        };
        o.state = on;
        self.writes.push((pin, on));
        Ok(())
    }

    fn output(&self, pin: PinName) -> bool {
        self.outputs
            .iter()
            .find(|o| o.pin == pin)
            .is_some_and(|o| o.state)
    }

    fn outputs(&self) -> Vec<OutputState> {
        self.outputs.clone()
    }

    fn read_temperature(&mut self, sensor: TemperatureSensor) -> f64 {
        self.temperatures.get(&sensor).copied().unwrap_or(0.0)
    }

    fn close(&mut self) -> Result<()> {
        let pins: Vec<PinName> = self.outputs.iter().map(|o| o.pin).collect();
        for pin in pins {
            self.write(pin, false)?;
        }
        Ok(())
    }
}
