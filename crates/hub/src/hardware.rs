//! Logical view of the pool hardware: named relays and buttons, the two
//! temperature probes, and the `Hardware` trait the controllers drive.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::config::{HardwareConfig, PinMode};
use crate::driver::Board;

// ---------------------------------------------------------------------------
// Names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinName {
    Pump,
    ChlorineInhibition,
    PhRegulationInhibition,
    SwimmingPoolLight,
    DeckLight,
    CoverPowerSupply,
    CoverPowerInverter,
    Watering,
    CoverButtonUp,
    CoverButtonDown,
}

impl PinName {
    pub const ALL: [PinName; 10] = [
        PinName::Pump,
        PinName::ChlorineInhibition,
        PinName::PhRegulationInhibition,
        PinName::SwimmingPoolLight,
        PinName::DeckLight,
        PinName::CoverPowerSupply,
        PinName::CoverPowerInverter,
        PinName::Watering,
        PinName::CoverButtonUp,
        PinName::CoverButtonDown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PinName::Pump => "Pump",
            PinName::ChlorineInhibition => "ChlorineInhibition",
            PinName::PhRegulationInhibition => "PhRegulationInhibition",
            PinName::SwimmingPoolLight => "SwimmingPoolLight",
            PinName::DeckLight => "DeckLight",
            PinName::CoverPowerSupply => "CoverPowerSupply",
            PinName::CoverPowerInverter => "CoverPowerInverter",
            PinName::Watering => "Watering",
            PinName::CoverButtonUp => "CoverButtonUp",
            PinName::CoverButtonDown => "CoverButtonDown",
        }
    }

    /// Case-insensitive lookup, as used by the HTTP switch routes.
    pub fn parse(name: &str) -> Option<PinName> {
        PinName::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(name))
    }

    /// Buttons are the only inputs; everything else drives a relay.
    pub fn is_input(self) -> bool {
        matches!(self, PinName::CoverButtonUp | PinName::CoverButtonDown)
    }

    pub fn is_light(self) -> bool {
        matches!(self, PinName::SwimmingPoolLight | PinName::DeckLight)
    }
}

impl fmt::Display for PinName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TemperatureSensor {
    WaterTemperature,
    AirTemperature,
}

impl TemperatureSensor {
    pub const ALL: [TemperatureSensor; 2] = [
        TemperatureSensor::WaterTemperature,
        TemperatureSensor::AirTemperature,
    ];
}

impl fmt::Display for TemperatureSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TemperatureSensor::WaterTemperature => "WaterTemperature",
            TemperatureSensor::AirTemperature => "AirTemperature",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputState {
    pub pin: PinName,
    pub state: bool,
    pub description: String,
}

/// A level change on a button input; `state` is true while pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEvent {
    pub pin: PinName,
    pub state: bool,
}

// ---------------------------------------------------------------------------
// Hardware boundary
// ---------------------------------------------------------------------------

pub trait Hardware: Send {
    fn write(&mut self, pin: PinName, on: bool) -> Result<()>;

    /// Last value written to an output pin.
    fn output(&self, pin: PinName) -> bool;

    fn outputs(&self) -> Vec<OutputState>;

    /// Temperature in degrees, rounded to one decimal. A failed read yields
    /// the sentinel `0.0` rather than an error.
    fn read_temperature(&mut self, sensor: TemperatureSensor) -> f64;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Manager over the physical (or mock) board
// ---------------------------------------------------------------------------

pub struct HardwareManager {
    board: Board,
    outputs: Vec<OutputState>,
    sensors: HashMap<TemperatureSensor, String>,
}

impl HardwareManager {
    /// Validate the pin table, open the board with every relay off, and
    /// start relaying button edges to `inputs`.
    pub fn open(config: &HardwareConfig, inputs: UnboundedSender<InputEvent>) -> Result<Self> {
        config.validate()?;
        print_pin_table(config);

        let board = Board::open(config, inputs)?;

        let outputs = config
            .pins
            .iter()
            .filter(|p| p.mode == PinMode::Output)
            .map(|p| OutputState {
                pin: p.name,
                state: false,
                description: p.description.clone(),
            })
            .collect();
        let sensors = config
            .sensors
            .iter()
            .map(|s| (s.name, s.device_id.clone()))
            .collect();

        info!("hardware initialised");
        Ok(Self {
            board,
            outputs,
            sensors,
        })
    }
}

fn print_pin_table(config: &HardwareConfig) {
    for p in &config.pins {
        info!(
            gpio = p.gpio,
            pin = %p.name,
            mode = ?p.mode,
            description = %p.description,
            "pin mapping"
        );
    }
    for s in &config.sensors {
        info!(
            sensor = %s.name,
            device_id = %s.device_id,
            description = %s.description,
            "temperature sensor"
        );
    }
}

impl Hardware for HardwareManager {
    fn write(&mut self, pin: PinName, on: bool) -> Result<()> {
        info!(%pin, on, "output write");
        self.board.set(pin, on)?;
        if let Some(o) = self.outputs.iter_mut().find(|o| o.pin == pin) {
            o.state = on;
        }
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
        let Some(device_id) = self.sensors.get(&sensor) else {
            warn!(%sensor, "temperature sensor not configured");
            return 0.0;
        };
        match self.board.read_temperature(device_id) {
            Ok(value) => round1(value),
            Err(e) => {
                warn!(%sensor, device_id = %device_id, "temperature read failed: {e:#}");
                0.0
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        let pins: Vec<PinName> = self.outputs.iter().map(|o| o.pin).collect();
        for pin in pins {
            self.write(pin, false)?;
        }
        self.board.close();
        info!("hardware stopped");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
