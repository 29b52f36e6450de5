//! Board access. The `gpio` feature gates the real rppal driver with 1-wire
//! temperature probes; without it, a mock board logs writes and reports a
//! fixed temperature.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{HardwareConfig, PinMode};
use crate::hardware::{InputEvent, PinName};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};

/// sysfs root of the 1-wire bus.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
const W1_DEVICES: &str = "/sys/bus/w1/devices";

// ---------------------------------------------------------------------------
// Real GPIO board (production, requires rppal and a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct Board {
    outputs: HashMap<PinName, OutputPin>,
    inputs: Vec<InputPin>, // dropping an input stops its interrupt thread
    active_low: bool,      // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl Board {
    pub(crate) fn open(config: &HardwareConfig, events: UnboundedSender<InputEvent>) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;
        let mut outputs = HashMap::new();
        let mut inputs = Vec::new();

        for p in &config.pins {
            let number = u8::try_from(p.gpio)
                .with_context(|| format!("pin '{}': gpio {} out of range", p.name, p.gpio))?;
            let pin = gpio
                .get(number)
                .with_context(|| format!("pin '{}': gpio {number} unavailable", p.name))?;

            match p.mode {
                PinMode::Output => {
                    let mut out = pin.into_output();
                    // Fail-safe: ensure "OFF" at startup
                    drive(&mut out, false, config.active_low);
                    outputs.insert(p.name, out);
                }
                PinMode::Input => {
                    let mut input = pin.into_input_pullup();
                    let name = p.name;
                    let tx = events.clone();
                    // Buttons pull the line to ground while pressed.
                    input
                        .set_async_interrupt(Trigger::Both, move |level: Level| {
                            let _ = tx.send(InputEvent {
                                pin: name,
                                state: level == Level::Low,
                            });
                        })
                        .with_context(|| format!("pin '{name}': failed to watch gpio {number}"))?;
                    inputs.push(input);
                }
            }
        }

        Ok(Self {
            outputs,
            inputs,
            active_low: config.active_low,
        })
    }

    pub(crate) fn set(&mut self, pin: PinName, on: bool) -> Result<()> {
        let Some(out) = self.outputs.get_mut(&pin) else {
            bail!("pin '{pin}' is not an output");
        };
        drive(out, on, self.active_low);
        Ok(())
    }

    pub(crate) fn read_temperature(&self, device_id: &str) -> Result<f64> {
        let path = format!("{W1_DEVICES}/{device_id}/w1_slave");
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {path}"))?;
        parse_w1_slave(&contents)
    }

    pub(crate) fn close(&mut self) {
        for input in &mut self.inputs {
            if let Err(e) = input.clear_async_interrupt() {
                tracing::warn!("failed to release input interrupt: {e}");
            }
        }
    }
}

#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, on: bool, active_low: bool) {
    // active-low relay: LOW = ON, HIGH = OFF
    if on != active_low {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

// ---------------------------------------------------------------------------
// Mock board (development: no hardware, logs state)
// ---------------------------------------------------------------------------

/// Reading reported by the mock board for every probe.
#[cfg(not(feature = "gpio"))]
const MOCK_TEMPERATURE: f64 = 27.8;

#[cfg(not(feature = "gpio"))]
pub(crate) struct Board {
    outputs: HashMap<PinName, bool>,
    #[cfg_attr(not(test), allow(dead_code))]
    events: UnboundedSender<InputEvent>,
}

#[cfg(not(feature = "gpio"))]
impl Board {
    pub(crate) fn open(config: &HardwareConfig, events: UnboundedSender<InputEvent>) -> Result<Self> {
        let mut outputs = HashMap::new();
        for p in &config.pins {
            tracing::debug!(pin = %p.name, gpio = p.gpio, "[mock-gpio] registered (not wired)");
            if p.mode == PinMode::Output {
                outputs.insert(p.name, false);
            }
        }
        tracing::info!("[mock-gpio] board initialised (no hardware)");
        Ok(Self { outputs, events })
    }

    pub(crate) fn set(&mut self, pin: PinName, on: bool) -> Result<()> {
        let Some(state) = self.outputs.get_mut(&pin) else {
            bail!("pin '{pin}' is not an output");
        };
        *state = on;
        tracing::debug!(%pin, on, "[mock-gpio] set");
        Ok(())
    }

    pub(crate) fn read_temperature(&self, _device_id: &str) -> Result<f64> {
        Ok(MOCK_TEMPERATURE)
    }

    pub(crate) fn close(&mut self) {
        tracing::info!("[mock-gpio] board closed");
    }

    /// Inject a button edge as if the interrupt thread had seen it.
    #[cfg(test)]
    pub(crate) fn simulate_input(&self, pin: PinName, state: bool) {
        let _ = self.events.send(InputEvent { pin, state });
    }
}

// ---------------------------------------------------------------------------
// 1-wire
// ---------------------------------------------------------------------------

/// Parse the two-line `w1_slave` output of a DS18B20:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
#[cfg_attr(not(any(test, feature = "gpio")), allow(dead_code))]
pub(crate) fn parse_w1_slave(contents: &str) -> Result<f64> {
    let mut lines = contents.lines();
    let crc = lines.next().context("empty w1_slave output")?;
    if !crc.trim_end().ends_with("YES") {
        bail!("crc check failed: {crc}");
    }
    let data = lines.next().context("missing temperature line")?;
    let raw = data
        .rsplit_once("t=")
        .map(|(_, v)| v.trim())
        .context("no t= field in w1_slave output")?;
    let millidegrees: i64 = raw
        .parse()
        .with_context(|| format!("bad temperature value '{raw}'"))?;
    Ok(millidegrees as f64 / 1000.0)
}

// ===========================================================================
// Tests
// ===========================================================================
