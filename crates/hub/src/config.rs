//! TOML config file loading and validation: control loop period, relay
//! polarity, the GPIO pin table and the 1-wire temperature sensors.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::hardware::{PinName, TemperatureSensor};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_loop_delay_ms")]
    pub loop_delay_ms: u64,
    pub hardware: HardwareConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HardwareConfig {
    #[serde(default = "default_active_low")]
    pub active_low: bool,
    #[serde(default)]
    pub pins: Vec<PinEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    Input,
    Output,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinEntry {
    pub name: PinName,
    pub gpio: i64,
    pub mode: PinMode,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub name: TemperatureSensor,
    pub device_id: String,
    #[serde(default)]
    pub description: String,
}

fn default_loop_delay_ms() -> u64 {
    1000
}

fn default_active_low() -> bool {
    true
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Accepted range for the control loop period.
const LOOP_DELAY_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=60_000;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub(crate) fn report(what: &str, errors: Vec<String>) -> Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        bail!(
            "{what} validation failed ({} error{}):\n  - {}",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" },
            errors.join("\n  - ")
        );
    }
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !LOOP_DELAY_RANGE_MS.contains(&self.loop_delay_ms) {
            errors.push(format!(
                "loop_delay_ms {} out of range [{}, {}]",
                self.loop_delay_ms,
                LOOP_DELAY_RANGE_MS.start(),
                LOOP_DELAY_RANGE_MS.end()
            ));
        }
        self.hardware.collect_errors(&mut errors);

        report("config", errors)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }
}

impl HardwareConfig {
    /// Check the pin and sensor tables before the board is opened.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        self.collect_errors(&mut errors);
        report("hardware", errors)
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        self.validate_pins(errors);
        self.validate_sensors(errors);
    }

    fn validate_pins(&self, errors: &mut Vec<String>) {
        for name in PinName::ALL {
            let count = self.pins.iter().filter(|p| p.name == name).count();
            match count {
                0 => errors.push(format!("pin '{name}' is not configured")),
                1 => {}
                n => errors.push(format!("pin '{name}' is configured {n} times")),
            }
        }

        let mut seen_gpio: HashMap<i64, PinName> = HashMap::new();

        for p in &self.pins {
            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&p.gpio) {
                errors.push(format!(
                    "pin '{}': gpio {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    p.name, p.gpio
                ));
            } else if let Some(other) = seen_gpio.insert(p.gpio, p.name) {
                if other != p.name {
                    errors.push(format!(
                        "pin '{}': gpio {} is already used by pin '{other}'",
                        p.name, p.gpio
                    ));
                }
            }

            // ── Direction ───────────────────────────────────────
            let expected = if p.name.is_input() {
                PinMode::Input
            } else {
                PinMode::Output
            };
            if p.mode != expected {
                errors.push(format!(
                    "pin '{}' must be an {}",
                    p.name,
                    if expected == PinMode::Input { "input" } else { "output" }
                ));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        for name in TemperatureSensor::ALL {
            let count = self.sensors.iter().filter(|s| s.name == name).count();
            match count {
                0 => errors.push(format!("sensor '{name}' is not configured")),
                1 => {}
                n => errors.push(format!("sensor '{name}' is configured {n} times")),
            }
        }

        for s in &self.sensors {
            if s.device_id.trim().is_empty() {
                errors.push(format!("sensor '{}': device_id is empty", s.name));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        pins = config.hardware.pins.len(),
        sensors = config.hardware.sensors.len(),
        loop_delay_ms = config.loop_delay_ms,
        "config loaded"
    );

    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = include_str!("../config.example.toml");

    fn valid_config() -> Config {
        toml::from_str(EXAMPLE).unwrap()
    }

    fn pin_mut(cfg: &mut Config, name: PinName) -> &mut PinEntry {
        cfg.hardware
            .pins
            .iter_mut()
            .find(|p| p.name == name)
            .unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_example_config() {
        let cfg = valid_config();
        assert_eq!(cfg.loop_delay_ms, 1000);
        assert!(cfg.hardware.active_low);
        assert_eq!(cfg.hardware.pins.len(), PinName::ALL.len());
        assert_eq!(cfg.hardware.sensors.len(), 2);
    }

    #[test]
    fn parse_applies_defaults() {
        let cfg: Config = toml::from_str("[hardware]\n").unwrap();
        assert_eq!(cfg.loop_delay_ms, 1000);
        assert!(cfg.hardware.active_low);
        assert!(cfg.hardware.pins.is_empty());
    }

    #[test]
    fn parse_rejects_unknown_pin_name() {
        let toml_str = r#"
[hardware]
[[hardware.pins]]
name = "Jacuzzi"
gpio = 4
mode = "output"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn loop_delay_out_of_range() {
        let mut cfg = valid_config();
        cfg.loop_delay_ms = 0;
        assert_validation_err(&cfg, "loop_delay_ms");
    }

    // -- Pins -------------------------------------------------------------

    #[test]
    fn missing_pin_rejected() {
        let mut cfg = valid_config();
        cfg.hardware.pins.retain(|p| p.name != PinName::Watering);
        assert_validation_err(&cfg, "pin 'Watering' is not configured");
    }

    #[test]
    fn duplicate_pin_name_rejected() {
        let mut cfg = valid_config();
        let mut extra = pin_mut(&mut cfg, PinName::Pump).clone();
        extra.gpio = 26;
        cfg.hardware.pins.push(extra);
        assert_validation_err(&cfg, "pin 'Pump' is configured 2 times");
    }

    #[test]
    fn duplicate_gpio_rejected() {
        let mut cfg = valid_config();
        pin_mut(&mut cfg, PinName::DeckLight).gpio = 17;
        assert_validation_err(&cfg, "gpio 17 is already used by pin 'Pump'");
    }

    #[test]
    fn gpio_outside_header_rejected() {
        let mut cfg = valid_config();
        pin_mut(&mut cfg, PinName::Pump).gpio = 1;
        assert_validation_err(&cfg, "gpio 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn gpio_boundaries_accepted() {
        let mut cfg = valid_config();
        pin_mut(&mut cfg, PinName::Pump).gpio = 2;
        pin_mut(&mut cfg, PinName::DeckLight).gpio = 26;
        cfg.validate().unwrap();
    }

    #[test]
    fn button_must_be_input() {
        let mut cfg = valid_config();
        pin_mut(&mut cfg, PinName::CoverButtonUp).mode = PinMode::Output;
        assert_validation_err(&cfg, "pin 'CoverButtonUp' must be an input");
    }

    #[test]
    fn relay_must_be_output() {
        let mut cfg = valid_config();
        pin_mut(&mut cfg, PinName::Pump).mode = PinMode::Input;
        assert_validation_err(&cfg, "pin 'Pump' must be an output");
    }

    // -- Sensors ----------------------------------------------------------

    #[test]
    fn missing_sensor_rejected() {
        let mut cfg = valid_config();
        cfg.hardware
            .sensors
            .retain(|s| s.name != TemperatureSensor::AirTemperature);
        assert_validation_err(&cfg, "sensor 'AirTemperature' is not configured");
    }

    #[test]
    fn empty_device_id_rejected() {
        let mut cfg = valid_config();
        cfg.hardware.sensors[0].device_id = " ".into();
        assert_validation_err(&cfg, "device_id is empty");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.hardware.pins.clear();
        cfg.hardware.sensors.clear();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("(12 errors)"), "got: {msg}");
    }

    #[test]
    fn hardware_validate_uses_its_own_label() {
        let mut cfg = valid_config();
        cfg.hardware.sensors.clear();
        let msg = format!("{:#}", cfg.hardware.validate().unwrap_err());
        assert!(msg.starts_with("hardware validation failed (2 errors)"), "got: {msg}");
    }

    // -- Load -------------------------------------------------------------

    #[test]
    fn load_missing_file_fails_with_path() {
        let err = load("/nonexistent/pool-config.toml").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/pool-config.toml"));
    }
}
