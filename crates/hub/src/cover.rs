//! Motorised pool cover: a power relay plus a direction (inverter) relay,
//! no end-of-travel sensors. Travel stops on command or once the configured
//! cycle duration has elapsed.
//!
//! ```text
//! Idle ──open/close──▶ Moving ──stop / travel time elapsed──▶ Idle
//! ```

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::clock::Clock;
use crate::hardware::{Hardware, PinName};
use crate::settings::PoolSettings;

/// Direction relay settle time before power is applied.
const DIRECTION_SETTLE: std::time::Duration = std::time::Duration::from_millis(200);
/// Motor spin-up time after power is applied.
const POWER_SETTLE: std::time::Duration = std::time::Duration::from_millis(500);
/// Power relay release time before the direction relay drops.
const STOP_SETTLE: std::time::Duration = std::time::Duration::from_millis(300);
/// Motor de-energise time when reversing direction.
const REVERSE_DELAY: std::time::Duration = std::time::Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverDirection {
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CoverState {
    Idle,
    Moving {
        direction: CoverDirection,
        started_at: NaiveDateTime,
    },
}

pub struct CoverController {
    clock: Arc<dyn Clock>,
    state: CoverState,
}

impl CoverController {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: CoverState::Idle,
        }
    }

    pub fn state(&self) -> CoverState {
        self.state
    }

    pub async fn open(&mut self, stop_if_moving: bool, hw: &mut dyn Hardware) -> Result<()> {
        self.start(CoverDirection::Opening, stop_if_moving, hw).await
    }

    pub async fn close(&mut self, stop_if_moving: bool, hw: &mut dyn Hardware) -> Result<()> {
        self.start(CoverDirection::Closing, stop_if_moving, hw).await
    }

    /// Cut power, then release the direction relay.
    pub async fn stop(&mut self, hw: &mut dyn Hardware) -> Result<()> {
        self.state = CoverState::Idle;
        hw.write(PinName::CoverPowerSupply, false)?;
        tokio::time::sleep(STOP_SETTLE).await;
        hw.write(PinName::CoverPowerInverter, false)?;
        info!("cover stopped");
        Ok(())
    }

    /// Auto-stop once the travel time has elapsed. Called every tick.
    pub async fn idle(&mut self, settings: &PoolSettings, hw: &mut dyn Hardware) -> Result<()> {
        if let CoverState::Moving { started_at, .. } = self.state {
            let travel = Duration::seconds(i64::from(settings.cover_cycle_duration_secs));
            if self.clock.now() - started_at > travel {
                info!(travel_secs = settings.cover_cycle_duration_secs, "cover travel complete");
                self.stop(hw).await?;
            }
        }
        Ok(())
    }

    async fn start(
        &mut self,
        direction: CoverDirection,
        stop_if_moving: bool,
        hw: &mut dyn Hardware,
    ) -> Result<()> {
        if matches!(self.state, CoverState::Moving { .. }) {
            self.stop(hw).await?;
            if stop_if_moving {
                return Ok(());
            }
            tokio::time::sleep(REVERSE_DELAY).await;
        }

        self.state = CoverState::Moving {
            direction,
            started_at: self.clock.now(),
        };
        // Direction is fixed before the motor is powered.
        hw.write(
            PinName::CoverPowerInverter,
            direction == CoverDirection::Closing,
        )?;
        tokio::time::sleep(DIRECTION_SETTLE).await;
        hw.write(PinName::CoverPowerSupply, true)?;
        tokio::time::sleep(POWER_SETTLE).await;
        info!(?direction, "cover moving");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::PinName::{CoverPowerInverter as Inverter, CoverPowerSupply as Power};
    use crate::testing::{at, FakeHardware, ManualClock};

    fn setup() -> (Arc<ManualClock>, CoverController, FakeHardware) {
        let clock = ManualClock::new(at(1, 10, 0));
        let cover = CoverController::new(clock.clone());
        (clock, cover, FakeHardware::new())
    }

    // -- Start ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn open_sets_direction_before_power() {
        let (_clock, mut cover, mut hw) = setup();
        cover.open(false, &mut hw).await.unwrap();

        assert_eq!(hw.take_writes(), vec![(Inverter, false), (Power, true)]);
        assert!(matches!(
            cover.state(),
            CoverState::Moving {
                direction: CoverDirection::Opening,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_asserts_inverter() {
        let (_clock, mut cover, mut hw) = setup();
        cover.close(false, &mut hw).await.unwrap();
        assert_eq!(hw.take_writes(), vec![(Inverter, true), (Power, true)]);
    }

    // -- While moving -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn reversing_stops_settles_then_restarts() {
        let (_clock, mut cover, mut hw) = setup();
        cover.open(false, &mut hw).await.unwrap();
        hw.take_writes();

        cover.close(false, &mut hw).await.unwrap();

        assert_eq!(
            hw.take_writes(),
            vec![(Power, false), (Inverter, false), (Inverter, true), (Power, true)]
        );
        assert!(matches!(
            cover.state(),
            CoverState::Moving {
                direction: CoverDirection::Closing,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn button_press_while_moving_only_stops() {
        let (_clock, mut cover, mut hw) = setup();
        cover.close(true, &mut hw).await.unwrap();
        hw.take_writes();

        cover.open(true, &mut hw).await.unwrap();

        assert_eq!(hw.take_writes(), vec![(Power, false), (Inverter, false)]);
        assert_eq!(cover.state(), CoverState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_power_before_direction() {
        let (_clock, mut cover, mut hw) = setup();
        cover.close(false, &mut hw).await.unwrap();
        hw.take_writes();

        cover.stop(&mut hw).await.unwrap();

        assert_eq!(hw.take_writes(), vec![(Power, false), (Inverter, false)]);
        assert_eq!(cover.state(), CoverState::Idle);
    }

    // -- Auto-stop ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn idle_stops_after_travel_time() {
        let (clock, mut cover, mut hw) = setup();
        let settings = PoolSettings::default(); // 90 s travel
        cover.open(false, &mut hw).await.unwrap();
        hw.take_writes();

        clock.advance(Duration::seconds(90));
        cover.idle(&settings, &mut hw).await.unwrap();
        assert!(hw.take_writes().is_empty(), "exactly 90 s is not yet elapsed");

        clock.advance(Duration::seconds(1));
        cover.idle(&settings, &mut hw).await.unwrap();
        assert_eq!(hw.take_writes(), vec![(Power, false), (Inverter, false)]);
        assert_eq!(cover.state(), CoverState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_when_stopped_writes_nothing() {
        let (clock, mut cover, mut hw) = setup();
        clock.advance(Duration::hours(2));
        cover.idle(&PoolSettings::default(), &mut hw).await.unwrap();
        assert!(hw.take_writes().is_empty());
    }

    #[test]
    fn state_serializes_with_tag() {
        let moving = CoverState::Moving {
            direction: CoverDirection::Opening,
            started_at: at(1, 10, 0),
        };
        let json = serde_json::to_value(moving).unwrap();
        assert_eq!(json["state"], "moving");
        assert_eq!(json["direction"], "opening");
        assert_eq!(
            serde_json::to_value(CoverState::Idle).unwrap()["state"],
            "idle"
        );
    }
}
