//! The control loop: owns the hardware, the canonical state and settings,
//! and the three controllers. Ticks, HTTP commands and button edges are
//! handled one at a time on the same task, so no controller ever runs
//! concurrently with another.

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::cover::{CoverController, CoverState};
use crate::db::Db;
use crate::hardware::{Hardware, InputEvent, PinName};
use crate::pump::{PumpController, PumpDirective};
use crate::settings::PoolSettings;
use crate::state::{EventKind, SharedStatus, Snapshot, SystemState};
use crate::watering::WateringController;

const COMMAND_QUEUE: usize = 32;
const PERSIST_EVERY_HOURS: i64 = 1;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum Command {
    SetLight { pin: PinName, on: bool },
    SetPumpForceOn(bool),
    SetPumpForceOff(bool),
    /// `duration` (minutes) replaces the manual duration first.
    SetWateringManual { on: bool, duration: Option<i32> },
    SetWateringSchedule { enabled: bool, duration: Option<i32> },
    OpenCover,
    CloseCover,
    StopCover,
    SaveSettings {
        settings: PoolSettings,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Cheap, cloneable access to the loop for the HTTP layer.
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<Command>,
    status: SharedStatus,
}

impl ControlHandle {
    pub async fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("control loop is not running"))
    }

    /// Validate, persist and apply new settings. Resolves once the loop has
    /// either swapped them in or rejected them.
    pub async fn save_settings(&self, settings: PoolSettings) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SaveSettings { settings, reply }).await?;
        rx.await.context("control loop dropped the request")?
    }

    pub fn status(&self) -> &SharedStatus {
        &self.status
    }

    /// A handle with no loop behind it; the caller plays the loop.
    #[cfg(test)]
    pub(crate) fn detached(status: SharedStatus) -> (Self, mpsc::Receiver<Command>) {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        (Self { commands, status }, rx)
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// What changed between two points is turned into events.
#[derive(PartialEq)]
struct Observed {
    directive: PumpDirective,
    cover: CoverState,
    watering: bool,
}

pub struct ControlLoop<H: Hardware> {
    clock: Arc<dyn Clock>,
    hw: H,
    db: Db,
    settings: Arc<PoolSettings>,
    state: SystemState,
    pump: PumpController,
    cover: CoverController,
    watering: WateringController,
    commands: mpsc::Receiver<Command>,
    status: SharedStatus,
    loop_delay: std::time::Duration,
    last_persist: NaiveDateTime,
    pending_events: Vec<(NaiveDateTime, EventKind, String)>,
}

impl<H: Hardware> ControlLoop<H> {
    pub fn new(
        clock: Arc<dyn Clock>,
        hw: H,
        db: Db,
        settings: PoolSettings,
        state: SystemState,
        loop_delay: std::time::Duration,
    ) -> (Self, ControlHandle) {
        let settings = Arc::new(settings);
        let watering = WateringController::new(clock.clone(), &settings);
        let snapshot = Snapshot::new(state.clone(), settings.clone(), watering.next_schedule());
        let status: SharedStatus = Arc::new(RwLock::new(snapshot));
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);

        let control = Self {
            pump: PumpController::new(clock.clone()),
            cover: CoverController::new(clock.clone()),
            watering,
            last_persist: clock.now(),
            clock,
            hw,
            db,
            settings,
            state,
            commands: rx,
            status: status.clone(),
            loop_delay,
            pending_events: Vec::new(),
        };
        let handle = ControlHandle {
            commands: tx,
            status,
        };
        (control, handle)
    }

    /// Run until `shutdown` flips or a tick fails. State is persisted and
    /// every output released on the way out, whichever way the loop ends.
    pub async fn run(
        mut self,
        mut inputs: mpsc::UnboundedReceiver<InputEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ticker = tokio::time::interval(self.loop_delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.record(EventKind::System, "controller started".into());
        info!(period_ms = self.loop_delay.as_millis() as u64, "control loop running");

        let outcome = loop {
            let step = tokio::select! {
                biased;
                _ = shutdown.changed() => break Ok(()),
                _ = ticker.tick() => self.tick().await,
                Some(command) = self.commands.recv() => self.handle(command).await,
                Some(event) = inputs.recv() => self.handle_input(event).await,
            };
            if let Err(e) = step {
                break Err(e);
            }
            self.publish().await;
        };

        if let Err(e) = &outcome {
            error!("control loop failed: {e:#}");
            self.record(EventKind::Error, format!("{e:#}"));
        }
        let finished = self.finish().await;
        outcome.and(finished)
    }

    async fn tick(&mut self) -> Result<()> {
        let before = self.observe();
        let settings = Arc::clone(&self.settings);

        self.pump.process(&settings, &mut self.state, &mut self.hw).await?;
        self.cover.idle(&settings, &mut self.hw).await?;
        self.watering.process(&mut self.state, &mut self.hw)?;

        self.note_changes(before);

        let now = self.clock.now();
        if now - self.last_persist >= Duration::hours(PERSIST_EVERY_HOURS) {
            self.last_persist = now;
            if let Err(e) = self.db.save_state(&self.state).await {
                warn!("periodic state save failed: {e:#}");
                self.record(EventKind::Error, format!("state save failed: {e:#}"));
            }
        }
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        debug!(?command, "command");
        let before = self.observe();
        let now = self.clock.now();

        match command {
            Command::SetLight { pin, on } => {
                self.hw.write(pin, on)?;
                self.record(EventKind::System, format!("{pin} {}", on_off(on)));
            }
            Command::SetPumpForceOn(on) => {
                self.state.pump_force_on.update(on, now);
                if on && self.state.pump_force_off.value {
                    self.state.pump_force_off.update(false, now);
                }
                self.record(EventKind::Pump, format!("force on {}", on_off(on)));
            }
            Command::SetPumpForceOff(on) => {
                self.state.pump_force_off.update(on, now);
                if on && self.state.pump_force_on.value {
                    self.state.pump_force_on.update(false, now);
                }
                self.record(EventKind::Pump, format!("force off {}", on_off(on)));
            }
            Command::SetWateringManual { on, duration } => {
                if let Some(minutes) = duration {
                    self.state.watering_manual_duration.update(minutes, now);
                }
                self.state.watering_manual_on.update(on, now);
            }
            Command::SetWateringSchedule { enabled, duration } => {
                if let Some(minutes) = duration {
                    self.state.watering_schedule_duration.update(minutes, now);
                }
                self.state.watering_schedule_enabled.update(enabled, now);
                self.record(
                    EventKind::Watering,
                    format!("schedule {}", if enabled { "enabled" } else { "disabled" }),
                );
            }
            Command::OpenCover => self.cover.open(false, &mut self.hw).await?,
            Command::CloseCover => self.cover.close(false, &mut self.hw).await?,
            Command::StopCover => self.cover.stop(&mut self.hw).await?,
            Command::SaveSettings { settings, reply } => {
                let result = self.apply_settings(settings).await;
                if let Err(e) = &result {
                    warn!("settings rejected: {e:#}");
                }
                if let Err(outcome) = reply.send(result) {
                    debug!(ok = outcome.is_ok(), "settings caller went away before the reply");
                }
            }
        }

        self.note_changes(before);
        Ok(())
    }

    /// Button edges: a press opens or closes, a press while moving stops.
    async fn handle_input(&mut self, event: InputEvent) -> Result<()> {
        if !event.state {
            return Ok(());
        }
        let before = self.observe();
        match event.pin {
            PinName::CoverButtonUp => self.cover.open(true, &mut self.hw).await?,
            PinName::CoverButtonDown => self.cover.close(true, &mut self.hw).await?,
            other => debug!(pin = %other, "ignoring input edge"),
        }
        self.note_changes(before);
        Ok(())
    }

    async fn apply_settings(&mut self, settings: PoolSettings) -> Result<()> {
        settings.validate()?;
        self.db.save_settings(&settings).await?;

        self.settings = Arc::new(settings);
        self.pump.reset_settings();
        self.watering.reset_settings(&self.settings);

        info!(mode = ?self.settings.working_mode, "settings saved");
        self.record(EventKind::Settings, "settings saved".into());
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let persisted = self.db.save_state(&self.state).await;
        if let Err(e) = &persisted {
            error!("final state save failed: {e:#}");
        }
        let released = self.hw.close();
        if let Err(e) = &released {
            error!("failed to release outputs: {e:#}");
        }

        self.record(EventKind::System, "controller stopped".into());
        self.publish().await;
        info!("control loop stopped");
        persisted.and(released)
    }

    // -----------------------------------------------------------------------
    // Status & events
    // -----------------------------------------------------------------------

    fn observe(&self) -> Observed {
        Observed {
            directive: self.pump.directive().clone(),
            cover: self.cover.state(),
            watering: self.hw.output(PinName::Watering),
        }
    }

    fn note_changes(&mut self, before: Observed) {
        let after = self.observe();
        if after == before {
            return;
        }
        if after.directive != before.directive {
            self.record(EventKind::Pump, describe_directive(&after.directive));
        }
        if after.cover != before.cover {
            let detail = match after.cover {
                CoverState::Idle => "cover stopped".to_string(),
                CoverState::Moving { direction, .. } => format!("cover {direction:?}").to_lowercase(),
            };
            self.record(EventKind::Cover, detail);
        }
        if after.watering != before.watering {
            self.record(EventKind::Watering, format!("watering {}", on_off(after.watering)));
        }
    }

    fn record(&mut self, kind: EventKind, detail: String) {
        self.pending_events.push((self.clock.now(), kind, detail));
    }

    async fn publish(&mut self) {
        let mut snap = self.status.write().await;
        snap.state = self.state.clone();
        snap.settings = Arc::clone(&self.settings);
        snap.outputs = self.hw.outputs();
        snap.pump_cycles = self.pump.cycles();
        snap.frost_protection_until = self.pump.frost_protection_until();
        snap.cover = self.cover.state();
        snap.watering_cycles = self.watering.cycles(&self.state);
        snap.next_watering = self.watering.next_schedule();
        for (ts, kind, detail) in self.pending_events.drain(..) {
            snap.push_event(ts, kind, detail);
        }
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

fn describe_directive(directive: &PumpDirective) -> String {
    match directive {
        PumpDirective::Off => "pump idle".to_string(),
        PumpDirective::Forced { on } => format!("pump forced {}", on_off(*on)),
        PumpDirective::Scheduled(c) => format!(
            "pump cycle {} to {}",
            c.start.format("%H:%M"),
            c.end.format("%H:%M")
        ),
        PumpDirective::FrostProtection { until } => {
            format!("frost protection until {}", until.format("%H:%M"))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
