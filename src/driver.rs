//! Cycle driver
//!
//! Owns the subsystems and turns the crank: one control cycle roughly every
//! `cycle_ms` (meter poll, BMS snapshot, one state-machine step, inverter
//! write, flight-recorder push). Operator commands arrive over an unbounded
//! mpsc channel and are drained at the start of each cycle; the resulting
//! state snapshot is published over a watch channel for the web layer.
//!
//! An overrunning cycle starts the next one late; there is no catch-up.

use crate::bms::{BmsAggregate, BmsSource};
use crate::blackbox::Blackbox;
use crate::config::Config;
use crate::controller::{Controller, InverterCommand, ManualCommand, Mode, State, StepInput};
use crate::error::Result;
use crate::inverter::{Inverter, InverterSnapshot};
use crate::logging::{StructuredLogger, get_logger};
use crate::meter::{MeterClient, MeterData};
use crate::settings::SettingsBook;
use chrono::Local;
use serde::Serialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Pause around the inverter status exchange
const INVERTER_PAUSE: Duration = Duration::from_millis(75);

/// Operator commands accepted between cycles
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    SetMode(Mode),
    SelectProfile(usize),
    Manual(ManualCommand),
    ResetError,
    DumpBlackbox,
}

/// Full per-cycle snapshot published for the web layer
#[derive(Debug, Clone, Serialize)]
pub struct DriverState {
    pub mode: Mode,
    pub state: State,
    pub set_p: f64,
    pub profile: usize,
    pub profiles: Vec<String>,
    pub info: String,
    pub time: String,
    pub feed_throttle: bool,
    pub meter: MeterData,
    pub bms: BmsAggregate,
    pub inverter: InverterSnapshot,
}

impl Default for DriverState {
    fn default() -> Self {
        Self {
            mode: Mode::Off,
            state: State::Init,
            set_p: 0.0,
            profile: 0,
            profiles: Vec::new(),
            info: String::new(),
            time: String::new(),
            feed_throttle: false,
            meter: MeterData::default(),
            bms: BmsAggregate::default(),
            inverter: InverterSnapshot::default(),
        }
    }
}

/// Channel ends handed to the web layer
#[derive(Clone)]
pub struct DriverHandle {
    pub commands: mpsc::UnboundedSender<DriverCommand>,
    pub state: watch::Receiver<DriverState>,
}

pub struct Driver {
    config: Config,
    controller: Controller,
    settings: SettingsBook,
    profile: usize,
    meter: MeterClient,
    bms: Box<dyn BmsSource>,
    inverter: Box<dyn Inverter>,
    blackbox: Blackbox,
    commands_rx: mpsc::UnboundedReceiver<DriverCommand>,
    state_tx: watch::Sender<DriverState>,
    pending_manual: Option<ManualCommand>,
    logger: StructuredLogger,
}

impl Driver {
    pub fn new(
        config: Config,
        bms: Box<dyn BmsSource>,
        inverter: Box<dyn Inverter>,
    ) -> Result<(Self, DriverHandle)> {
        let settings = SettingsBook::new(config.settings.clone())?;
        let controller = Controller::new(config.limits.clone(), settings.resolve(0));
        let meter = MeterClient::new(&config.meterhub)?;
        let blackbox = Blackbox::new(config.blackbox.size, &config.blackbox.path)?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DriverState {
            profiles: settings.names(),
            ..Default::default()
        });

        let driver = Self {
            config,
            controller,
            settings,
            profile: 0,
            meter,
            bms,
            inverter,
            blackbox,
            commands_rx,
            state_tx,
            pending_manual: None,
            logger: get_logger("driver"),
        };
        let handle = DriverHandle {
            commands: commands_tx,
            state: state_rx,
        };
        Ok((driver, handle))
    }

    /// Main loop, runs until the process exits
    pub async fn run(&mut self) -> Result<()> {
        self.logger.info(&format!(
            "starting control loop, cycle {}ms",
            self.config.cycle_ms
        ));
        let cycle = Duration::from_millis(self.config.cycle_ms);

        loop {
            let begin = tokio::time::Instant::now();
            self.cycle().await;
            tokio::time::sleep_until(begin + cycle).await;
        }
    }

    async fn cycle(&mut self) {
        self.drain_commands();

        // meter poll carries our status report
        let info = self.controller.info_text(self.inverter.snapshot().state);
        self.meter.update(&info, self.bms.soc()).await;

        self.bms.update();

        let now = Instant::now();
        let meter_sample = self.meter.sample(now);
        let inverter_snapshot = self.inverter.snapshot();
        let input = StepInput {
            bms: self.bms.snapshot(),
            meter_ready: self.meter.is_ready(now),
            pv_p: meter_sample.pv_p,
            home_p: meter_sample.home_all_p,
            inverter: &inverter_snapshot,
            manual: self.pending_manual.take(),
        };
        let out = self.controller.step(input, now);

        if let Err(e) = self.inverter.command(out.set_p).await {
            self.logger.warn(&format!("inverter command failed: {}", e));
        }
        match out.inverter_command {
            Some(InverterCommand::Sleep) => {
                if let Err(e) = self.inverter.sleep().await {
                    self.logger.warn(&format!("inverter sleep failed: {}", e));
                }
            }
            Some(InverterCommand::Wakeup) => {
                if let Err(e) = self.inverter.wakeup().await {
                    self.logger.warn(&format!("inverter wakeup failed: {}", e));
                }
            }
            None => {}
        }
        tokio::time::sleep(INVERTER_PAUSE).await;
        if let Err(e) = self.inverter.update(INVERTER_PAUSE).await {
            self.logger.warn(&format!("inverter update failed: {}", e));
        }

        let state = self.build_state(meter_sample);
        self.blackbox.push(&json!({
            "ess": {
                "mode": state.mode,
                "state": state.state,
                "set_p": state.set_p,
                "time": &state.time,
                "profile": state.profile,
                "info": &state.info,
            },
            "meterhub": &state.meter,
            "bms": &state.bms,
            "inverter": &state.inverter,
            "bms_detail": self.bms.detail(),
        }));
        if out.dump_blackbox {
            if let Err(e) = self.blackbox.dump() {
                self.logger.error(&format!("blackbox dump failed: {}", e));
            }
        }

        let _ = self.state_tx.send(state);
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands_rx.try_recv() {
            match command {
                DriverCommand::SetMode(mode) => {
                    self.controller.set_mode(mode, Instant::now());
                }
                DriverCommand::SelectProfile(index) => {
                    if index < self.settings.len() {
                        self.profile = index;
                        self.controller.set_settings(self.settings.resolve(index));
                    } else {
                        self.logger
                            .warn(&format!("unknown settings profile: {}", index));
                    }
                }
                DriverCommand::Manual(manual) => {
                    self.pending_manual = Some(manual);
                }
                DriverCommand::ResetError => {
                    self.controller.reset_error();
                }
                DriverCommand::DumpBlackbox => {
                    if let Err(e) = self.blackbox.dump() {
                        self.logger.error(&format!("blackbox dump failed: {}", e));
                    }
                }
            }
        }
    }

    fn build_state(&self, meter: MeterData) -> DriverState {
        let inverter = self.inverter.snapshot();
        DriverState {
            mode: self.controller.mode(),
            state: self.controller.state(),
            set_p: self.controller.set_p(),
            profile: self.profile,
            profiles: self.settings.names(),
            info: self.controller.info_text(inverter.state),
            time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            feed_throttle: self.controller.feed_throttle(),
            meter,
            bms: self.bms.snapshot().clone(),
            inverter,
        }
    }
}
