//! Control state machine
//!
//! One step per cycle. State changes are requested with a pending-next-state
//! slot and applied at the start of the following step, which hands the new
//! state handler an entry flag for its one-time work. The safety gate runs
//! before the handler in every state except `Init` and `Error`.
//!
//! Power sign convention: positive set-points charge the battery, negative
//! ones feed the house.

use crate::bms::BmsAggregate;
use crate::config::LimitsConfig;
use crate::inverter::{InverterSnapshot, InverterState};
use crate::logging::{StructuredLogger, get_logger};
use crate::settings::Settings;
use crate::timer::Timer;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Operator-selected operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Off,
    Auto,
    Manual,
}

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Init,
    Error,
    Off,
    AutoIdle,
    AutoCharge,
    AutoFeed,
    Manual,
}

impl State {
    fn is_auto(self) -> bool {
        matches!(self, State::AutoIdle | State::AutoCharge | State::AutoFeed)
    }
}

/// Standby command forwarded to the inverter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InverterCommand {
    Sleep,
    Wakeup,
}

/// One manual-mode instruction from the operator
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ManualCommand {
    pub set_p: f64,
    pub command: Option<InverterCommand>,
}

/// Everything one step consumes
pub struct StepInput<'a> {
    pub bms: &'a BmsAggregate,
    pub meter_ready: bool,
    /// PV production in W
    pub pv_p: Option<f64>,
    /// Total household consumption in W
    pub home_p: Option<f64>,
    pub inverter: &'a InverterSnapshot,
    pub manual: Option<ManualCommand>,
}

/// Everything one step produces
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub set_p: f64,
    pub inverter_command: Option<InverterCommand>,
    /// Request a flight-recorder dump (set on error entry)
    pub dump_blackbox: bool,
}

const INIT_GUARD: Duration = Duration::from_secs(10);
const MANUAL_WATCHDOG: Duration = Duration::from_secs(5);
const SLEEP_RESEND: Duration = Duration::from_secs(5);
/// Below this state of charge the reduced feed cap applies
const FEED_SOC_REDUCED: u8 = 25;

pub struct Controller {
    mode: Mode,
    state: State,
    next_state: Option<State>,
    set_p: f64,
    feed_throttle: bool,

    charge_start_timer: Timer,
    feed_start_timer: Timer,
    feed_throttle_timer: Timer,
    /// Shared per-state timer: init guard, idle sleep, stop delays, watchdog
    state_timer: Timer,

    settings: Settings,
    limits: LimitsConfig,
    logger: StructuredLogger,
}

impl Controller {
    pub fn new(limits: LimitsConfig, settings: Settings) -> Self {
        Self {
            mode: Mode::Off,
            state: State::Init,
            next_state: Some(State::Init),
            set_p: 0.0,
            feed_throttle: false,
            charge_start_timer: Timer::new(),
            feed_start_timer: Timer::new(),
            feed_throttle_timer: Timer::new(),
            state_timer: Timer::new(),
            settings,
            limits,
            logger: get_logger("controller"),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn set_p(&self) -> f64 {
        self.set_p
    }

    pub fn feed_throttle(&self) -> bool {
        self.feed_throttle
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Swap the resolved settings view (profile change)
    pub fn set_settings(&mut self, settings: Settings) {
        if settings.name != self.settings.name {
            self.logger
                .info(&format!("settings profile: {}", settings.name));
        }
        self.settings = settings;
    }

    /// Operator mode change; start debounce timers fire immediately so a
    /// fresh auto mode does not wait a full debounce period
    pub fn set_mode(&mut self, mode: Mode, now: Instant) {
        self.logger.info(&format!("mode: {:?}", mode));
        self.mode = mode;
        self.charge_start_timer.force_expire(now);
        self.feed_start_timer.force_expire(now);
    }

    /// Operator error acknowledgement; the only way out of `Error`
    pub fn reset_error(&mut self) {
        if self.state == State::Error {
            self.logger.info("manual error reset");
            self.next_state = Some(State::Init);
        }
    }

    /// Run one control cycle
    pub fn step(&mut self, input: StepInput<'_>, now: Instant) -> StepOutput {
        let mut out = StepOutput::default();

        if !matches!(self.state, State::Error | State::Init) {
            self.gate_and_switch(&input);
        }

        let entry = match self.next_state.take() {
            Some(next) => {
                self.state = next;
                true
            }
            None => false,
        };

        let result = match self.state {
            State::Init => self.on_init(entry, &input, now),
            State::Error => self.on_error(entry, &mut out),
            State::Off => self.on_off(entry),
            State::AutoIdle => self.on_auto_idle(entry, &input, now, &mut out),
            State::AutoCharge => self.on_auto_charge(entry, &input, now),
            State::AutoFeed => self.on_auto_feed(entry, &input, now),
            State::Manual => self.on_manual(entry, &input, now, &mut out),
        };

        if let Err(e) = result {
            self.logger
                .error(&format!("[{:?}] step failed: {}", self.state, e));
            self.set_p = 0.0;
            self.next_state = Some(State::Error);
        }

        out.set_p = self.set_p;
        out
    }

    /// German status line for the dashboard and the MeterHub report
    pub fn info_text(&self, inverter_state: InverterState) -> String {
        match (self.mode, self.state, inverter_state) {
            (Mode::Off, _, _) => "AUS".to_string(),
            (Mode::Manual, _, _) => "HANDBETRIEB !".to_string(),
            (_, State::AutoIdle, InverterState::Sleep) => "Automatik - Schlafen".to_string(),
            (_, State::AutoIdle, InverterState::On) => "Automatik - Bereit".to_string(),
            (_, State::AutoCharge, InverterState::On) => "Automatik - Laden".to_string(),
            (_, State::AutoFeed, InverterState::On) => "Automatik - Einspeisen".to_string(),
            (_, _, InverterState::Wait) => "Automatik - Warten".to_string(),
            (mode, state, inv) => format!("[{:?}, {:?}, {:?}]", mode, state, inv),
        }
    }

    /// Safety gate plus coarse mode-driven transitions
    fn gate_and_switch(&mut self, input: &StepInput<'_>) {
        if input
            .bms
            .voltage
            .is_some_and(|u| u > self.limits.voltage_max)
        {
            self.logger.error(&format!(
                "max battery voltage exceeded: {:?} V",
                input.bms.voltage
            ));
            self.next_state = Some(State::Error);
        } else if input
            .bms
            .temperature
            .is_some_and(|t| t > self.limits.temperature_max)
        {
            self.logger.error(&format!(
                "max battery temperature exceeded: {:?} C",
                input.bms.temperature
            ));
            self.next_state = Some(State::Error);
        } else if !input.meter_ready {
            self.logger.error("meterhub not ready");
            self.next_state = Some(State::Error);
        } else if let Some(reason) = &input.bms.error {
            self.logger.error(&format!("bms error: {}", reason));
            self.next_state = Some(State::Error);
        } else if !input.inverter.ready {
            self.logger.error("inverter not ready");
            self.next_state = Some(State::Error);
        } else {
            match self.mode {
                Mode::Off if self.state != State::Off => {
                    self.next_state = Some(State::Off);
                }
                Mode::Auto if !self.state.is_auto() => {
                    self.next_state = Some(State::AutoIdle);
                }
                Mode::Manual if self.state != State::Manual => {
                    self.next_state = Some(State::Manual);
                }
                _ => {}
            }
        }
    }

    /// Charge start condition with debounce. Missing inputs keep the
    /// candidate at zero, which resets the debounce timer.
    fn is_charge_start(&mut self, input: &StepInput<'_>, now: Instant) -> bool {
        let s = &self.settings;
        let p = match (input.pv_p, input.home_p) {
            (Some(pv), Some(home)) => pv - home - s.charge_reserve_power,
            _ => 0.0,
        };

        let soc_ceiling = i32::from(s.charge_end_soc) - i32::from(s.charge_hysteresis_soc);
        let soc_blocked = match input.bms.soc_high {
            Some(soc) => i32::from(soc) > soc_ceiling,
            None => true,
        };

        if p < s.charge_min_power || soc_blocked {
            self.charge_start_timer.stop();
        } else if self.charge_start_timer.is_stopped() {
            self.charge_start_timer.start(now, s.charge_start_time);
        } else if self.charge_start_timer.is_expired(now) {
            return true;
        }
        false
    }

    /// Feed start condition, symmetric to the charge side
    fn is_feed_start(&mut self, input: &StepInput<'_>, now: Instant) -> bool {
        let s = &self.settings;
        let p = match (input.pv_p, input.home_p) {
            (Some(pv), Some(home)) => home - pv - s.feed_reserve_power,
            _ => 0.0,
        };

        let soc_floor = i32::from(s.feed_end_soc) + i32::from(s.feed_hysteresis_soc);
        let soc_blocked = match input.bms.soc_low {
            Some(soc) => i32::from(soc) < soc_floor,
            None => true,
        };

        if p < s.feed_min_power || soc_blocked {
            self.feed_start_timer.stop();
        } else if self.feed_start_timer.is_stopped() {
            self.feed_start_timer.start(now, s.feed_start_time);
        } else if self.feed_start_timer.is_expired(now) {
            return true;
        }
        false
    }

    fn on_init(
        &mut self,
        entry: bool,
        input: &StepInput<'_>,
        now: Instant,
    ) -> crate::error::Result<()> {
        if entry {
            self.logger.info("FSM: INIT");
            self.set_p = 0.0;
            self.state_timer.start(now, INIT_GUARD);
        }

        if input.meter_ready && input.bms.error.is_none() && input.inverter.ready {
            self.gate_and_switch(input);
        }

        if self.state_timer.is_expired(now) {
            if !input.meter_ready {
                self.logger.error("init: meterhub not ready");
            }
            if let Some(reason) = &input.bms.error {
                self.logger.error(&format!("init: bms error: {}", reason));
            }
            if !input.inverter.ready {
                self.logger.error("init: inverter not ready");
            }
            self.next_state = Some(State::Error);
        }
        Ok(())
    }

    fn on_error(&mut self, entry: bool, out: &mut StepOutput) -> crate::error::Result<()> {
        if entry {
            self.logger.info("FSM: ERROR");
            out.dump_blackbox = true;
            self.set_p = 0.0;
        }
        Ok(())
    }

    fn on_off(&mut self, entry: bool) -> crate::error::Result<()> {
        if entry {
            self.logger.info("FSM: OFF");
            self.set_p = 0.0;
        }
        Ok(())
    }

    fn on_auto_idle(
        &mut self,
        entry: bool,
        input: &StepInput<'_>,
        now: Instant,
        out: &mut StepOutput,
    ) -> crate::error::Result<()> {
        if entry {
            self.logger.info("AUTO-IDLE");
            self.set_p = 0.0;
            self.charge_start_timer.stop();
            self.feed_start_timer.stop();
            if !self.settings.idle_sleep_time.is_zero() {
                self.state_timer.start(now, self.settings.idle_sleep_time);
            }
        }

        // one evaluation of each start condition per cycle
        let feed = self.is_feed_start(input, now);
        let charge = self.is_charge_start(input, now);

        if (feed || charge) && input.inverter.state == InverterState::Sleep {
            self.logger.info("[auto-idle] wakeup");
            self.state_timer.start(now, self.settings.idle_sleep_time);
            out.inverter_command = Some(InverterCommand::Wakeup);
        }

        if feed {
            self.next_state = Some(State::AutoFeed);
        } else if charge {
            self.next_state = Some(State::AutoCharge);
        }

        if self.state_timer.is_expired(now) && input.inverter.state != InverterState::Sleep {
            self.state_timer.start(now, SLEEP_RESEND);
            self.logger.info("[auto-idle] sleep");
            out.inverter_command = Some(InverterCommand::Sleep);
        }
        Ok(())
    }

    fn on_auto_charge(
        &mut self,
        entry: bool,
        input: &StepInput<'_>,
        now: Instant,
    ) -> crate::error::Result<()> {
        if entry {
            self.logger.info("AUTO-CHARGE");
        }

        let (pv, home) = match (input.pv_p, input.home_p) {
            (Some(pv), Some(home)) => (pv, home),
            _ => {
                return Err(crate::error::HestiaError::generic(
                    "auto_charge: missing meter values",
                ));
            }
        };

        let s = &self.settings;
        let p = pv - home - s.charge_reserve_power;
        let charge_set_p = p.clamp(0.0, s.charge_max_power);

        if input
            .bms
            .soc_high
            .is_some_and(|soc| soc >= s.charge_end_soc)
        {
            self.logger.info("charge end by soc (charge_end_soc)");
            self.next_state = Some(State::AutoIdle);
        } else if input
            .bms
            .voltage
            .is_some_and(|u| u >= s.charge_end_voltage)
        {
            self.logger.info("charge end by voltage (charge_end_voltage)");
            self.next_state = Some(State::AutoIdle);
        } else if charge_set_p > s.charge_min_power {
            self.state_timer.stop();
        } else if self.state_timer.is_stopped() {
            self.state_timer.start(now, s.charge_stop_time);
        } else if self.state_timer.is_expired(now) {
            self.logger.info(&format!(
                "charge end by low power, home={}W pv={}W",
                home, pv
            ));
            self.next_state = Some(State::AutoIdle);
        }

        self.set_p = charge_set_p;
        Ok(())
    }

    fn on_auto_feed(
        &mut self,
        entry: bool,
        input: &StepInput<'_>,
        now: Instant,
    ) -> crate::error::Result<()> {
        if entry {
            self.logger.info("AUTO-FEED");
        }

        let (pv, home) = match (input.pv_p, input.home_p) {
            (Some(pv), Some(home)) => (pv, home),
            _ => {
                return Err(crate::error::HestiaError::generic(
                    "auto_feed: missing meter values",
                ));
            }
        };

        let p = home - pv - self.settings.feed_reserve_power;

        let max_p = if input.bms.soc_low.is_some_and(|soc| soc <= FEED_SOC_REDUCED) {
            self.settings.feed_soc25_max_power
        } else {
            self.settings.feed_max_power
        };
        let mut feed_set_p = p.clamp(0.0, max_p);

        // throttle hysteresis: a long stretch above feed_throttle_power caps
        // the feed, a long stretch below lifts the cap again
        if !self.feed_throttle {
            if feed_set_p < self.settings.feed_throttle_power {
                self.feed_throttle_timer.stop();
            } else if self.feed_throttle_timer.is_stopped() {
                self.feed_throttle_timer
                    .start(now, self.settings.feed_throttle_time);
            }
            if self.feed_throttle_timer.is_expired(now) {
                self.feed_throttle = true;
                self.logger.info("feed throttle activated");
            }
        } else {
            if feed_set_p > self.settings.feed_throttle_power {
                self.feed_throttle_timer.stop();
            } else if self.feed_throttle_timer.is_stopped() {
                self.feed_throttle_timer
                    .start(now, self.settings.feed_throttle_time);
            }
            if self.feed_throttle_timer.is_expired(now) {
                self.feed_throttle = false;
                self.logger.info("feed throttle disabled");
            }

            feed_set_p = p.clamp(0.0, self.settings.feed_throttle_power);
        }

        let s = &self.settings;
        if input.bms.soc_low.is_some_and(|soc| soc <= s.feed_end_soc) {
            self.logger.info("feed end by soc (feed_end_soc)");
            self.next_state = Some(State::AutoIdle);
        } else if input.bms.voltage.is_some_and(|u| u <= s.feed_end_voltage) {
            self.logger.info("feed end by voltage (feed_end_voltage)");
            self.next_state = Some(State::AutoIdle);
        } else if feed_set_p > s.feed_min_power {
            self.state_timer.stop();
        } else if self.state_timer.is_stopped() {
            self.state_timer.start(now, s.feed_stop_time);
        } else if self.state_timer.is_expired(now) {
            self.logger.info(&format!(
                "feed end by low power (feed_min_power) home={}W pv={}W",
                home, pv
            ));
            self.next_state = Some(State::AutoIdle);
        }

        self.set_p = -feed_set_p;
        Ok(())
    }

    fn on_manual(
        &mut self,
        entry: bool,
        input: &StepInput<'_>,
        now: Instant,
        out: &mut StepOutput,
    ) -> crate::error::Result<()> {
        if entry {
            self.logger.info("MANUAL");
            self.set_p = 0.0;
            self.state_timer.start(now, MANUAL_WATCHDOG);
        }

        if let Some(manual) = input.manual {
            self.state_timer.start(now, MANUAL_WATCHDOG);
            self.logger
                .info(&format!("manual command: set_p={}W", manual.set_p));
            self.set_p = manual.set_p;
            match manual.command {
                Some(InverterCommand::Sleep) => {
                    self.logger.info("manual inverter sleep");
                    out.inverter_command = Some(InverterCommand::Sleep);
                }
                Some(InverterCommand::Wakeup) => {
                    self.logger.info("manual inverter wakeup");
                    out.inverter_command = Some(InverterCommand::Wakeup);
                }
                None => {}
            }
        }

        if self.state_timer.is_expired(now) {
            self.logger.info("manual watchdog expired");
            self.mode = Mode::Off;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SettingsBook;

    fn controller() -> Controller {
        let book = SettingsBook::new(Vec::new()).unwrap();
        Controller::new(LimitsConfig::default(), book.resolve(0))
    }

    fn healthy_bms() -> BmsAggregate {
        BmsAggregate {
            voltage: Some(49.0),
            current: Some(0.0),
            temperature: Some(25.0),
            soc: Some(50),
            soc_low: Some(48),
            soc_high: Some(52),
            packs: Vec::new(),
            ready: true,
            error: None,
        }
    }

    fn ready_inverter() -> InverterSnapshot {
        InverterSnapshot {
            state: InverterState::On,
            bus_voltage: None,
            bus_current: None,
            ready: true,
        }
    }

    fn input<'a>(bms: &'a BmsAggregate, inverter: &'a InverterSnapshot) -> StepInput<'a> {
        StepInput {
            bms,
            meter_ready: true,
            pv_p: Some(0.0),
            home_p: Some(300.0),
            inverter,
            manual: None,
        }
    }

    #[test]
    fn test_boot_reaches_off() {
        let mut c = controller();
        let bms = healthy_bms();
        let inv = ready_inverter();
        let now = Instant::now();

        assert_eq!(c.state(), State::Init);
        c.step(input(&bms, &inv), now);
        assert_eq!(c.state(), State::Init);
        // healthy subsystems let init hand over on the next step
        c.step(input(&bms, &inv), now + Duration::from_millis(750));
        assert_eq!(c.state(), State::Off);
        assert_eq!(c.set_p(), 0.0);
    }

    #[test]
    fn test_init_guard_expiry_faults() {
        let mut c = controller();
        let bms = BmsAggregate {
            error: Some("timeout pack 0".to_string()),
            ..Default::default()
        };
        let inv = ready_inverter();
        let start = Instant::now();

        c.step(input(&bms, &inv), start);
        assert_eq!(c.state(), State::Init);
        let out = c.step(input(&bms, &inv), start + Duration::from_secs(11));
        assert!(!out.dump_blackbox);
        // pending error state applies on the following step, with the dump
        let out = c.step(input(&bms, &inv), start + Duration::from_secs(12));
        assert_eq!(c.state(), State::Error);
        assert!(out.dump_blackbox);
    }

    #[test]
    fn test_error_exits_only_via_reset() {
        let mut c = controller();
        let sick = BmsAggregate {
            error: Some("alarm pack 0".to_string()),
            ..Default::default()
        };
        let bms = healthy_bms();
        let inv = ready_inverter();
        let start = Instant::now();

        c.step(input(&sick, &inv), start);
        c.step(input(&sick, &inv), start + Duration::from_secs(11));
        c.step(input(&sick, &inv), start + Duration::from_secs(12));
        assert_eq!(c.state(), State::Error);

        // healthy inputs alone do not leave the error state
        c.step(input(&bms, &inv), start + Duration::from_secs(13));
        assert_eq!(c.state(), State::Error);

        c.reset_error();
        c.step(input(&bms, &inv), start + Duration::from_secs(14));
        assert_eq!(c.state(), State::Init);
    }

    #[test]
    fn test_mode_auto_enters_idle() {
        let mut c = controller();
        let bms = healthy_bms();
        let inv = ready_inverter();
        let mut now = Instant::now();

        c.step(input(&bms, &inv), now);
        now += Duration::from_millis(750);
        c.step(input(&bms, &inv), now);
        assert_eq!(c.state(), State::Off);

        c.set_mode(Mode::Auto, now);
        now += Duration::from_millis(750);
        c.step(input(&bms, &inv), now);
        now += Duration::from_millis(750);
        c.step(input(&bms, &inv), now);
        assert_eq!(c.state(), State::AutoIdle);
    }

    #[test]
    fn test_info_text() {
        let mut c = controller();
        assert_eq!(c.info_text(InverterState::On), "AUS");
        c.mode = Mode::Manual;
        assert_eq!(c.info_text(InverterState::On), "HANDBETRIEB !");
        c.mode = Mode::Auto;
        c.state = State::AutoIdle;
        assert_eq!(c.info_text(InverterState::Sleep), "Automatik - Schlafen");
        assert_eq!(c.info_text(InverterState::On), "Automatik - Bereit");
        c.state = State::AutoCharge;
        assert_eq!(c.info_text(InverterState::On), "Automatik - Laden");
        c.state = State::AutoFeed;
        assert_eq!(c.info_text(InverterState::On), "Automatik - Einspeisen");
        assert_eq!(c.info_text(InverterState::Wait), "Automatik - Warten");
    }

    #[test]
    fn test_manual_watchdog_reverts_mode() {
        let mut c = controller();
        let bms = healthy_bms();
        let inv = ready_inverter();
        let mut now = Instant::now();

        c.step(input(&bms, &inv), now);
        now += Duration::from_millis(750);
        c.step(input(&bms, &inv), now);
        c.set_mode(Mode::Manual, now);
        now += Duration::from_millis(750);
        c.step(input(&bms, &inv), now);
        now += Duration::from_millis(750);
        c.step(input(&bms, &inv), now);
        assert_eq!(c.state(), State::Manual);

        // fresh command applies the set-point and feeds the watchdog
        let mut cmd_input = input(&bms, &inv);
        cmd_input.manual = Some(ManualCommand {
            set_p: 250.0,
            command: None,
        });
        c.step(cmd_input, now);
        assert_eq!(c.set_p(), 250.0);

        // silence for longer than the watchdog reverts the mode
        now += Duration::from_secs(6);
        c.step(input(&bms, &inv), now);
        assert_eq!(c.mode(), Mode::Off);
    }
}
