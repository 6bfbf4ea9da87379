//! Battery pack data model and fleet aggregation
//!
//! The poller (`bms::us2000`) fills one [`PackSlot`] per pack; [`aggregate`]
//! folds the slots into the single [`BmsAggregate`] the control loop consumes.
//! The fleet is only as healthy as its weakest pack: one stale, alarmed or
//! not-ready pack invalidates the whole aggregate.

pub mod us2000;

use crate::pylontech::{PackAlarm, PackAnalog};
use serde::Serialize;
use std::time::Instant;

/// Per-pack poller state: latest telemetry plus per-datum freshness deadlines
#[derive(Debug, Clone, Default)]
pub struct PackSlot {
    pub analog: Option<PackAnalog>,
    pub alarm: Option<PackAlarm>,
    /// Analog datum is fresh until this instant; `None` means never read
    pub analog_deadline: Option<Instant>,
    /// Alarm datum is fresh until this instant; `None` means never read
    pub alarm_deadline: Option<Instant>,
    /// Decode failures since startup; connection stays up on these
    pub soft_errors: u32,
}

impl PackSlot {
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.analog_deadline.is_some_and(|deadline| now < deadline)
            && self.alarm_deadline.is_some_and(|deadline| now < deadline)
    }
}

/// Per-pack numbers exposed to the operator UI
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PackSnapshot {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature: Option<f64>,
    pub soc: Option<u8>,
    pub cycles: Option<u16>,
    pub soft_errors: u32,
    pub fresh: bool,
}

/// Fleet-level battery state consumed by the control loop
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BmsAggregate {
    /// Highest pack voltage in V
    pub voltage: Option<f64>,
    /// Sum of pack currents in A, positive while charging
    pub current: Option<f64>,
    /// Hottest sensor across all packs in degrees Celsius
    pub temperature: Option<f64>,
    /// Rounded mean state of charge in percent
    pub soc: Option<u8>,
    /// State of charge of the emptiest pack
    pub soc_low: Option<u8>,
    /// State of charge of the fullest pack
    pub soc_high: Option<u8>,
    pub packs: Vec<PackSnapshot>,
    /// All packs fresh, alarm-free and signalling readiness
    pub ready: bool,
    /// First disqualification found, e.g. "alarm pack 0"
    pub error: Option<String>,
}

fn pack_snapshot(slot: &PackSlot, now: Instant) -> PackSnapshot {
    PackSnapshot {
        voltage: slot.analog.as_ref().map(|a| a.voltage),
        current: slot.analog.as_ref().map(|a| a.current),
        temperature: slot
            .analog
            .as_ref()
            .and_then(|a| a.temps.iter().copied().fold(None, |acc: Option<f64>, t| {
                Some(acc.map_or(t, |m| m.max(t)))
            })),
        soc: slot.analog.as_ref().map(|a| a.soc),
        cycles: slot.analog.as_ref().map(|a| a.cycles),
        soft_errors: slot.soft_errors,
        fresh: slot.is_fresh(now),
    }
}

/// Fold the pack slots into the fleet aggregate.
///
/// Disqualification order per pack: stale data, then active alarm, then
/// missing readiness. The first hit wins and blanks the numeric fields.
pub fn aggregate(slots: &[PackSlot], now: Instant) -> BmsAggregate {
    let packs: Vec<PackSnapshot> = slots.iter().map(|s| pack_snapshot(s, now)).collect();

    let mut error = None;
    for (i, slot) in slots.iter().enumerate() {
        if !slot.is_fresh(now) || slot.analog.is_none() || slot.alarm.is_none() {
            error = Some(format!("timeout pack {}", i));
            break;
        }
        if slot.alarm.as_ref().is_some_and(|a| a.error) {
            error = Some(format!("alarm pack {}", i));
            break;
        }
        if slot.alarm.as_ref().is_some_and(|a| !a.ready) {
            error = Some(format!("not ready pack {}", i));
            break;
        }
    }

    if slots.is_empty() {
        error = Some("no packs configured".to_string());
    }

    if let Some(error) = error {
        return BmsAggregate {
            packs,
            ready: false,
            error: Some(error),
            ..Default::default()
        };
    }

    let mut voltage = f64::MIN;
    let mut current = 0.0;
    let mut temperature = f64::MIN;
    let mut soc_sum = 0.0;
    let mut soc_low = u8::MAX;
    let mut soc_high = u8::MIN;

    for slot in slots {
        // all packs verified present above
        if let Some(analog) = slot.analog.as_ref() {
            voltage = voltage.max(analog.voltage);
            current += analog.current;
            for &t in &analog.temps {
                temperature = temperature.max(t);
            }
            soc_sum += f64::from(analog.soc);
            soc_low = soc_low.min(analog.soc);
            soc_high = soc_high.max(analog.soc);
        }
    }

    let soc = (soc_sum / slots.len() as f64).round() as u8;

    BmsAggregate {
        voltage: Some(voltage),
        current: Some(current),
        temperature: Some(temperature),
        soc: Some(soc),
        soc_low: Some(soc_low),
        soc_high: Some(soc_high),
        packs,
        ready: true,
        error: None,
    }
}

/// A telemetry source the cycle driver can poll
pub trait BmsSource: Send {
    /// Refresh the cached aggregate; must not block the control loop
    fn update(&mut self);

    /// Latest aggregate
    fn snapshot(&self) -> &BmsAggregate;

    /// Full per-pack telemetry for diagnostics
    fn detail(&self) -> serde_json::Value;

    fn ready(&self) -> bool {
        self.snapshot().ready
    }

    fn error(&self) -> Option<String> {
        self.snapshot().error.clone()
    }

    fn voltage(&self) -> Option<f64> {
        self.snapshot().voltage
    }

    fn current(&self) -> Option<f64> {
        self.snapshot().current
    }

    fn temperature(&self) -> Option<f64> {
        self.snapshot().temperature
    }

    fn soc(&self) -> Option<u8> {
        self.snapshot().soc
    }

    fn soc_low(&self) -> Option<u8> {
        self.snapshot().soc_low
    }

    fn soc_high(&self) -> Option<u8> {
        self.snapshot().soc_high
    }
}

/// Source with no hardware behind it. Never ready; used in tests and when
/// running without a serial port.
#[derive(Debug, Default)]
pub struct InertBms {
    aggregate: BmsAggregate,
}

impl InertBms {
    pub fn new() -> Self {
        Self {
            aggregate: BmsAggregate {
                error: Some("no packs configured".to_string()),
                ..Default::default()
            },
        }
    }
}

impl BmsSource for InertBms {
    fn update(&mut self) {}

    fn snapshot(&self) -> &BmsAggregate {
        &self.aggregate
    }

    fn detail(&self) -> serde_json::Value {
        serde_json::json!({ "packs": [] })
    }
}
