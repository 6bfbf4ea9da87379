//! Inverter driver boundary
//!
//! The battery inverter hangs off its own link and speaks a vendor protocol
//! that is out of scope here; the control loop only needs this narrow
//! surface. `InertInverter` stands in when no device is attached and in
//! tests.

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InverterState {
    /// Converting; follows the commanded set-point
    On,
    /// Standby, near-zero self consumption
    Sleep,
    /// Starting up or waiting for the DC bus
    Wait,
}

/// Per-cycle device view for the safety gate and the operator UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InverterSnapshot {
    pub state: InverterState,
    pub bus_voltage: Option<f64>,
    pub bus_current: Option<f64>,
    pub ready: bool,
}

impl Default for InverterSnapshot {
    fn default() -> Self {
        Self {
            state: InverterState::Wait,
            bus_voltage: None,
            bus_current: None,
            ready: false,
        }
    }
}

#[async_trait]
pub trait Inverter: Send {
    /// Apply a power set-point in W, positive charges the battery
    async fn command(&mut self, set_point_w: f64) -> Result<()>;

    /// Exchange one status round with the device
    async fn update(&mut self, pause: Duration) -> Result<()>;

    /// Enter standby
    async fn sleep(&mut self) -> Result<()>;

    /// Leave standby
    async fn wakeup(&mut self) -> Result<()>;

    fn snapshot(&self) -> InverterSnapshot;

    fn ready(&self) -> bool {
        self.snapshot().ready
    }
}

/// Device-less implementation: accepts every command, reports ready
#[derive(Debug, Default)]
pub struct InertInverter {
    set_point: f64,
    asleep: bool,
}

impl InertInverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_point(&self) -> f64 {
        self.set_point
    }
}

#[async_trait]
impl Inverter for InertInverter {
    async fn command(&mut self, set_point_w: f64) -> Result<()> {
        self.set_point = set_point_w;
        Ok(())
    }

    async fn update(&mut self, _pause: Duration) -> Result<()> {
        Ok(())
    }

    async fn sleep(&mut self) -> Result<()> {
        self.asleep = true;
        Ok(())
    }

    async fn wakeup(&mut self) -> Result<()> {
        self.asleep = false;
        Ok(())
    }

    fn snapshot(&self) -> InverterSnapshot {
        InverterSnapshot {
            state: if self.asleep {
                InverterState::Sleep
            } else {
                InverterState::On
            },
            bus_voltage: None,
            bus_current: None,
            ready: true,
        }
    }
}
