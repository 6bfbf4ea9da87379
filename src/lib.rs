//! Hestia - home battery energy management
//!
//! Reads household power from a MeterHub aggregator and battery telemetry
//! from Pylontech US2000/US3000 packs over RS485, then drives a hybrid
//! inverter to charge, feed or idle the battery so grid exchange stays
//! minimal within the configured safety and operator constraints.

pub mod blackbox;
pub mod bms;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod inverter;
pub mod logging;
pub mod meter;
pub mod pylontech;
pub mod settings;
pub mod timer;
pub mod web;

pub use config::Config;
pub use error::{HestiaError, Result};
