//! Operational settings profiles
//!
//! Charge/feed behavior is tuned through named profiles ("standard",
//! "eco", "holiday", ...). Every field of a profile is optional; profile 0
//! must define all of them and acts as the fallback for the rest. Profiles
//! are immutable after config load, the operator only switches the active
//! index.

use crate::error::{HestiaError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One profile as it appears in the config file. Durations are seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsProfile {
    pub name: String,

    pub charge_min_power: Option<f64>,
    pub charge_max_power: Option<f64>,
    pub charge_reserve_power: Option<f64>,
    pub charge_end_soc: Option<u8>,
    pub charge_hysteresis_soc: Option<u8>,
    pub charge_end_voltage: Option<f64>,
    pub charge_start_time: Option<u64>,
    pub charge_stop_time: Option<u64>,

    pub feed_min_power: Option<f64>,
    pub feed_max_power: Option<f64>,
    pub feed_soc25_max_power: Option<f64>,
    pub feed_reserve_power: Option<f64>,
    pub feed_end_soc: Option<u8>,
    pub feed_hysteresis_soc: Option<u8>,
    pub feed_end_voltage: Option<f64>,
    pub feed_start_time: Option<u64>,
    pub feed_stop_time: Option<u64>,
    pub feed_throttle_time: Option<u64>,
    pub feed_throttle_power: Option<f64>,

    pub idle_sleep_time: Option<u64>,
}

/// Fully-resolved parameter set used by the control loop
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub name: String,

    pub charge_min_power: f64,
    pub charge_max_power: f64,
    pub charge_reserve_power: f64,
    pub charge_end_soc: u8,
    pub charge_hysteresis_soc: u8,
    pub charge_end_voltage: f64,
    pub charge_start_time: Duration,
    pub charge_stop_time: Duration,

    pub feed_min_power: f64,
    pub feed_max_power: f64,
    pub feed_soc25_max_power: f64,
    pub feed_reserve_power: f64,
    pub feed_end_soc: u8,
    pub feed_hysteresis_soc: u8,
    pub feed_end_voltage: f64,
    pub feed_start_time: Duration,
    pub feed_stop_time: Duration,
    pub feed_throttle_time: Duration,
    pub feed_throttle_power: f64,

    pub idle_sleep_time: Duration,
}

/// Built-in "standard" profile, used when no profiles are configured.
/// Values match a two-pack US2000 installation on a 1 kW inverter.
pub static STANDARD: Lazy<SettingsProfile> = Lazy::new(|| SettingsProfile {
    name: "standard".to_string(),
    charge_min_power: Some(300.0),
    charge_max_power: Some(1000.0),
    charge_reserve_power: Some(200.0),
    charge_end_soc: Some(95),
    charge_hysteresis_soc: Some(3),
    charge_end_voltage: Some(52.0),
    charge_start_time: Some(30),
    charge_stop_time: Some(30),
    feed_min_power: Some(40.0),
    feed_max_power: Some(2000.0),
    feed_soc25_max_power: Some(1500.0),
    feed_reserve_power: Some(30.0),
    feed_end_soc: Some(10),
    feed_hysteresis_soc: Some(5),
    feed_end_voltage: Some(47.0),
    feed_start_time: Some(30),
    feed_stop_time: Some(30),
    feed_throttle_time: Some(300),
    feed_throttle_power: Some(1500.0),
    idle_sleep_time: Some(600),
});

/// The configured profile list plus the active index
#[derive(Debug, Clone)]
pub struct SettingsBook {
    profiles: Vec<SettingsProfile>,
}

impl SettingsBook {
    /// Build from the configured profile list. An empty list yields a book
    /// containing only the built-in standard profile.
    pub fn new(mut profiles: Vec<SettingsProfile>) -> Result<Self> {
        if profiles.is_empty() {
            profiles.push(STANDARD.clone());
        }
        validate_base_profile(&profiles[0])?;
        Ok(Self { profiles })
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.iter().map(|p| p.name.clone()).collect()
    }

    /// Resolve the view for profile `index`: each parameter answers from the
    /// selected profile, falling back to profile 0. Unknown indexes resolve
    /// to profile 0.
    pub fn resolve(&self, index: usize) -> Settings {
        let base = &self.profiles[0];
        let active = self.profiles.get(index).unwrap_or(base);

        // base is validated complete; STANDARD backs the type system only
        macro_rules! field {
            ($name:ident) => {
                active
                    .$name
                    .or(base.$name)
                    .or(STANDARD.$name)
                    .unwrap_or_default()
            };
        }

        Settings {
            name: active.name.clone(),
            charge_min_power: field!(charge_min_power),
            charge_max_power: field!(charge_max_power),
            charge_reserve_power: field!(charge_reserve_power),
            charge_end_soc: field!(charge_end_soc),
            charge_hysteresis_soc: field!(charge_hysteresis_soc),
            charge_end_voltage: field!(charge_end_voltage),
            charge_start_time: Duration::from_secs(field!(charge_start_time)),
            charge_stop_time: Duration::from_secs(field!(charge_stop_time)),
            feed_min_power: field!(feed_min_power),
            feed_max_power: field!(feed_max_power),
            feed_soc25_max_power: field!(feed_soc25_max_power),
            feed_reserve_power: field!(feed_reserve_power),
            feed_end_soc: field!(feed_end_soc),
            feed_hysteresis_soc: field!(feed_hysteresis_soc),
            feed_end_voltage: field!(feed_end_voltage),
            feed_start_time: Duration::from_secs(field!(feed_start_time)),
            feed_stop_time: Duration::from_secs(field!(feed_stop_time)),
            feed_throttle_time: Duration::from_secs(field!(feed_throttle_time)),
            feed_throttle_power: field!(feed_throttle_power),
            idle_sleep_time: Duration::from_secs(field!(idle_sleep_time)),
        }
    }
}

fn validate_base_profile(profile: &SettingsProfile) -> Result<()> {
    macro_rules! require {
        ($name:ident) => {
            if profile.$name.is_none() {
                return Err(HestiaError::validation(
                    concat!("settings[0].", stringify!($name)),
                    "base profile must define every parameter",
                ));
            }
        };
    }

    require!(charge_min_power);
    require!(charge_max_power);
    require!(charge_reserve_power);
    require!(charge_end_soc);
    require!(charge_hysteresis_soc);
    require!(charge_end_voltage);
    require!(charge_start_time);
    require!(charge_stop_time);
    require!(feed_min_power);
    require!(feed_max_power);
    require!(feed_soc25_max_power);
    require!(feed_reserve_power);
    require!(feed_end_soc);
    require!(feed_hysteresis_soc);
    require!(feed_end_voltage);
    require!(feed_start_time);
    require!(feed_stop_time);
    require!(feed_throttle_time);
    require!(feed_throttle_power);
    require!(idle_sleep_time);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eco_profile() -> SettingsProfile {
        SettingsProfile {
            name: "eco".to_string(),
            feed_max_power: Some(800.0),
            idle_sleep_time: Some(120),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_list_uses_standard() {
        let book = SettingsBook::new(Vec::new()).unwrap();
        assert_eq!(book.len(), 1);
        let settings = book.resolve(0);
        assert_eq!(settings.name, "standard");
        assert_eq!(settings.charge_max_power, 1000.0);
        assert_eq!(settings.idle_sleep_time, Duration::from_secs(600));
    }

    #[test]
    fn test_sparse_profile_falls_back_to_base() {
        let book = SettingsBook::new(vec![STANDARD.clone(), eco_profile()]).unwrap();
        let eco = book.resolve(1);
        assert_eq!(eco.name, "eco");
        // overridden
        assert_eq!(eco.feed_max_power, 800.0);
        assert_eq!(eco.idle_sleep_time, Duration::from_secs(120));
        // inherited from profile 0
        assert_eq!(eco.charge_max_power, 1000.0);
        assert_eq!(eco.feed_end_soc, 10);
    }

    #[test]
    fn test_unknown_index_resolves_base() {
        let book = SettingsBook::new(vec![STANDARD.clone(), eco_profile()]).unwrap();
        let settings = book.resolve(7);
        assert_eq!(settings.name, "standard");
        assert_eq!(settings.feed_max_power, 2000.0);
    }

    #[test]
    fn test_incomplete_base_profile_rejected() {
        let err = SettingsBook::new(vec![eco_profile()]).unwrap_err();
        assert!(matches!(err, HestiaError::Validation { .. }));
    }

    #[test]
    fn test_standard_profile_is_complete() {
        assert!(validate_base_profile(&STANDARD).is_ok());
    }
}
