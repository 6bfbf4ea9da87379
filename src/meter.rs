//! MeterHub aggregator client
//!
//! One POST per control cycle: we push our own status (text plus state of
//! charge) and get the household power snapshot back. A failed request keeps
//! the last good sample alive until its lifetime deadline; after that the
//! sample reads as absent and the safety gate trips on "meter not ready".

use crate::config::MeterHubConfig;
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Household power snapshot in W. Fields the aggregator cannot measure are
/// absent rather than zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterData {
    /// Grid exchange, positive while importing
    pub grid_p: Option<f64>,
    /// EV charger draw
    pub car_p: Option<f64>,
    /// PV production
    pub pv_p: Option<f64>,
    /// Total household consumption
    pub home_all_p: Option<f64>,
    /// Battery inverter AC power
    pub bat_p: Option<f64>,
}

/// Status report sent with every poll
#[derive(Debug, Serialize)]
struct StatusReport<'a> {
    battery_status_text: &'a str,
    battery_soc: Option<u8>,
}

pub struct MeterClient {
    client: reqwest::Client,
    url: String,
    lifetime: Duration,
    data: MeterData,
    deadline: Option<Instant>,
    error: Option<String>,
    logger: StructuredLogger,
}

impl MeterClient {
    pub fn new(config: &MeterHubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            lifetime: Duration::from_secs(config.lifetime_secs),
            data: MeterData::default(),
            deadline: None,
            error: None,
            logger: get_logger("meter"),
        })
    }

    /// Poll the aggregator, reporting our status in the same request
    pub async fn update(&mut self, status_text: &str, soc: Option<u8>) {
        let report = StatusReport {
            battery_status_text: status_text,
            battery_soc: soc,
        };

        let result = async {
            let response = self
                .client
                .post(&self.url)
                .json(&report)
                .send()
                .await?
                .error_for_status()?;
            response.json::<MeterData>().await
        }
        .await;

        match result {
            Ok(data) => {
                self.data = data;
                self.deadline = Some(Instant::now() + self.lifetime);
                if self.error.take().is_some() {
                    self.logger.info("MeterHub connection recovered");
                }
            }
            Err(e) => {
                if self.error.is_none() {
                    self.logger.warn(&format!("MeterHub request failed: {}", e));
                }
                self.error = Some(e.to_string());
            }
        }
    }

    /// A sample newer than its lifetime is available
    pub fn is_ready(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now < deadline)
    }

    /// Current sample; absent fields once the lifetime has passed
    pub fn sample(&self, now: Instant) -> MeterData {
        if self.is_ready(now) {
            self.data.clone()
        } else {
            MeterData::default()
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn inject(&mut self, data: MeterData, deadline: Instant) {
        self.data = data;
        self.deadline = Some(deadline);
    }
}
