//! Serial telemetry poller for Pylontech US2000/US3000 packs
//!
//! A dedicated thread owns the RS485 serial handle and round-robins the
//! packs, reading analog then alarm data with a fixed pause between
//! requests. After every read it recomputes the fleet aggregate and
//! publishes it over a `watch` channel; the control loop consumes snapshots
//! without ever touching the serial port.
//!
//! Failure handling is two-tier: transport errors drop the serial handle
//! (reconnect on the next outer pass), decode errors keep the connection and
//! bump a per-pack counter. Neither touches the stored datum, which stays
//! valid until its freshness deadline lapses, so a transient failure inside
//! the freshness window does not disturb the control loop.

use crate::bms::{BmsAggregate, BmsSource, PackSlot, aggregate};
use crate::config::BmsConfig;
use crate::error::{HestiaError, Result};
use crate::logging::{StructuredLogger, get_logger};
use crate::pylontech::{
    CID_ALARM, CID_ANALOG, CID_MANUFACTURER, CID_SERIAL_NUMBER, PackAlarm, PackAnalog,
    decode_frame, encode_command, parse_alarm, parse_analog, parse_manufacturer_info,
    parse_serial_number,
};
use serde_json::json;
use serialport::SerialPort;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// First pack answers on RS485 address 2
const BASE_ADDRESS: u8 = 2;
/// Per-request read timeout on the serial handle
const READ_TIMEOUT: Duration = Duration::from_millis(500);
/// Wait before retrying a failed port open
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
/// Response frames never exceed this many bytes
const MAX_FRAME_LEN: usize = 4096;

/// One published poller sample: control-loop aggregate plus diagnostics
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub aggregate: BmsAggregate,
    pub detail: serde_json::Value,
}

/// Watch-backed [`BmsSource`] fed by the poller thread
pub struct Us2000Bms {
    rx: watch::Receiver<Telemetry>,
    cached: Telemetry,
    shutdown: Arc<AtomicBool>,
}

impl Us2000Bms {
    /// Spawn the poller thread for the configured serial link
    pub fn spawn(config: BmsConfig) -> Result<Self> {
        let (tx, rx) = watch::channel(Telemetry::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut poller = Poller {
            slots: vec![PackSlot::default(); config.pack_count],
            config,
            port: None,
            tx,
            shutdown: Arc::clone(&shutdown),
            logger: get_logger("us2000"),
        };

        thread::Builder::new()
            .name("us2000-poller".to_string())
            .spawn(move || poller.run())
            .map_err(|e| HestiaError::io(format!("Failed to spawn poller thread: {}", e)))?;

        Ok(Self {
            rx,
            cached: Telemetry::default(),
            shutdown,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_receiver(rx: watch::Receiver<Telemetry>) -> Self {
        Self {
            rx,
            cached: Telemetry::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl BmsSource for Us2000Bms {
    fn update(&mut self) {
        self.cached = self.rx.borrow_and_update().clone();
    }

    fn snapshot(&self) -> &BmsAggregate {
        &self.cached.aggregate
    }

    fn detail(&self) -> serde_json::Value {
        self.cached.detail.clone()
    }
}

impl Drop for Us2000Bms {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

struct Poller {
    config: BmsConfig,
    port: Option<Box<dyn SerialPort>>,
    slots: Vec<PackSlot>,
    tx: watch::Sender<Telemetry>,
    shutdown: Arc<AtomicBool>,
    logger: StructuredLogger,
}

impl Poller {
    fn run(&mut self) {
        self.logger.info(&format!(
            "Polling {} pack(s) on {} at {} baud",
            self.config.pack_count, self.config.port, self.config.baudrate
        ));

        while !self.shutdown.load(Ordering::Relaxed) {
            if self.port.is_none() {
                if let Err(e) = self.connect() {
                    self.logger.warn(&format!(
                        "Cannot open {}: {}",
                        self.config.port, e
                    ));
                    self.publish();
                    thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            }

            for index in 0..self.config.pack_count {
                if self.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                self.poll_pack(index);
                thread::sleep(Duration::from_millis(self.config.pause_ms));
                if self.port.is_none() {
                    // transport failure, reconnect on the next outer pass
                    break;
                }
            }
        }
    }

    fn connect(&mut self) -> Result<()> {
        let port = serialport::new(&self.config.port, self.config.baudrate)
            .timeout(READ_TIMEOUT)
            .open()?;
        self.port = Some(port);
        self.logger.info(&format!("Opened {}", self.config.port));
        self.log_serial_numbers();
        Ok(())
    }

    /// Best-effort identification after connect. The manufacturer info is
    /// read once without addressing a specific pack; on a shared bus the
    /// first pack answers regardless.
    fn log_serial_numbers(&mut self) {
        let result = self
            .transact(&encode_command(BASE_ADDRESS, CID_MANUFACTURER, b""))
            .and_then(|raw| decode_frame(&raw))
            .and_then(|frame| parse_manufacturer_info(&frame));
        match result {
            Ok(info) => self.logger.info(&format!(
                "Device {} v{} ({})",
                info.device, info.version, info.manufacturer
            )),
            Err(e) => self
                .logger
                .debug(&format!("Manufacturer info read failed: {}", e)),
        }

        for index in 0..self.config.pack_count {
            let addr = BASE_ADDRESS + index as u8;
            let info = format!("{:02X}", addr);
            let result = self
                .transact(&encode_command(addr, CID_SERIAL_NUMBER, info.as_bytes()))
                .and_then(|raw| decode_frame(&raw))
                .and_then(|frame| parse_serial_number(&frame));
            match result {
                Ok(serial) => self
                    .logger
                    .info(&format!("Pack {}: serial number {}", index, serial)),
                Err(e) => self
                    .logger
                    .debug(&format!("Pack {}: serial number read failed: {}", index, e)),
            }
        }
    }

    /// One pack round: analog then alarm, publishing after each read
    fn poll_pack(&mut self, index: usize) {
        let addr = BASE_ADDRESS + index as u8;
        let info = format!("{:02X}", addr);

        let analog = self
            .transact(&encode_command(addr, CID_ANALOG, info.as_bytes()))
            .and_then(|raw| decode_frame(&raw))
            .and_then(|frame| parse_analog(&frame));
        self.store_analog(index, analog);
        self.publish();

        if self.port.is_none() {
            return;
        }
        thread::sleep(Duration::from_millis(self.config.pause_ms));

        let alarm = self
            .transact(&encode_command(addr, CID_ALARM, info.as_bytes()))
            .and_then(|raw| decode_frame(&raw))
            .and_then(|frame| parse_alarm(&frame));
        self.store_alarm(index, alarm);
        self.publish();
    }

    fn store_analog(&mut self, index: usize, result: Result<PackAnalog>) {
        match result {
            Ok(analog) => {
                let slot = &mut self.slots[index];
                slot.analog = Some(analog);
                slot.analog_deadline =
                    Some(Instant::now() + Duration::from_secs(self.config.lifetime_secs));
            }
            Err(e) => self.note_failure(index, "analog", &e),
        }
    }

    fn store_alarm(&mut self, index: usize, result: Result<PackAlarm>) {
        match result {
            Ok(alarm) => {
                let slot = &mut self.slots[index];
                slot.alarm = Some(alarm);
                slot.alarm_deadline =
                    Some(Instant::now() + Duration::from_secs(self.config.lifetime_secs));
            }
            Err(e) => self.note_failure(index, "alarm", &e),
        }
    }

    /// A transport failure drops the handle; a decode failure keeps the
    /// connection. The stored datum is never touched here, it ages out
    /// through its freshness deadline.
    fn note_failure(&mut self, index: usize, what: &str, e: &HestiaError) {
        if e.is_transport() {
            self.logger.warn(&format!(
                "Pack {}: {} transport failure: {}",
                index, what, e
            ));
            self.port = None;
        } else {
            self.slots[index].soft_errors += 1;
            self.logger
                .warn(&format!("Pack {}: discarding {} reply: {}", index, what, e));
        }
    }

    /// Send one request and collect the reply up to the `\r` terminator
    fn transact(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| HestiaError::serial("serial port not open"))?;

        port.write_all(request)?;
        port.flush()?;

        let mut frame = Vec::with_capacity(160);
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(0) => return Err(HestiaError::serial("serial link closed")),
                Ok(_) => {
                    frame.push(byte[0]);
                    if byte[0] == b'\r' {
                        return Ok(frame);
                    }
                    if frame.len() > MAX_FRAME_LEN {
                        return Err(HestiaError::protocol("unterminated response frame"));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(HestiaError::timeout(format!(
                        "no response after {} byte(s)",
                        frame.len()
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn publish(&self) {
        let now = Instant::now();
        let packs: Vec<serde_json::Value> = self
            .slots
            .iter()
            .map(|slot| {
                json!({
                    "analog": slot.analog,
                    "alarm": slot.alarm,
                    "soft_errors": slot.soft_errors,
                    "fresh": slot.is_fresh(now),
                })
            })
            .collect();

        let telemetry = Telemetry {
            aggregate: aggregate(&self.slots, now),
            detail: json!({ "packs": packs }),
        };
        let _ = self.tx.send(telemetry);
    }
}
