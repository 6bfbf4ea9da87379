//! Pylontech US2000/US3000 wire-protocol codec
//!
//! Pure, stateless encode/decode for the ASCII-hex framed RS485 protocol the
//! battery packs speak. A request/response frame looks like:
//!
//! ```text
//! ~ 20 02 46 42 E002 02 FD33 \r
//!   |  |  |  |  |    |  |
//!   |  |  |  |  |    |  frame checksum (4 hex digits)
//!   |  |  |  |  |    info field (command parameter)
//!   |  |  |  |  length code (obfuscated 12-bit info length)
//!   |  |  |  CID2 (command)
//!   |  |  CID1 (battery data, always 0x46)
//!   |  pack address (RS485 addresses start at 2)
//!   protocol version
//! ```
//!
//! Everything between `~` and `\r` is ASCII hex. Decode failures are
//! `HestiaError::Protocol` and are distinct from transport errors.

use crate::error::{HestiaError, Result};
use serde::Serialize;

/// Read analog values (voltages, temperatures, current, capacity)
pub const CID_ANALOG: u8 = 0x42;
/// Read alarm/status info
pub const CID_ALARM: u8 = 0x44;
/// Read serial number (diagnostic only)
pub const CID_SERIAL_NUMBER: u8 = 0x93;
/// Read manufacturer info (diagnostic only; unreliable when several packs
/// share the link, the bus then answers for the first pack regardless of the
/// addressed one)
pub const CID_MANUFACTURER: u8 = 0x51;

const PROTOCOL_VERSION: u8 = 0x20;
const CID1_BATTERY: u8 = 0x46;
const FRAME_START: u8 = b'~';
const FRAME_END: u8 = b'\r';

/// Payload offset inside a decoded response frame: 6 header bytes
/// (version, address, CID1, RTN, length) plus data flag and command address.
const INFO_OFFSET: usize = 8;

/// Per-pack analog telemetry from a CID 0x42 response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackAnalog {
    /// Cell voltages in mV, one per cell
    pub cell_mv: Vec<u16>,
    /// Temperatures in degrees Celsius
    pub temps: Vec<f64>,
    /// Pack current in A, positive while charging
    pub current: f64,
    /// Pack voltage in V
    pub voltage: f64,
    /// Remaining capacity (raw units, typically mAh*10)
    pub charge: u16,
    /// Total capacity (same units as `charge`)
    pub capacity: u16,
    /// Charge/discharge cycle count
    pub cycles: u16,
    /// State of charge in percent, round(100 * charge / capacity)
    pub soc: u8,
}

/// Per-pack alarm/status info from a CID 0x44 response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackAlarm {
    /// Per-cell alarm flags
    pub cell_flags: Vec<u8>,
    /// Per-sensor temperature alarm flags
    pub temp_flags: Vec<u8>,
    /// Charge current alarm flag
    pub charge_current_flag: u8,
    /// Pack voltage alarm flag
    pub pack_voltage_flag: u8,
    /// Discharge current alarm flag
    pub discharge_current_flag: u8,
    /// Raw 5-byte status vector
    pub status: [u8; 5],
    /// Pack signals ready for operation (status[1] bit 2)
    pub ready: bool,
    /// Pack signals an active failure (status[0] != 0)
    pub error: bool,
}

/// Manufacturer info from a CID 0x51 response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManufacturerInfo {
    pub device: String,
    pub version: String,
    pub manufacturer: String,
}

/// Checksum over the ASCII body between start marker and checksum field:
/// byte sum, complemented, reduced mod 0x10000, plus one.
pub fn frame_checksum(body: &[u8]) -> u32 {
    let sum: u32 = body.iter().map(|&b| u32::from(b)).sum();
    ((!sum) & 0xFFFF) + 1
}

/// Length-obfuscation code for the info field: the 12-bit byte length with a
/// checksum nibble (nibble sum complemented mod 16) packed into the top four
/// bits. Zero-length info encodes as 0.
pub fn info_length_code(len: usize) -> u32 {
    if len == 0 {
        return 0;
    }
    let len = (len & 0xFFF) as u32;
    let nibble_sum = (len & 0xF) + ((len >> 4) & 0xF) + ((len >> 8) & 0xF);
    let check = 0b1111 - (nibble_sum % 16) + 1;
    (check << 12) + len
}

/// Build a full request frame for `cid2` addressed to `addr`
pub fn encode_command(addr: u8, cid2: u8, info: &[u8]) -> Vec<u8> {
    let mut body = format!(
        "{:02X}{:02X}{:02X}{:02X}{:04X}",
        PROTOCOL_VERSION,
        addr,
        CID1_BATTERY,
        cid2,
        info_length_code(info.len())
    )
    .into_bytes();
    body.extend_from_slice(info);

    let checksum = frame_checksum(&body);

    let mut frame = Vec::with_capacity(body.len() + 6);
    frame.push(FRAME_START);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(format!("{:04X}", checksum).as_bytes());
    frame.push(FRAME_END);
    frame
}

/// Validate markers and checksum of a raw frame and hex-decode its body.
///
/// The decoded bytes include the header and the trailing checksum bytes;
/// the payload parsers index from [`INFO_OFFSET`].
pub fn decode_frame(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < 18 {
        return Err(HestiaError::protocol(format!(
            "frame too short ({} bytes)",
            raw.len()
        )));
    }
    if raw[0] != FRAME_START || raw[raw.len() - 1] != FRAME_END {
        return Err(HestiaError::protocol("missing frame markers"));
    }
    if raw.len() % 2 != 0 {
        return Err(HestiaError::protocol("odd frame length"));
    }

    let received = parse_hex_u32(&raw[raw.len() - 5..raw.len() - 1])?;
    let computed = frame_checksum(&raw[1..raw.len() - 5]);
    if received != computed {
        return Err(HestiaError::protocol(format!(
            "checksum mismatch: received {:04X}, computed {:04X}",
            received, computed
        )));
    }

    decode_hex(&raw[1..raw.len() - 1])
}

/// Parse a decoded CID 0x42 analog response
pub fn parse_analog(frame: &[u8]) -> Result<PackAnalog> {
    let mut r = Reader::new(frame, INFO_OFFSET);

    let cell_count = r.u8()? as usize;
    let mut cell_mv = Vec::with_capacity(cell_count);
    for _ in 0..cell_count {
        cell_mv.push(r.u16()?);
    }

    let temp_count = r.u8()? as usize;
    let mut temps = Vec::with_capacity(temp_count);
    for _ in 0..temp_count {
        // raw value is deci-Kelvin; 2731 == 0.0 degrees Celsius
        temps.push((f64::from(r.u16()?) - 2731.0) / 10.0);
    }

    let current = f64::from(r.i16()?) / 10.0;
    let voltage = f64::from(r.u16()?) / 1000.0;
    let charge = r.u16()?;
    r.skip(1)?;
    let capacity = r.u16()?;
    let cycles = r.u16()?;

    if capacity == 0 {
        return Err(HestiaError::protocol("analog frame with zero capacity"));
    }
    let soc = (100.0 * f64::from(charge) / f64::from(capacity)).round() as u8;

    Ok(PackAnalog {
        cell_mv,
        temps,
        current,
        voltage,
        charge,
        capacity,
        cycles,
        soc,
    })
}

/// Parse a decoded CID 0x44 alarm response
pub fn parse_alarm(frame: &[u8]) -> Result<PackAlarm> {
    let mut r = Reader::new(frame, INFO_OFFSET);

    let cell_count = r.u8()? as usize;
    let cell_flags = r.bytes(cell_count)?.to_vec();
    let temp_count = r.u8()? as usize;
    let temp_flags = r.bytes(temp_count)?.to_vec();

    let charge_current_flag = r.u8()?;
    let pack_voltage_flag = r.u8()?;
    let discharge_current_flag = r.u8()?;

    let raw_status = r.bytes(5)?;
    let mut status = [0u8; 5];
    status.copy_from_slice(raw_status);

    Ok(PackAlarm {
        cell_flags,
        temp_flags,
        charge_current_flag,
        pack_voltage_flag,
        discharge_current_flag,
        status,
        ready: status[1] & 0x04 != 0,
        error: status[0] != 0,
    })
}

/// Parse a decoded CID 0x93 serial number response
pub fn parse_serial_number(frame: &[u8]) -> Result<String> {
    let mut r = Reader::new(frame, 7);
    let raw = r.bytes(16)?;
    let trimmed: Vec<u8> = raw.iter().copied().take_while(|&b| b != 0).collect();
    String::from_utf8(trimmed)
        .map_err(|e| HestiaError::protocol(format!("serial number not UTF-8: {}", e)))
}

/// Parse a decoded CID 0x51 manufacturer info response
pub fn parse_manufacturer_info(frame: &[u8]) -> Result<ManufacturerInfo> {
    let mut r = Reader::new(frame, 6);
    let device_raw = r.bytes(10)?;
    let major = r.u8()?;
    let minor = r.u8()?;
    let manufacturer_raw = r.bytes(20)?;

    let device: Vec<u8> = device_raw.iter().copied().take_while(|&b| b != 0).collect();
    let manufacturer: Vec<u8> = manufacturer_raw
        .iter()
        .copied()
        .filter(|&b| b != b'-' && b != 0)
        .collect();

    Ok(ManufacturerInfo {
        device: String::from_utf8_lossy(&device).into_owned(),
        version: format!("{}.{}", major, minor),
        manufacturer: String::from_utf8_lossy(&manufacturer).into_owned(),
    })
}

/// Bounds-checked big-endian reader over a decoded frame
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        let end = self.pos + count;
        if end > self.buf.len() {
            return Err(HestiaError::protocol(format!(
                "frame truncated: need {} bytes at offset {}, have {}",
                count,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, count: usize) -> Result<()> {
        self.bytes(count).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16> {
        let b = self.bytes(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }
}

fn hex_value(digit: u8) -> Result<u32> {
    match digit {
        b'0'..=b'9' => Ok(u32::from(digit - b'0')),
        b'A'..=b'F' => Ok(u32::from(digit - b'A') + 10),
        b'a'..=b'f' => Ok(u32::from(digit - b'a') + 10),
        other => Err(HestiaError::protocol(format!(
            "invalid hex digit 0x{:02X}",
            other
        ))),
    }
}

fn parse_hex_u32(digits: &[u8]) -> Result<u32> {
    let mut value = 0u32;
    for &d in digits {
        value = (value << 4) | hex_value(d)?;
    }
    Ok(value)
}

fn decode_hex(ascii: &[u8]) -> Result<Vec<u8>> {
    if ascii.len() % 2 != 0 {
        return Err(HestiaError::protocol("odd hex body length"));
    }
    let mut out = Vec::with_capacity(ascii.len() / 2);
    for pair in ascii.chunks_exact(2) {
        out.push(((hex_value(pair[0])? << 4) | hex_value(pair[1])?) as u8);
    }
    Ok(out)
}
