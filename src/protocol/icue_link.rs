//! iCUE Link System Hub endpoint map.
//!
//! The hub daisy-chains up to 24 sub-devices. Which ports are populated, and
//! with what, is only known after reading the sub-device endpoint, so the
//! channel set is rebuilt every time the hub is (re)initialized.

use byteorder::{ByteOrder, LittleEndian};

use super::endpoint::EndpointLayout;
use crate::error::{LinkError, Result};

pub const LAYOUT: EndpointLayout = EndpointLayout {
    header: &[0x00, 0x01],
    request_len: 513,
    response_len: 512,
    echo_offset: 2,
    type_offset: 4,
    payload_offset: 6,
    open: &[0x0d, 0x01],
    close: &[0x05, 0x01, 0x01],
    read: &[0x08, 0x01],
    write: &[0x06, 0x01],
};

pub const CMD_SOFTWARE_MODE: &[u8] = &[0x01, 0x03, 0x00, 0x02];
pub const CMD_HARDWARE_MODE: &[u8] = &[0x01, 0x03, 0x00, 0x01];
pub const CMD_READ_FIRMWARE: &[u8] = &[0x02, 0x13];

pub const EP_SUB_DEVICES: &[u8] = &[0x36];
pub const TYPE_SUB_DEVICES: [u8; 2] = [0x21, 0x00];

pub const EP_SPEEDS: &[u8] = &[0x17];
pub const TYPE_SPEEDS: [u8; 2] = [0x25, 0x00];

pub const EP_TEMPERATURES: &[u8] = &[0x21];
pub const TYPE_TEMPERATURES: [u8; 2] = [0x10, 0x00];

pub const EP_SET_SPEEDS: &[u8] = &[0x18];
pub const TYPE_SET_SPEEDS: [u8; 2] = [0x07, 0x00];

/// Status byte of a valid speed or temperature entry.
pub const STATUS_OK: u8 = 0x00;

const RECORD_HEADER_LEN: usize = 8;
const RECORD_TYPE: usize = 2;
const RECORD_MODEL: usize = 3;
const RECORD_ID_LEN: usize = 7;

/// What is plugged into a hub port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDeviceKind {
    QxFan,
    LxFan,
    RxFan,
    /// AIO pump block. Reports the liquid temperature.
    Pump,
    Other(u8),
}

impl SubDeviceKind {
    pub fn from_type(device_type: u8) -> Self {
        match device_type {
            0x01 => SubDeviceKind::QxFan,
            0x02 => SubDeviceKind::LxFan,
            0x0F => SubDeviceKind::RxFan,
            0x07 => SubDeviceKind::Pump,
            other => SubDeviceKind::Other(other),
        }
    }

    /// Whether the port accepts speed commands.
    pub fn is_controllable(&self) -> bool {
        !matches!(self, SubDeviceKind::Other(_))
    }

    pub fn is_pump(&self) -> bool {
        matches!(self, SubDeviceKind::Pump)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubDeviceKind::QxFan => "QX Fan",
            SubDeviceKind::LxFan => "LX Fan",
            SubDeviceKind::RxFan => "RX Fan",
            SubDeviceKind::Pump => "Pump",
            SubDeviceKind::Other(_) => "Device",
        }
    }
}

/// One populated hub port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDevice {
    /// 1-based port number, used as the channel ID.
    pub channel: i32,
    pub kind: SubDeviceKind,
    pub model: u8,
    pub id: String,
}

/// Firmware version from the firmware command response.
pub fn parse_firmware(response: &[u8]) -> Result<String> {
    match response.get(4..8) {
        Some(v) => Ok(format!(
            "{}.{}.{}",
            v[0],
            v[1],
            LittleEndian::read_u16(&v[2..4])
        )),
        None => Err(LinkError::invalid_response("Firmware response too short")),
    }
}

/// Populated ports from the sub-device endpoint, `[n, record × n]`.
///
/// A record is an 8-byte header followed by an ID whose length is the last
/// header byte. Empty ports have a zero-length ID.
pub fn parse_sub_devices(payload: &[u8]) -> Result<Vec<SubDevice>> {
    let count = *payload
        .first()
        .ok_or_else(|| LinkError::invalid_response("Empty sub-device payload"))? as usize;

    let mut devices = Vec::new();
    let mut offset = 1;
    for port in 0..count {
        let header = payload
            .get(offset..offset + RECORD_HEADER_LEN)
            .ok_or_else(|| LinkError::invalid_response(format!("Truncated sub-device record {}", port)))?;
        let id_len = header[RECORD_ID_LEN] as usize;
        let start = offset + RECORD_HEADER_LEN;
        let id = payload
            .get(start..start + id_len)
            .ok_or_else(|| LinkError::invalid_response(format!("Truncated sub-device ID {}", port)))?;
        offset = start + id_len;

        if id_len == 0 {
            continue;
        }
        devices.push(SubDevice {
            channel: port as i32 + 1,
            kind: SubDeviceKind::from_type(header[RECORD_TYPE]),
            model: header[RECORD_MODEL],
            id: String::from_utf8_lossy(id).into_owned(),
        });
    }
    Ok(devices)
}

fn entries(payload: &[u8]) -> Result<&[u8]> {
    let count = *payload
        .first()
        .ok_or_else(|| LinkError::invalid_response("Empty sensor payload"))? as usize;
    payload
        .get(1..1 + count * 3)
        .ok_or_else(|| LinkError::invalid_response(format!("Sensor payload too short for {} entries", count)))
}

/// `[n, (status, u16le) × n]`, indexed by port; `None` for invalid entries.
pub fn parse_speeds(payload: &[u8]) -> Result<Vec<Option<u16>>> {
    Ok(entries(payload)?
        .chunks_exact(3)
        .map(|e| (e[0] == STATUS_OK).then(|| LittleEndian::read_u16(&e[1..3])))
        .collect())
}

/// `[n, (status, i16le decidegrees) × n]`, indexed by port.
pub fn parse_temperatures(payload: &[u8]) -> Result<Vec<Option<f64>>> {
    Ok(entries(payload)?
        .chunks_exact(3)
        .map(|e| (e[0] == STATUS_OK).then(|| LittleEndian::read_i16(&e[1..3]) as f64 / 10.0))
        .collect())
}

/// Value of port `channel` (1-based) in a parsed speed or temperature list.
pub fn port_value<T: Copy>(values: &[Option<T>], channel: i32) -> Option<T> {
    usize::try_from(channel - 1)
        .ok()
        .and_then(|i| values.get(i).copied().flatten())
}

/// Set-speeds body, `[n, (port, 0x00, percent, 0x00) × n]`.
pub fn build_set_speeds(duties: &[(i32, u8)]) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + duties.len() * 4);
    data.push(duties.len() as u8);
    for &(channel, percent) in duties {
        data.extend_from_slice(&[channel as u8, 0x00, percent, 0x00]);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device_type: u8, model: u8, id: &str) -> Vec<u8> {
        let mut r = vec![0x00, 0x00, device_type, model, 0x00, 0x00, 0x00, id.len() as u8];
        r.extend_from_slice(id.as_bytes());
        r
    }

    #[test]
    fn test_parse_sub_devices_skips_empty_ports() {
        let mut payload = vec![3];
        payload.extend(record(0x07, 0x01, "AIO123"));
        payload.extend(record(0x00, 0x00, ""));
        payload.extend(record(0x01, 0x00, "QX0001"));

        let devices = parse_sub_devices(&payload).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].channel, 1);
        assert_eq!(devices[0].kind, SubDeviceKind::Pump);
        assert_eq!(devices[0].id, "AIO123");
        assert_eq!(devices[1].channel, 3);
        assert_eq!(devices[1].kind, SubDeviceKind::QxFan);
    }

    #[test]
    fn test_parse_sensor_entries() {
        let speeds = parse_speeds(&[2, 0x00, 0xB0, 0x04, 0x01, 0x00, 0x00]).unwrap();
        assert_eq!(speeds, vec![Some(1200), None]);
        assert_eq!(port_value(&speeds, 1), Some(1200));
        assert_eq!(port_value(&speeds, 2), None);
        assert_eq!(port_value(&speeds, 0), None);

        let temps = parse_temperatures(&[1, 0x00, 0x2D, 0x01]).unwrap();
        assert_eq!(temps, vec![Some(30.1)]);
    }

    #[test]
    fn test_build_set_speeds() {
        assert_eq!(
            build_set_speeds(&[(1, 40), (3, 100)]),
            vec![2, 1, 0, 40, 0, 3, 0, 100, 0]
        );
    }

    #[test]
    fn test_parse_firmware() {
        let mut response = vec![0u8; 512];
        response[2] = 0x02;
        response[4..8].copy_from_slice(&[2, 4, 0x2A, 0x01]);
        assert_eq!(parse_firmware(&response).unwrap(), "2.4.298");
    }
}
