//! Commander Core, Core XT and ST endpoint map.

use byteorder::{ByteOrder, LittleEndian};

use super::endpoint::EndpointLayout;
use crate::error::{LinkError, Result};

pub const LAYOUT: EndpointLayout = EndpointLayout {
    header: &[0x08],
    request_len: 97,
    response_len: 96,
    echo_offset: 1,
    type_offset: 3,
    payload_offset: 5,
    open: &[0x0d, 0x00],
    close: &[0x05, 0x01, 0x00],
    read: &[0x08, 0x00],
    write: &[0x06, 0x00],
};

// =============================================================================
// Commands
// =============================================================================

pub const CMD_SOFTWARE_MODE: &[u8] = &[0x01, 0x03, 0x00, 0x02];
pub const CMD_HARDWARE_MODE: &[u8] = &[0x01, 0x03, 0x00, 0x01];
pub const CMD_READ_FIRMWARE: &[u8] = &[0x02, 0x13];

// =============================================================================
// Endpoints and Data Types
// =============================================================================

pub const EP_SPEEDS: &[u8] = &[0x17];
pub const TYPE_SPEEDS: [u8; 2] = [0x06, 0x00];

pub const EP_TEMPERATURES: &[u8] = &[0x21];
pub const TYPE_TEMPERATURES: [u8; 2] = [0x10, 0x00];

pub const EP_CONNECTED_FANS: &[u8] = &[0x1a];
pub const TYPE_CONNECTED_FANS: [u8; 2] = [0x09, 0x00];

pub const EP_SPEED_MODE: &[u8] = &[0x60, 0x6d];
pub const TYPE_SPEED_MODE: [u8; 2] = [0x03, 0x00];

pub const EP_FIXED_PERCENT: &[u8] = &[0x61, 0x6d];
pub const TYPE_FIXED_PERCENT: [u8; 2] = [0x04, 0x00];

/// Connected-fans status of a populated header.
pub const FAN_CONNECTED: u8 = 0x07;
/// Temperature status of a connected probe.
pub const PROBE_CONNECTED: u8 = 0x00;
/// Speed mode byte selecting fixed percent.
pub const MODE_FIXED_PERCENT: u8 = 0x00;

// =============================================================================
// Parsing
// =============================================================================

/// `major.minor.revision` from a firmware command response.
pub fn parse_firmware(response: &[u8]) -> Result<String> {
    match response.get(3..6) {
        Some(v) => Ok(format!("{}.{}.{}", v[0], v[1], v[2])),
        None => Err(LinkError::invalid_response("Firmware response too short")),
    }
}

fn entries<'a>(payload: &'a [u8], width: usize, what: &str) -> Result<(usize, &'a [u8])> {
    let count = *payload
        .first()
        .ok_or_else(|| LinkError::invalid_response(format!("Empty {} payload", what)))? as usize;
    let body = payload.get(1..1 + count * width).ok_or_else(|| {
        LinkError::invalid_response(format!("{} payload too short for {} entries", what, count))
    })?;
    Ok((count, body))
}

/// `[n, u16le × n]`.
pub fn parse_speeds(payload: &[u8]) -> Result<Vec<u16>> {
    let (_, body) = entries(payload, 2, "speed")?;
    Ok(body.chunks_exact(2).map(LittleEndian::read_u16).collect())
}

/// `[n, (status, u16le decidegrees) × n]`; `None` for disconnected probes.
pub fn parse_temperatures(payload: &[u8]) -> Result<Vec<Option<f64>>> {
    let (_, body) = entries(payload, 3, "temperature")?;
    Ok(body
        .chunks_exact(3)
        .map(|entry| {
            (entry[0] == PROBE_CONNECTED).then(|| LittleEndian::read_u16(&entry[1..3]) as f64 / 10.0)
        })
        .collect())
}

/// `[n, status × n]`.
pub fn parse_connected_fans(payload: &[u8]) -> Result<Vec<bool>> {
    let (_, body) = entries(payload, 1, "connected fans")?;
    Ok(body.iter().map(|&status| status == FAN_CONNECTED).collect())
}

/// Speed-mode body putting every channel in fixed-percent mode.
pub fn build_speed_modes(count: usize) -> Vec<u8> {
    let mut data = vec![MODE_FIXED_PERCENT; count + 1];
    data[0] = count as u8;
    data
}

/// Fixed-percent body, one `u16le` per channel.
pub fn build_fixed_percent(duties: &[u8]) -> Vec<u8> {
    let mut data = vec![0u8; 1 + duties.len() * 2];
    data[0] = duties.len() as u8;
    for (i, &duty) in duties.iter().enumerate() {
        LittleEndian::write_u16(&mut data[1 + i * 2..3 + i * 2], duty as u16);
    }
    data
}
