//! Commander Pro / Obsidian 1000D register map.

use super::register::{RegisterLayout, RegisterResponse};
use crate::error::Result;

// =============================================================================
// Framing
// =============================================================================

pub const LAYOUT: RegisterLayout = RegisterLayout {
    report_id: Some(0x00),
    request_len: Some(65),
    response_len: 16,
    payload_offset: 1,
    echo_offset: None,
};

/// Number of fan headers.
pub const FAN_COUNT: usize = 6;

/// Number of temperature probe inputs.
pub const PROBE_COUNT: usize = 4;

// =============================================================================
// Commands
// =============================================================================

pub const CMD_READ_FIRMWARE: u8 = 0x02;
pub const CMD_READ_TEMPERATURE_CONFIG: u8 = 0x10;
/// Args: `[probe]`.
pub const CMD_READ_TEMPERATURE: u8 = 0x11;
pub const CMD_READ_FAN_MODES: u8 = 0x20;
/// Args: `[fan]`.
pub const CMD_READ_FAN_RPM: u8 = 0x21;
/// Args: `[fan, percent]`.
pub const CMD_WRITE_FIXED_DUTY: u8 = 0x23;

/// Fan mode byte of an empty header.
pub const FAN_MODE_DISCONNECTED: u8 = 0x00;

/// Temperature config flag of a connected probe.
pub const PROBE_CONNECTED: u8 = 0x01;

// =============================================================================
// Response Parsing
// =============================================================================

/// `major.minor.revision` from a firmware response.
pub fn parse_firmware(response: &RegisterResponse) -> Result<String> {
    Ok(format!(
        "{}.{}.{}",
        response.byte(1)?,
        response.byte(2)?,
        response.byte(3)?
    ))
}

/// Connected flag per probe.
pub fn parse_probe_config(response: &RegisterResponse) -> Result<Vec<bool>> {
    (0..PROBE_COUNT)
        .map(|i| Ok(response.byte(1 + i)? == PROBE_CONNECTED))
        .collect()
}

/// Connected flag per fan header.
pub fn parse_fan_modes(response: &RegisterResponse) -> Result<Vec<bool>> {
    (0..FAN_COUNT)
        .map(|i| Ok(response.byte(1 + i)? != FAN_MODE_DISCONNECTED))
        .collect()
}

/// Probe temperature in °C (centidegrees on the wire).
pub fn parse_temperature(response: &RegisterResponse) -> Result<f64> {
    Ok(response.u16_be(1)? as f64 / 100.0)
}

pub fn parse_fan_rpm(response: &RegisterResponse) -> Result<u16> {
    response.u16_be(1)
}
