//! Hydro Asetek Pro (H100i Pro, H115i Pro, H150i Pro) register map.
//!
//! Packets travel unpadded over the USBXpress bridge. Responses echo the
//! command followed by the fixed `0x12 0x34` marker.

use super::checksum::Crc16;
use super::register::{RegisterLayout, RegisterResponse};
use crate::error::{LinkError, Result};

pub const LAYOUT: RegisterLayout = RegisterLayout {
    report_id: None,
    request_len: None,
    response_len: 32,
    payload_offset: 3,
    echo_offset: Some(0),
};

const RESPONSE_MARKER: [u8; 2] = [0x12, 0x34];

// =============================================================================
// Commands
// =============================================================================

pub const CMD_READ_FIRMWARE: u8 = 0xAA;
pub const CMD_READ_LIQUID_TEMP: u8 = 0xA9;
pub const CMD_READ_PUMP_RPM: u8 = 0x31;
/// Args: `[mode]`.
pub const CMD_WRITE_PUMP_MODE: u8 = 0x32;
/// Args: `[fan]`.
pub const CMD_READ_FAN_RPM: u8 = 0x41;
/// Args: `[fan, percent]`.
pub const CMD_WRITE_FIXED_DUTY: u8 = 0x42;
/// Args: `[profile body, crc16 big-endian]`.
pub const CMD_WRITE_SAFETY_PROFILE: u8 = 0x5F;

pub const PUMP_MODE_QUIET: u8 = 0x00;
pub const PUMP_MODE_BALANCED: u8 = 0x01;
pub const PUMP_MODE_PERFORMANCE: u8 = 0x02;

// =============================================================================
// Safety profile
// =============================================================================

/// Safety profile body: 7 thresholds (°C), 7 fan duties (%), pump mode,
/// critical temperature, 3 reserved bytes.
pub const SAFETY_PROFILE_LENGTH: usize = 19;

/// Every threshold at 100 °C so the device never overrides host duties.
pub const OVERRIDE_PROFILE: [u8; SAFETY_PROFILE_LENGTH] = [0x64; SAFETY_PROFILE_LENGTH];

/// Profile restored when the host gives control back: fans ramp from 25 %
/// at 20 °C to full speed at 50 °C, balanced pump, 60 °C critical.
pub const DEFAULT_SAFETY_PROFILE: [u8; SAFETY_PROFILE_LENGTH] = [
    20, 25, 30, 35, 40, 45, 50, // thresholds
    25, 30, 40, 50, 70, 90, 100, // duties
    PUMP_MODE_BALANCED,
    60,
    0, 0, 0,
];

/// Arguments of [`CMD_WRITE_SAFETY_PROFILE`]: the body and its CRC16.
pub fn build_safety_profile(body: &[u8; SAFETY_PROFILE_LENGTH]) -> Vec<u8> {
    let mut args = Vec::with_capacity(SAFETY_PROFILE_LENGTH + 2);
    args.extend_from_slice(body);
    args.extend_from_slice(&Crc16::to_be_bytes(body));
    args
}

pub fn pump_mode_for(percent: u8) -> u8 {
    match percent {
        0..=33 => PUMP_MODE_QUIET,
        34..=66 => PUMP_MODE_BALANCED,
        _ => PUMP_MODE_PERFORMANCE,
    }
}

// =============================================================================
// Response Parsing
// =============================================================================

/// Reject responses without the `0x12 0x34` marker.
pub fn check_marker(response: &RegisterResponse) -> Result<()> {
    let marker = [response.byte(1)?, response.byte(2)?];
    if marker != RESPONSE_MARKER {
        return Err(LinkError::invalid_response(format!(
            "Missing response marker, got {:02x?}",
            marker
        )));
    }
    Ok(())
}

pub fn parse_firmware(response: &RegisterResponse) -> Result<String> {
    Ok(format!(
        "{}.{}.{}.{}",
        response.byte(3)?,
        response.byte(4)?,
        response.byte(5)?,
        response.byte(6)?
    ))
}

pub fn parse_liquid_temp(response: &RegisterResponse) -> Result<f64> {
    Ok(response.byte(3)? as f64 + response.byte(4)? as f64 / 10.0)
}

pub fn parse_pump_rpm(response: &RegisterResponse) -> Result<u16> {
    response.u16_be(3)
}

pub fn parse_fan_rpm(response: &RegisterResponse) -> Result<u16> {
    response.u16_be(4)
}
