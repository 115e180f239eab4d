//! Hydro Platinum / Pro XT / Elite report format.
//!
//! Every report starts with the `0x3F` prefix, carries a 5-bit sequence
//! number next to a 3-bit feature selector, and ends with a CRC8 over
//! everything between the prefix and the checksum byte.

use byteorder::{ByteOrder, LittleEndian};

use super::checksum::Crc8;
use super::register::RegisterLayout;
use super::scale::to_fractional_byte;
use crate::error::{LinkError, Result};

// =============================================================================
// Framing
// =============================================================================

/// Request length including the HID report ID.
pub const REQUEST_LENGTH: usize = 65;
pub const RESPONSE_LENGTH: usize = 64;

/// Reports are prebuilt and sealed, so the layout only fixes the lengths.
pub const LAYOUT: RegisterLayout = RegisterLayout {
    report_id: Some(0x00),
    request_len: Some(REQUEST_LENGTH),
    response_len: RESPONSE_LENGTH,
    payload_offset: 1,
    echo_offset: None,
};

const PREFIX: u8 = 0x3F;
/// Offset of the first data byte after the command in a request.
const DATA_OFFSET: usize = 4;

pub const FEATURE_COOLING: u8 = 0b000;
pub const FEATURE_COOLING_FAN3: u8 = 0b011;

pub const CMD_GET_STATUS: u8 = 0xFF;
pub const CMD_SET_COOLING: u8 = 0x14;

// =============================================================================
// Set-cooling data layout (offsets from DATA_OFFSET)
// =============================================================================

const COOLING_PREFIX: [u8; 8] = [0x00, 0xFF, 0x05, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
const FAN_MODE_OFFSETS: [usize; 2] = [8, 14];
const FAN_DUTY_OFFSETS: [usize; 2] = [13, 19];
const PUMP_MODE_OFFSET: usize = 20;
const PROFILE_LENGTH_OFFSET: usize = 26;
const PROFILE_OFFSETS: [usize; 2] = [27, 41];

/// Points in a fan temperature profile.
pub const PROFILE_POINTS: usize = 7;

pub const FAN_MODE_CUSTOM_PROFILE: u8 = 0x00;
pub const FAN_MODE_FIXED_DUTY: u8 = 0x02;

pub const PUMP_MODE_QUIET: u8 = 0x00;
pub const PUMP_MODE_BALANCED: u8 = 0x01;
pub const PUMP_MODE_EXTREME: u8 = 0x02;

/// Profile loaded while a fan is in custom-profile mode: the fan stays
/// stopped until the liquid warms up, then ramps to full speed.
pub const ZERO_RPM_PROFILE: [(u8, u8); PROFILE_POINTS] = [
    (20, 0),
    (30, 0),
    (35, 25),
    (38, 40),
    (41, 55),
    (44, 75),
    (60, 100),
];

// =============================================================================
// Status offsets
// =============================================================================

const STATUS_FIRMWARE: usize = 2;
const STATUS_TEMP_FRACTION: usize = 7;
const STATUS_TEMP_INTEGER: usize = 8;
const STATUS_FAN_RPM: [usize; 2] = [15, 22];
const STATUS_PUMP_RPM: usize = 29;

// =============================================================================
// Builders
// =============================================================================

/// Fill the CRC8 byte of a request.
fn seal(packet: &mut [u8; REQUEST_LENGTH]) {
    packet[REQUEST_LENGTH - 1] = Crc8::calculate(&packet[2..REQUEST_LENGTH - 1]);
}

fn header(sequence: u8, feature: u8, command: u8) -> [u8; REQUEST_LENGTH] {
    let mut packet = [0u8; REQUEST_LENGTH];
    packet[1] = PREFIX;
    packet[2] = (sequence << 3) | (feature & 0b111);
    packet[3] = command;
    packet
}

/// Status request for `feature`.
pub fn build_status_request(sequence: u8, feature: u8) -> [u8; REQUEST_LENGTH] {
    let mut packet = header(sequence, feature, CMD_GET_STATUS);
    seal(&mut packet);
    packet
}

/// Target of one fan slot in a set-cooling report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanTarget {
    pub mode: u8,
    /// Duty as a fractional byte.
    pub duty: u8,
}

/// Set-cooling report for up to two fan slots and the pump.
pub fn build_set_cooling(
    sequence: u8,
    feature: u8,
    fans: &[FanTarget],
    pump_mode: u8,
) -> [u8; REQUEST_LENGTH] {
    let mut packet = header(sequence, feature, CMD_SET_COOLING);
    let data = &mut packet[DATA_OFFSET..REQUEST_LENGTH - 1];

    data[..COOLING_PREFIX.len()].copy_from_slice(&COOLING_PREFIX);
    for (slot, fan) in fans.iter().take(2).enumerate() {
        data[FAN_MODE_OFFSETS[slot]] = fan.mode;
        data[FAN_DUTY_OFFSETS[slot]] = fan.duty;
    }
    data[PUMP_MODE_OFFSET] = pump_mode;

    data[PROFILE_LENGTH_OFFSET] = PROFILE_POINTS as u8;
    for offset in PROFILE_OFFSETS {
        for (i, &(temp, percent)) in ZERO_RPM_PROFILE.iter().enumerate() {
            data[offset + i * 2] = temp;
            data[offset + i * 2 + 1] = to_fractional_byte(percent as i32);
        }
    }

    seal(&mut packet);
    packet
}

/// Pump mode for a requested pump power.
pub fn pump_mode_for(percent: u8) -> u8 {
    match percent {
        0..=33 => PUMP_MODE_QUIET,
        34..=66 => PUMP_MODE_BALANCED,
        _ => PUMP_MODE_EXTREME,
    }
}

// =============================================================================
// Status parsing
// =============================================================================

/// Check the CRC8 of a response.
///
/// # Errors
/// Returns `ChecksumMismatch` on a corrupt report.
pub fn verify_response(response: &[u8]) -> Result<()> {
    if response.len() != RESPONSE_LENGTH {
        return Err(LinkError::invalid_response(format!(
            "Expected {} byte report, got {}",
            RESPONSE_LENGTH,
            response.len()
        )));
    }
    Crc8::verify(&response[1..RESPONSE_LENGTH - 1], response[RESPONSE_LENGTH - 1])
}

/// Decoded cooling status report.
#[derive(Debug, Clone, PartialEq)]
pub struct PlatinumStatus {
    pub firmware: String,
    pub liquid_temp_c: f64,
    pub fan_rpm: [u16; 2],
    pub pump_rpm: u16,
}

impl PlatinumStatus {
    /// Parse a verified status report.
    pub fn parse(response: &[u8]) -> Result<Self> {
        verify_response(response)?;

        let fw = response[STATUS_FIRMWARE];
        let firmware = format!("{}.{}.{}", fw >> 4, fw & 0x0F, response[STATUS_FIRMWARE + 1]);
        let liquid_temp_c =
            response[STATUS_TEMP_INTEGER] as f64 + response[STATUS_TEMP_FRACTION] as f64 / 255.0;
        let fan_rpm = STATUS_FAN_RPM.map(|offset| LittleEndian::read_u16(&response[offset..offset + 2]));
        let pump_rpm = LittleEndian::read_u16(&response[STATUS_PUMP_RPM..STATUS_PUMP_RPM + 2]);

        Ok(Self {
            firmware,
            liquid_temp_c,
            fan_rpm,
            pump_rpm,
        })
    }
}

/// RPM of the third fan from a fan-3 feature status report.
pub fn parse_fan3_rpm(response: &[u8]) -> Result<u16> {
    verify_response(response)?;
    Ok(LittleEndian::read_u16(&response[STATUS_FAN_RPM[0]..STATUS_FAN_RPM[0] + 2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_report() -> Vec<u8> {
        let mut r = vec![0u8; RESPONSE_LENGTH];
        r[0] = 0xFF;
        r[1] = 0x08;
        r[2] = 0x12;
        r[3] = 0x07;
        r[7] = 0x80;
        r[8] = 29;
        r[15..17].copy_from_slice(&[0xE8, 0x03]);
        r[22..24].copy_from_slice(&[0xDC, 0x05]);
        r[29..31].copy_from_slice(&[0x34, 0x08]);
        r[63] = 0x8D;
        r
    }

    #[test]
    fn test_parse_status() {
        let status = PlatinumStatus::parse(&status_report()).unwrap();
        assert_eq!(status.firmware, "1.2.7");
        assert_eq!(status.liquid_temp_c, 29.0 + 128.0 / 255.0);
        assert_eq!(status.fan_rpm, [1000, 1500]);
        assert_eq!(status.pump_rpm, 2100);
    }

    #[test]
    fn test_corrupt_status_rejected() {
        let mut report = status_report();
        report[29] = 0x35;
        assert!(matches!(
            PlatinumStatus::parse(&report),
            Err(LinkError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_status_request_framing() {
        let packet = build_status_request(5, FEATURE_COOLING_FAN3);
        assert_eq!(packet[0], 0x00);
        assert_eq!(packet[1], 0x3F);
        assert_eq!(packet[2], (5 << 3) | 0b011);
        assert_eq!(packet[3], CMD_GET_STATUS);
        assert_eq!(packet[64], Crc8::calculate(&packet[2..64]));
    }

    #[test]
    fn test_set_cooling_layout() {
        let fans = [
            FanTarget { mode: FAN_MODE_FIXED_DUTY, duty: 128 },
            FanTarget { mode: FAN_MODE_CUSTOM_PROFILE, duty: 0 },
        ];
        let packet = build_set_cooling(1, FEATURE_COOLING, &fans, PUMP_MODE_BALANCED);
        let data = &packet[4..];

        assert_eq!(&data[..8], &COOLING_PREFIX);
        assert_eq!(data[8], FAN_MODE_FIXED_DUTY);
        assert_eq!(data[13], 128);
        assert_eq!(data[14], FAN_MODE_CUSTOM_PROFILE);
        assert_eq!(data[20], PUMP_MODE_BALANCED);
        assert_eq!(data[26], 7);
        assert_eq!(&data[27..29], &[20, 0]);
        assert_eq!(&data[53..55], &[60, 255]);
        assert_eq!(packet[64], Crc8::calculate(&packet[2..64]));
    }

    #[test]
    fn test_pump_mode_for() {
        assert_eq!(pump_mode_for(0), PUMP_MODE_QUIET);
        assert_eq!(pump_mode_for(33), PUMP_MODE_QUIET);
        assert_eq!(pump_mode_for(34), PUMP_MODE_BALANCED);
        assert_eq!(pump_mode_for(66), PUMP_MODE_BALANCED);
        assert_eq!(pump_mode_for(67), PUMP_MODE_EXTREME);
    }
}
