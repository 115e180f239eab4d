//! Conversions between duty percentages and the devices' native scales.

/// Clamp a requested power to `0..=100` percent.
pub fn clamp_percent(percent: i32) -> u8 {
    percent.clamp(0, 100) as u8
}

/// Percent (clamped to `0..=100`) to a fractional byte, `round(p / 100 * 255)`.
pub fn to_fractional_byte(percent: i32) -> u8 {
    let percent = clamp_percent(percent) as f64;
    (percent / 100.0 * 255.0).round() as u8
}

/// Fractional byte back to percent, `round(b / 255 * 100)`.
pub fn from_fractional_byte(value: u8) -> u8 {
    (value as f64 / 255.0 * 100.0).round() as u8
}
