//! Parsing utilities for CLI arguments.

use crate::error::{LinkError, Result};
use crate::tracking::ChannelId;

// =============================================================================
// Channel Power Parsing
// =============================================================================

/// Parse a `CHANNEL=PERCENT` power assignment.
///
/// Channels may be negative (fixed pump channels). The percent is returned
/// unclamped; drivers clamp it to `0..=100`.
///
/// # Example
/// ```
/// use corsair_rust_devices::utils::parsing::parse_channel_power;
///
/// assert_eq!(parse_channel_power("2=75").unwrap(), (2, 75));
/// assert_eq!(parse_channel_power("-1=40").unwrap(), (-1, 40));
/// ```
pub fn parse_channel_power(arg: &str) -> Result<(ChannelId, i32)> {
    let (channel, percent) = arg.split_once('=').ok_or_else(|| {
        LinkError::InvalidInput(format!("Invalid power '{}'. Use CHANNEL=PERCENT, e.g. 0=60", arg))
    })?;

    let channel: ChannelId = channel
        .trim()
        .parse()
        .map_err(|_| LinkError::InvalidInput(format!("Invalid channel '{}'", channel.trim())))?;
    let percent: i32 = percent
        .trim()
        .trim_end_matches('%')
        .parse()
        .map_err(|_| LinkError::InvalidInput(format!("Invalid percent '{}'", percent.trim())))?;

    Ok((channel, percent))
}

// =============================================================================
// Device Selection
// =============================================================================

/// Parse a USB product ID given as hex, with or without a `0x` prefix.
pub fn parse_product_id(arg: &str) -> Result<u16> {
    let hex = arg.trim();
    let hex = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    u16::from_str_radix(hex, 16).map_err(|_| LinkError::InvalidInput(format!("Invalid product ID '{}'", arg)))
}

// =============================================================================
// Tests
// =============================================================================
