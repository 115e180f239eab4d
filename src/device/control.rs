//! Channel power control handles.
//!
//! A control handle only queues values in a [`ChannelStore`]; the owning
//! driver writes them to the hardware on its next refresh. Handles are
//! `Send + Sync` and can be used from any thread while the poller owns the
//! driver.

use std::sync::Arc;

use tracing::trace;

use super::sensors::{SensorBoard, SpeedKind};
use crate::error::{LinkError, Result};
use crate::protocol::scale::clamp_percent;
use crate::tracking::{ChannelId, ChannelStore};

/// Thread-safe power control of one device's channels.
pub trait PowerControl: Send + Sync {
    /// Queue `percent` (clamped to `0..=100`) for `channel`.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the channel does not exist or cannot be
    /// controlled.
    fn set_channel_power(&self, channel: ChannelId, percent: i32) -> Result<()>;

    /// Queue the channel's default setting.
    fn reset_channel(&self, channel: ChannelId) -> Result<()>;
}

/// Look up a controllable channel on the board.
pub(crate) fn controllable(sensors: &SensorBoard, channel: ChannelId) -> Result<SpeedKind> {
    sensors
        .controllable_kind(channel)
        .ok_or_else(|| LinkError::InvalidInput(format!("Channel {} is not controllable", channel)))
}

/// How a pump power is stored.
#[derive(Debug, Clone, Copy)]
pub enum PumpEncoding {
    /// Same percent byte as the fans.
    Percent,
    /// Mapped to a discrete pump mode.
    Mode(fn(u8) -> u8),
}

/// Control for families that take a per-channel percent duty.
#[derive(Debug, Clone)]
pub struct DutyControl {
    duties: Arc<ChannelStore>,
    sensors: SensorBoard,
    min_pump_power: u8,
    default_percent: u8,
    pump_encoding: PumpEncoding,
}

impl DutyControl {
    pub fn new(duties: Arc<ChannelStore>, sensors: SensorBoard, min_pump_power: u8, default_percent: u8) -> Self {
        Self {
            duties,
            sensors,
            min_pump_power: clamp_percent(min_pump_power as i32),
            default_percent,
            pump_encoding: PumpEncoding::Percent,
        }
    }

    pub fn with_pump_encoding(mut self, encoding: PumpEncoding) -> Self {
        self.pump_encoding = encoding;
        self
    }

    /// Value stored for `percent` on a channel of `kind`.
    pub fn encode(&self, kind: SpeedKind, percent: i32) -> u8 {
        let percent = clamp_percent(percent);
        match kind {
            SpeedKind::Fan => percent,
            SpeedKind::Pump => {
                let percent = percent.max(self.min_pump_power);
                match self.pump_encoding {
                    PumpEncoding::Percent => percent,
                    PumpEncoding::Mode(to_mode) => to_mode(percent),
                }
            }
        }
    }
}

impl PowerControl for DutyControl {
    fn set_channel_power(&self, channel: ChannelId, percent: i32) -> Result<()> {
        let kind = controllable(&self.sensors, channel)?;
        let value = self.encode(kind, percent);
        trace!(channel, percent, value, "Queued channel power");
        self.duties.set(channel, value);
        Ok(())
    }

    fn reset_channel(&self, channel: ChannelId) -> Result<()> {
        self.set_channel_power(channel, self.default_percent as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> SensorBoard {
        let board = SensorBoard::new();
        board.add_speed("Pump", 0, SpeedKind::Pump, true);
        board.add_speed("Fan 1", 1, SpeedKind::Fan, true);
        board
    }

    #[test]
    fn test_clamps_and_applies_pump_minimum() {
        let duties = Arc::new(ChannelStore::new());
        let control = DutyControl::new(Arc::clone(&duties), board(), 40, 50);

        control.set_channel_power(0, 10).unwrap();
        control.set_channel_power(1, 150).unwrap();
        duties.apply_changes();

        assert_eq!(duties.get(0).unwrap(), 40);
        assert_eq!(duties.get(1).unwrap(), 100);
    }

    #[test]
    fn test_pump_mode_encoding() {
        let duties = Arc::new(ChannelStore::new());
        let control = DutyControl::new(Arc::clone(&duties), board(), 0, 50)
            .with_pump_encoding(PumpEncoding::Mode(|p| if p < 50 { 0 } else { 2 }));

        control.set_channel_power(0, 80).unwrap();
        duties.apply_changes();
        assert_eq!(duties.get(0).unwrap(), 2);
    }

    #[test]
    fn test_unknown_channel_rejected_and_reset() {
        let duties = Arc::new(ChannelStore::new());
        let control = DutyControl::new(Arc::clone(&duties), board(), 0, 50);

        assert!(matches!(
            control.set_channel_power(7, 50),
            Err(LinkError::InvalidInput(_))
        ));

        control.set_channel_power(1, 90).unwrap();
        control.reset_channel(1).unwrap();
        duties.apply_changes();
        assert_eq!(duties.get(1).unwrap(), 50);
    }
}
