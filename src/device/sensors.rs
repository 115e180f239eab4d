//! Shared sensor board.
//!
//! Sensors are created once while a device initializes and then updated in
//! place on every refresh, so their identity is stable across polls.
//! Consumers on other threads only ever see cloned snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::tracking::ChannelId;

// =============================================================================
// Sensors
// =============================================================================

/// What a speed channel drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedKind {
    Fan,
    Pump,
}

/// Fan or pump tachometer.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedSensor {
    pub name: String,
    pub channel: ChannelId,
    pub kind: SpeedKind,
    /// `None` when nothing is connected or the reading is unavailable.
    pub rpm: Option<u16>,
    /// Whether the channel accepts power changes.
    pub controllable: bool,
}

/// Temperature probe.
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureSensor {
    pub name: String,
    pub channel: ChannelId,
    pub celsius: Option<f64>,
}

// =============================================================================
// Sensor Board
// =============================================================================

#[derive(Debug, Default)]
struct Board {
    speeds: BTreeMap<ChannelId, SpeedSensor>,
    temperatures: BTreeMap<ChannelId, TemperatureSensor>,
}

/// Thread-safe sensor map keyed by channel. Clones share the same board.
#[derive(Debug, Clone, Default)]
pub struct SensorBoard {
    inner: Arc<RwLock<Board>>,
}

impl SensorBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a speed sensor with no reading yet.
    pub fn add_speed(&self, name: impl Into<String>, channel: ChannelId, kind: SpeedKind, controllable: bool) {
        self.inner.write().speeds.insert(
            channel,
            SpeedSensor {
                name: name.into(),
                channel,
                kind,
                rpm: None,
                controllable,
            },
        );
    }

    /// Register a temperature sensor with no reading yet.
    pub fn add_temperature(&self, name: impl Into<String>, channel: ChannelId) {
        self.inner.write().temperatures.insert(
            channel,
            TemperatureSensor {
                name: name.into(),
                channel,
                celsius: None,
            },
        );
    }

    /// Update a speed reading. Unknown channels are ignored.
    pub fn set_rpm(&self, channel: ChannelId, rpm: Option<u16>) {
        if let Some(sensor) = self.inner.write().speeds.get_mut(&channel) {
            sensor.rpm = rpm;
        }
    }

    /// Update a temperature reading. Unknown channels are ignored.
    pub fn set_temperature(&self, channel: ChannelId, celsius: Option<f64>) {
        if let Some(sensor) = self.inner.write().temperatures.get_mut(&channel) {
            sensor.celsius = celsius;
        }
    }

    pub fn speeds(&self) -> Vec<SpeedSensor> {
        self.inner.read().speeds.values().cloned().collect()
    }

    pub fn temperatures(&self) -> Vec<TemperatureSensor> {
        self.inner.read().temperatures.values().cloned().collect()
    }

    pub fn speed(&self, channel: ChannelId) -> Option<SpeedSensor> {
        self.inner.read().speeds.get(&channel).cloned()
    }

    pub fn temperature(&self, channel: ChannelId) -> Option<TemperatureSensor> {
        self.inner.read().temperatures.get(&channel).cloned()
    }

    /// Kind of a controllable speed channel, `None` if it cannot be driven.
    pub fn controllable_kind(&self, channel: ChannelId) -> Option<SpeedKind> {
        self.inner
            .read()
            .speeds
            .get(&channel)
            .filter(|s| s.controllable)
            .map(|s| s.kind)
    }

    /// Forget every sensor, e.g. before re-enumerating a hub.
    pub fn clear(&self) {
        let mut board = self.inner.write();
        board.speeds.clear();
        board.temperatures.clear();
    }

    /// Forget all readings but keep the sensors.
    pub fn invalidate(&self) {
        let mut board = self.inner.write();
        board.speeds.values_mut().for_each(|s| s.rpm = None);
        board.temperatures.values_mut().for_each(|t| t.celsius = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updates_in_place() {
        let board = SensorBoard::new();
        board.add_speed("Pump", -1, SpeedKind::Pump, true);
        board.add_temperature("Liquid Temperature", 0);

        board.set_rpm(-1, Some(2100));
        board.set_temperature(0, Some(30.5));
        board.set_rpm(9, Some(1)); // unknown, ignored

        let speeds = board.speeds();
        assert_eq!(speeds.len(), 1);
        assert_eq!(speeds[0].name, "Pump");
        assert_eq!(speeds[0].rpm, Some(2100));
        assert_eq!(board.temperature(0).unwrap().celsius, Some(30.5));
    }

    #[test]
    fn test_clones_share_state() {
        let board = SensorBoard::new();
        let view = board.clone();
        board.add_speed("Fan 1", 0, SpeedKind::Fan, true);
        board.add_speed("Tach", 1, SpeedKind::Fan, false);

        assert_eq!(view.controllable_kind(0), Some(SpeedKind::Fan));
        assert_eq!(view.controllable_kind(1), None);
        assert_eq!(view.controllable_kind(2), None);

        board.set_rpm(0, Some(900));
        board.invalidate();
        assert_eq!(view.speed(0).unwrap().rpm, None);

        board.clear();
        assert!(view.speeds().is_empty());
    }
}
