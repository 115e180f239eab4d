//! Hydro Platinum, Pro XT and Elite driver.
//!
//! These coolers take all cooling settings in one set-cooling report, so a
//! change to any channel rewrites the whole report. Fans carry both a mode
//! and a duty; the pump only has a mode.

use std::sync::Arc;

use tracing::debug;

use super::control::{PowerControl, controllable};
use super::sensors::SensorBoard;
use super::{DEFAULT_POWER_PERCENT, DeviceDriver, DriverCore, SpeedKind};
use crate::error::Result;
use crate::protocol::hydro_platinum::*;
use crate::protocol::scale::{clamp_percent, to_fractional_byte};
use crate::protocol::{RegisterCodec, SequenceCounter};
use crate::tracking::{ChannelId, ChannelStore};

/// Channel of the pump.
pub const PUMP_CHANNEL: ChannelId = -1;

const CODEC: RegisterCodec = RegisterCodec::new(LAYOUT);

// =============================================================================
// Control
// =============================================================================

/// Control handle queuing fan modes, fan duties and the pump mode.
#[derive(Debug)]
pub struct PlatinumControl {
    duties: Arc<ChannelStore>,
    modes: Arc<ChannelStore>,
    sensors: SensorBoard,
    zero_rpm_duty_threshold: Option<u8>,
    min_pump_power: u8,
}

impl PowerControl for PlatinumControl {
    fn set_channel_power(&self, channel: ChannelId, percent: i32) -> Result<()> {
        let percent = clamp_percent(percent);
        match controllable(&self.sensors, channel)? {
            SpeedKind::Pump => {
                let percent = percent.max(self.min_pump_power);
                self.modes.set(channel, pump_mode_for(percent));
            }
            SpeedKind::Fan => {
                if self.zero_rpm_duty_threshold.is_some_and(|threshold| percent < threshold) {
                    self.modes.set(channel, FAN_MODE_CUSTOM_PROFILE);
                } else {
                    self.modes.set(channel, FAN_MODE_FIXED_DUTY);
                    self.duties.set(channel, to_fractional_byte(percent as i32));
                }
            }
        }
        Ok(())
    }

    fn reset_channel(&self, channel: ChannelId) -> Result<()> {
        match controllable(&self.sensors, channel)? {
            SpeedKind::Pump => self.modes.set(channel, PUMP_MODE_BALANCED),
            SpeedKind::Fan => self.modes.set(channel, FAN_MODE_CUSTOM_PROFILE),
        }
        Ok(())
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Driver for Hydro Platinum family coolers with two or three fans.
#[derive(Debug)]
pub struct HydroPlatinum {
    core: DriverCore,
    sequence: SequenceCounter,
    duties: Arc<ChannelStore>,
    modes: Arc<ChannelStore>,
    control: Arc<PlatinumControl>,
    needs_write: bool,
}

impl HydroPlatinum {
    pub fn new(core: DriverCore) -> Self {
        let duties = Arc::new(ChannelStore::new());
        let modes = Arc::new(ChannelStore::new());
        let control = Arc::new(PlatinumControl {
            duties: Arc::clone(&duties),
            modes: Arc::clone(&modes),
            sensors: core.sensors().clone(),
            zero_rpm_duty_threshold: core.options().zero_rpm_duty_threshold,
            min_pump_power: core.options().min_pump_power,
        });
        Self {
            core,
            sequence: SequenceCounter::new(),
            duties,
            modes,
            control,
            needs_write: true,
        }
    }

    fn fan_count(&self) -> usize {
        self.core.options().fan_count.clamp(1, 3)
    }

    fn fan_target(&self, fan: ChannelId) -> FanTarget {
        FanTarget {
            mode: self.modes.get(fan).unwrap_or(FAN_MODE_FIXED_DUTY),
            duty: self
                .duties
                .get(fan)
                .unwrap_or_else(|_| to_fractional_byte(DEFAULT_POWER_PERCENT as i32)),
        }
    }

    /// Send one report and return its checksum-verified response.
    /// The caller must hold the bus guard.
    fn exchange(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        let response = CODEC.exchange(self.core.channel_mut(), packet)?;
        verify_response(response.bytes())?;
        Ok(response.bytes().to_vec())
    }

    /// Write the cooling reports for the given per-fan targets.
    fn write_cooling(&mut self, fans: &[FanTarget], pump_mode: u8) -> Result<()> {
        let packet = build_set_cooling(self.sequence.next(), FEATURE_COOLING, &fans[..fans.len().min(2)], pump_mode);
        self.exchange(&packet)?;

        if let Some(third) = fans.get(2) {
            let packet = build_set_cooling(self.sequence.next(), FEATURE_COOLING_FAN3, &[*third], pump_mode);
            self.exchange(&packet)?;
        }
        Ok(())
    }
}

impl DeviceDriver for HydroPlatinum {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        let fan_count = self.fan_count();
        let sensors = self.core.sensors();
        sensors.clear();
        self.duties.clear();
        self.modes.clear();

        sensors.add_speed("Pump", PUMP_CHANNEL, SpeedKind::Pump, true);
        for fan in 0..fan_count {
            sensors.add_speed(format!("Fan #{}", fan + 1), fan as ChannelId, SpeedKind::Fan, true);
        }
        sensors.add_temperature("Liquid Temperature", 0);

        for fan in 0..fan_count {
            let fan = fan as ChannelId;
            self.modes.set(fan, FAN_MODE_FIXED_DUTY);
            self.duties.set(fan, to_fractional_byte(DEFAULT_POWER_PERCENT as i32));
        }
        let pump_percent = DEFAULT_POWER_PERCENT.max(self.core.options().min_pump_power);
        self.modes.set(PUMP_CHANNEL, pump_mode_for(pump_percent));

        self.needs_write = true;
        debug!(device = %self.core.info().unique_id, fan_count, "Hydro Platinum initialized");
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        let modes_changed = self.modes.apply_changes();
        let duties_changed = self.duties.apply_changes();
        if modes_changed || duties_changed {
            self.needs_write = true;
        }

        let fan_count = self.fan_count();
        let _access = self.core.guard().acquire_exclusive()?;

        if self.needs_write {
            let fans: Vec<FanTarget> = (0..fan_count).map(|fan| self.fan_target(fan as ChannelId)).collect();
            let pump_mode = self.modes.get(PUMP_CHANNEL).unwrap_or(PUMP_MODE_BALANCED);
            self.write_cooling(&fans, pump_mode)?;
            self.needs_write = false;
        }

        let packet = build_status_request(self.sequence.next(), FEATURE_COOLING);
        let status = PlatinumStatus::parse(&self.exchange(&packet)?)?;
        let third_fan = if fan_count > 2 {
            let packet = build_status_request(self.sequence.next(), FEATURE_COOLING_FAN3);
            Some(parse_fan3_rpm(&self.exchange(&packet)?)?)
        } else {
            None
        };

        let sensors = self.core.sensors();
        sensors.set_temperature(0, Some(status.liquid_temp_c));
        sensors.set_rpm(PUMP_CHANNEL, Some(status.pump_rpm));
        for (fan, &rpm) in status.fan_rpm.iter().enumerate().take(fan_count) {
            sensors.set_rpm(fan as ChannelId, Some(rpm));
        }
        if let Some(rpm) = third_fan {
            sensors.set_rpm(2, Some(rpm));
        }
        Ok(())
    }

    fn read_firmware_version(&mut self) -> Result<String> {
        let _access = self.core.guard().acquire_exclusive()?;
        let packet = build_status_request(self.sequence.next(), FEATURE_COOLING);
        Ok(PlatinumStatus::parse(&self.exchange(&packet)?)?.firmware)
    }

    fn return_to_hardware_mode(&mut self) -> Result<()> {
        let _access = self.core.guard().acquire_exclusive()?;
        let fans = vec![
            FanTarget {
                mode: FAN_MODE_CUSTOM_PROFILE,
                duty: 0,
            };
            self.fan_count()
        ];
        self.write_cooling(&fans, PUMP_MODE_BALANCED)?;
        self.needs_write = true;
        Ok(())
    }

    fn control(&self) -> Arc<dyn PowerControl> {
        self.control.clone()
    }
}
