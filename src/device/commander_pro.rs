//! Commander Pro and Obsidian 1000D driver.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::control::{DutyControl, PowerControl};
use super::{DEFAULT_POWER_PERCENT, DeviceDriver, DriverCore, SpeedKind};
use crate::error::Result;
use crate::protocol::RegisterCodec;
use crate::protocol::commander_pro::*;
use crate::tracking::{ChannelId, ChannelStore};

const CODEC: RegisterCodec = RegisterCodec::new(LAYOUT);

/// Driver for the Commander Pro: six fan headers and four probe inputs,
/// each read with its own register command.
#[derive(Debug)]
pub struct CommanderPro {
    core: DriverCore,
    duties: Arc<ChannelStore>,
    control: Arc<DutyControl>,
    fans_connected: Vec<bool>,
    probes_connected: Vec<bool>,
    /// Duty last written per fan header.
    written: BTreeMap<ChannelId, u8>,
    /// Applied duties not yet confirmed written.
    needs_write: bool,
}

impl CommanderPro {
    pub fn new(core: DriverCore) -> Self {
        let duties = Arc::new(ChannelStore::new());
        let control = Arc::new(DutyControl::new(
            Arc::clone(&duties),
            core.sensors().clone(),
            0,
            DEFAULT_POWER_PERCENT,
        ));
        Self {
            core,
            duties,
            control,
            fans_connected: Vec::new(),
            probes_connected: Vec::new(),
            written: BTreeMap::new(),
            needs_write: true,
        }
    }
}

impl DeviceDriver for CommanderPro {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        let (probes, fans) = {
            let _access = self.core.guard().acquire_exclusive()?;
            let channel = self.core.channel_mut();
            let probes = parse_probe_config(&CODEC.transact(channel, CMD_READ_TEMPERATURE_CONFIG, &[])?)?;
            let fans = parse_fan_modes(&CODEC.transact(channel, CMD_READ_FAN_MODES, &[])?)?;
            (probes, fans)
        };

        let sensors = self.core.sensors();
        sensors.clear();
        self.duties.clear();
        self.written.clear();
        self.needs_write = true;

        for i in 0..FAN_COUNT {
            let channel = i as ChannelId;
            sensors.add_speed(format!("Fan #{}", i + 1), channel, SpeedKind::Fan, true);
            self.duties.set(channel, DEFAULT_POWER_PERCENT);
        }
        for i in 0..PROBE_COUNT {
            sensors.add_temperature(format!("Temperature #{}", i + 1), i as ChannelId);
        }

        debug!(
            device = %self.core.info().unique_id,
            fans = ?fans,
            probes = ?probes,
            "Commander Pro initialized"
        );
        self.fans_connected = fans;
        self.probes_connected = probes;
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        if self.duties.apply_changes() {
            self.needs_write = true;
        }

        let _access = self.core.guard().acquire_exclusive()?;
        let channel = self.core.channel_mut();

        if self.needs_write {
            for (fan, duty) in self.duties.snapshot() {
                let connected = self.fans_connected.get(fan as usize).copied().unwrap_or(false);
                if !connected || self.written.get(&fan) == Some(&duty) {
                    continue;
                }
                CODEC.transact(channel, CMD_WRITE_FIXED_DUTY, &[fan as u8, duty])?;
                self.written.insert(fan, duty);
                trace!(fan, duty, "Fan duty written");
            }
            self.needs_write = false;
        }

        let mut rpms = Vec::with_capacity(self.fans_connected.len());
        for (fan, &connected) in self.fans_connected.iter().enumerate() {
            let rpm = if connected {
                Some(parse_fan_rpm(&CODEC.transact(channel, CMD_READ_FAN_RPM, &[fan as u8])?)?)
            } else {
                None
            };
            rpms.push(rpm);
        }

        let mut temperatures = Vec::with_capacity(self.probes_connected.len());
        for (probe, &connected) in self.probes_connected.iter().enumerate() {
            let celsius = if connected {
                Some(parse_temperature(&CODEC.transact(channel, CMD_READ_TEMPERATURE, &[probe as u8])?)?)
            } else {
                None
            };
            temperatures.push(celsius);
        }

        let sensors = self.core.sensors();
        for (fan, rpm) in rpms.into_iter().enumerate() {
            sensors.set_rpm(fan as ChannelId, rpm);
        }
        for (probe, celsius) in temperatures.into_iter().enumerate() {
            sensors.set_temperature(probe as ChannelId, celsius);
        }
        Ok(())
    }

    fn read_firmware_version(&mut self) -> Result<String> {
        let _access = self.core.guard().acquire_exclusive()?;
        parse_firmware(&CODEC.transact(self.core.channel_mut(), CMD_READ_FIRMWARE, &[])?)
    }

    fn return_to_hardware_mode(&mut self) -> Result<()> {
        // The Commander Pro resumes its stored curves on its own once the
        // host stops writing.
        self.written.clear();
        self.needs_write = true;
        Ok(())
    }

    fn control(&self) -> Arc<dyn PowerControl> {
        self.control.clone()
    }
}
