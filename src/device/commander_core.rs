//! Commander Core, Core XT and ST driver.
//!
//! The Core ships with AIO coolers and drives the pump on raw channel 0;
//! the XT and ST variants only drive fans.

use std::sync::Arc;

use tracing::debug;

use super::control::{DutyControl, PowerControl};
use super::session::EndpointSession;
use super::{DEFAULT_POWER_PERCENT, DeviceDriver, DriverCore, SpeedKind};
use crate::error::Result;
use crate::protocol::EndpointCodec;
use crate::protocol::commander_core::*;
use crate::tracking::{ChannelId, ChannelStore};

const SESSION: EndpointSession = EndpointSession::new(EndpointCodec::new(LAYOUT), CMD_SOFTWARE_MODE);

/// Driver for the Commander Core family.
#[derive(Debug)]
pub struct CommanderCore {
    core: DriverCore,
    duties: Arc<ChannelStore>,
    control: Arc<DutyControl>,
    /// Connected flag per raw channel, from the connected-fans endpoint.
    connected: Vec<bool>,
    /// Applied duties not yet confirmed written.
    needs_write: bool,
}

impl CommanderCore {
    pub fn new(core: DriverCore) -> Self {
        let duties = Arc::new(ChannelStore::new());
        let control = Arc::new(DutyControl::new(
            Arc::clone(&duties),
            core.sensors().clone(),
            core.options().min_pump_power,
            DEFAULT_POWER_PERCENT,
        ));
        Self {
            core,
            duties,
            control,
            connected: Vec::new(),
            needs_write: true,
        }
    }

    fn has_pump(&self) -> bool {
        self.core.options().first_channel_is_pump
    }

    fn seed_sensors(&mut self, temperatures: usize) {
        let has_pump = self.has_pump();
        let sensors = self.core.sensors();
        sensors.clear();
        self.duties.clear();

        for i in 0..self.connected.len() {
            let channel = i as ChannelId;
            let kind = if has_pump && i == 0 {
                sensors.add_speed("Pump", channel, SpeedKind::Pump, true);
                SpeedKind::Pump
            } else {
                let number = if has_pump { i } else { i + 1 };
                sensors.add_speed(format!("Fan #{}", number), channel, SpeedKind::Fan, true);
                SpeedKind::Fan
            };
            self.duties
                .set(channel, self.control.encode(kind, DEFAULT_POWER_PERCENT as i32));
        }

        for i in 0..temperatures {
            let name = if has_pump && i == 0 {
                "Liquid Temperature".to_string()
            } else {
                format!("Temperature #{}", i + 1)
            };
            sensors.add_temperature(name, i as ChannelId);
        }
        self.needs_write = true;
    }

    fn duty_snapshot(&self) -> Vec<u8> {
        (0..self.connected.len())
            .map(|i| self.duties.get(i as ChannelId).unwrap_or(DEFAULT_POWER_PERCENT))
            .collect()
    }
}

impl DeviceDriver for CommanderCore {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        SESSION.install_reconnect_hook(&mut self.core);
        SESSION.enter_software_mode(&mut self.core)?;

        let (connected, temperatures) = SESSION.run(&mut self.core, |codec, channel| {
            let connected = parse_connected_fans(&codec.read(channel, EP_CONNECTED_FANS, TYPE_CONNECTED_FANS)?)?;
            let temperatures = parse_temperatures(&codec.read(channel, EP_TEMPERATURES, TYPE_TEMPERATURES)?)?;
            codec.write(channel, EP_SPEED_MODE, TYPE_SPEED_MODE, &build_speed_modes(connected.len()))?;
            Ok((connected, temperatures))
        })?;

        debug!(
            device = %self.core.info().unique_id,
            channels = connected.len(),
            connected = connected.iter().filter(|&&c| c).count(),
            probes = temperatures.len(),
            "Commander Core initialized"
        );

        self.connected = connected;
        self.seed_sensors(temperatures.len());
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        if self.duties.apply_changes() {
            self.needs_write = true;
        }
        let duties = self.needs_write.then(|| self.duty_snapshot());

        let (speeds, temperatures) = SESSION.run(&mut self.core, |codec, channel| {
            if let Some(duties) = &duties {
                codec.write(channel, EP_FIXED_PERCENT, TYPE_FIXED_PERCENT, &build_fixed_percent(duties))?;
            }
            let speeds = parse_speeds(&codec.read(channel, EP_SPEEDS, TYPE_SPEEDS)?)?;
            let temperatures = parse_temperatures(&codec.read(channel, EP_TEMPERATURES, TYPE_TEMPERATURES)?)?;
            Ok((speeds, temperatures))
        })?;
        self.needs_write = false;

        let sensors = self.core.sensors();
        for (i, &connected) in self.connected.iter().enumerate() {
            let rpm = if connected { speeds.get(i).copied() } else { None };
            sensors.set_rpm(i as ChannelId, rpm);
        }
        for (i, celsius) in temperatures.into_iter().enumerate() {
            sensors.set_temperature(i as ChannelId, celsius);
        }
        Ok(())
    }

    fn read_firmware_version(&mut self) -> Result<String> {
        SESSION.run(&mut self.core, |codec, channel| {
            parse_firmware(&codec.command(channel, CMD_READ_FIRMWARE, &[])?)
        })
    }

    fn return_to_hardware_mode(&mut self) -> Result<()> {
        let _access = self.core.guard().acquire_exclusive()?;
        SESSION
            .codec()
            .command(self.core.channel_mut(), CMD_HARDWARE_MODE, &[])?;
        Ok(())
    }

    fn control(&self) -> Arc<dyn PowerControl> {
        self.control.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_support::scripted_core;
    use crate::device::{DeviceFamily, DeviceState, DriverOptions};
    use crate::transport::mock::ScriptHandle;

    /// Device side of a Commander Core: tracks the open endpoint and answers
    /// reads with the matching data type.
    fn responder(
        connected: Vec<u8>,
        speeds: Vec<u16>,
        probes: Vec<(u8, u16)>,
    ) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
        let mut open_endpoint = 0u8;
        move |req: &[u8]| {
            let command = req[2];
            let mut r = vec![0u8; 96];
            r[1] = command;
            match command {
                0x02 => r[3..6].copy_from_slice(&[2, 10, 219]),
                0x0d => open_endpoint = req[4],
                0x08 => {
                    let (data_type, payload): ([u8; 2], Vec<u8>) = match open_endpoint {
                        0x1a => {
                            let mut p = vec![connected.len() as u8];
                            p.extend(&connected);
                            (TYPE_CONNECTED_FANS, p)
                        }
                        0x17 => {
                            let mut p = vec![speeds.len() as u8];
                            speeds.iter().for_each(|s| p.extend(s.to_le_bytes()));
                            (TYPE_SPEEDS, p)
                        }
                        0x21 => {
                            let mut p = vec![probes.len() as u8];
                            for (status, value) in &probes {
                                p.push(*status);
                                p.extend(value.to_le_bytes());
                            }
                            (TYPE_TEMPERATURES, p)
                        }
                        _ => ([0, 0], Vec::new()),
                    };
                    r[3..5].copy_from_slice(&data_type);
                    r[5..5 + payload.len()].copy_from_slice(&payload);
                }
                _ => {}
            }
            vec![r]
        }
    }

    fn core_xt() -> (CommanderCore, ScriptHandle) {
        let (core, handle) = scripted_core(
            DeviceFamily::CommanderCore,
            DriverOptions::default(),
            responder(
                vec![0x07, 0x07, 0x07, 0x07, 0x07, 0x01],
                vec![1000, 1100, 1200, 1300, 1400, 0],
                vec![(0x00, 315), (0x01, 0)],
            ),
        );
        (CommanderCore::new(core), handle)
    }

    fn fixed_percent_writes(handle: &ScriptHandle) -> Vec<Vec<u8>> {
        handle
            .writes()
            .into_iter()
            .filter(|w| w[2] == 0x06 && w[8..10] == TYPE_FIXED_PERCENT)
            .collect()
    }

    #[test]
    fn test_connected_mask_seeds_sensors() {
        let (mut device, _) = core_xt();
        assert!(device.connect());
        assert_eq!(device.state(), DeviceState::Ready);

        let speeds = device.speed_sensors();
        assert_eq!(speeds.len(), 6);
        assert_eq!(speeds[0].name, "Fan #1");
        assert_eq!(speeds[0].rpm, Some(1000));
        assert_eq!(speeds[4].rpm, Some(1400));
        assert_eq!(speeds[5].channel, 5);
        assert_eq!(speeds[5].rpm, None);

        let temps = device.temperature_sensors();
        assert_eq!(temps.len(), 2);
        assert_eq!(temps[0].celsius, Some(31.5));
        assert_eq!(temps[1].celsius, None);

        assert_eq!(device.get_firmware_version(), "2.10.219");
    }

    #[test]
    fn test_power_changes_are_coalesced() {
        let (mut device, handle) = core_xt();
        assert!(device.connect());
        handle.clear_writes();

        device.set_channel_power(1, 30).unwrap();
        device.set_channel_power(1, 70).unwrap();
        device.refresh().unwrap();

        let writes = fixed_percent_writes(&handle);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0][10], 6);
        assert_eq!(writes[0][11], 50);
        assert_eq!(writes[0][13], 70);

        handle.clear_writes();
        device.set_channel_power(1, 70).unwrap();
        device.refresh().unwrap();
        assert!(fixed_percent_writes(&handle).is_empty());
    }

    #[test]
    fn test_read_timeout_reconnects_once() {
        let (mut device, handle) = core_xt();
        assert!(device.connect());
        assert_eq!(handle.open_count(), 1);
        handle.clear_writes();

        handle.fail_next_reads(1);
        device.refresh().unwrap();

        assert_eq!(handle.open_count(), 2);
        assert_eq!(device.state(), DeviceState::Ready);
        let software_mode = handle.writes_starting_with(&[0x00, 0x08, 0x01, 0x03, 0x00, 0x02]);
        assert_eq!(software_mode.len(), 1);
    }

    #[test]
    fn test_pump_channel_minimum() {
        let options = DriverOptions {
            first_channel_is_pump: true,
            min_pump_power: 20,
            ..DriverOptions::default()
        };
        let (core, handle) = scripted_core(
            DeviceFamily::CommanderCore,
            options,
            responder(vec![0x07, 0x07, 0x07], vec![2400, 900, 950], vec![(0x00, 300)]),
        );
        let mut device = CommanderCore::new(core);
        assert!(device.connect());

        let speeds = device.speed_sensors();
        assert_eq!(speeds[0].name, "Pump");
        assert_eq!(speeds[0].kind, SpeedKind::Pump);
        assert_eq!(speeds[1].name, "Fan #1");
        assert_eq!(device.temperature_sensors()[0].name, "Liquid Temperature");

        handle.clear_writes();
        device.set_channel_power(0, 5).unwrap();
        device.refresh().unwrap();
        let writes = fixed_percent_writes(&handle);
        assert_eq!(writes[0][11], 20);
    }

    #[test]
    fn test_disconnect_returns_to_hardware_mode() {
        let (mut device, handle) = core_xt();
        assert!(device.connect());
        device.disconnect();

        assert_eq!(device.state(), DeviceState::Disconnected);
        let last = handle.writes().last().cloned().unwrap();
        assert_eq!(&last[2..6], CMD_HARDWARE_MODE);
        assert_eq!(handle.close_count(), 1);
        assert!(matches!(device.refresh(), Err(crate::error::LinkError::NotConnected)));
    }

    #[test]
    fn test_failed_connect_returns_to_hardware_mode() {
        let mut inner = responder(vec![0x07, 0x07], vec![1000, 1100], vec![(0x00, 300)]);
        let mut open_endpoint = 0u8;
        // Speed reads answer with a data type the driver never accepts.
        let responder = move |req: &[u8]| {
            if req[2] == 0x0d {
                open_endpoint = req[4];
            }
            let mut frames = inner(req);
            if req[2] == 0x08 && open_endpoint == 0x17 {
                frames[0][3..5].copy_from_slice(&[0xEE, 0xEE]);
            }
            frames
        };
        let (core, handle) = scripted_core(DeviceFamily::CommanderCore, DriverOptions::default(), responder);
        let mut device = CommanderCore::new(core);

        assert!(!device.connect());
        assert_eq!(device.state(), DeviceState::Disconnected);

        let modes: Vec<Vec<u8>> = handle
            .writes()
            .into_iter()
            .filter(|w| &w[2..6] == CMD_SOFTWARE_MODE || &w[2..6] == CMD_HARDWARE_MODE)
            .map(|w| w[2..6].to_vec())
            .collect();
        assert_eq!(modes, vec![CMD_SOFTWARE_MODE.to_vec(), CMD_HARDWARE_MODE.to_vec()]);
        assert_eq!(handle.close_count(), 1);
    }
}
