//! iCUE Link System Hub driver.
//!
//! Channels are hub ports (1-based). The set of populated ports is read on
//! every initialize, so a reconnect after a hot-plug picks up the new
//! topology.

use std::sync::Arc;

use tracing::{debug, info};

use super::control::{DutyControl, PowerControl};
use super::session::EndpointSession;
use super::{DEFAULT_POWER_PERCENT, DeviceDriver, DriverCore, SpeedKind};
use crate::error::Result;
use crate::protocol::EndpointCodec;
use crate::protocol::icue_link::*;
use crate::tracking::ChannelStore;

const SESSION: EndpointSession = EndpointSession::new(EndpointCodec::new(LAYOUT), CMD_SOFTWARE_MODE);

/// Driver for the iCUE Link System Hub and its daisy-chained devices.
#[derive(Debug)]
pub struct IcueLink {
    core: DriverCore,
    duties: Arc<ChannelStore>,
    control: Arc<DutyControl>,
    /// Populated ports from the last initialize.
    ports: Vec<SubDevice>,
    needs_write: bool,
}

impl IcueLink {
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
            ports: Vec::new(),
            needs_write: true,
        }
    }

    /// Sub-devices found on the hub at the last initialize.
    pub fn sub_devices(&self) -> &[SubDevice] {
        &self.ports
    }

    fn rebuild_channels(&mut self, ports: Vec<SubDevice>) {
        let sensors = self.core.sensors();
        sensors.clear();
        self.duties.clear();

        for port in ports.iter().filter(|p| p.kind.is_controllable()) {
            let kind = if port.kind.is_pump() {
                SpeedKind::Pump
            } else {
                SpeedKind::Fan
            };
            sensors.add_speed(format!("{} #{}", port.kind.label(), port.channel), port.channel, kind, true);
            self.duties
                .set(port.channel, self.control.encode(kind, DEFAULT_POWER_PERCENT as i32));
            if port.kind.is_pump() {
                sensors.add_temperature("Liquid Temperature", port.channel);
            }
        }

        self.ports = ports;
        self.needs_write = true;
    }
}

impl DeviceDriver for IcueLink {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        SESSION.install_reconnect_hook(&mut self.core);
        SESSION.enter_software_mode(&mut self.core)?;

        let ports = SESSION.run(&mut self.core, |codec, channel| {
            parse_sub_devices(&codec.read(channel, EP_SUB_DEVICES, TYPE_SUB_DEVICES)?)
        })?;

        if ports != self.ports && !self.ports.is_empty() {
            info!(
                device = %self.core.info().unique_id,
                before = self.ports.len(),
                after = ports.len(),
                "Hub topology changed"
            );
        }
        for port in &ports {
            debug!(device = %self.core.info().unique_id, channel = port.channel, kind = ?port.kind, id = %port.id, "Sub-device");
        }

        self.rebuild_channels(ports);
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        if self.duties.apply_changes() {
            self.needs_write = true;
        }
        let duties = self.needs_write.then(|| self.duties.snapshot());

        let (speeds, temperatures) = SESSION.run(&mut self.core, |codec, channel| {
            if let Some(duties) = &duties
                && !duties.is_empty()
            {
                codec.write(channel, EP_SET_SPEEDS, TYPE_SET_SPEEDS, &build_set_speeds(duties))?;
            }
            let speeds = parse_speeds(&codec.read(channel, EP_SPEEDS, TYPE_SPEEDS)?)?;
            let temperatures = parse_temperatures(&codec.read(channel, EP_TEMPERATURES, TYPE_TEMPERATURES)?)?;
            Ok((speeds, temperatures))
        })?;
        self.needs_write = false;

        let sensors = self.core.sensors();
        for port in self.ports.iter().filter(|p| p.kind.is_controllable()) {
            sensors.set_rpm(port.channel, port_value(&speeds, port.channel));
            if port.kind.is_pump() {
                sensors.set_temperature(port.channel, port_value(&temperatures, port.channel));
            }
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
    use parking_lot::Mutex;

    use super::*;
    use crate::device::test_support::scripted_core;
    use crate::device::{DeviceFamily, DeviceState, DriverOptions};
    use crate::transport::mock::ScriptHandle;

    /// `(type, id)` per hub port; an empty ID is an empty port.
    type Topology = Arc<Mutex<Vec<(u8, &'static str)>>>;

    fn sub_device_payload(ports: &[(u8, &str)]) -> Vec<u8> {
        let mut p = vec![ports.len() as u8];
        for (device_type, id) in ports {
            p.extend([0x00, 0x00, *device_type, 0x00, 0x00, 0x00, 0x00, id.len() as u8]);
            p.extend(id.as_bytes());
        }
        p
    }

    fn responder(topology: Topology) -> impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static {
        let mut open_endpoint = 0u8;
        move |req: &[u8]| {
            let command = req[3];
            let mut r = vec![0u8; 512];
            r[2] = command;
            match command {
                0x02 => r[4..8].copy_from_slice(&[2, 4, 0x2A, 0x01]),
                0x0d => open_endpoint = req[5],
                0x08 => {
                    let ports = topology.lock().clone();
                    let (data_type, payload) = match open_endpoint {
                        0x36 => (TYPE_SUB_DEVICES, sub_device_payload(&ports)),
                        0x17 => {
                            let mut p = vec![ports.len() as u8];
                            for (i, (_, id)) in ports.iter().enumerate() {
                                let status = if id.is_empty() { 0x01 } else { STATUS_OK };
                                p.push(status);
                                p.extend((1000 + 100 * i as u16).to_le_bytes());
                            }
                            (TYPE_SPEEDS, p)
                        }
                        0x21 => {
                            let mut p = vec![ports.len() as u8];
                            for (device_type, _) in &ports {
                                let status = if *device_type == 0x07 { STATUS_OK } else { 0x01 };
                                p.push(status);
                                p.extend(305i16.to_le_bytes());
                            }
                            (TYPE_TEMPERATURES, p)
                        }
                        _ => ([0, 0], Vec::new()),
                    };
                    r[4..6].copy_from_slice(&data_type);
                    r[6..6 + payload.len()].copy_from_slice(&payload);
                }
                _ => {}
            }
            vec![r]
        }
    }

    fn hub(ports: Vec<(u8, &'static str)>) -> (IcueLink, ScriptHandle, Topology) {
        let topology: Topology = Arc::new(Mutex::new(ports));
        let options = DriverOptions {
            min_pump_power: 30,
            ..DriverOptions::default()
        };
        let (core, handle) = scripted_core(DeviceFamily::IcueLink, options, responder(Arc::clone(&topology)));
        (IcueLink::new(core), handle, topology)
    }

    fn set_speed_bodies(handle: &ScriptHandle) -> Vec<Vec<u8>> {
        handle
            .writes_starting_with(&[0x00, 0x00, 0x01, 0x06, 0x01])
            .into_iter()
            .filter(|w| w[9..11] == TYPE_SET_SPEEDS)
            .map(|w| w[11..].to_vec())
            .collect()
    }

    #[test]
    fn test_ports_become_channels() {
        let (mut hub, handle, _) = hub(vec![(0x07, "AIO01"), (0x00, ""), (0x01, "QX0001")]);
        assert!(hub.connect());
        assert_eq!(hub.get_firmware_version(), "2.4.298");
        assert_eq!(hub.sub_devices().len(), 2);

        let speeds = hub.speed_sensors();
        assert_eq!(speeds.len(), 2);
        assert_eq!(speeds[0].name, "Pump #1");
        assert_eq!(speeds[0].kind, SpeedKind::Pump);
        assert_eq!(speeds[0].rpm, Some(1000));
        assert_eq!(speeds[1].name, "QX Fan #3");
        assert_eq!(speeds[1].channel, 3);
        assert_eq!(speeds[1].rpm, Some(1200));

        let temps = hub.temperature_sensors();
        assert_eq!(temps.len(), 1);
        assert_eq!(temps[0].channel, 1);
        assert_eq!(temps[0].celsius, Some(30.5));

        let bodies = set_speed_bodies(&handle);
        assert_eq!(bodies.len(), 1);
        assert_eq!(&bodies[0][..9], &[2, 1, 0, 50, 0, 3, 0, 50, 0]);
    }

    #[test]
    fn test_pump_minimum_and_empty_port() {
        let (mut hub, handle, _) = hub(vec![(0x07, "AIO01"), (0x00, ""), (0x01, "QX0001")]);
        assert!(hub.connect());
        handle.clear_writes();

        assert!(hub.set_channel_power(2, 40).is_err());
        hub.set_channel_power(1, 10).unwrap();
        hub.refresh().unwrap();

        let bodies = set_speed_bodies(&handle);
        assert_eq!(&bodies[0][..9], &[2, 1, 0, 30, 0, 3, 0, 50, 0]);

        handle.clear_writes();
        hub.refresh().unwrap();
        assert!(set_speed_bodies(&handle).is_empty());
    }

    #[test]
    fn test_reconnect_rebuilds_topology() {
        let (mut hub, _, topology) = hub(vec![(0x01, "QX0001")]);
        assert!(hub.connect());
        assert_eq!(hub.speed_sensors().len(), 1);

        topology.lock().push((0x0F, "RX0002"));
        assert!(hub.connect());

        let speeds = hub.speed_sensors();
        assert_eq!(speeds.len(), 2);
        assert_eq!(speeds[1].name, "RX Fan #2");
        assert_eq!(speeds[1].rpm, Some(1100));
        assert_eq!(hub.state(), DeviceState::Ready);
    }

    #[test]
    fn test_failed_connect_returns_to_hardware_mode() {
        let topology: Topology = Arc::new(Mutex::new(vec![(0x01, "fan-a")]));
        let mut inner = responder(Arc::clone(&topology));
        let mut open_endpoint = 0u8;
        // Speed reads answer with a data type the driver never accepts.
        let responder = move |req: &[u8]| {
            if req[3] == 0x0d {
                open_endpoint = req[5];
            }
            let mut frames = inner(req);
            if req[3] == 0x08 && open_endpoint == 0x17 {
                frames[0][4..6].copy_from_slice(&[0xEE, 0xEE]);
            }
            frames
        };
        let (core, handle) = scripted_core(DeviceFamily::IcueLink, DriverOptions::default(), responder);
        let mut hub = IcueLink::new(core);

        assert!(!hub.connect());
        assert_eq!(hub.state(), DeviceState::Disconnected);

        let hardware_mode = handle.writes_starting_with(&[0x00, 0x00, 0x01, 0x01, 0x03, 0x00, 0x01]);
        assert_eq!(hardware_mode.len(), 1);
        assert_eq!(handle.close_count(), 1);
    }
}
