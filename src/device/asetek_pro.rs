//! Hydro H100i Pro, H115i Pro and H150i Pro driver.
//!
//! These coolers sit behind a Silicon Labs USBXpress bridge and speak the
//! Asetek register protocol. The pump only takes discrete modes, so its
//! power is stored as a mode byte.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use super::control::{DutyControl, PowerControl, PumpEncoding};
use super::{DEFAULT_POWER_PERCENT, DeviceDriver, DriverCore, SpeedKind};
use crate::error::Result;
use crate::protocol::asetek_pro::*;
use crate::protocol::{RegisterCodec, RegisterResponse};
use crate::tracking::{ChannelId, ChannelStore};
use crate::transport::ByteChannel;

const CODEC: RegisterCodec = RegisterCodec::new(LAYOUT);

/// Channel ID of the pump. Fans use `0..fan_count`.
pub const PUMP_CHANNEL: ChannelId = -1;

/// Transact and reject responses without the Asetek marker.
fn transact(channel: &mut dyn ByteChannel, command: u8, args: &[u8]) -> Result<RegisterResponse> {
    let response = CODEC.transact(channel, command, args)?;
    check_marker(&response)?;
    Ok(response)
}

/// Driver for the Hydro Asetek Pro coolers.
#[derive(Debug)]
pub struct AsetekPro {
    core: DriverCore,
    duties: Arc<ChannelStore>,
    control: Arc<DutyControl>,
    /// Value last written per channel; the pump entry holds a mode.
    written: BTreeMap<ChannelId, u8>,
    /// Applied values not yet confirmed written.
    needs_write: bool,
    /// Whether the override profile is currently on the device.
    profile_overridden: bool,
}

impl AsetekPro {
    pub fn new(core: DriverCore) -> Self {
        let duties = Arc::new(ChannelStore::new());
        let control = Arc::new(
            DutyControl::new(
                Arc::clone(&duties),
                core.sensors().clone(),
                core.options().min_pump_power,
                DEFAULT_POWER_PERCENT,
            )
            .with_pump_encoding(PumpEncoding::Mode(pump_mode_for)),
        );
        Self {
            core,
            duties,
            control,
            written: BTreeMap::new(),
            needs_write: true,
            profile_overridden: false,
        }
    }

    fn fan_count(&self) -> usize {
        self.core.options().fan_count
    }

    fn write_safety_profile(&mut self, body: &[u8; SAFETY_PROFILE_LENGTH]) -> Result<()> {
        let args = build_safety_profile(body);
        transact(self.core.channel_mut(), CMD_WRITE_SAFETY_PROFILE, &args)?;
        Ok(())
    }
}

impl DeviceDriver for AsetekPro {
    fn core(&self) -> &DriverCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DriverCore {
        &mut self.core
    }

    fn initialize(&mut self) -> Result<()> {
        if self.core.options().safety_profile_override {
            let _access = self.core.guard().acquire_exclusive()?;
            self.write_safety_profile(&OVERRIDE_PROFILE)?;
            self.profile_overridden = true;
            debug!(device = %self.core.info().unique_id, "Safety profile overridden");
        }

        let sensors = self.core.sensors();
        sensors.clear();
        self.duties.clear();
        self.written.clear();
        self.needs_write = true;

        sensors.add_speed("Pump", PUMP_CHANNEL, SpeedKind::Pump, true);
        self.duties
            .set(PUMP_CHANNEL, self.control.encode(SpeedKind::Pump, DEFAULT_POWER_PERCENT as i32));
        for fan in 0..self.fan_count() {
            let channel = fan as ChannelId;
            sensors.add_speed(format!("Fan #{}", fan + 1), channel, SpeedKind::Fan, true);
            self.duties.set(channel, DEFAULT_POWER_PERCENT);
        }
        sensors.add_temperature("Liquid Temperature", 0);
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        if self.duties.apply_changes() {
            self.needs_write = true;
        }

        let _access = self.core.guard().acquire_exclusive()?;
        let channel = self.core.channel_mut();

        if self.needs_write {
            for (id, value) in self.duties.snapshot() {
                if self.written.get(&id) == Some(&value) {
                    continue;
                }
                if id == PUMP_CHANNEL {
                    transact(channel, CMD_WRITE_PUMP_MODE, &[value])?;
                    trace!(mode = value, "Pump mode written");
                } else {
                    transact(channel, CMD_WRITE_FIXED_DUTY, &[id as u8, value])?;
                    trace!(fan = id, duty = value, "Fan duty written");
                }
                self.written.insert(id, value);
            }
            self.needs_write = false;
        }

        let liquid = parse_liquid_temp(&transact(channel, CMD_READ_LIQUID_TEMP, &[])?)?;
        let pump = parse_pump_rpm(&transact(channel, CMD_READ_PUMP_RPM, &[])?)?;
        let fan_count = self.core.options().fan_count;
        let mut fans = Vec::with_capacity(fan_count);
        for fan in 0..fan_count {
            let channel = self.core.channel_mut();
            fans.push(parse_fan_rpm(&transact(channel, CMD_READ_FAN_RPM, &[fan as u8])?)?);
        }

        let sensors = self.core.sensors();
        sensors.set_temperature(0, Some(liquid));
        sensors.set_rpm(PUMP_CHANNEL, Some(pump));
        for (fan, rpm) in fans.into_iter().enumerate() {
            sensors.set_rpm(fan as ChannelId, Some(rpm));
        }
        Ok(())
    }

    fn read_firmware_version(&mut self) -> Result<String> {
        let _access = self.core.guard().acquire_exclusive()?;
        parse_firmware(&transact(self.core.channel_mut(), CMD_READ_FIRMWARE, &[])?)
    }

    fn return_to_hardware_mode(&mut self) -> Result<()> {
        let _access = self.core.guard().acquire_exclusive()?;
        if self.profile_overridden {
            self.write_safety_profile(&DEFAULT_SAFETY_PROFILE)?;
            self.profile_overridden = false;
        }
        transact(self.core.channel_mut(), CMD_WRITE_PUMP_MODE, &[PUMP_MODE_BALANCED])?;
        self.written.clear();
        self.needs_write = true;
        Ok(())
    }

    fn control(&self) -> Arc<dyn PowerControl> {
        self.control.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::device::test_support::scripted_core;
    use crate::device::{DeviceFamily, DeviceState, DriverOptions};
    use crate::error::LinkError;
    use crate::protocol::Crc16;
    use crate::transport::mock::ScriptHandle;

    fn responder(req: &[u8]) -> Vec<Vec<u8>> {
        let mut r = vec![req[0], 0x12, 0x34];
        match req[0] {
            CMD_READ_FIRMWARE => r.extend([2, 0, 0, 7]),
            CMD_READ_LIQUID_TEMP => r.extend([30, 5]),
            CMD_READ_PUMP_RPM => r.extend(2700u16.to_be_bytes()),
            CMD_READ_FAN_RPM => {
                let rpm: u16 = if req[1] == 0 { 900 } else { 950 };
                r.push(req[1]);
                r.extend(rpm.to_be_bytes());
            }
            _ => {}
        }
        vec![r]
    }

    fn device(options: DriverOptions) -> (AsetekPro, ScriptHandle) {
        let (core, handle) = scripted_core(DeviceFamily::AsetekPro, options, responder);
        (AsetekPro::new(core), handle)
    }

    fn two_fans() -> DriverOptions {
        DriverOptions {
            fan_count: 2,
            ..DriverOptions::default()
        }
    }

    #[test]
    fn test_connect_reads_telemetry() {
        let (mut device, handle) = device(two_fans());
        assert!(device.connect());
        assert_eq!(device.get_firmware_version(), "2.0.0.7");

        let speeds = device.speed_sensors();
        assert_eq!(speeds.len(), 3);
        assert_eq!(speeds[0].name, "Pump");
        assert_eq!(speeds[0].rpm, Some(2700));
        assert_eq!(speeds[1].rpm, Some(900));
        assert_eq!(speeds[2].rpm, Some(950));

        let liquid = device.temperature_sensors()[0].celsius.unwrap();
        assert!((liquid - 30.5).abs() < 1e-9);

        assert_eq!(handle.writes_starting_with(&[CMD_WRITE_PUMP_MODE]), vec![vec![CMD_WRITE_PUMP_MODE, PUMP_MODE_BALANCED]]);
        assert_eq!(handle.writes_starting_with(&[CMD_WRITE_FIXED_DUTY]).len(), 2);
        assert!(handle.writes_starting_with(&[CMD_WRITE_SAFETY_PROFILE]).is_empty());
    }

    #[test]
    fn test_pump_power_maps_to_mode() {
        let (mut device, handle) = device(two_fans());
        assert!(device.connect());
        handle.clear_writes();

        device.set_channel_power(PUMP_CHANNEL, 90).unwrap();
        device.set_channel_power(1, 35).unwrap();
        device.refresh().unwrap();

        assert_eq!(
            handle.writes_starting_with(&[CMD_WRITE_PUMP_MODE]),
            vec![vec![CMD_WRITE_PUMP_MODE, PUMP_MODE_PERFORMANCE]]
        );
        assert_eq!(
            handle.writes_starting_with(&[CMD_WRITE_FIXED_DUTY]),
            vec![vec![CMD_WRITE_FIXED_DUTY, 1, 35]]
        );

        // A pump percent in the same band does not produce another write.
        handle.clear_writes();
        device.set_channel_power(PUMP_CHANNEL, 100).unwrap();
        device.refresh().unwrap();
        assert!(handle.writes_starting_with(&[CMD_WRITE_PUMP_MODE]).is_empty());
    }

    #[test]
    fn test_safety_profile_override_and_restore() {
        let options = DriverOptions {
            safety_profile_override: true,
            ..two_fans()
        };
        let (mut device, handle) = device(options);
        assert!(device.connect());

        let writes = handle.writes_starting_with(&[CMD_WRITE_SAFETY_PROFILE]);
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].len(), 22);
        assert!(writes[0][1..20].iter().all(|&b| b == 0x64));
        assert_eq!(&writes[0][20..22], &63835u16.to_be_bytes());

        handle.clear_writes();
        device.disconnect();
        let writes = handle.writes_starting_with(&[CMD_WRITE_SAFETY_PROFILE]);
        assert_eq!(writes.len(), 1);
        assert_eq!(&writes[0][1..20], &DEFAULT_SAFETY_PROFILE);
        Crc16::verify(&writes[0][1..20], u16::from_be_bytes([writes[0][20], writes[0][21]])).unwrap();
        assert_eq!(device.state(), DeviceState::Disconnected);
    }

    #[test]
    fn test_missing_marker_keeps_device_ready() {
        let corrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&corrupt);
        let (core, _) = scripted_core(DeviceFamily::AsetekPro, two_fans(), move |req: &[u8]| {
            if req[0] == CMD_READ_LIQUID_TEMP && flag.load(Ordering::SeqCst) {
                vec![vec![req[0], 0x00, 0x00]]
            } else {
                responder(req)
            }
        });
        let mut device = AsetekPro::new(core);
        assert!(device.connect());

        corrupt.store(true, Ordering::SeqCst);
        assert!(matches!(device.refresh(), Err(LinkError::InvalidResponse { .. })));
        assert_eq!(device.state(), DeviceState::Ready);
    }

    #[test]
    fn test_unknown_channel_rejected() {
        let (mut device, _) = device(two_fans());
        assert!(device.connect());
        assert!(matches!(device.set_channel_power(5, 50), Err(LinkError::InvalidInput(_))));
    }

    #[test]
    fn test_failed_duty_write_is_retried() {
        let corrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&corrupt);
        let (core, handle) = scripted_core(DeviceFamily::AsetekPro, two_fans(), move |req: &[u8]| {
            if req[0] == CMD_WRITE_FIXED_DUTY && flag.load(Ordering::SeqCst) {
                vec![vec![req[0], 0x00, 0x00]]
            } else {
                responder(req)
            }
        });
        let mut device = AsetekPro::new(core);
        assert!(device.connect());

        handle.clear_writes();
        device.refresh().unwrap();
        assert!(handle.writes_starting_with(&[CMD_WRITE_FIXED_DUTY]).is_empty());

        corrupt.store(true, Ordering::SeqCst);
        device.set_channel_power(0, 70).unwrap();
        assert!(device.refresh().is_err());
        assert_eq!(device.state(), DeviceState::Ready);

        corrupt.store(false, Ordering::SeqCst);
        handle.clear_writes();
        device.refresh().unwrap();
        assert_eq!(
            handle.writes_starting_with(&[CMD_WRITE_FIXED_DUTY]),
            vec![vec![CMD_WRITE_FIXED_DUTY, 0, 70]]
        );
    }

    #[test]
    fn test_failed_connect_restores_safety_profile() {
        let (core, handle) = scripted_core(
            DeviceFamily::AsetekPro,
            DriverOptions {
                safety_profile_override: true,
                ..two_fans()
            },
            |req: &[u8]| {
                if req[0] == CMD_READ_LIQUID_TEMP {
                    vec![vec![req[0], 0x00, 0x00]]
                } else {
                    responder(req)
                }
            },
        );
        let mut device = AsetekPro::new(core);
        assert!(!device.connect());
        assert_eq!(device.state(), DeviceState::Disconnected);

        let profiles = handle.writes_starting_with(&[CMD_WRITE_SAFETY_PROFILE]);
        assert_eq!(profiles.len(), 2);
        assert_eq!(&profiles[1][1..20], &DEFAULT_SAFETY_PROFILE);
        assert_eq!(handle.close_count(), 1);
    }
}
