//! Device abstraction layer for Corsair cooling controllers.
//!
//! Every family implements [`DeviceDriver`]. The trait supplies the shared
//! connection state machine (`connect`, `refresh`, `disconnect`) on top of
//! a handful of family hooks, and every driver composes a [`DriverCore`]
//! holding its transport, bus guard, sensor board and options.

pub mod asetek_pro;
pub mod commander_core;
pub mod commander_pro;
pub mod control;
pub mod hydro_platinum;
pub mod icue_link;
pub mod sensors;

mod session;

pub use asetek_pro::AsetekPro;
pub use commander_core::CommanderCore;
pub use commander_pro::CommanderPro;
pub use control::{DutyControl, PowerControl};
pub use hydro_platinum::HydroPlatinum;
pub use icue_link::IcueLink;
pub use sensors::{SensorBoard, SpeedKind, SpeedSensor, TemperatureSensor};

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::{LinkError, Result};
use crate::guard::ExclusiveGuard;
use crate::tracking::ChannelId;
use crate::transport::ByteChannel;

/// Firmware string reported when the device cannot be queried.
pub const FIRMWARE_UNKNOWN: &str = "UNKNOWN";

/// Power every controllable channel starts at after initialization.
pub const DEFAULT_POWER_PERCENT: u8 = 50;

// =============================================================================
// Families and Options
// =============================================================================

/// Protocol family of a supported controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    CommanderPro,
    CommanderCore,
    HydroPlatinum,
    AsetekPro,
    IcueLink,
}

impl DeviceFamily {
    /// Key used for per-family overrides in the config file.
    pub const fn key(&self) -> &'static str {
        match self {
            DeviceFamily::CommanderPro => "commander_pro",
            DeviceFamily::CommanderCore => "commander_core",
            DeviceFamily::HydroPlatinum => "hydro_platinum",
            DeviceFamily::AsetekPro => "asetek_pro",
            DeviceFamily::IcueLink => "icue_link",
        }
    }
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceFamily::CommanderPro => "Commander Pro",
            DeviceFamily::CommanderCore => "Commander Core",
            DeviceFamily::HydroPlatinum => "Hydro Platinum",
            DeviceFamily::AsetekPro => "Hydro Asetek Pro",
            DeviceFamily::IcueLink => "iCUE Link",
        };
        write!(f, "{}", name)
    }
}

/// Resolved per-device driver options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    /// Number of fan headers (Hydro coolers). Commander Core and iCUE Link
    /// channels are discovered from the device instead.
    pub fan_count: usize,
    /// Raw channel 0 drives the pump (Commander Core).
    pub first_channel_is_pump: bool,
    /// Replace the cooler's safety profile so it never overrides host duties.
    pub safety_profile_override: bool,
    /// Below this percent a fan is handed back to the device so it can stop.
    pub zero_rpm_duty_threshold: Option<u8>,
    /// Lowest pump power the host may request.
    pub min_pump_power: u8,
    /// Log the full device state after every refresh.
    pub debug_state: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            fan_count: 0,
            first_channel_is_pump: false,
            safety_profile_override: false,
            zero_rpm_duty_threshold: None,
            min_pump_power: 0,
            debug_state: false,
        }
    }
}

// =============================================================================
// Device Info and State
// =============================================================================

/// Identity of one physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Bus path of the device.
    pub unique_id: String,
    /// Human-readable name including the serial number or a path hash.
    pub name: String,
    pub model: String,
    pub family: DeviceFamily,
}

impl DeviceInfo {
    /// Identity for `model` reached through `channel`.
    pub fn new(family: DeviceFamily, model: &str, channel: &dyn ByteChannel) -> Self {
        let suffix = match channel.serial_number() {
            Some(serial) => serial.to_string(),
            None => {
                let mut hasher = DefaultHasher::new();
                channel.path().hash(&mut hasher);
                format!("{:08X}", hasher.finish() as u32)
            }
        };
        Self {
            unique_id: channel.path().to_string(),
            name: format!("Corsair {} ({})", model, suffix),
            model: model.to_string(),
            family,
        }
    }
}

/// Connection state of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Initializing,
    Ready,
    Refreshing,
}

// =============================================================================
// Driver Core
// =============================================================================

/// State shared by every family driver.
pub struct DriverCore {
    info: DeviceInfo,
    channel: Box<dyn ByteChannel>,
    guard: ExclusiveGuard,
    state: DeviceState,
    sensors: SensorBoard,
    firmware: Option<String>,
    options: DriverOptions,
}

impl DriverCore {
    pub fn new(
        info: DeviceInfo,
        channel: Box<dyn ByteChannel>,
        guard: ExclusiveGuard,
        options: DriverOptions,
    ) -> Self {
        Self {
            info,
            channel,
            guard,
            state: DeviceState::Disconnected,
            sensors: SensorBoard::new(),
            firmware: None,
            options,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn sensors(&self) -> &SensorBoard {
        &self.sensors
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn guard(&self) -> &ExclusiveGuard {
        &self.guard
    }

    pub fn channel(&self) -> &dyn ByteChannel {
        self.channel.as_ref()
    }

    pub fn channel_mut(&mut self) -> &mut dyn ByteChannel {
        self.channel.as_mut()
    }

    fn log_state(&self) {
        for s in self.sensors.speeds() {
            debug!(device = %self.info.unique_id, channel = s.channel, name = %s.name, rpm = ?s.rpm, "Speed sensor");
        }
        for t in self.sensors.temperatures() {
            debug!(device = %self.info.unique_id, channel = t.channel, name = %t.name, celsius = ?t.celsius, "Temperature sensor");
        }
    }
}

impl std::fmt::Debug for DriverCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverCore")
            .field("info", &self.info)
            .field("state", &self.state)
            .field("firmware", &self.firmware)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Device Driver
// =============================================================================

/// A connected (or connectable) cooling controller.
///
/// Families implement the hooks; the lifecycle methods are shared.
pub trait DeviceDriver: Send {
    fn core(&self) -> &DriverCore;

    fn core_mut(&mut self) -> &mut DriverCore;

    /// Negotiate software mode, discover channels, seed the channel store
    /// with defaults and create the sensors. Called with the channel open.
    fn initialize(&mut self) -> Result<()>;

    /// One poll cycle: push coalesced writes, then read telemetry.
    fn poll(&mut self) -> Result<()>;

    fn read_firmware_version(&mut self) -> Result<String>;

    /// Hand control back to the device's own firmware.
    fn return_to_hardware_mode(&mut self) -> Result<()>;

    /// Cloneable handle for changing channel power from another thread.
    fn control(&self) -> Arc<dyn PowerControl>;

    // -------------------------------------------------------------------------
    // Provided
    // -------------------------------------------------------------------------

    fn unique_id(&self) -> &str {
        &self.core().info.unique_id
    }

    fn name(&self) -> &str {
        &self.core().info.name
    }

    fn state(&self) -> DeviceState {
        self.core().state
    }

    fn speed_sensors(&self) -> Vec<SpeedSensor> {
        self.core().sensors.speeds()
    }

    fn temperature_sensors(&self) -> Vec<TemperatureSensor> {
        self.core().sensors.temperatures()
    }

    /// Open the device, initialize it and seed the sensors.
    ///
    /// Never fails: errors are logged and reported as `false`.
    fn connect(&mut self) -> bool {
        self.disconnect();

        let id = self.unique_id().to_string();
        self.core_mut().state = DeviceState::Connecting;
        if let Err(e) = self.core_mut().channel.open() {
            warn!(device = %id, error = %e, "Failed to open device");
            self.core_mut().state = DeviceState::Disconnected;
            return false;
        }

        self.core_mut().state = DeviceState::Initializing;
        if let Err(e) = self.initialize() {
            abandon_connect(self, "initialize", &e);
            return false;
        }

        let firmware = self.get_firmware_version();
        self.core_mut().state = DeviceState::Ready;

        if let Err(e) = self.refresh() {
            abandon_connect(self, "refresh", &e);
            return false;
        }

        info!(device = %id, name = %self.name(), firmware = %firmware, "Device connected");
        true
    }

    /// Best-effort return to hardware mode, then close the channel.
    fn disconnect(&mut self) {
        if self.core().channel.is_open()
            && let Err(e) = self.return_to_hardware_mode()
        {
            debug!(device = %self.unique_id(), error = %e, "Failed to return to hardware mode");
        }

        let core = self.core_mut();
        core.channel.close();
        core.firmware = None;
        if core.state != DeviceState::Disconnected {
            info!(device = %core.info.unique_id, "Device disconnected");
        }
        core.state = DeviceState::Disconnected;
    }

    /// Run one poll cycle.
    ///
    /// A transport failure that the driver could not recover from drops the
    /// device to `Disconnected` so the poller reconnects it.
    ///
    /// # Errors
    /// Returns `NotConnected` unless the device is `Ready`, otherwise the
    /// poll error.
    fn refresh(&mut self) -> Result<()> {
        if self.core().state != DeviceState::Ready {
            return Err(LinkError::NotConnected);
        }

        self.core_mut().state = DeviceState::Refreshing;
        let result = self.poll();

        let core = self.core_mut();
        match &result {
            Err(LinkError::Transport(e)) => {
                error!(device = %core.info.unique_id, error = %e, "Transport failure, marking device disconnected");
                core.channel.close();
                core.sensors.invalidate();
                core.state = DeviceState::Disconnected;
            }
            _ => core.state = DeviceState::Ready,
        }

        if result.is_ok() && core.options.debug_state {
            core.log_state();
        }
        result
    }

    /// Firmware version as `major.minor.revision[.build]`, or
    /// [`FIRMWARE_UNKNOWN`] if it cannot be read.
    fn get_firmware_version(&mut self) -> String {
        if let Some(firmware) = &self.core().firmware {
            return firmware.clone();
        }
        if !self.core().channel.is_open() {
            return FIRMWARE_UNKNOWN.to_string();
        }

        match self.read_firmware_version() {
            Ok(firmware) => {
                self.core_mut().firmware = Some(firmware.clone());
                firmware
            }
            Err(e) => {
                warn!(device = %self.unique_id(), error = %e, "Failed to read firmware version");
                FIRMWARE_UNKNOWN.to_string()
            }
        }
    }

    /// Queue a power change for `channel`, applied on the next refresh.
    fn set_channel_power(&self, channel: ChannelId, percent: i32) -> Result<()> {
        self.control().set_channel_power(channel, percent)
    }

    /// Queue the channel's default setting, applied on the next refresh.
    fn reset_channel(&self, channel: ChannelId) -> Result<()> {
        self.control().reset_channel(channel)
    }
}

fn abandon_connect<D: DeviceDriver + ?Sized>(driver: &mut D, stage: &str, e: &LinkError) {
    error!(device = %driver.unique_id(), stage, error = %e, "Failed to connect device");
    // Initialize may already have taken the device out of hardware mode.
    if driver.core().channel.is_open()
        && let Err(e) = driver.return_to_hardware_mode()
    {
        debug!(device = %driver.unique_id(), error = %e, "Failed to return to hardware mode");
    }
    let core = driver.core_mut();
    core.channel.close();
    core.state = DeviceState::Disconnected;
}
