//! Device discovery and driver construction.
//!
//! HID controllers are found with hidapi; the Asetek Pro coolers sit
//! behind a USBXpress bridge that is not a HID device and are found with
//! nusb instead. Every match is looked up in the model table, which fixes
//! the family, display model and default driver options.

use std::collections::{HashMap, HashSet};
use std::ffi::CStr;

use hidapi::HidApi;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::device::{
    AsetekPro, CommanderCore, CommanderPro, DeviceDriver, DeviceFamily, DeviceInfo, DriverCore,
    DriverOptions, HydroPlatinum, IcueLink,
};
use crate::error::{LinkError, Result, TransportError};
use crate::guard::ExclusiveGuard;
use crate::transport::{BridgeChannel, ByteChannel, HidChannel};

/// Corsair USB vendor ID.
pub const CORSAIR_VID: u16 = 0x1B1C;

// =============================================================================
// Model Table
// =============================================================================

/// One supported product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelEntry {
    pub product_id: u16,
    pub family: DeviceFamily,
    pub model: &'static str,
    /// HID interface carrying the protocol, or `None` for any.
    pub interface: Option<i32>,
    pub fan_count: usize,
    pub first_channel_is_pump: bool,
    pub min_pump_power: u8,
}

impl ModelEntry {
    const fn new(product_id: u16, family: DeviceFamily, model: &'static str) -> Self {
        Self {
            product_id,
            family,
            model,
            interface: None,
            fan_count: 0,
            first_channel_is_pump: false,
            min_pump_power: 0,
        }
    }

    const fn interface(mut self, interface: i32) -> Self {
        self.interface = Some(interface);
        self
    }

    const fn fans(mut self, count: usize) -> Self {
        self.fan_count = count;
        self
    }

    const fn pump_first(mut self, min_pump_power: u8) -> Self {
        self.first_channel_is_pump = true;
        self.min_pump_power = min_pump_power;
        self
    }

    const fn min_pump(mut self, min_pump_power: u8) -> Self {
        self.min_pump_power = min_pump_power;
        self
    }

    /// Driver options before config overrides.
    pub fn default_options(&self) -> DriverOptions {
        DriverOptions {
            fan_count: self.fan_count,
            first_channel_is_pump: self.first_channel_is_pump,
            min_pump_power: self.min_pump_power,
            ..DriverOptions::default()
        }
    }

    fn matches_interface(&self, interface: i32) -> bool {
        self.interface.is_none_or(|wanted| wanted == interface)
    }
}

pub const MODELS: &[ModelEntry] = &[
    ModelEntry::new(0x0C10, DeviceFamily::CommanderPro, "Commander Pro"),
    ModelEntry::new(0x1D00, DeviceFamily::CommanderPro, "Obsidian 1000D"),
    ModelEntry::new(0x0C1C, DeviceFamily::CommanderCore, "Commander Core").interface(0).pump_first(50),
    ModelEntry::new(0x0C1A, DeviceFamily::CommanderCore, "Commander Core").interface(0).pump_first(50),
    ModelEntry::new(0x0C2A, DeviceFamily::CommanderCore, "Commander Core XT").interface(0),
    ModelEntry::new(0x0C32, DeviceFamily::CommanderCore, "Commander ST").interface(0).pump_first(50),
    ModelEntry::new(0x0C18, DeviceFamily::HydroPlatinum, "H100i Platinum").fans(2),
    ModelEntry::new(0x0C19, DeviceFamily::HydroPlatinum, "H100i Platinum SE").fans(2),
    ModelEntry::new(0x0C17, DeviceFamily::HydroPlatinum, "H115i Platinum").fans(2),
    ModelEntry::new(0x0C29, DeviceFamily::HydroPlatinum, "H60i Pro XT").fans(2),
    ModelEntry::new(0x0C20, DeviceFamily::HydroPlatinum, "H100i Pro XT").fans(2),
    ModelEntry::new(0x0C21, DeviceFamily::HydroPlatinum, "H115i Pro XT").fans(2),
    ModelEntry::new(0x0C22, DeviceFamily::HydroPlatinum, "H150i Pro XT").fans(3),
    ModelEntry::new(0x0C35, DeviceFamily::HydroPlatinum, "H100i Elite").fans(2),
    ModelEntry::new(0x0C36, DeviceFamily::HydroPlatinum, "H115i Elite").fans(2),
    ModelEntry::new(0x0C37, DeviceFamily::HydroPlatinum, "H150i Elite").fans(3),
    ModelEntry::new(0x0C15, DeviceFamily::AsetekPro, "H100i Pro").fans(2),
    ModelEntry::new(0x0C13, DeviceFamily::AsetekPro, "H115i Pro").fans(2),
    ModelEntry::new(0x0C12, DeviceFamily::AsetekPro, "H150i Pro").fans(3),
    ModelEntry::new(0x0C3F, DeviceFamily::IcueLink, "iCUE Link System Hub").interface(0).min_pump(50),
];

/// Look up a supported product.
///
/// # Errors
/// Returns `UnsupportedDevice` for any other vendor or product ID.
pub fn lookup(vendor_id: u16, product_id: u16) -> Result<&'static ModelEntry> {
    if vendor_id != CORSAIR_VID {
        return Err(LinkError::UnsupportedDevice { vendor_id, product_id });
    }
    MODELS
        .iter()
        .find(|m| m.product_id == product_id)
        .ok_or(LinkError::UnsupportedDevice { vendor_id, product_id })
}

// =============================================================================
// Registry
// =============================================================================

/// A matched device whose driver has not been built yet.
pub struct Candidate {
    pub model: &'static ModelEntry,
    pub channel: Box<dyn ByteChannel>,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("model", &self.model.model)
            .field("path", &self.channel.path())
            .finish()
    }
}

/// Group candidates by protocol family.
pub fn partition(candidates: Vec<Candidate>) -> HashMap<DeviceFamily, Vec<Candidate>> {
    let mut families: HashMap<DeviceFamily, Vec<Candidate>> = HashMap::new();
    for candidate in candidates {
        families.entry(candidate.model.family).or_default().push(candidate);
    }
    families
}

/// Keep only candidates with `product_id`, or all of them for `None`.
pub fn select(candidates: Vec<Candidate>, product_id: Option<u16>) -> Vec<Candidate> {
    match product_id {
        Some(pid) => candidates.into_iter().filter(|c| c.model.product_id == pid).collect(),
        None => candidates,
    }
}

/// Builds drivers for every supported controller on the system.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    config: AppConfig,
    guard: ExclusiveGuard,
    product: Option<u16>,
}

impl DeviceRegistry {
    pub fn new(config: AppConfig, guard: ExclusiveGuard) -> Self {
        Self {
            config,
            guard,
            product: None,
        }
    }

    /// Restrict discovery to one product ID.
    pub fn with_product(mut self, product_id: Option<u16>) -> Self {
        self.product = product_id;
        self
    }

    /// Every matching HID and bridge device, filtered by product.
    ///
    /// # Errors
    /// Returns an error if HID enumeration fails. A failing USB enumeration
    /// only skips the bridge-attached coolers.
    pub fn candidates(&self) -> Result<Vec<Candidate>> {
        let mut candidates = self.enumerate_hid()?;
        match self.enumerate_bridges() {
            Ok(bridges) => candidates.extend(bridges),
            Err(e) => warn!(error = %e, "USB enumeration failed, skipping bridge devices"),
        }
        Ok(select(candidates, self.product))
    }

    /// Enumerate HID and bridge devices and return one unconnected driver
    /// per supported controller, ordered by family.
    ///
    /// # Errors
    /// Returns an error if HID enumeration itself fails. A failing USB
    /// enumeration only skips the bridge-attached coolers.
    pub fn discover(&self) -> Result<Vec<Box<dyn DeviceDriver>>> {
        let mut families: Vec<_> = partition(self.candidates()?).into_iter().collect();
        families.sort_by_key(|(family, _)| family.key());

        let mut drivers = Vec::new();
        for (family, members) in families {
            info!(family = %family, count = members.len(), "Found devices");
            drivers.extend(members.into_iter().map(|c| self.build(c.model, c.channel)));
        }
        Ok(drivers)
    }

    /// Matching HID interfaces, one per path.
    pub fn enumerate_hid(&self) -> Result<Vec<Candidate>> {
        let api = HidApi::new().map_err(TransportError::from)?;
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for device in api.device_list() {
            let Ok(model) = lookup(device.vendor_id(), device.product_id()) else {
                continue;
            };
            if model.family == DeviceFamily::AsetekPro || !model.matches_interface(device.interface_number()) {
                continue;
            }
            let path: &CStr = device.path();
            if !seen.insert(path.to_owned()) {
                continue;
            }

            debug!(path = ?path, model = model.model, "HID device matched");
            let serial = device.serial_number().map(str::to_string);
            candidates.push(Candidate {
                model,
                channel: Box::new(HidChannel::new(path, serial)),
            });
        }
        Ok(candidates)
    }

    /// Asetek Pro coolers behind the USBXpress bridge.
    pub fn enumerate_bridges(&self) -> Result<Vec<Candidate>> {
        let devices = nusb::list_devices().map_err(TransportError::from)?;
        let mut candidates = Vec::new();

        for device in devices {
            let Ok(model) = lookup(device.vendor_id(), device.product_id()) else {
                continue;
            };
            if model.family != DeviceFamily::AsetekPro {
                continue;
            }
            debug!(bus = device.bus_number(), address = device.device_address(), model = model.model, "USB bridge matched");
            candidates.push(Candidate {
                model,
                channel: Box::new(BridgeChannel::from_info(&device)),
            });
        }
        Ok(candidates)
    }

    /// Build the family driver for `model` on `channel`.
    pub fn build(&self, model: &ModelEntry, channel: Box<dyn ByteChannel>) -> Box<dyn DeviceDriver> {
        let options = self.config.driver_options(model.family, model.default_options());
        let info = DeviceInfo::new(model.family, model.model, channel.as_ref());
        let core = DriverCore::new(info, channel, self.guard.clone(), options);

        match model.family {
            DeviceFamily::CommanderPro => Box::new(CommanderPro::new(core)),
            DeviceFamily::CommanderCore => Box::new(CommanderCore::new(core)),
            DeviceFamily::HydroPlatinum => Box::new(HydroPlatinum::new(core)),
            DeviceFamily::AsetekPro => Box::new(AsetekPro::new(core)),
            DeviceFamily::IcueLink => Box::new(IcueLink::new(core)),
        }
    }
}
