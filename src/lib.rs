//! Corsair Rust Devices Library
//!
//! Drivers for Corsair liquid coolers and fan hubs: Commander Pro, Commander
//! Core (XT, ST), iCUE Link System Hub, Hydro Platinum / Pro XT / Elite and
//! the Hydro Asetek Pro coolers.
//!
//! # Features
//!
//! - Discover supported controllers over HID and the USBXpress bridge
//! - Read fan and pump RPM and liquid or probe temperatures
//! - Set per-channel fan and pump power, coalescing writes between polls
//! - Serialize all bus traffic across processes with one system-wide lock
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use corsair_rust_devices::config::load_config;
//! use corsair_rust_devices::guard::ExclusiveGuard;
//! use corsair_rust_devices::poller::Poller;
//! use corsair_rust_devices::registry::DeviceRegistry;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config()?;
//!     let registry = DeviceRegistry::new(config, ExclusiveGuard::global());
//!
//!     let mut poller = Poller::new(registry.discover()?, Duration::from_secs(1));
//!     poller.connect_all();
//!
//!     for driver in poller.drivers() {
//!         println!("{}", driver.name());
//!         // Queue 60% on channel 0; written on the next refresh.
//!         driver.set_channel_power(0, 60)?;
//!     }
//!
//!     poller.tick();
//!     poller.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod guard;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod tracking;
pub mod transport;
pub mod utils;

// Re-exports for convenience
pub use device::{DeviceDriver, DeviceFamily, DeviceState, PowerControl, SpeedSensor, TemperatureSensor};
pub use error::{LinkError, Result, TransportError};
pub use guard::ExclusiveGuard;
pub use poller::Poller;
pub use registry::DeviceRegistry;
pub use tracking::{ChannelId, ChannelStore};
pub use transport::ByteChannel;
