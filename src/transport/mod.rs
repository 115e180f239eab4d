//! Raw duplex byte transports.
//!
//! Drivers never talk to hidapi or nusb directly; they go through a
//! [`ByteChannel`], which lets the registry hand any transport to any
//! protocol and lets tests script the device side.

pub mod bridge;
pub mod hid;

#[cfg(test)]
pub(crate) mod mock;

pub use bridge::BridgeChannel;
pub use hid::HidChannel;

use crate::error::TransportError;

/// Callback invoked by a transport right after it silently reopened the
/// device. It receives the channel so it can renegotiate device mode.
pub type ReconnectHook = Box<dyn FnMut(&mut dyn ByteChannel) + Send>;

/// Opaque duplex byte transport to one physical device.
pub trait ByteChannel: Send {
    /// Stable bus path, used as the device's unique ID.
    fn path(&self) -> &str;

    /// Serial number reported by the device, if any.
    fn serial_number(&self) -> Option<&str> {
        None
    }

    /// Whether [`ByteChannel::open`] succeeded and `close` was not called since.
    fn is_open(&self) -> bool;

    /// Open the device.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close the device. Closing a closed channel is a no-op.
    fn close(&mut self);

    /// Write one packet.
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read one packet into `buf`, zero-filling whatever the device did not
    /// send. Fails with [`TransportError::Timeout`] if nothing arrives.
    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Drop any reports queued by the device before the next write.
    fn clear_pending(&mut self);

    /// Register the hook to run after an automatic reconnect.
    fn on_reconnect(&mut self, hook: ReconnectHook);
}
