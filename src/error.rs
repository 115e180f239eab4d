//! Custom error types for Corsair devices.
//!
//! This module provides fine-grained error handling for bus transport,
//! protocol framing and checksum validation, and device discovery.

use thiserror::Error;

/// Errors raised by a [`ByteChannel`](crate::transport::ByteChannel).
#[derive(Error, Debug)]
pub enum TransportError {
    /// HID communication error.
    #[error("HID communication error: {0}")]
    Hid(#[from] hidapi::HidError),

    /// USB error from the bulk/control transport. `nusb` reports plain
    /// `io::Error`s, so local I/O failures land here too.
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    /// A USB transfer completed with an error status.
    #[error("USB transfer error: {0}")]
    Transfer(String),

    /// The device disappeared from the bus.
    #[error("Device {0} is no longer present")]
    Gone(String),

    /// No data arrived within the channel's per-call timeout.
    #[error("Timeout waiting for device response")]
    Timeout,

    /// The channel is not open.
    #[error("Channel is closed")]
    Closed,
}

/// Main error type for device operations.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Open/read/write failure on the underlying byte channel.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A received packet failed checksum validation.
    #[error("Checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    /// The expected response never arrived within the bounded wait.
    #[error("Timed out after {elapsed_ms}ms waiting for {operation}")]
    ProtocolTimeout {
        operation: String,
        elapsed_ms: u128,
    },

    /// Enumerated hardware is not in the known model table.
    #[error("Unsupported device {vendor_id:04x}:{product_id:04x}")]
    UnsupportedDevice { vendor_id: u16, product_id: u16 },

    /// A channel was read from the tracking store before it was ever applied.
    #[error("Channel {0} has no applied value")]
    KeyNotFound(i32),

    /// Invalid or malformed response from device.
    #[error("Invalid response from device: {message}")]
    InvalidResponse { message: String },

    /// Operation requires a connected device.
    #[error("Device not connected. Call connect() first.")]
    NotConnected,

    /// Device not found during enumeration.
    #[error("No supported Corsair device found. Check USB connection and permissions.")]
    DeviceNotFound,

    /// Generic invalid input error.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be read or written.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The system-wide bus lock could not be taken or released.
    #[error("Bus lock error: {0}")]
    Lock(String),
}

impl LinkError {
    /// Shorthand for [`LinkError::InvalidResponse`].
    pub fn invalid_response(message: impl Into<String>) -> Self {
        LinkError::InvalidResponse {
            message: message.into(),
        }
    }

    /// Whether this error is a transport read timeout.
    ///
    /// Endpoint-addressed drivers reconnect once when they see one.
    pub fn is_transport_timeout(&self) -> bool {
        matches!(self, LinkError::Transport(TransportError::Timeout))
    }
}

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_timeout_detection() {
        assert!(LinkError::from(TransportError::Timeout).is_transport_timeout());
        assert!(!LinkError::from(TransportError::Closed).is_transport_timeout());
        assert!(!LinkError::NotConnected.is_transport_timeout());
    }

    #[test]
    fn test_error_messages() {
        let err = LinkError::UnsupportedDevice {
            vendor_id: 0x1b1c,
            product_id: 0x0c99,
        };
        assert_eq!(err.to_string(), "Unsupported device 1b1c:0c99");

        let err = LinkError::ChecksumMismatch {
            expected: 0x42,
            actual: 0x17,
        };
        assert_eq!(err.to_string(), "Checksum mismatch: expected 0x0042, got 0x0017");
    }
}
