//! USBXpress serial-bridge transport backed by `nusb`.
//!
//! Asetek-based Hydro coolers sit behind a Silicon Labs USBXpress bridge:
//! packets travel over a bulk endpoint pair, and flow control is driven with
//! vendor control requests on interface 0.

use std::future::Future;
use std::time::{Duration, Instant};

use futures_lite::future::{block_on, poll_once};
use nusb::transfer::{ControlOut, ControlType, Recipient, RequestBuffer};
use tracing::{debug, warn};

use super::{ByteChannel, ReconnectHook};
use crate::error::TransportError;

/// Bulk endpoint for host-to-device packets.
pub const BULK_OUT_ENDPOINT: u8 = 0x02;

/// Bulk endpoint for device-to-host packets.
pub const BULK_IN_ENDPOINT: u8 = 0x82;

/// USBXpress vendor request number.
const USBXPRESS_REQUEST: u8 = 0x02;
/// USBXpress request value: flush both bridge buffers.
const USBXPRESS_FLUSH_BUFFERS: u16 = 0x0001;
/// USBXpress request value: host is ready to exchange data.
const USBXPRESS_CLEAR_TO_SEND: u16 = 0x0002;
/// USBXpress request value: host stops exchanging data.
const USBXPRESS_NOT_CLEAR_TO_SEND: u16 = 0x0004;

/// Default per-transfer timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll step while waiting for a transfer to complete.
const POLL_STEP: Duration = Duration::from_millis(1);

/// Drive `transfer` until it completes or `timeout` elapses.
///
/// Dropping an unfinished transfer cancels it.
fn wait_for<F: Future>(transfer: F, timeout: Duration) -> Result<F::Output, TransportError> {
    let mut transfer = std::pin::pin!(transfer);
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(output) = block_on(poll_once(transfer.as_mut())) {
            return Ok(output);
        }
        if Instant::now() >= deadline {
            return Err(TransportError::Timeout);
        }
        std::thread::sleep(POLL_STEP);
    }
}

/// Handle for one USBXpress bridge device, addressed by bus and address.
pub struct BridgeChannel {
    bus_number: u8,
    device_address: u8,
    display_path: String,
    serial: Option<String>,
    interface: Option<nusb::Interface>,
    timeout: Duration,
    reconnect_hook: Option<ReconnectHook>,
}

impl BridgeChannel {
    /// Create a closed channel for the device at `bus_number`/`device_address`.
    pub fn new(bus_number: u8, device_address: u8, serial: Option<String>) -> Self {
        Self {
            bus_number,
            device_address,
            display_path: format!("usb-{}-{}", bus_number, device_address),
            serial: serial.filter(|s| !s.trim().is_empty()),
            interface: None,
            timeout: DEFAULT_TIMEOUT,
            reconnect_hook: None,
        }
    }

    /// Create a closed channel from an enumerated device.
    pub fn from_info(info: &nusb::DeviceInfo) -> Self {
        Self::new(
            info.bus_number(),
            info.device_address(),
            info.serial_number().map(String::from),
        )
    }

    /// Override the per-transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn interface(&self) -> Result<&nusb::Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::Closed)
    }

    fn flow_control(&self, value: u16) -> Result<(), TransportError> {
        let interface = self.interface()?;
        let completion = wait_for(
            interface.control_out(ControlOut {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: USBXPRESS_REQUEST,
                value,
                index: 0,
                data: &[],
            }),
            self.timeout,
        )?;
        completion
            .status
            .map_err(|e| TransportError::Transfer(format!("{:?}", e)))
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        self.interface = None;
        self.open()?;

        if let Some(mut hook) = self.reconnect_hook.take() {
            debug!(device = %self.display_path, "Running reconnect hook");
            hook(self);
            if self.reconnect_hook.is_none() {
                self.reconnect_hook = Some(hook);
            }
        }
        Ok(())
    }

    fn write_once(&self, data: &[u8]) -> Result<(), TransportError> {
        let interface = self.interface()?;
        let completion = wait_for(interface.bulk_out(BULK_OUT_ENDPOINT, data.to_vec()), self.timeout)?;
        completion
            .status
            .map_err(|e| TransportError::Transfer(format!("{:?}", e)))
    }
}

impl ByteChannel for BridgeChannel {
    fn path(&self) -> &str {
        &self.display_path
    }

    fn serial_number(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn is_open(&self) -> bool {
        self.interface.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.interface.is_some() {
            return Ok(());
        }

        let info = nusb::list_devices()?
            .find(|d| d.bus_number() == self.bus_number && d.device_address() == self.device_address)
            .ok_or_else(|| TransportError::Gone(self.display_path.clone()))?;

        let device = info.open()?;
        let interface = device.claim_interface(0)?;
        self.interface = Some(interface);

        if let Err(e) = self.flow_control(USBXPRESS_CLEAR_TO_SEND) {
            self.interface = None;
            return Err(e);
        }
        debug!(device = %self.display_path, "USBXpress bridge opened");
        Ok(())
    }

    fn close(&mut self) {
        if self.interface.is_none() {
            return;
        }
        if let Err(e) = self.flow_control(USBXPRESS_NOT_CLEAR_TO_SEND) {
            debug!(device = %self.display_path, error = %e, "Failed to clear flow control on close");
        }
        self.interface = None;
        debug!(device = %self.display_path, "USBXpress bridge closed");
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        match self.write_once(data) {
            Err(TransportError::Timeout) => Err(TransportError::Timeout),
            Err(e @ TransportError::Closed) => Err(e),
            Err(e) => {
                warn!(device = %self.display_path, error = %e, "Bulk write failed, reopening device");
                self.reopen()?;
                self.write_once(data)
            }
            Ok(()) => Ok(()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let interface = self.interface()?;
        let completion = wait_for(
            interface.bulk_in(BULK_IN_ENDPOINT, RequestBuffer::new(buf.len())),
            self.timeout,
        )?;
        completion
            .status
            .map_err(|e| TransportError::Transfer(format!("{:?}", e)))?;

        let data = completion.data;
        if data.is_empty() {
            return Err(TransportError::Timeout);
        }
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        buf[len..].fill(0);
        Ok(())
    }

    fn clear_pending(&mut self) {
        if self.interface.is_none() {
            return;
        }
        if let Err(e) = self.flow_control(USBXPRESS_FLUSH_BUFFERS) {
            debug!(device = %self.display_path, error = %e, "Failed to flush bridge buffers");
        }
    }

    fn on_reconnect(&mut self, hook: ReconnectHook) {
        self.reconnect_hook = Some(hook);
    }
}

impl std::fmt::Debug for BridgeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeChannel")
            .field("path", &self.display_path)
            .field("serial", &self.serial)
            .field("open", &self.interface.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_ready_future() {
        let value = wait_for(std::future::ready(7), Duration::from_millis(5)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_wait_for_times_out() {
        let result = wait_for(std::future::pending::<()>(), Duration::from_millis(5));
        assert!(matches!(result, Err(TransportError::Timeout)));
    }

    #[test]
    fn test_closed_channel_rejects_io() {
        let mut channel = BridgeChannel::new(1, 4, Some("  ".into()));
        assert_eq!(channel.path(), "usb-1-4");
        assert_eq!(channel.serial_number(), None);
        assert!(!channel.is_open());
        assert!(matches!(channel.write(&[0xAA]), Err(TransportError::Closed)));
        let mut buf = [0u8; 4];
        assert!(matches!(channel.read(&mut buf), Err(TransportError::Closed)));
    }
}
