//! HID transport backed by `hidapi`.

use std::ffi::{CStr, CString};

use hidapi::{HidApi, HidDevice, HidError};
use tracing::{debug, warn};

use super::{ByteChannel, ReconnectHook};
use crate::error::TransportError;

/// Default HID read timeout in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: i32 = 500;

/// Largest report any supported device sends, used to drain stale reports.
const DRAIN_BUFFER_LENGTH: usize = 1024;

/// One HID interface of a device, addressed by its hidapi path.
///
/// A failed read or write reopens the path once and retries, then runs the
/// registered reconnect hook so the driver can re-enter software mode.
pub struct HidChannel {
    path: CString,
    display_path: String,
    serial: Option<String>,
    device: Option<HidDevice>,
    read_timeout_ms: i32,
    reconnect_hook: Option<ReconnectHook>,
}

impl HidChannel {
    /// Create a closed channel for the given hidapi path.
    pub fn new(path: &CStr, serial: Option<String>) -> Self {
        Self {
            path: path.to_owned(),
            display_path: path.to_string_lossy().into_owned(),
            serial: serial.filter(|s| !s.trim().is_empty()),
            device: None,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            reconnect_hook: None,
        }
    }

    /// Override the per-read timeout.
    pub fn with_read_timeout(mut self, timeout_ms: i32) -> Self {
        self.read_timeout_ms = timeout_ms;
        self
    }

    fn reopen(&mut self) -> Result<(), TransportError> {
        self.device = None;
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

    fn with_retry<T>(
        &mut self,
        what: &str,
        mut op: impl FnMut(&HidDevice) -> Result<T, HidError>,
    ) -> Result<T, TransportError> {
        let first = match &self.device {
            Some(device) => op(device),
            None => return Err(TransportError::Closed),
        };

        match first {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(device = %self.display_path, error = %e, "HID {} failed, reopening device", what);
                self.reopen()?;
                let device = self.device.as_ref().ok_or(TransportError::Closed)?;
                Ok(op(device)?)
            }
        }
    }
}

impl ByteChannel for HidChannel {
    fn path(&self) -> &str {
        &self.display_path
    }

    fn serial_number(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.device.is_some() {
            return Ok(());
        }
        let api = HidApi::new()?;
        let device = api.open_path(&self.path)?;
        debug!(device = %self.display_path, "HID device opened");
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!(device = %self.display_path, "HID device closed");
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.with_retry("write", |device| device.write(data))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let timeout = self.read_timeout_ms;
        let read = self.with_retry("read", |device| device.read_timeout(&mut *buf, timeout))?;
        if read == 0 {
            return Err(TransportError::Timeout);
        }
        buf[read..].fill(0);
        Ok(())
    }

    fn clear_pending(&mut self) {
        let Some(device) = &self.device else {
            return;
        };
        let mut buf = [0u8; DRAIN_BUFFER_LENGTH];
        loop {
            match device.read_timeout(&mut buf, 1) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    fn on_reconnect(&mut self, hook: ReconnectHook) {
        self.reconnect_hook = Some(hook);
    }
}

impl std::fmt::Debug for HidChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HidChannel")
            .field("path", &self.display_path)
            .field("serial", &self.serial)
            .field("open", &self.device.is_some())
            .finish_non_exhaustive()
    }
}
