//! Scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{ByteChannel, ReconnectHook};
use crate::error::TransportError;

/// Produces the packets the device sends back for one written packet.
pub(crate) type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Debug, Default)]
struct Shared {
    writes: Vec<Vec<u8>>,
    read_timeouts: usize,
    opens: usize,
    closes: usize,
}

/// Observer for a [`ScriptedChannel`] that stays usable after the channel
/// was moved into a driver.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptHandle {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptHandle {
    /// Every packet written so far, in order.
    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.lock().writes.clone()
    }

    /// Written packets whose bytes start with `prefix`.
    pub(crate) fn writes_starting_with(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.shared
            .lock()
            .writes
            .iter()
            .filter(|w| w.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub(crate) fn clear_writes(&self) {
        self.shared.lock().writes.clear();
    }

    /// Make the next `count` reads fail with [`TransportError::Timeout`].
    pub(crate) fn fail_next_reads(&self, count: usize) {
        self.shared.lock().read_timeouts = count;
    }

    pub(crate) fn open_count(&self) -> usize {
        self.shared.lock().opens
    }

    pub(crate) fn close_count(&self) -> usize {
        self.shared.lock().closes
    }
}

/// [`ByteChannel`] whose device side is a responder closure.
pub(crate) struct ScriptedChannel {
    path: String,
    serial: Option<String>,
    open: bool,
    fail_open: bool,
    responder: Responder,
    queue: VecDeque<Vec<u8>>,
    shared: Arc<Mutex<Shared>>,
    reconnect_hook: Option<ReconnectHook>,
}

impl ScriptedChannel {
    pub(crate) fn new(
        path: &str,
        responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    ) -> (Self, ScriptHandle) {
        let handle = ScriptHandle::default();
        let channel = Self {
            path: path.to_string(),
            serial: None,
            open: false,
            fail_open: false,
            responder: Box::new(responder),
            queue: VecDeque::new(),
            shared: Arc::clone(&handle.shared),
            reconnect_hook: None,
        };
        (channel, handle)
    }

    pub(crate) fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    /// Every `open` fails, as if the device was unplugged.
    pub(crate) fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl ByteChannel for ScriptedChannel {
    fn path(&self) -> &str {
        &self.path
    }

    fn serial_number(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.fail_open {
            return Err(TransportError::Gone(self.path.clone()));
        }
        self.shared.lock().opens += 1;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.shared.lock().closes += 1;
        }
        self.open = false;
        self.queue.clear();
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.shared.lock().writes.push(data.to_vec());
        let responses = (self.responder)(data);
        self.queue.extend(responses);
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        {
            let mut shared = self.shared.lock();
            if shared.read_timeouts > 0 {
                shared.read_timeouts -= 1;
                return Err(TransportError::Timeout);
            }
        }
        let packet = self.queue.pop_front().ok_or(TransportError::Timeout)?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        buf[len..].fill(0);
        Ok(())
    }

    fn clear_pending(&mut self) {
        self.queue.clear();
    }

    fn on_reconnect(&mut self, hook: ReconnectHook) {
        self.reconnect_hook = Some(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_round_trip() {
        let (mut channel, handle) = ScriptedChannel::new("mock-0", |req| vec![vec![req[0], 0x42]]);
        channel.open().unwrap();
        channel.write(&[0x07, 0x01]).unwrap();

        let mut buf = [0xFFu8; 4];
        channel.read(&mut buf).unwrap();
        assert_eq!(buf, [0x07, 0x42, 0x00, 0x00]);
        assert_eq!(handle.writes(), vec![vec![0x07, 0x01]]);

        // Nothing queued anymore.
        assert!(matches!(channel.read(&mut buf), Err(TransportError::Timeout)));
    }

    #[test]
    fn test_injected_timeouts_and_closed_state() {
        let (mut channel, handle) = ScriptedChannel::new("mock-1", |_| vec![vec![1]]);
        let mut buf = [0u8; 1];
        assert!(matches!(channel.write(&[0]), Err(TransportError::Closed)));

        channel.open().unwrap();
        channel.write(&[0]).unwrap();
        handle.fail_next_reads(1);
        assert!(matches!(channel.read(&mut buf), Err(TransportError::Timeout)));
        channel.read(&mut buf).unwrap();
        assert_eq!(buf[0], 1);

        channel.close();
        assert_eq!(handle.open_count(), 1);
        assert_eq!(handle.close_count(), 1);
    }
}
