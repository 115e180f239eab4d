//! Endpoint-addressed sub-protocol.
//!
//! Multi-endpoint controllers expose their data behind numbered endpoints.
//! Every access is a session: close any stale handle, open the endpoint,
//! read or write it, then close it again. Each step travels inside the
//! family's outer command envelope `[0x00][header][command][data...]`.
//!
//! Read responses carry a two-byte data-type tag. The device occasionally
//! answers a read with a frame of another type, so the read is re-issued
//! until the tag matches or the response deadline passes.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use crate::error::{LinkError, Result};
use crate::transport::ByteChannel;

/// Default wall-clock bound on the data-type poll loop.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Envelope and session commands of one endpoint-addressed family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointLayout {
    /// Bytes between the report ID and the command.
    pub header: &'static [u8],
    /// Request length including the report ID.
    pub request_len: usize,
    pub response_len: usize,
    /// Response offset that repeats the first command byte.
    pub echo_offset: usize,
    /// Response offset of the two-byte data-type tag.
    pub type_offset: usize,
    /// Response offset where endpoint data starts.
    pub payload_offset: usize,
    pub open: &'static [u8],
    pub close: &'static [u8],
    pub read: &'static [u8],
    pub write: &'static [u8],
}

/// Session driver for an [`EndpointLayout`].
///
/// All methods expect the caller to hold the bus guard for the whole call.
#[derive(Debug, Clone, Copy)]
pub struct EndpointCodec {
    layout: EndpointLayout,
    response_timeout: Duration,
}

impl EndpointCodec {
    pub const fn new(layout: EndpointLayout) -> Self {
        Self {
            layout,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub const fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn layout(&self) -> &EndpointLayout {
        &self.layout
    }

    /// Wrap `command` and `data` in the outer envelope.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the result overflows the request length.
    pub fn encode(&self, command: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut packet = Vec::with_capacity(self.layout.request_len);
        packet.push(0x00);
        packet.extend_from_slice(self.layout.header);
        packet.extend_from_slice(command);
        packet.extend_from_slice(data);

        if packet.len() > self.layout.request_len {
            return Err(LinkError::InvalidInput(format!(
                "Endpoint request of {} bytes exceeds {}-byte report",
                packet.len(),
                self.layout.request_len
            )));
        }
        packet.resize(self.layout.request_len, 0);
        Ok(packet)
    }

    fn exchange(&self, channel: &mut dyn ByteChannel, command: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let packet = self.encode(command, data)?;
        channel.clear_pending();
        channel.write(&packet)?;

        let mut response = vec![0u8; self.layout.response_len];
        channel.read(&mut response)?;
        Ok(response)
    }

    fn echoes(&self, response: &[u8], command: &[u8]) -> bool {
        matches!((response.get(self.layout.echo_offset), command.first()), (Some(a), Some(b)) if a == b)
    }

    fn tag(&self, response: &[u8]) -> Option<[u8; 2]> {
        let offset = self.layout.type_offset;
        response.get(offset..offset + 2).map(|t| [t[0], t[1]])
    }

    /// Send one outer command and return the full response.
    ///
    /// # Errors
    /// Returns `InvalidResponse` if the response does not echo the command.
    pub fn command(&self, channel: &mut dyn ByteChannel, command: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let response = self.exchange(channel, command, data)?;
        if !self.echoes(&response, command) {
            return Err(LinkError::invalid_response(format!(
                "Command {:02x?} answered with {:#04x} at offset {}",
                command,
                response.get(self.layout.echo_offset).copied().unwrap_or_default(),
                self.layout.echo_offset
            )));
        }
        Ok(response)
    }

    fn open(&self, channel: &mut dyn ByteChannel, endpoint: &[u8]) -> Result<()> {
        // A handle left open by a crashed session makes the open fail.
        self.command(channel, self.layout.close, endpoint)?;
        self.command(channel, self.layout.open, endpoint)?;
        Ok(())
    }

    fn close_quietly(&self, channel: &mut dyn ByteChannel, endpoint: &[u8]) {
        if let Err(e) = self.command(channel, self.layout.close, endpoint) {
            debug!(device = %channel.path(), endpoint = ?endpoint, error = %e, "Failed to close endpoint");
        }
    }

    /// Read `endpoint` and return its data once the response carries
    /// `data_type`.
    ///
    /// # Errors
    /// Returns `ProtocolTimeout` if no frame with the expected tag arrives
    /// before the response deadline.
    pub fn read(&self, channel: &mut dyn ByteChannel, endpoint: &[u8], data_type: [u8; 2]) -> Result<Vec<u8>> {
        self.open(channel, endpoint)?;

        let result = self.poll_for_type(channel, endpoint, data_type);
        match &result {
            Ok(_) => {
                self.command(channel, self.layout.close, endpoint)?;
            }
            Err(_) => self.close_quietly(channel, endpoint),
        }
        result
    }

    fn poll_for_type(
        &self,
        channel: &mut dyn ByteChannel,
        endpoint: &[u8],
        data_type: [u8; 2],
    ) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let response = self.exchange(channel, self.layout.read, &[])?;
            let tag = self.tag(&response);
            if self.echoes(&response, self.layout.read) && tag == Some(data_type) {
                trace!(device = %channel.path(), endpoint = ?endpoint, attempts, "Endpoint read");
                return Ok(response[self.layout.payload_offset..].to_vec());
            }

            let elapsed = start.elapsed();
            if elapsed >= self.response_timeout {
                return Err(LinkError::ProtocolTimeout {
                    operation: format!("endpoint {:02x?} data type {:02x?}", endpoint, data_type),
                    elapsed_ms: elapsed.as_millis(),
                });
            }
            trace!(device = %channel.path(), endpoint = ?endpoint, expected = ?data_type, got = ?tag, "Unexpected data type, re-reading");
        }
    }

    /// Write `data` tagged with `data_type` to `endpoint`.
    pub fn write(
        &self,
        channel: &mut dyn ByteChannel,
        endpoint: &[u8],
        data_type: [u8; 2],
        data: &[u8],
    ) -> Result<()> {
        let body = write_body(data_type, data)?;
        self.open(channel, endpoint)?;

        match self.command(channel, self.layout.write, &body) {
            Ok(_) => {
                self.command(channel, self.layout.close, endpoint)?;
                Ok(())
            }
            Err(e) => {
                self.close_quietly(channel, endpoint);
                Err(e)
            }
        }
    }
}

/// `[len16-le][0x0000][type16][data...]` with `len = data.len() + 2`.
pub fn write_body(data_type: [u8; 2], data: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(data.len() + 2)
        .map_err(|_| LinkError::InvalidInput(format!("Endpoint data too long: {} bytes", data.len())))?;

    let mut body = vec![0u8; 6 + data.len()];
    LittleEndian::write_u16(&mut body[0..2], len);
    body[4..6].copy_from_slice(&data_type);
    body[6..].copy_from_slice(data);
    Ok(body)
}
