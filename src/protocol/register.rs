//! Register-addressed request/response framing.
//!
//! A request is `[report id][command][args...]` padded to a fixed length and
//! answered by exactly one fixed-length response. There is no checksum or
//! tag: pairing relies on the caller holding the bus guard across the
//! write-then-read.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::trace;

use crate::error::{LinkError, Result};
use crate::transport::ByteChannel;

/// Fixed framing parameters of one register-addressed family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    /// Leading HID report ID, or `None` for raw bulk transports.
    pub report_id: Option<u8>,
    /// Total request length including the report ID, or `None` to send the
    /// request unpadded.
    pub request_len: Option<usize>,
    /// Length of every response.
    pub response_len: usize,
    /// Offset where the response payload starts.
    pub payload_offset: usize,
    /// Offset at which the response repeats the command byte, if it does.
    pub echo_offset: Option<usize>,
}

/// Encoder and transactor for a [`RegisterLayout`].
#[derive(Debug, Clone, Copy)]
pub struct RegisterCodec {
    layout: RegisterLayout,
}

impl RegisterCodec {
    pub const fn new(layout: RegisterLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    /// Build the request for `command` with `args`.
    ///
    /// # Errors
    /// Returns `InvalidInput` if the arguments overflow the request length.
    pub fn encode(&self, command: u8, args: &[u8]) -> Result<Vec<u8>> {
        let mut packet = Vec::with_capacity(self.layout.request_len.unwrap_or(args.len() + 2));
        if let Some(report_id) = self.layout.report_id {
            packet.push(report_id);
        }
        packet.push(command);
        packet.extend_from_slice(args);

        if let Some(len) = self.layout.request_len {
            if packet.len() > len {
                return Err(LinkError::InvalidInput(format!(
                    "Command {:#04x} with {} argument bytes exceeds {}-byte request",
                    command,
                    args.len(),
                    len
                )));
            }
            packet.resize(len, 0);
        }
        Ok(packet)
    }

    /// Write a prebuilt packet and read one response.
    ///
    /// The caller must hold the bus guard.
    pub fn exchange(&self, channel: &mut dyn ByteChannel, packet: &[u8]) -> Result<RegisterResponse> {
        channel.clear_pending();
        channel.write(packet)?;

        let mut buf = vec![0u8; self.layout.response_len];
        channel.read(&mut buf)?;
        trace!(device = %channel.path(), request = ?&packet[..packet.len().min(8)], response = ?&buf[..buf.len().min(8)], "Register exchange");

        Ok(RegisterResponse {
            bytes: buf,
            payload_offset: self.layout.payload_offset,
        })
    }

    /// Send `command` with `args` and return its response.
    ///
    /// The caller must hold the bus guard.
    ///
    /// # Errors
    /// Returns `InvalidResponse` if the response does not echo the command
    /// at the family's echo offset.
    pub fn transact(
        &self,
        channel: &mut dyn ByteChannel,
        command: u8,
        args: &[u8],
    ) -> Result<RegisterResponse> {
        let packet = self.encode(command, args)?;
        let response = self.exchange(channel, &packet)?;

        if let Some(offset) = self.layout.echo_offset {
            let echoed = response.byte(offset)?;
            if echoed != command {
                return Err(LinkError::invalid_response(format!(
                    "Expected echo of command {:#04x}, got {:#04x}",
                    command, echoed
                )));
            }
        }
        Ok(response)
    }
}

/// One fixed-length response. Accessors take absolute offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    bytes: Vec<u8>,
    payload_offset: usize,
}

impl RegisterResponse {
    /// Wrap raw bytes, e.g. a response produced outside [`RegisterCodec`].
    pub fn from_bytes(bytes: Vec<u8>, payload_offset: usize) -> Self {
        Self {
            bytes,
            payload_offset,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes from the payload offset to the end.
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(self.payload_offset..).unwrap_or(&[])
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.bytes.get(offset..offset + len).ok_or_else(|| {
            LinkError::invalid_response(format!(
                "Response too short: {} bytes, need {} at offset {}",
                self.bytes.len(),
                len,
                offset
            ))
        })
    }

    pub fn byte(&self, offset: usize) -> Result<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    pub fn u16_be(&self, offset: usize) -> Result<u16> {
        Ok(BigEndian::read_u16(self.slice(offset, 2)?))
    }

    pub fn u16_le(&self, offset: usize) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.slice(offset, 2)?))
    }
}
