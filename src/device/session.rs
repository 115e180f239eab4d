//! Guarded endpoint sessions with reconnect-on-timeout.

use tracing::{debug, warn};

use super::DriverCore;
use crate::error::Result;
use crate::protocol::EndpointCodec;
use crate::transport::ByteChannel;

/// Endpoint codec plus the family's software-mode command.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndpointSession {
    codec: EndpointCodec,
    software_mode: &'static [u8],
}

impl EndpointSession {
    pub(crate) const fn new(codec: EndpointCodec, software_mode: &'static [u8]) -> Self {
        Self { codec, software_mode }
    }

    pub(crate) fn codec(&self) -> &EndpointCodec {
        &self.codec
    }

    /// Have the transport re-enter software mode after it reopens itself.
    pub(crate) fn install_reconnect_hook(&self, core: &mut DriverCore) {
        let codec = self.codec;
        let software_mode = self.software_mode;
        core.channel_mut().on_reconnect(Box::new(move |channel: &mut dyn ByteChannel| {
            if let Err(e) = codec.command(channel, software_mode, &[]) {
                warn!(device = %channel.path(), error = %e, "Failed to re-enter software mode after reconnect");
            }
        }));
    }

    pub(crate) fn enter_software_mode(&self, core: &mut DriverCore) -> Result<()> {
        self.run(core, |codec, channel| {
            codec.command(channel, self.software_mode, &[])?;
            Ok(())
        })
    }

    /// Run `op` under the bus guard.
    ///
    /// A transport read timeout closes and reopens the device, re-enters
    /// software mode and retries `op` once before giving up.
    pub(crate) fn run<T>(
        &self,
        core: &mut DriverCore,
        mut op: impl FnMut(&EndpointCodec, &mut dyn ByteChannel) -> Result<T>,
    ) -> Result<T> {
        let _access = core.guard().acquire_exclusive()?;

        match op(&self.codec, core.channel_mut()) {
            Err(e) if e.is_transport_timeout() => {
                warn!(device = %core.info().unique_id, "Read timed out, reconnecting device");
                let channel = core.channel_mut();
                channel.close();
                channel.open()?;
                self.codec.command(channel, self.software_mode, &[])?;
                debug!(device = %channel.path(), "Reconnected, retrying");
                op(&self.codec, channel)
            }
            other => other,
        }
    }
}
