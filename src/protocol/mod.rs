//! Wire protocols for Corsair cooling controllers.
//!
//! Two framing styles cover every supported family:
//! [`register`] for fixed request/response controllers and [`endpoint`] for
//! the multiplexed open/read/write/close sub-protocol. The per-family
//! modules hold each device's constant tables and decoders.

pub mod checksum;
pub mod endpoint;
pub mod register;
pub mod scale;
pub mod sequence;

pub mod asetek_pro;
pub mod commander_core;
pub mod commander_pro;
pub mod hydro_platinum;
pub mod icue_link;

pub use checksum::{Crc8, Crc16};
pub use endpoint::{EndpointCodec, EndpointLayout};
pub use register::{RegisterCodec, RegisterLayout, RegisterResponse};
pub use scale::{from_fractional_byte, to_fractional_byte};
pub use sequence::SequenceCounter;
