//! imx-core: shared protocol library for the imx messaging gateway.
//!
//! Provides the forwarder and session header codecs, command identifiers,
//! the CBOR bodies the gateway inspects, and the command dispatch registry.

pub mod cmd;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{
    cbor_decode, cbor_encode, Flag, FrameHeader, FramePacket, Header, MesgHeader, MesgPacket,
    Packet, PROTOCOL_CHECKSUM,
};
pub use dispatch::{Entry, Registry};
pub use error::{ImxError, ImxResult};
