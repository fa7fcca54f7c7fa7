//! Fixed binary headers for the forwarder protocol and the session layer.
//!
//! Forwarder frame (17 bytes, big-endian):
//! `[cmd u32][nid u32][flag u8][length u32][checksum u32]`
//!
//! Session header (33 bytes, big-endian), carried in WebSocket frames and
//! inside forwarder bodies for session traffic:
//! `[cmd u32][nid u32][flag u8][length u32][checksum u32][sid u64][seq u64]`
//!
//! `checksum` is a protocol-version constant, not a digest of the body.

use crate::error::{ImxError, ImxResult};
use std::io::Cursor;

/// Protocol-version sentinel carried in every header.
pub const PROTOCOL_CHECKSUM: u32 = 0x1ED9_52B1;

/// Size of the forwarder frame header on the wire.
pub const FRAME_HEADER_LEN: usize = 17;

/// Size of the session header on the wire.
pub const MESG_HEADER_LEN: usize = 33;

/// Largest body either header may announce (1 MiB).
pub const MAX_BODY_LEN: usize = 1_048_576;

/// Origin class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Flag {
    /// Transport-internal traffic (keepalive, link auth, reports).
    System = 0,
    /// Application traffic.
    User = 1,
}

impl From<Flag> for u8 {
    fn from(f: Flag) -> u8 {
        f as u8
    }
}

impl TryFrom<u8> for Flag {
    type Error = ImxError;
    fn try_from(v: u8) -> ImxResult<Self> {
        match v {
            0 => Ok(Flag::System),
            1 => Ok(Flag::User),
            other => Err(ImxError::MalformedFrame(format!("unknown flag: {other}"))),
        }
    }
}

/// Common behaviour of the two fixed-size headers.
pub trait Header: Sized + Copy {
    /// Encoded size in bytes.
    const LEN: usize;

    /// Write the big-endian representation into `out` (`out.len() >= LEN`).
    fn write_to(&self, out: &mut [u8]);

    /// Parse a header from the first `LEN` bytes of `buf`.
    ///
    /// Checks field extents only; use [`Header::validate`] to check the
    /// protocol checksum.
    fn decode(buf: &[u8]) -> ImxResult<Self>;

    fn cmd(&self) -> u32;

    /// Announced body length.
    fn body_len(&self) -> usize;

    fn checksum(&self) -> u32;

    /// Encode into a fresh fixed-size vector.
    fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; Self::LEN];
        self.write_to(&mut out);
        out
    }

    /// Reject headers whose checksum is not the protocol constant.
    fn validate(&self) -> ImxResult<()> {
        if self.checksum() != PROTOCOL_CHECKSUM {
            return Err(ImxError::MalformedFrame(format!(
                "bad checksum: {:#010x} (expected {:#010x})",
                self.checksum(),
                PROTOCOL_CHECKSUM
            )));
        }
        Ok(())
    }
}

/// Forwarder frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub cmd: u32,
    pub nid: u32,
    pub flag: Flag,
    pub length: u32,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn new(cmd: u32, nid: u32, flag: Flag, length: u32) -> Self {
        Self {
            cmd,
            nid,
            flag,
            length,
            checksum: PROTOCOL_CHECKSUM,
        }
    }
}

impl Header for FrameHeader {
    const LEN: usize = FRAME_HEADER_LEN;

    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.cmd.to_be_bytes());
        out[4..8].copy_from_slice(&self.nid.to_be_bytes());
        out[8] = self.flag.into();
        out[9..13].copy_from_slice(&self.length.to_be_bytes());
        out[13..17].copy_from_slice(&self.checksum.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> ImxResult<Self> {
        if buf.len() < Self::LEN {
            return Err(ImxError::MalformedFrame(format!(
                "short frame header: {} bytes (need {})",
                buf.len(),
                Self::LEN
            )));
        }
        let length = be_u32(&buf[9..13]);
        check_length(length)?;
        Ok(Self {
            cmd: be_u32(&buf[0..4]),
            nid: be_u32(&buf[4..8]),
            flag: Flag::try_from(buf[8])?,
            length,
            checksum: be_u32(&buf[13..17]),
        })
    }

    fn cmd(&self) -> u32 {
        self.cmd
    }

    fn body_len(&self) -> usize {
        self.length as usize
    }

    fn checksum(&self) -> u32 {
        self.checksum
    }
}

/// Session header: the forwarder fields plus session id and sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MesgHeader {
    pub cmd: u32,
    pub nid: u32,
    pub flag: Flag,
    pub length: u32,
    pub checksum: u32,
    pub sid: u64,
    pub seq: u64,
}

impl MesgHeader {
    pub fn new(cmd: u32, nid: u32, sid: u64, length: u32) -> Self {
        Self {
            cmd,
            nid,
            flag: Flag::User,
            length,
            checksum: PROTOCOL_CHECKSUM,
            sid,
            seq: 0,
        }
    }
}

impl Header for MesgHeader {
    const LEN: usize = MESG_HEADER_LEN;

    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.cmd.to_be_bytes());
        out[4..8].copy_from_slice(&self.nid.to_be_bytes());
        out[8] = self.flag.into();
        out[9..13].copy_from_slice(&self.length.to_be_bytes());
        out[13..17].copy_from_slice(&self.checksum.to_be_bytes());
        out[17..25].copy_from_slice(&self.sid.to_be_bytes());
        out[25..33].copy_from_slice(&self.seq.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> ImxResult<Self> {
        if buf.len() < Self::LEN {
            return Err(ImxError::MalformedFrame(format!(
                "short session header: {} bytes (need {})",
                buf.len(),
                Self::LEN
            )));
        }
        let length = be_u32(&buf[9..13]);
        check_length(length)?;
        Ok(Self {
            cmd: be_u32(&buf[0..4]),
            nid: be_u32(&buf[4..8]),
            flag: Flag::try_from(buf[8])?,
            length,
            checksum: be_u32(&buf[13..17]),
            sid: be_u64(&buf[17..25]),
            seq: be_u64(&buf[25..33]),
        })
    }

    fn cmd(&self) -> u32 {
        self.cmd
    }

    fn body_len(&self) -> usize {
        self.length as usize
    }

    fn checksum(&self) -> u32 {
        self.checksum
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

fn check_length(length: u32) -> ImxResult<()> {
    if length as usize > MAX_BODY_LEN {
        return Err(ImxError::MalformedFrame(format!(
            "body too large: {length} bytes (max {MAX_BODY_LEN})"
        )));
    }
    Ok(())
}

/// One complete message: a header followed by its body in a single buffer.
///
/// The buffer is moved from stage to stage (codec, queue, writer) and never
/// shared between writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet<H: Header> {
    header: H,
    buf: Vec<u8>,
}

/// A forwarder-protocol frame.
pub type FramePacket = Packet<FrameHeader>;

/// A session-layer message (client WebSocket frame).
pub type MesgPacket = Packet<MesgHeader>;

impl<H: Header> Packet<H> {
    /// Build a packet from a header and body. The header's length field is
    /// expected to equal `body.len()`.
    pub fn from_parts(header: &H, body: &[u8]) -> Self {
        let mut buf = vec![0u8; H::LEN + body.len()];
        header.write_to(&mut buf[..H::LEN]);
        buf[H::LEN..].copy_from_slice(body);
        Self {
            header: *header,
            buf,
        }
    }

    /// Parse and validate a complete message held in `bytes`.
    ///
    /// Fails if the header is malformed, the checksum is wrong, or the
    /// announced body length differs from the bytes actually present.
    pub fn parse(bytes: Vec<u8>) -> ImxResult<Self> {
        let header = H::decode(&bytes)?;
        header.validate()?;
        let actual = bytes.len() - H::LEN;
        if header.body_len() != actual {
            return Err(ImxError::MalformedFrame(format!(
                "length mismatch: header says {}, got {actual}",
                header.body_len()
            )));
        }
        Ok(Self { header, buf: bytes })
    }

    pub fn header(&self) -> H {
        self.header
    }

    pub fn cmd(&self) -> u32 {
        self.header().cmd()
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[H::LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl FramePacket {
    /// Build a forwarder frame for `cmd` from `nid` carrying `body`.
    pub fn frame(cmd: u32, nid: u32, flag: Flag, body: &[u8]) -> Self {
        let header = FrameHeader::new(cmd, nid, flag, body.len() as u32);
        Self::from_parts(&header, body)
    }
}

impl MesgPacket {
    /// Build a session message for `sid` carrying `body`.
    pub fn mesg(cmd: u32, nid: u32, sid: u64, body: &[u8]) -> Self {
        let header = MesgHeader::new(cmd, nid, sid, body.len() as u32);
        Self::from_parts(&header, body)
    }

    /// Copy of this message with `sid` and `nid` substituted.
    pub fn rewrite(&self, sid: u64, nid: u32) -> Self {
        let mut header = self.header();
        header.sid = sid;
        header.nid = nid;
        Self::from_parts(&header, self.body())
    }
}

/// Encode a serializable value as a CBOR body.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> ImxResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR body into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> ImxResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}
