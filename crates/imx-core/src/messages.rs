//! CBOR message bodies the gateway and transport need to inspect.
//!
//! Other bodies are relayed untouched. Unknown fields are ignored on decode,
//! so backends may carry more than is modelled here.

use serde::{Deserialize, Serialize};

/// Result code meaning success in every acknowledgement.
pub const CODE_OK: u32 = 0;

/// Client could not be decoded or failed validation.
pub const CODE_BAD_REQUEST: u32 = 1;

/// Session was taken over by a newer connection.
pub const CODE_DUPLICATE_LOGIN: u32 = 2;

/// Session was terminated by an operator or the backend.
pub const CODE_KICKED: u32 = 3;

/// `ONLINE` request from a client. The gateway fills `cid` before forwarding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineReq {
    pub sid: u64,
    #[serde(default)]
    pub uid: u64,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub cid: u64,
}

/// `ONLINE_ACK` from the backend, echoed to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineAck {
    pub sid: u64,
    #[serde(default)]
    pub uid: u64,
    #[serde(default)]
    pub cid: u64,
    pub code: u32,
    #[serde(default)]
    pub errmsg: String,
}

/// `KICK` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kick {
    pub code: u32,
    #[serde(default)]
    pub errmsg: String,
}

/// `ROOM_JOIN_ACK` from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomJoinAck {
    pub rid: u64,
    #[serde(default)]
    pub gid: u32,
    pub code: u32,
    #[serde(default)]
    pub errmsg: String,
}

/// `ROOM_QUIT` request and `ROOM_KICK_NTC` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomQuit {
    pub rid: u64,
}

/// Addressing prefix of room-scoped downlink messages
/// (`ROOM_CHAT`, `ROOM_BC`, `ROOM_USR_NUM`, `ROOM_JOIN_NTC`, `ROOM_QUIT_NTC`).
///
/// `gid == 0` addresses every group of the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMesg {
    pub rid: u64,
    #[serde(default)]
    pub gid: u32,
}

/// `LINK_AUTH_REQ` sent by a forwarder link after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkAuthReq {
    pub nid: u32,
    pub usr: String,
    pub passwd: String,
}

/// `LINK_AUTH_ACK` from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkAuthAck {
    pub code: u32,
    #[serde(default)]
    pub errmsg: String,
}

/// `LSN_RPT` liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsnReport {
    pub nid: u32,
    pub ip: String,
    pub port: u16,
    pub connections: u64,
}
