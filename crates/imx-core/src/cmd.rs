//! Numeric command identifiers.
//!
//! `0x00xx` are forwarder system commands, consumed by the transport.
//! `0x01xx` are session commands, `0x02xx` are chat-room commands.
//! Requests are odd, their acknowledgements are the following even value.

// ── Forwarder system ─────────────────────────────────────────────────
pub const KPALIVE_REQ: u32 = 0x0001;
pub const KPALIVE_ACK: u32 = 0x0002;
pub const LINK_AUTH_REQ: u32 = 0x0003;
pub const LINK_AUTH_ACK: u32 = 0x0004;
pub const LSN_RPT: u32 = 0x0005;

// ── Session ──────────────────────────────────────────────────────────
pub const ONLINE: u32 = 0x0101;
pub const ONLINE_ACK: u32 = 0x0102;
pub const OFFLINE: u32 = 0x0103;
pub const OFFLINE_ACK: u32 = 0x0104;
pub const PING: u32 = 0x0105;
pub const PONG: u32 = 0x0106;
pub const SUB: u32 = 0x0107;
pub const SUB_ACK: u32 = 0x0108;
pub const UNSUB: u32 = 0x0109;
pub const UNSUB_ACK: u32 = 0x010A;
pub const KICK: u32 = 0x010B;

// ── Chat room ────────────────────────────────────────────────────────
pub const ROOM_JOIN: u32 = 0x0201;
pub const ROOM_JOIN_ACK: u32 = 0x0202;
pub const ROOM_QUIT: u32 = 0x0203;
pub const ROOM_QUIT_ACK: u32 = 0x0204;
pub const ROOM_CHAT: u32 = 0x0205;
pub const ROOM_CHAT_ACK: u32 = 0x0206;
pub const ROOM_BC: u32 = 0x0207;
pub const ROOM_USR_NUM: u32 = 0x0209;
pub const ROOM_JOIN_NTC: u32 = 0x020B;
pub const ROOM_QUIT_NTC: u32 = 0x020D;
pub const ROOM_KICK_NTC: u32 = 0x020F;

/// Human-readable name for logging.
pub fn name(cmd: u32) -> &'static str {
    match cmd {
        KPALIVE_REQ => "KPALIVE_REQ",
        KPALIVE_ACK => "KPALIVE_ACK",
        LINK_AUTH_REQ => "LINK_AUTH_REQ",
        LINK_AUTH_ACK => "LINK_AUTH_ACK",
        LSN_RPT => "LSN_RPT",
        ONLINE => "ONLINE",
        ONLINE_ACK => "ONLINE_ACK",
        OFFLINE => "OFFLINE",
        OFFLINE_ACK => "OFFLINE_ACK",
        PING => "PING",
        PONG => "PONG",
        SUB => "SUB",
        SUB_ACK => "SUB_ACK",
        UNSUB => "UNSUB",
        UNSUB_ACK => "UNSUB_ACK",
        KICK => "KICK",
        ROOM_JOIN => "ROOM_JOIN",
        ROOM_JOIN_ACK => "ROOM_JOIN_ACK",
        ROOM_QUIT => "ROOM_QUIT",
        ROOM_QUIT_ACK => "ROOM_QUIT_ACK",
        ROOM_CHAT => "ROOM_CHAT",
        ROOM_CHAT_ACK => "ROOM_CHAT_ACK",
        ROOM_BC => "ROOM_BC",
        ROOM_USR_NUM => "ROOM_USR_NUM",
        ROOM_JOIN_NTC => "ROOM_JOIN_NTC",
        ROOM_QUIT_NTC => "ROOM_QUIT_NTC",
        ROOM_KICK_NTC => "ROOM_KICK_NTC",
        _ => "UNKNOWN",
    }
}
