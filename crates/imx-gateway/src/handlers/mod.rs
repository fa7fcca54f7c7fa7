//! Command handlers.
//!
//! Uplink handlers run on the connection's reader task, one message at a
//! time. Downlink handlers run on the forwarder's handler pool and receive
//! the gateway through a weak reference.

mod downlink;
mod uplink;

use crate::conn::{Connection, Flow};
use crate::server::{Gateway, GatewayRef};
use imx_core::{cmd, ImxResult, MesgPacket, Registry};
use imx_forwarder::ForwarderProxy;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by an uplink handler.
pub type UplinkFuture = Pin<Box<dyn Future<Output = ImxResult<Flow>> + Send + 'static>>;

/// Handler for one client command.
pub type UplinkHandler = fn(Arc<Gateway>, Arc<Connection>, MesgPacket) -> UplinkFuture;

/// Downlink commands delivered to the session named in the header.
const SESSION_ADDRESSED: [u32; 6] = [
    cmd::SUB_ACK,
    cmd::UNSUB_ACK,
    cmd::PONG,
    cmd::OFFLINE_ACK,
    cmd::ROOM_QUIT_ACK,
    cmd::ROOM_CHAT_ACK,
];

/// Downlink commands fanned out to every member of a room.
const ROOM_ADDRESSED: [u32; 5] = [
    cmd::ROOM_CHAT,
    cmd::ROOM_BC,
    cmd::ROOM_USR_NUM,
    cmd::ROOM_JOIN_NTC,
    cmd::ROOM_QUIT_NTC,
];

/// Client commands relayed upstream once the session is logged on.
const TRANSIT: [u32; 5] = [
    cmd::PING,
    cmd::SUB,
    cmd::UNSUB,
    cmd::ROOM_JOIN,
    cmd::ROOM_CHAT,
];

pub fn register_uplink(reg: &Registry<UplinkHandler, ()>) {
    reg.register(cmd::ONLINE, uplink::online, ());
    reg.register(cmd::OFFLINE, uplink::offline, ());
    reg.register(cmd::ROOM_QUIT, uplink::room_quit, ());
    for c in TRANSIT {
        reg.register(c, uplink::transit, ());
    }
}

pub fn register_downlink(proxy: &ForwarderProxy<GatewayRef>, gw: &GatewayRef) {
    proxy.register(cmd::ONLINE_ACK, downlink::online_ack, gw.clone());
    proxy.register(cmd::KICK, downlink::kick, gw.clone());
    proxy.register(cmd::ROOM_JOIN_ACK, downlink::room_join_ack, gw.clone());
    proxy.register(cmd::ROOM_KICK_NTC, downlink::room_kick_ntc, gw.clone());
    for c in SESSION_ADDRESSED {
        proxy.register(c, downlink::to_session, gw.clone());
    }
    for c in ROOM_ADDRESSED {
        proxy.register(c, downlink::to_room, gw.clone());
    }
}
