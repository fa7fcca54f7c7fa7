use super::UplinkFuture;
use crate::conn::{Connection, Flow, Status};
use crate::server::Gateway;
use imx_core::messages::{OnlineAck, OnlineReq, RoomQuit, CODE_BAD_REQUEST};
use imx_core::{cbor_decode, cbor_encode, cmd, ImxError, ImxResult, MesgPacket};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// `ONLINE`: start the handshake.
///
/// Accepted only in `Ready` or `Check`. An undecodable request is answered
/// with a negative `ONLINE_ACK` instead of being forwarded.
pub(super) fn online(gw: Arc<Gateway>, conn: Arc<Connection>, packet: MesgPacket) -> UplinkFuture {
    Box::pin(async move {
        let cid = conn.cid();
        let status = conn.status();
        if !matches!(status, Status::Ready | Status::Check) {
            debug!(cid, ?status, "handshake outside READY/CHECK, dropping");
            return Ok(Flow::Continue);
        }

        let mut req: OnlineReq = match cbor_decode(packet.body()) {
            Ok(req) => req,
            Err(e) => {
                reject(&gw, &conn, packet.header().sid, &e.to_string())?;
                return Ok(Flow::Continue);
            }
        };
        if req.sid == 0 {
            reject(&gw, &conn, 0, "sid must be non-zero")?;
            return Ok(Flow::Continue);
        }

        if !conn.transition(&[Status::Ready, Status::Check], Status::Check) {
            return Ok(Flow::Continue);
        }
        req.cid = cid;
        let body = cbor_encode(&req)?;
        let upstream = MesgPacket::mesg(cmd::ONLINE, gw.nid(), req.sid, &body);
        gw.forward(&upstream).await?;
        info!(cid, sid = req.sid, uid = req.uid, "handshake forwarded");
        Ok(Flow::Continue)
    })
}

fn reject(gw: &Gateway, conn: &Connection, sid: u64, reason: &str) -> ImxResult<()> {
    warn!(cid = conn.cid(), sid, reason, "handshake rejected locally");
    let ack = OnlineAck {
        sid,
        uid: 0,
        cid: conn.cid(),
        code: CODE_BAD_REQUEST,
        errmsg: reason.to_string(),
    };
    let body = cbor_encode(&ack)?;
    conn.send(MesgPacket::mesg(cmd::ONLINE_ACK, gw.nid(), sid, &body))
}

/// `OFFLINE`: relay, mark `Logout` and schedule eviction. A client that
/// never logged on is simply disconnected.
pub(super) fn offline(gw: Arc<Gateway>, conn: Arc<Connection>, packet: MesgPacket) -> UplinkFuture {
    Box::pin(async move {
        if conn.status() != Status::Logon {
            return Ok(Flow::Disconnect);
        }
        let sent = gw.forward(&packet.rewrite(conn.sid(), gw.nid())).await;
        conn.set_status(Status::Logout);
        gw.kick.push(conn.cid()).await?;
        debug!(cid = conn.cid(), sid = conn.sid(), "client logout");
        sent.map(|_| Flow::Continue)
    })
}

/// Relay a logged-on client's message upstream under its session id.
pub(super) fn transit(gw: Arc<Gateway>, conn: Arc<Connection>, packet: MesgPacket) -> UplinkFuture {
    Box::pin(async move {
        if conn.status() != Status::Logon {
            debug!(cid = conn.cid(), cmd = packet.cmd(), "not logged on, dropping");
            return Ok(Flow::Continue);
        }
        gw.forward(&packet.rewrite(conn.sid(), gw.nid())).await?;
        Ok(Flow::Continue)
    })
}

/// `ROOM_QUIT`: leave the room locally, then relay.
pub(super) fn room_quit(gw: Arc<Gateway>, conn: Arc<Connection>, packet: MesgPacket) -> UplinkFuture {
    Box::pin(async move {
        if conn.status() != Status::Logon {
            debug!(cid = conn.cid(), "not logged on, dropping room quit");
            return Ok(Flow::Continue);
        }
        let sid = conn.sid();
        let quit: RoomQuit = cbor_decode(packet.body())
            .map_err(|e| ImxError::InvalidMessage(format!("room quit: {e}")))?;
        gw.chat.quit(quit.rid, sid);
        gw.forward(&packet.rewrite(sid, gw.nid())).await?;
        Ok(Flow::Continue)
    })
}
