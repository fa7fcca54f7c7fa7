use crate::conn::Status;
use crate::server::{Gateway, GatewayRef};
use imx_core::messages::{Kick, OnlineAck, RoomJoinAck, RoomMesg, RoomQuit, CODE_DUPLICATE_LOGIN, CODE_OK};
use imx_core::{cbor_decode, cbor_encode, cmd, ImxError, ImxResult, MesgPacket};
use imx_forwarder::HandlerFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upgrade the context and parse the session message carried in `body`.
/// `None` once the gateway is gone.
fn open(ctx: &GatewayRef, body: Vec<u8>) -> ImxResult<Option<(Arc<Gateway>, MesgPacket)>> {
    let Some(gw) = ctx.upgrade() else {
        return Ok(None);
    };
    let packet = MesgPacket::parse(body)?;
    Ok(Some((gw, packet)))
}

/// Push `packet` to the connection currently bound to `sid`.
fn deliver(gw: &Gateway, sid: u64, packet: MesgPacket) -> ImxResult<()> {
    let cid = gw.router.lookup(sid).ok_or(ImxError::SessionNotFound(sid))?;
    let conn = gw.conns.get(cid).ok_or(ImxError::ConnectionNotFound(cid))?;
    conn.send(packet)
}

/// `ONLINE_ACK`: finish or fail the handshake of the connection named by
/// the ack's `cid`.
pub(super) fn online_ack(_cmd: u32, _nid: u32, body: Vec<u8>, ctx: GatewayRef) -> HandlerFuture {
    Box::pin(async move {
        let Some((gw, packet)) = open(&ctx, body)? else {
            return Ok(());
        };
        let ack: OnlineAck = cbor_decode(packet.body())?;
        let conn = gw
            .conns
            .get(ack.cid)
            .ok_or(ImxError::ConnectionNotFound(ack.cid))?;
        let (cid, sid) = (conn.cid(), packet.header().sid);

        if ack.code != CODE_OK {
            warn!(cid, sid, code = ack.code, errmsg = %ack.errmsg, "handshake refused by backend");
            if let Err(e) = conn.send(packet) {
                debug!(cid, error = %e, "failure ack not queued");
            }
            return gw.kick.push(cid).await;
        }

        if !conn.logon(sid, ack.uid) {
            debug!(cid, sid, status = ?conn.status(), "ack for connection not awaiting handshake");
            return Ok(());
        }
        let displaced = gw.router.bind(sid, cid).filter(|old| *old != cid);
        gw.chat.rebind(sid, cid);
        if let Some(old) = displaced {
            displace(&gw, old, sid).await?;
        }
        if conn.is_closed() {
            // Closed between logon and bind: the close path may have missed
            // the binding.
            debug!(cid, sid, "connection closed during handshake");
            gw.clone().release(&conn);
            return Ok(());
        }
        info!(cid, sid, uid = ack.uid, "session online");
        conn.send(packet)
    })
}

/// Tell the connection that lost `sid` why, then schedule its eviction.
async fn displace(gw: &Gateway, old: u64, sid: u64) -> ImxResult<()> {
    if let Some(conn) = gw.conns.get(old) {
        let notice = Kick {
            code: CODE_DUPLICATE_LOGIN,
            errmsg: "session opened on another connection".into(),
        };
        let body = cbor_encode(&notice)?;
        if let Err(e) = conn.send(MesgPacket::mesg(cmd::KICK, gw.nid(), sid, &body)) {
            debug!(cid = old, error = %e, "kick notice not queued");
        }
        conn.set_status(Status::Kick);
    }
    info!(cid = old, sid, "displaced by newer login");
    gw.kick.push(old).await
}

/// `KICK`: forward the backend's notice and evict the session's connection.
pub(super) fn kick(_cmd: u32, _nid: u32, body: Vec<u8>, ctx: GatewayRef) -> HandlerFuture {
    Box::pin(async move {
        let Some((gw, packet)) = open(&ctx, body)? else {
            return Ok(());
        };
        let sid = packet.header().sid;
        let cid = gw.router.lookup(sid).ok_or(ImxError::SessionNotFound(sid))?;
        let conn = gw.conns.get(cid).ok_or(ImxError::ConnectionNotFound(cid))?;
        if let Ok(notice) = cbor_decode::<Kick>(packet.body()) {
            info!(cid, sid, code = notice.code, errmsg = %notice.errmsg, "kicked by backend");
        }
        conn.set_status(Status::Kick);
        if let Err(e) = conn.send(packet) {
            debug!(cid, error = %e, "kick notice not queued");
        }
        gw.kick.push(cid).await
    })
}

/// Replies addressed to a single session.
pub(super) fn to_session(_cmd: u32, _nid: u32, body: Vec<u8>, ctx: GatewayRef) -> HandlerFuture {
    Box::pin(async move {
        let Some((gw, packet)) = open(&ctx, body)? else {
            return Ok(());
        };
        let sid = packet.header().sid;
        deliver(&gw, sid, packet)
    })
}

/// `ROOM_JOIN_ACK`: record membership on success, then deliver.
pub(super) fn room_join_ack(_cmd: u32, _nid: u32, body: Vec<u8>, ctx: GatewayRef) -> HandlerFuture {
    Box::pin(async move {
        let Some((gw, packet)) = open(&ctx, body)? else {
            return Ok(());
        };
        let sid = packet.header().sid;
        let ack: RoomJoinAck = cbor_decode(packet.body())?;
        if ack.code == CODE_OK {
            let cid = gw.router.lookup(sid).ok_or(ImxError::SessionNotFound(sid))?;
            gw.chat.join(ack.rid, ack.gid, sid, cid);
            debug!(sid, rid = ack.rid, members = gw.chat.usr_num(ack.rid), "room join acked");
        }
        deliver(&gw, sid, packet)
    })
}

/// `ROOM_KICK_NTC`: the backend removed the session from a room.
pub(super) fn room_kick_ntc(_cmd: u32, _nid: u32, body: Vec<u8>, ctx: GatewayRef) -> HandlerFuture {
    Box::pin(async move {
        let Some((gw, packet)) = open(&ctx, body)? else {
            return Ok(());
        };
        let sid = packet.header().sid;
        let quit: RoomQuit = cbor_decode(packet.body())?;
        gw.chat.quit(quit.rid, sid);
        deliver(&gw, sid, packet)
    })
}

/// Room-addressed messages: one copy per member, each stamped with the
/// member's sid.
pub(super) fn to_room(cmd: u32, _nid: u32, body: Vec<u8>, ctx: GatewayRef) -> HandlerFuture {
    Box::pin(async move {
        let Some((gw, packet)) = open(&ctx, body)? else {
            return Ok(());
        };
        let target: RoomMesg = cbor_decode(packet.body())?;
        let origin = packet.header().nid;
        let sent = gw.chat.traverse(
            target.rid,
            target.gid,
            |sid, cid, packet: &MesgPacket| {
                let conn = gw.conns.get(cid).ok_or(ImxError::ConnectionNotFound(cid))?;
                conn.send(packet.rewrite(sid, origin))
            },
            &packet,
        );
        debug!(cmd, rid = target.rid, gid = target.gid, members = sent, "room fan-out");
        Ok(())
    })
}
