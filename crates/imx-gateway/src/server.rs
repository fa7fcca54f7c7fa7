//! The gateway context: every table, queue and link a connection or handler
//! needs, constructed once and shared by `Arc`.

use crate::chat::ChatTab;
use crate::config::GatewayConfig;
use crate::conn::{self, ConnRegistry, Connection, Flow, Lifecycle, RecvFuture, Status, WriterOpts};
use crate::handlers::{self, UplinkHandler};
use crate::kick::{self, KickItem, KickQueue};
use crate::reporter;
use crate::router::SessionRouter;
use crate::transport::websocket::{self, WebSocketConnection};
use imx_core::{cmd, ImxResult, MesgPacket, Registry};
use imx_forwarder::ForwarderProxy;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Downlink handler context: the gateway, held weakly so the proxy's
/// registry does not keep it alive.
pub type GatewayRef = Weak<Gateway>;

pub struct Gateway {
    pub(crate) conf: GatewayConfig,
    pub(crate) conns: Arc<ConnRegistry>,
    pub(crate) router: SessionRouter,
    pub(crate) chat: ChatTab,
    pub(crate) kick: KickQueue,
    kick_rx: Mutex<Option<mpsc::Receiver<KickItem>>>,
    pub(crate) proxy: ForwarderProxy<GatewayRef>,
    uplink: Registry<UplinkHandler, ()>,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(conf: GatewayConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Gateway>| {
            let (kick, kick_rx) = KickQueue::new(conf.kick_queue_len, conf.kick_delay);
            let proxy = ForwarderProxy::new(conf.forwarder.clone());
            handlers::register_downlink(&proxy, weak);
            let uplink = Registry::new();
            handlers::register_uplink(&uplink);

            Self {
                conns: Arc::new(ConnRegistry::new(conf.router_shards)),
                router: SessionRouter::new(conf.router_shards),
                chat: ChatTab::new(),
                kick,
                kick_rx: Mutex::new(Some(kick_rx)),
                proxy,
                uplink,
                shutdown_tx: broadcast::channel(1).0,
                local_addr: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                conf,
            }
        })
    }

    pub fn nid(&self) -> u32 {
        self.conf.nid
    }

    pub fn conns(&self) -> &ConnRegistry {
        &self.conns
    }

    pub fn router(&self) -> &SessionRouter {
        &self.router
    }

    pub fn chat(&self) -> &ChatTab {
        &self.chat
    }

    /// Address the WebSocket listener is bound to, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Serve clients accepted on `listener` until [`Gateway::shutdown`].
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> ImxResult<()> {
        *self.local_addr.lock() = Some(listener.local_addr()?);

        self.proxy.launch();

        {
            let mut tasks = self.tasks.lock();
            if let Some(kick_rx) = self.kick_rx.lock().take() {
                tasks.push(tokio::spawn(kick::run_sweeper(
                    kick_rx,
                    self.conns.clone(),
                    self.shutdown_tx.subscribe(),
                )));
            }
            if !self.conf.report_interval.is_zero() {
                tasks.push(tokio::spawn(reporter::run(
                    Arc::downgrade(&self),
                    self.conf.report_interval,
                    self.shutdown_tx.subscribe(),
                )));
            }
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (mut ws_rx, accept_task) = websocket::start_listener(
            listener,
            self.conf.path.clone(),
            self.shutdown_tx.subscribe(),
        );

        info!(
            nid = self.conf.nid,
            addr = ?self.local_addr(),
            path = %self.conf.path,
            forwarder = %self.conf.forwarder.addr,
            "imx-gateway ready"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = ws_rx.recv() => match accepted {
                    Some(ws_conn) => self.open(ws_conn),
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
            }
        }

        let _ = accept_task.await;
        Ok(())
    }

    fn open(self: &Arc<Self>, ws_conn: WebSocketConnection) {
        let WebSocketConnection {
            ws_stream,
            remote_addr,
        } = ws_conn;

        if self.conns.len() >= self.conf.max_connections {
            warn!(remote = %remote_addr, max = self.conf.max_connections, "connection limit reached, refusing");
            // Dropping the stream closes the socket.
            drop(ws_stream);
            return;
        }

        let cid = self.conns.next_cid();
        let (conn, queues) = Connection::new(cid, remote_addr, self.conf.send_queue_len);
        let opts = WriterOpts {
            ping_interval: self.conf.ping_interval,
            write_timeout: self.conf.write_timeout,
        };
        conn::serve(conn, queues, ws_stream, self.conns.clone(), self.clone(), opts);
    }

    /// Stop accepting, close every connection, stop the forwarder.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let closed = self.conns.close_all();
        debug!(closed, "closed client connections");

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.proxy.shutdown().await;
        info!("imx-gateway stopped");
    }

    /// Wrap a session message for the backend and queue it upstream.
    pub(crate) async fn forward(&self, packet: &MesgPacket) -> ImxResult<()> {
        self.proxy.async_send(packet.cmd(), packet.as_bytes()).await
    }
}

impl Lifecycle for Gateway {
    fn on_create(&self, conn: &Arc<Connection>) {
        debug!(cid = conn.cid(), remote = %conn.addr(), "session state attached");
    }

    fn on_recv(self: Arc<Self>, conn: Arc<Connection>, packet: MesgPacket) -> RecvFuture {
        Box::pin(async move {
            let command = packet.cmd();
            let Some(entry) = self.uplink.lookup(command) else {
                debug!(cid = conn.cid(), cmd = command, "unregistered uplink command, dropping");
                return Flow::Continue;
            };
            match (entry.handler)(self.clone(), conn.clone(), packet).await {
                Ok(flow) => flow,
                Err(e) => {
                    warn!(cid = conn.cid(), cmd = command, name = cmd::name(command), error = %e, "uplink handler failed");
                    Flow::Continue
                }
            }
        })
    }

    fn on_close(self: Arc<Self>, conn: Arc<Connection>) {
        self.release(&conn);
    }
}

impl Gateway {
    /// Tear down the session `conn` holds, if it still owns one: unbind it,
    /// drop its room memberships and tell the backend it went offline.
    ///
    /// Runs from the close path and from a handshake ack that lost a race
    /// with close. Whichever call wins the unbind does the teardown.
    pub(crate) fn release(self: Arc<Self>, conn: &Connection) {
        let session = conn.session();
        let (sid, cid) = (session.sid, conn.cid());
        if sid == 0 || !self.router.unbind(sid, cid) {
            // Never logged on, or a newer connection owns the session.
            return;
        }
        let rooms = self.chat.del_session(sid);
        debug!(sid, cid, uid = session.uid, rooms, "session torn down");

        if session.status == Status::Logout {
            return;
        }
        let offline = MesgPacket::mesg(cmd::OFFLINE, self.nid(), sid, &[]);
        tokio::spawn(async move {
            if let Err(e) = self.forward(&offline).await {
                warn!(sid, error = %e, "offline notification not sent");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::websocket::ws_recv_binary;
    use futures_util::SinkExt;
    use imx_core::messages::{
        Kick, LsnReport, OnlineAck, OnlineReq, RoomJoinAck, RoomQuit, CODE_BAD_REQUEST, CODE_DUPLICATE_LOGIN,
        CODE_KICKED, CODE_OK,
    };
    use imx_core::{cbor_decode, cbor_encode, Flag, FramePacket};
    use imx_forwarder::read_frame;
    use serde::Serialize;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        gw: Arc<Gateway>,
        backend: TcpStream,
        url: String,
    }

    async fn start(tweak: impl FnOnce(&mut GatewayConfig)) -> Harness {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut conf = GatewayConfig::default();
        conf.nid = 3;
        conf.forwarder.nid = 3;
        conf.forwarder.addr = backend_listener.local_addr().unwrap().to_string();
        conf.forwarder.link_num = 1;
        conf.forwarder.worker_num = 1;
        conf.kick_delay = Duration::ZERO;
        conf.report_interval = Duration::ZERO;
        tweak(&mut conf);

        let gw = Gateway::new(conf);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/im", listener.local_addr().unwrap());
        tokio::spawn(gw.clone().run(listener));
        let (backend, _) = backend_listener.accept().await.unwrap();
        Harness { gw, backend, url }
    }

    /// Next session message the gateway sent upstream.
    async fn upstream(backend: &mut TcpStream) -> MesgPacket {
        time::timeout(WAIT, async {
            loop {
                if let Some(frame) = read_frame(backend).await.unwrap() {
                    if frame.header().flag == Flag::User {
                        let packet = MesgPacket::parse(frame.body().to_vec()).unwrap();
                        assert_eq!(frame.cmd(), packet.cmd());
                        return packet;
                    }
                }
            }
        })
        .await
        .unwrap()
    }

    async fn downstream<T: Serialize>(backend: &mut TcpStream, command: u32, sid: u64, body: &T) {
        let packet = MesgPacket::mesg(command, 0, sid, &cbor_encode(body).unwrap());
        let frame = FramePacket::frame(command, 0, Flag::User, packet.as_bytes());
        backend.write_all(frame.as_bytes()).await.unwrap();
    }

    async fn send(client: &mut Client, packet: &MesgPacket) {
        client
            .send(Message::Binary(packet.as_bytes().to_vec().into()))
            .await
            .unwrap();
    }

    async fn recv(client: &mut Client) -> MesgPacket {
        let data = time::timeout(WAIT, ws_recv_binary(client))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        MesgPacket::parse(data).unwrap()
    }

    /// True once the server side has gone away.
    async fn closed(client: &mut Client) -> bool {
        !matches!(
            time::timeout(WAIT, ws_recv_binary(client)).await.unwrap(),
            Ok(Some(_))
        )
    }

    fn online(sid: u64) -> MesgPacket {
        let req = OnlineReq {
            sid,
            uid: sid + 1000,
            token: "token".into(),
            app: "test".into(),
            version: "1.0".into(),
            cid: 0,
        };
        MesgPacket::mesg(cmd::ONLINE, 0, sid, &cbor_encode(&req).unwrap())
    }

    /// Connect and complete a successful handshake for `sid`.
    async fn login(h: &mut Harness, sid: u64) -> (Client, u64) {
        let (mut client, _) = connect_async(h.url.as_str()).await.unwrap();
        send(&mut client, &online(sid)).await;

        let up = upstream(&mut h.backend).await;
        assert_eq!(up.cmd(), cmd::ONLINE);
        assert_eq!(up.header().sid, sid);
        assert_eq!(up.header().nid, 3);
        let req: OnlineReq = cbor_decode(up.body()).unwrap();
        assert_ne!(req.cid, 0);

        let ack = OnlineAck {
            sid,
            uid: req.uid,
            cid: req.cid,
            code: CODE_OK,
            errmsg: String::new(),
        };
        downstream(&mut h.backend, cmd::ONLINE_ACK, sid, &ack).await;
        let got = recv(&mut client).await;
        assert_eq!(got.cmd(), cmd::ONLINE_ACK);
        (client, req.cid)
    }

    async fn wait_gone(gw: &Gateway, cid: u64) {
        for _ in 0..500 {
            if gw.conns().get(cid).is_none() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cid {cid} still registered");
    }

    #[tokio::test]
    async fn handshake_binds_session_to_connection() {
        let mut h = start(|_| {}).await;
        let (_client, cid) = login(&mut h, 42).await;

        assert_eq!(h.gw.router().lookup(42), Some(cid));
        let conn = h.gw.conns().get(cid).unwrap();
        assert_eq!(conn.status(), Status::Logon);
        assert_eq!(conn.sid(), 42);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_login_evicts_older_connection() {
        let mut h = start(|_| {}).await;
        let (mut first, first_cid) = login(&mut h, 42).await;
        let (_second, second_cid) = login(&mut h, 42).await;
        assert_ne!(first_cid, second_cid);

        let notice = recv(&mut first).await;
        assert_eq!(notice.cmd(), cmd::KICK);
        let kick: Kick = cbor_decode(notice.body()).unwrap();
        assert_eq!(kick.code, CODE_DUPLICATE_LOGIN);
        assert!(closed(&mut first).await);

        wait_gone(&h.gw, first_cid).await;
        assert_eq!(h.gw.router().lookup(42), Some(second_cid));
        let survivor = h.gw.conns().get(second_cid).unwrap();
        assert_eq!(survivor.status(), Status::Logon);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn traffic_before_logon_is_dropped() {
        let mut h = start(|_| {}).await;
        let (mut client, _) = connect_async(h.url.as_str()).await.unwrap();
        send(&mut client, &MesgPacket::mesg(cmd::PING, 0, 0, b"early")).await;
        send(&mut client, &online(7)).await;

        // The early PING never reaches the backend.
        let up = upstream(&mut h.backend).await;
        assert_eq!(up.cmd(), cmd::ONLINE);
        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn transit_is_rewritten_with_session_identity() {
        let mut h = start(|_| {}).await;
        let (mut client, _) = login(&mut h, 42).await;

        send(&mut client, &MesgPacket::mesg(cmd::PING, 99, 0, b"ping")).await;
        let up = upstream(&mut h.backend).await;
        assert_eq!(up.cmd(), cmd::PING);
        assert_eq!(up.header().sid, 42);
        assert_eq!(up.header().nid, 3);
        assert_eq!(up.body(), b"ping");

        downstream(&mut h.backend, cmd::PONG, 42, &"pong").await;
        assert_eq!(recv(&mut client).await.cmd(), cmd::PONG);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn undecodable_handshake_gets_negative_ack() {
        let mut h = start(|_| {}).await;
        let (mut client, _) = connect_async(h.url.as_str()).await.unwrap();
        send(&mut client, &MesgPacket::mesg(cmd::ONLINE, 0, 5, b"\xff\x00")).await;

        let ack = recv(&mut client).await;
        assert_eq!(ack.cmd(), cmd::ONLINE_ACK);
        let body: OnlineAck = cbor_decode(ack.body()).unwrap();
        assert_eq!(body.code, CODE_BAD_REQUEST);

        // The connection stays usable for a proper handshake.
        send(&mut client, &online(5)).await;
        assert_eq!(upstream(&mut h.backend).await.cmd(), cmd::ONLINE);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn backend_refusal_is_delivered_then_kicked() {
        let mut h = start(|_| {}).await;
        let (mut client, _) = connect_async(h.url.as_str()).await.unwrap();
        send(&mut client, &online(8)).await;
        let req: OnlineReq = cbor_decode(upstream(&mut h.backend).await.body()).unwrap();

        let ack = OnlineAck {
            sid: 8,
            uid: 0,
            cid: req.cid,
            code: 40,
            errmsg: "bad token".into(),
        };
        downstream(&mut h.backend, cmd::ONLINE_ACK, 8, &ack).await;
        let got: OnlineAck = cbor_decode(recv(&mut client).await.body()).unwrap();
        assert_eq!(got.code, 40);
        assert!(closed(&mut client).await);
        wait_gone(&h.gw, req.cid).await;
        assert_eq!(h.gw.router().lookup(8), None);

        h.gw.shutdown().await;
    }

    #[derive(Serialize)]
    struct Broadcast {
        rid: u64,
        gid: u32,
        text: String,
    }

    #[tokio::test]
    async fn room_broadcast_reaches_every_member() {
        let mut h = start(|_| {}).await;
        let (mut alice, _) = login(&mut h, 1).await;
        let (mut bob, _) = login(&mut h, 2).await;

        for (sid, gid) in [(1u64, 1u32), (2, 2)] {
            let ack = RoomJoinAck {
                rid: 77,
                gid,
                code: CODE_OK,
                errmsg: String::new(),
            };
            downstream(&mut h.backend, cmd::ROOM_JOIN_ACK, sid, &ack).await;
        }
        assert_eq!(recv(&mut alice).await.cmd(), cmd::ROOM_JOIN_ACK);
        assert_eq!(recv(&mut bob).await.cmd(), cmd::ROOM_JOIN_ACK);
        assert_eq!(h.gw.chat().usr_num(77), 2);

        let bc = Broadcast {
            rid: 77,
            gid: 0,
            text: "hello room".into(),
        };
        downstream(&mut h.backend, cmd::ROOM_BC, 0, &bc).await;
        let a = recv(&mut alice).await;
        let b = recv(&mut bob).await;
        assert_eq!((a.cmd(), a.header().sid), (cmd::ROOM_BC, 1));
        assert_eq!((b.cmd(), b.header().sid), (cmd::ROOM_BC, 2));

        // Group-scoped: only bob is in group 2.
        let bc = Broadcast {
            rid: 77,
            gid: 2,
            text: "group two".into(),
        };
        downstream(&mut h.backend, cmd::ROOM_CHAT, 0, &bc).await;
        assert_eq!(recv(&mut bob).await.cmd(), cmd::ROOM_CHAT);

        // Leaving the room locally stops delivery.
        send(
            &mut alice,
            &MesgPacket::mesg(cmd::ROOM_QUIT, 0, 0, &cbor_encode(&RoomQuit { rid: 77 }).unwrap()),
        )
        .await;
        assert_eq!(upstream(&mut h.backend).await.cmd(), cmd::ROOM_QUIT);
        assert_eq!(h.gw.chat().usr_num(77), 1);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn room_follows_session_after_relogin() {
        let mut h = start(|_| {}).await;
        let (mut first, first_cid) = login(&mut h, 42).await;
        let ack = RoomJoinAck {
            rid: 77,
            gid: 1,
            code: CODE_OK,
            errmsg: String::new(),
        };
        downstream(&mut h.backend, cmd::ROOM_JOIN_ACK, 42, &ack).await;
        assert_eq!(recv(&mut first).await.cmd(), cmd::ROOM_JOIN_ACK);

        let (mut second, second_cid) = login(&mut h, 42).await;
        assert_eq!(recv(&mut first).await.cmd(), cmd::KICK);
        assert!(closed(&mut first).await);
        wait_gone(&h.gw, first_cid).await;
        assert_eq!(h.gw.chat().usr_num(77), 1);

        let bc = Broadcast {
            rid: 77,
            gid: 0,
            text: "still here".into(),
        };
        downstream(&mut h.backend, cmd::ROOM_BC, 0, &bc).await;
        let got = recv(&mut second).await;
        assert_eq!((got.cmd(), got.header().sid), (cmd::ROOM_BC, 42));
        assert_eq!(h.gw.router().lookup(42), Some(second_cid));

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn ack_for_closed_connection_leaves_no_route() {
        let mut h = start(|_| {}).await;
        let cid = h.gw.conns().next_cid();
        let (conn, _queues) = Connection::new(cid, "127.0.0.1:1".parse().unwrap(), 4);
        h.gw.conns().insert(conn.clone());
        conn.set_status(Status::Check);
        conn.close();

        let ack = OnlineAck {
            sid: 21,
            uid: 1021,
            cid,
            code: CODE_OK,
            errmsg: String::new(),
        };
        downstream(&mut h.backend, cmd::ONLINE_ACK, 21, &ack).await;
        // A later frame on the same link is handled after the ack.
        let kick = Kick {
            code: CODE_KICKED,
            errmsg: String::new(),
        };
        downstream(&mut h.backend, cmd::KICK, 21, &kick).await;
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.gw.router().lookup(21), None);
        assert_eq!(conn.status(), Status::Check);
        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn release_tears_down_owned_session() {
        let mut h = start(|_| {}).await;
        let cid = h.gw.conns().next_cid();
        let (conn, _queues) = Connection::new(cid, "127.0.0.1:1".parse().unwrap(), 4);
        conn.set_status(Status::Check);
        assert!(conn.logon(31, 1031));
        h.gw.router().bind(31, cid);
        h.gw.chat().join(5, 0, 31, cid);
        conn.close();

        h.gw.clone().release(&conn);
        let up = upstream(&mut h.backend).await;
        assert_eq!((up.cmd(), up.header().sid), (cmd::OFFLINE, 31));
        assert_eq!(h.gw.router().lookup(31), None);
        assert_eq!(h.gw.chat().usr_num(5), 0);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn client_disconnect_notifies_backend() {
        let mut h = start(|_| {}).await;
        let (mut client, cid) = login(&mut h, 9).await;
        client.close(None).await.unwrap();

        let up = upstream(&mut h.backend).await;
        assert_eq!(up.cmd(), cmd::OFFLINE);
        assert_eq!(up.header().sid, 9);
        wait_gone(&h.gw, cid).await;
        assert_eq!(h.gw.router().lookup(9), None);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn client_offline_relays_and_evicts() {
        let mut h = start(|_| {}).await;
        let (mut client, cid) = login(&mut h, 11).await;
        send(&mut client, &MesgPacket::mesg(cmd::OFFLINE, 0, 0, &[])).await;

        let up = upstream(&mut h.backend).await;
        assert_eq!(up.cmd(), cmd::OFFLINE);
        assert_eq!(up.header().sid, 11);
        assert!(closed(&mut client).await);
        wait_gone(&h.gw, cid).await;
        assert_eq!(h.gw.router().lookup(11), None);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn backend_kick_closes_session() {
        let mut h = start(|_| {}).await;
        let (mut client, cid) = login(&mut h, 12).await;
        let kick = Kick {
            code: CODE_KICKED,
            errmsg: "banned".into(),
        };
        downstream(&mut h.backend, cmd::KICK, 12, &kick).await;

        let got: Kick = cbor_decode(recv(&mut client).await.body()).unwrap();
        assert_eq!(got.code, CODE_KICKED);
        assert!(closed(&mut client).await);
        wait_gone(&h.gw, cid).await;

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn connections_beyond_limit_are_refused() {
        let mut h = start(|c| c.max_connections = 1).await;
        let (_first, _) = login(&mut h, 1).await;

        let (mut second, _) = connect_async(h.url.as_str()).await.unwrap();
        assert!(closed(&mut second).await);
        assert_eq!(h.gw.conns().len(), 1);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn liveness_report_is_sent_upstream() {
        let mut h = start(|c| c.report_interval = Duration::from_millis(20)).await;
        let report = time::timeout(WAIT, async {
            loop {
                if let Some(frame) = read_frame(&mut h.backend).await.unwrap() {
                    if frame.cmd() == cmd::LSN_RPT {
                        return frame;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(report.header().flag, Flag::System);
        let body: LsnReport = cbor_decode(report.body()).unwrap();
        assert_eq!(body.nid, 3);
        assert_eq!(body.ip, "127.0.0.1");
        assert_eq!(body.connections, 0);

        h.gw.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_clients() {
        let mut h = start(|_| {}).await;
        let (mut client, _) = login(&mut h, 21).await;
        h.gw.shutdown().await;
        assert!(closed(&mut client).await);
    }
}
