//! Client connections: per-socket state, the connection registry and the
//! reader/writer task pair.
//!
//! Lifecycle of one socket:
//!
//! 1. [`Connection::new`] allocates the send queue and close signal.
//! 2. [`Lifecycle::on_create`] runs, then the connection is registered.
//! 3. [`serve`] spawns a supervisor owning a reader and a writer task.
//! 4. When either task ends (error, timeout, panic, peer close, or an
//!    explicit [`Connection::close`]) the supervisor closes the connection,
//!    joins both tasks, deregisters it and calls [`Lifecycle::on_close`].

use crate::shard::ShardedMap;
use crate::transport::websocket::{ws_recv_binary, WsStream};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use imx_core::{ImxError, ImxResult, MesgPacket};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Session status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Socket accepted, no handshake yet.
    Ready,
    /// Handshake forwarded, waiting for the backend.
    Check,
    /// Handshake accepted; traffic is authorized.
    Logon,
    /// Client or backend asked to go offline.
    Logout,
    /// Kicked by the backend or displaced by a newer login.
    Kick,
    /// Socket closed.
    Close,
}

/// What the reader does after a message has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// Session state attached to a connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Zero until the handshake completes.
    pub sid: u64,
    pub uid: u64,
    pub status: Status,
    pub last_activity: Instant,
}

/// One client WebSocket connection.
pub struct Connection {
    cid: u64,
    addr: SocketAddr,
    send_tx: Mutex<Option<mpsc::Sender<MesgPacket>>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
    session: RwLock<Session>,
}

/// Receiving ends owned by the connection's tasks.
pub struct ConnQueues {
    send_rx: mpsc::Receiver<MesgPacket>,
    close_rx: watch::Receiver<bool>,
}

impl Connection {
    pub fn new(cid: u64, addr: SocketAddr, queue_len: usize) -> (Arc<Self>, ConnQueues) {
        let (send_tx, send_rx) = mpsc::channel(queue_len.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let conn = Arc::new(Self {
            cid,
            addr,
            send_tx: Mutex::new(Some(send_tx)),
            closed: AtomicBool::new(false),
            close_tx,
            session: RwLock::new(Session {
                sid: 0,
                uid: 0,
                status: Status::Ready,
                last_activity: Instant::now(),
            }),
        });
        (conn, ConnQueues { send_rx, close_rx })
    }

    pub fn cid(&self) -> u64 {
        self.cid
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn sid(&self) -> u64 {
        self.session.read().sid
    }

    pub fn status(&self) -> Status {
        self.session.read().status
    }

    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    pub fn set_status(&self, status: Status) {
        self.session.write().status = status;
    }

    /// Move to `to` only if the current status is one of `from`.
    pub fn transition(&self, from: &[Status], to: Status) -> bool {
        let mut session = self.session.write();
        if from.contains(&session.status) {
            session.status = to;
            true
        } else {
            false
        }
    }

    /// Complete the handshake: record the session identity and go `Logon`.
    /// Only an open connection in `Check` can log on.
    pub fn logon(&self, sid: u64, uid: u64) -> bool {
        let mut session = self.session.write();
        if session.status != Status::Check || self.is_closed() {
            return false;
        }
        session.sid = sid;
        session.uid = uid;
        session.status = Status::Logon;
        true
    }

    pub fn touch(&self) {
        self.session.write().last_activity = Instant::now();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue `packet` for the writer. Fails when the queue is full or the
    /// connection is closing; the message is dropped in either case.
    pub fn send(&self, packet: MesgPacket) -> ImxResult<()> {
        let guard = self.send_tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(ImxError::QueueClosed("connection send"));
        };
        tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ImxError::Transport(format!("cid {} send queue full", self.cid))
            }
            mpsc::error::TrySendError::Closed(_) => ImxError::QueueClosed("connection send"),
        })
    }

    /// Close the send queue and stop the reader. Only the first call has an
    /// effect; returns whether this call was it.
    ///
    /// Already queued messages are still flushed by the writer before the
    /// socket is closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.send_tx.lock().take();
        let _ = self.close_tx.send(true);
        true
    }
}

/// Live connections by cid.
pub struct ConnRegistry {
    conns: ShardedMap<Arc<Connection>>,
    next_cid: AtomicU64,
}

impl ConnRegistry {
    pub fn new(shards: usize) -> Self {
        Self {
            conns: ShardedMap::new(shards),
            next_cid: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh, process-unique cid.
    pub fn next_cid(&self) -> u64 {
        self.next_cid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.conns.insert(conn.cid(), conn);
    }

    pub fn get(&self, cid: u64) -> Option<Arc<Connection>> {
        self.conns.get(cid)
    }

    pub fn remove(&self, cid: u64) -> Option<Arc<Connection>> {
        self.conns.remove(cid)
    }

    /// Close `cid` if it is live. Returns `false` for an unknown cid.
    pub fn close(&self, cid: u64) -> bool {
        match self.conns.get(cid) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) -> usize {
        if self.conns.is_empty() {
            return 0;
        }
        let all = self.conns.values();
        for conn in &all {
            conn.close();
        }
        all.len()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }
}

/// Future returned by [`Lifecycle::on_recv`].
pub type RecvFuture = Pin<Box<dyn Future<Output = Flow> + Send + 'static>>;

/// Hooks the gateway attaches to every connection.
pub trait Lifecycle: Send + Sync + 'static {
    /// Called once before the connection is registered.
    fn on_create(&self, _conn: &Arc<Connection>) {}

    /// Called for every well-formed inbound message, in arrival order.
    fn on_recv(self: Arc<Self>, conn: Arc<Connection>, packet: MesgPacket) -> RecvFuture;

    /// Called once after the connection is closed and deregistered, while
    /// its status still shows how the session ended.
    fn on_close(self: Arc<Self>, _conn: Arc<Connection>) {}
}

/// Writer tuning.
#[derive(Debug, Clone, Copy)]
pub struct WriterOpts {
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

/// Register `conn` and run its reader and writer under a supervisor.
pub fn serve<L: Lifecycle>(
    conn: Arc<Connection>,
    queues: ConnQueues,
    ws: WsStream,
    registry: Arc<ConnRegistry>,
    lifecycle: Arc<L>,
    opts: WriterOpts,
) {
    lifecycle.on_create(&conn);
    registry.insert(conn.clone());
    info!(cid = conn.cid(), remote = %conn.addr(), "connection opened");

    tokio::spawn(async move {
        let cid = conn.cid();
        let (sink, stream) = ws.split();
        let mut tasks: JoinSet<ImxResult<()>> = JoinSet::new();
        tasks.spawn(read_loop(
            conn.clone(),
            stream,
            queues.close_rx,
            lifecycle.clone(),
        ));
        tasks.spawn(write_loop(cid, sink, queues.send_rx, opts));

        if let Some(res) = tasks.join_next().await {
            log_task_exit(cid, res);
        }
        conn.close();
        while let Some(res) = tasks.join_next().await {
            log_task_exit(cid, res);
        }

        registry.remove(cid);
        let session = conn.session();
        info!(
            cid,
            sid = session.sid,
            idle = ?session.last_activity.elapsed(),
            "connection closed"
        );
        lifecycle.on_close(conn.clone());
        conn.set_status(Status::Close);
    });
}

fn log_task_exit(cid: u64, res: Result<ImxResult<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(cid, error = %e, "connection task ended"),
        Err(e) => error!(cid, error = %e, "connection task panicked"),
    }
}

async fn read_loop<L: Lifecycle>(
    conn: Arc<Connection>,
    mut stream: SplitStream<WsStream>,
    mut close_rx: watch::Receiver<bool>,
    lifecycle: Arc<L>,
) -> ImxResult<()> {
    let cid = conn.cid();
    loop {
        let data = tokio::select! {
            _ = close_rx.changed() => return Ok(()),
            r = ws_recv_binary(&mut stream) => r?,
        };
        let Some(data) = data else {
            debug!(cid, "peer closed");
            return Ok(());
        };

        let packet = match MesgPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                warn!(cid, error = %e, "invalid message from client");
                return Err(e);
            }
        };
        conn.touch();

        if lifecycle.clone().on_recv(conn.clone(), packet).await == Flow::Disconnect {
            debug!(cid, "handler requested disconnect");
            return Ok(());
        }
    }
}

async fn write_loop(
    cid: u64,
    mut sink: SplitSink<WsStream, Message>,
    mut send_rx: mpsc::Receiver<MesgPacket>,
    opts: WriterOpts,
) -> ImxResult<()> {
    let mut ping = time::interval(opts.ping_interval);
    ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ping.tick().await;

    loop {
        let msg = tokio::select! {
            p = send_rx.recv() => match p {
                Some(p) => Message::Binary(p.into_bytes().into()),
                None => {
                    // Queue closed: everything queued has been written.
                    let _ = time::timeout(opts.write_timeout, sink.send(Message::Close(None))).await;
                    return Ok(());
                }
            },
            _ = ping.tick() => Message::Ping(Vec::<u8>::new().into()),
        };

        match time::timeout(opts.write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ImxError::Transport(format!("cid {cid} write: {e}")));
            }
            Err(_) => {
                warn!(cid, "write deadline exceeded");
                return Err(ImxError::Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imx_core::cmd;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::connect_async;

    fn addr() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn closed_connection_cannot_log_on() {
        let (conn, _queues) = Connection::new(1, addr(), 4);
        assert!(conn.transition(&[Status::Ready], Status::Check));
        assert!(conn.close());
        assert!(!conn.logon(42, 7));
        assert_eq!(conn.status(), Status::Check);
        assert_eq!(conn.sid(), 0);
    }

    #[test]
    fn cids_are_unique_and_increasing() {
        let reg = ConnRegistry::new(4);
        let a = reg.next_cid();
        let b = reg.next_cid();
        assert!(b > a);
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, _queues) = Connection::new(1, addr(), 4);
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(MesgPacket::mesg(cmd::PONG, 1, 1, &[])),
            Err(ImxError::QueueClosed(_))
        ));
    }

    #[tokio::test]
    async fn queued_messages_survive_close() {
        let (conn, mut queues) = Connection::new(1, addr(), 4);
        conn.send(MesgPacket::mesg(cmd::KICK, 1, 5, b"bye")).unwrap();
        conn.close();
        let p = queues.send_rx.recv().await.unwrap();
        assert_eq!(p.cmd(), cmd::KICK);
        assert!(queues.send_rx.recv().await.is_none());
        assert!(*queues.close_rx.borrow_and_update());
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let (conn, _queues) = Connection::new(1, addr(), 1);
        conn.send(MesgPacket::mesg(cmd::PONG, 1, 1, &[])).unwrap();
        assert!(matches!(
            conn.send(MesgPacket::mesg(cmd::PONG, 1, 1, &[])),
            Err(ImxError::Transport(_))
        ));
    }

    #[test]
    fn transition_guards_current_status() {
        let (conn, _queues) = Connection::new(1, addr(), 1);
        assert!(!conn.logon(42, 7));
        assert!(conn.transition(&[Status::Ready, Status::Check], Status::Check));
        assert!(conn.transition(&[Status::Ready, Status::Check], Status::Check));
        assert!(conn.logon(42, 7));
        assert!(!conn.transition(&[Status::Ready, Status::Check], Status::Check));
        assert_eq!(conn.status(), Status::Logon);
        assert_eq!(conn.sid(), 42);
    }

    #[test]
    fn registry_close_unknown_cid_is_noop() {
        let reg = ConnRegistry::new(4);
        assert!(!reg.close(99));
        let (conn, _queues) = Connection::new(reg.next_cid(), addr(), 1);
        reg.insert(conn.clone());
        assert!(reg.close(conn.cid()));
        assert!(conn.is_closed());
        assert_eq!(reg.close_all(), 1);
    }

    /// Echoes every message back; disconnects on `OFFLINE`; panics on `KICK`.
    struct Echo {
        closed: AtomicUsize,
    }

    impl Lifecycle for Echo {
        fn on_recv(self: Arc<Self>, conn: Arc<Connection>, packet: MesgPacket) -> RecvFuture {
            Box::pin(async move {
                match packet.cmd() {
                    cmd::OFFLINE => Flow::Disconnect,
                    cmd::KICK => panic!("boom"),
                    _ => {
                        let _ = conn.send(packet);
                        Flow::Continue
                    }
                }
            })
        }

        fn on_close(self: Arc<Self>, _conn: Arc<Connection>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn open(
        reg: &Arc<ConnRegistry>,
        life: &Arc<Echo>,
    ) -> (
        Arc<Connection>,
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            (tokio_tungstenite::accept_async(stream).await.unwrap(), peer)
        });
        let (client, _) = connect_async(format!("ws://{local}/im")).await.unwrap();
        let (ws, peer) = accept.await.unwrap();

        let (conn, queues) = Connection::new(reg.next_cid(), peer, 8);
        let opts = WriterOpts {
            ping_interval: Duration::from_secs(30),
            write_timeout: Duration::from_secs(2),
        };
        serve(conn.clone(), queues, ws, reg.clone(), life.clone(), opts);
        (conn, client)
    }

    /// Wait for the supervisor to finish: deregistered and marked closed.
    async fn wait_closed(reg: &ConnRegistry, conn: &Connection) {
        for _ in 0..200 {
            if reg.get(conn.cid()).is_none() && conn.status() == Status::Close {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cid {} still open", conn.cid());
    }

    #[tokio::test]
    async fn echo_then_handler_disconnect() {
        let reg = Arc::new(ConnRegistry::new(4));
        let life = Arc::new(Echo {
            closed: AtomicUsize::new(0),
        });
        let (conn, mut client) = open(&reg, &life).await;
        assert!(reg.get(conn.cid()).is_some());

        let ping = MesgPacket::mesg(cmd::PING, 1, 0, b"p");
        client
            .send(Message::Binary(ping.as_bytes().to_vec().into()))
            .await
            .unwrap();
        let echoed = ws_recv_binary(&mut client).await.unwrap().unwrap();
        assert_eq!(MesgPacket::parse(echoed).unwrap(), ping);

        let off = MesgPacket::mesg(cmd::OFFLINE, 1, 0, &[]);
        client
            .send(Message::Binary(off.as_bytes().to_vec().into()))
            .await
            .unwrap();
        assert_eq!(ws_recv_binary(&mut client).await.unwrap(), None);

        wait_closed(&reg, &conn).await;
        assert_eq!(conn.status(), Status::Close);
        assert_eq!(life.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_message_closes_connection() {
        let reg = Arc::new(ConnRegistry::new(4));
        let life = Arc::new(Echo {
            closed: AtomicUsize::new(0),
        });
        let (conn, mut client) = open(&reg, &life).await;

        client
            .send(Message::Binary(vec![0u8; 5].into()))
            .await
            .unwrap();
        wait_closed(&reg, &conn).await;
        assert!(conn.is_closed());
        assert_eq!(life.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_panic_is_scoped_to_connection() {
        let reg = Arc::new(ConnRegistry::new(4));
        let life = Arc::new(Echo {
            closed: AtomicUsize::new(0),
        });
        let (victim, mut client) = open(&reg, &life).await;
        let (bystander, _other) = open(&reg, &life).await;

        let kick = MesgPacket::mesg(cmd::KICK, 1, 0, &[]);
        client
            .send(Message::Binary(kick.as_bytes().to_vec().into()))
            .await
            .unwrap();
        wait_closed(&reg, &victim).await;
        assert!(reg.get(bystander.cid()).is_some());
        assert!(!bystander.is_closed());
    }

    #[tokio::test]
    async fn explicit_close_flushes_then_disconnects() {
        let reg = Arc::new(ConnRegistry::new(4));
        let life = Arc::new(Echo {
            closed: AtomicUsize::new(0),
        });
        let (conn, mut client) = open(&reg, &life).await;

        conn.send(MesgPacket::mesg(cmd::KICK, 1, 9, b"bye")).unwrap();
        assert!(reg.close(conn.cid()));

        let last = ws_recv_binary(&mut client).await.unwrap().unwrap();
        assert_eq!(MesgPacket::parse(last).unwrap().cmd(), cmd::KICK);
        assert_eq!(ws_recv_binary(&mut client).await.unwrap(), None);
        wait_closed(&reg, &conn).await;
    }
}
