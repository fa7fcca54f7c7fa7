//! A single forwarder link: one persistent TCP connection to the backend.
//!
//! State machine: `Dialing → Connected → Draining → Dialing …`, and
//! `Stopped` once the proxy shuts down. While connected the link runs three
//! kinds of task, all sharing one per-connection stop signal:
//!
//! - **read**: frames inbound bytes and pushes user packets to the shared
//!   inbound queue; system frames (keepalive, auth ack) are consumed here.
//! - **write**: pops packets from this link's system queue and the shared
//!   outbound queue and writes them raw.
//! - **handlers** (`worker_num` of them): pop from the shared inbound queue
//!   and invoke the registered downlink handler.
//!
//! When read or write fails the link signals stop, joins every task, waits
//! the fixed reconnect interval and dials again.

use crate::config::ForwarderConf;
use crate::Handler;
use futures_util::FutureExt;
use imx_core::cmd;
use imx_core::codec::FRAME_HEADER_LEN;
use imx_core::messages::{LinkAuthAck, LinkAuthReq, CODE_OK};
use imx_core::{
    cbor_decode, cbor_encode, Flag, FrameHeader, FramePacket, Header, ImxError, ImxResult,
    Registry,
};
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Observable state of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Dialing,
    Connected,
    Draining,
    Stopped,
}

/// System queue receiver. Successive connections of one link take turns
/// draining it; the lock is never contended across links.
type SysReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<FramePacket>>>;

/// The parts of a link the proxy keeps after launching it.
#[derive(Clone)]
pub(crate) struct LinkHandle {
    pub(crate) id: usize,
    pub(crate) state: Arc<Mutex<LinkState>>,
    pub(crate) sys_tx: mpsc::Sender<FramePacket>,
    pub(crate) sys_rx: SysReceiver,
}

impl LinkHandle {
    pub(crate) fn new(id: usize) -> Self {
        let (sys_tx, sys_rx) = mpsc::channel(16);
        Self {
            id,
            state: Arc::new(Mutex::new(LinkState::Dialing)),
            sys_tx,
            sys_rx: Arc::new(tokio::sync::Mutex::new(sys_rx)),
        }
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.lock()
    }
}

/// Everything a running link owns.
pub(crate) struct ForwarderLink<C> {
    pub(crate) handle: LinkHandle,
    pub(crate) conf: Arc<ForwarderConf>,
    pub(crate) registry: Arc<Registry<Handler<C>, C>>,
    pub(crate) out_rx: flume::Receiver<FramePacket>,
    pub(crate) in_tx: flume::Sender<FramePacket>,
    pub(crate) in_rx: flume::Receiver<FramePacket>,
    pub(crate) shutdown_rx: broadcast::Receiver<()>,
}

impl<C: Clone + Send + Sync + 'static> ForwarderLink<C> {
    fn set_state(&self, state: LinkState) {
        *self.handle.state.lock() = state;
    }

    /// Dial, serve, back off, repeat, until the proxy shuts down.
    pub(crate) async fn run(mut self) {
        let link = self.handle.id;
        loop {
            self.set_state(LinkState::Dialing);
            let dialed = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                r = TcpStream::connect(&self.conf.addr) => r,
            };

            match dialed {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.set_state(LinkState::Connected);
                    info!(link, addr = %self.conf.addr, "forwarder link connected");
                    if self.serve(stream).await {
                        break;
                    }
                    warn!(link, "forwarder link lost");
                }
                Err(e) => {
                    warn!(link, addr = %self.conf.addr, error = %e, "forwarder dial failed");
                }
            }

            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                _ = tokio::time::sleep(self.conf.reconnect_interval()) => {}
            }
        }
        self.set_state(LinkState::Stopped);
        debug!(link, "forwarder link stopped");
    }

    /// Run the task set for one TCP connection. Returns `true` when the
    /// proxy asked for shutdown, `false` when the connection failed.
    async fn serve(&mut self, stream: TcpStream) -> bool {
        let link = self.handle.id;
        let (rd, mut wr) = stream.into_split();

        // Authenticate ahead of any queued traffic.
        if let Err(e) = self.write_auth(&mut wr).await {
            warn!(link, error = %e, "link auth write failed");
            self.set_state(LinkState::Draining);
            return false;
        }

        let (stop_tx, _) = broadcast::channel::<()>(1);
        let mut tasks: JoinSet<ImxResult<()>> = JoinSet::new();

        tasks.spawn(read_loop(
            rd,
            stop_tx.subscribe(),
            self.in_tx.clone(),
            self.handle.sys_tx.clone(),
            self.conf.nid,
            link,
        ));
        tasks.spawn(write_loop(
            wr,
            stop_tx.subscribe(),
            self.out_rx.clone(),
            self.handle.sys_rx.clone(),
            link,
        ));
        for worker in 0..self.conf.worker_num.max(1) {
            tasks.spawn(handle_loop(
                stop_tx.subscribe(),
                self.in_rx.clone(),
                self.registry.clone(),
                link,
                worker,
            ));
        }

        let shutdown = tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            Some(res) = tasks.join_next() => {
                log_task_exit(link, res);
                false
            }
        };

        let _ = stop_tx.send(());
        self.set_state(LinkState::Draining);
        while let Some(res) = tasks.join_next().await {
            log_task_exit(link, res);
        }
        shutdown
    }

    async fn write_auth(&self, wr: &mut OwnedWriteHalf) -> ImxResult<()> {
        let req = LinkAuthReq {
            nid: self.conf.nid,
            usr: self.conf.usr.clone(),
            passwd: self.conf.passwd.clone(),
        };
        let body = cbor_encode(&req)?;
        let packet = FramePacket::frame(cmd::LINK_AUTH_REQ, self.conf.nid, Flag::System, &body);
        wr.write_all(packet.as_bytes()).await?;
        Ok(())
    }
}

fn log_task_exit(link: usize, res: Result<ImxResult<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(link, error = %e, "link task ended"),
        Err(e) => error!(link, error = %e, "link task panicked"),
    }
}

/// Read one frame: exactly a header, then exactly the announced body.
///
/// Returns `Ok(None)` for a structurally sound frame whose checksum is
/// wrong; the frame is consumed and dropped so the stream stays in sync.
/// Any other decode failure is an error, since framing can no longer be
/// trusted.
pub async fn read_frame<R: AsyncRead + Unpin>(rd: &mut R) -> ImxResult<Option<FramePacket>> {
    let mut head = [0u8; FRAME_HEADER_LEN];
    rd.read_exact(&mut head).await?;
    let header = FrameHeader::decode(&head)?;

    let total = FRAME_HEADER_LEN + header.body_len();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&head);
    buf.resize(total, 0);
    rd.read_exact(&mut buf[FRAME_HEADER_LEN..]).await?;

    match FramePacket::parse(buf) {
        Ok(packet) => Ok(Some(packet)),
        Err(e) => {
            warn!(cmd = header.cmd, error = %e, "dropping malformed frame");
            Ok(None)
        }
    }
}

async fn read_loop(
    mut rd: OwnedReadHalf,
    mut stop: broadcast::Receiver<()>,
    in_tx: flume::Sender<FramePacket>,
    sys_tx: mpsc::Sender<FramePacket>,
    nid: u32,
    link: usize,
) -> ImxResult<()> {
    loop {
        let frame = tokio::select! {
            _ = stop.recv() => return Ok(()),
            r = read_frame(&mut rd) => r?,
        };
        let Some(packet) = frame else { continue };
        let header = packet.header();

        if header.flag == Flag::System {
            match header.cmd {
                cmd::KPALIVE_REQ => {
                    let ack = FramePacket::frame(cmd::KPALIVE_ACK, nid, Flag::System, &[]);
                    if sys_tx.try_send(ack).is_err() {
                        debug!(link, "system queue full, keepalive ack dropped");
                    }
                }
                cmd::KPALIVE_ACK => debug!(link, "keepalive ack"),
                cmd::LINK_AUTH_ACK => match cbor_decode::<LinkAuthAck>(packet.body()) {
                    Ok(ack) if ack.code == CODE_OK => info!(link, "link authenticated"),
                    Ok(ack) => warn!(link, code = ack.code, errmsg = %ack.errmsg, "link auth rejected"),
                    Err(e) => warn!(link, error = %e, "undecodable link auth ack"),
                },
                other => debug!(link, cmd = other, "unhandled system frame"),
            }
            continue;
        }

        tokio::select! {
            _ = stop.recv() => return Ok(()),
            r = in_tx.send_async(packet) => {
                if r.is_err() {
                    return Err(ImxError::QueueClosed("inbound"));
                }
            }
        }
    }
}

async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut stop: broadcast::Receiver<()>,
    out_rx: flume::Receiver<FramePacket>,
    sys_rx: SysReceiver,
    link: usize,
) -> ImxResult<()> {
    // Only the current connection of this link drains its system queue.
    let mut sys = sys_rx.lock().await;
    loop {
        let packet = tokio::select! {
            biased;
            _ = stop.recv() => break,
            Some(p) = sys.recv() => p,
            p = out_rx.recv_async() => match p {
                Ok(p) => p,
                Err(_) => return Err(ImxError::QueueClosed("outbound")),
            },
        };
        if let Err(e) = wr.write_all(packet.as_bytes()).await {
            warn!(link, cmd = packet.cmd(), error = %e, "forwarder write failed");
            return Err(ImxError::Transport(format!("link {link} write: {e}")));
        }
    }
    let _ = wr.shutdown().await;
    Ok(())
}

async fn handle_loop<C: Clone + Send + Sync + 'static>(
    mut stop: broadcast::Receiver<()>,
    in_rx: flume::Receiver<FramePacket>,
    registry: Arc<Registry<Handler<C>, C>>,
    link: usize,
    worker: usize,
) -> ImxResult<()> {
    loop {
        let packet = tokio::select! {
            _ = stop.recv() => return Ok(()),
            p = in_rx.recv_async() => match p {
                Ok(p) => p,
                Err(_) => return Err(ImxError::QueueClosed("inbound")),
            },
        };
        let header = packet.header();
        let Some(entry) = registry.lookup(header.cmd) else {
            warn!(link, cmd = header.cmd, name = cmd::name(header.cmd), "no handler registered, dropping");
            continue;
        };

        let body = packet.body().to_vec();
        let call = (entry.handler)(header.cmd, header.nid, body, entry.ctx);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(link, worker, cmd = header.cmd, error = %e, "handler failed");
            }
            Err(_) => {
                error!(link, worker, cmd = header.cmd, "handler panicked");
            }
        }
    }
}
