//! The forwarder proxy: owner of the link pool, the shared queues and the
//! downlink registry.

use crate::config::ForwarderConf;
use crate::link::{ForwarderLink, LinkHandle, LinkState};
use crate::Handler;
use imx_core::{cmd, Flag, FramePacket, ImxError, ImxResult, Registry};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info};

/// Pool of forwarder links sharing one outbound and one inbound queue.
pub struct ForwarderProxy<C> {
    conf: Arc<ForwarderConf>,
    registry: Arc<Registry<Handler<C>, C>>,
    out_tx: flume::Sender<FramePacket>,
    out_rx: flume::Receiver<FramePacket>,
    in_tx: flume::Sender<FramePacket>,
    in_rx: flume::Receiver<FramePacket>,
    links: Vec<LinkHandle>,
    shutdown_tx: broadcast::Sender<()>,
    launched: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Clone + Send + Sync + 'static> ForwarderProxy<C> {
    pub fn new(conf: ForwarderConf) -> Self {
        let (out_tx, out_rx) = flume::bounded(conf.send_queue_len.max(1));
        let (in_tx, in_rx) = flume::bounded(conf.recv_queue_len.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);
        let links = (0..conf.link_num.max(1)).map(LinkHandle::new).collect();

        Self {
            conf: Arc::new(conf),
            registry: Arc::new(Registry::new()),
            out_tx,
            out_rx,
            in_tx,
            in_rx,
            links,
            shutdown_tx,
            launched: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Node id stamped on outbound frames.
    pub fn nid(&self) -> u32 {
        self.conf.nid
    }

    /// Register the downlink handler for `cmd`. Last registration wins.
    pub fn register(&self, cmd: u32, handler: Handler<C>, ctx: C) -> bool {
        let replaced = self.registry.register(cmd, handler, ctx);
        if replaced {
            debug!(cmd, name = cmd::name(cmd), "downlink handler replaced");
        }
        replaced
    }

    /// Start every link and the keepalive ticker. Calling it again is a
    /// no-op.
    pub fn launch(&self) {
        if self.launched.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();

        for handle in &self.links {
            let link = ForwarderLink {
                handle: handle.clone(),
                conf: self.conf.clone(),
                registry: self.registry.clone(),
                out_rx: self.out_rx.clone(),
                in_tx: self.in_tx.clone(),
                in_rx: self.in_rx.clone(),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            tasks.push(tokio::spawn(link.run()));
        }

        tasks.push(tokio::spawn(keepalive(
            self.links.clone(),
            self.conf.clone(),
            self.shutdown_tx.subscribe(),
        )));

        info!(
            addr = %self.conf.addr,
            links = self.links.len(),
            workers = self.conf.worker_num,
            "forwarder proxy launched"
        );
    }

    /// Queue a user frame for `cmd` carrying `body`.
    ///
    /// Waits while the outbound queue is full.
    pub async fn async_send(&self, cmd: u32, body: &[u8]) -> ImxResult<()> {
        let packet = FramePacket::frame(cmd, self.conf.nid, Flag::User, body);
        self.send_packet(packet).await
    }

    /// Queue an already-built frame.
    pub async fn send_packet(&self, packet: FramePacket) -> ImxResult<()> {
        self.out_tx
            .send_async(packet)
            .await
            .map_err(|_| ImxError::QueueClosed("outbound"))
    }

    /// Current state of every link, indexed by link id.
    pub fn link_states(&self) -> Vec<LinkState> {
        self.links.iter().map(LinkHandle::state).collect()
    }

    /// Stop every link and wait for its tasks to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("forwarder proxy stopped");
    }
}

/// Periodically queue `KPALIVE_REQ` on each connected link.
async fn keepalive(
    links: Vec<LinkHandle>,
    conf: Arc<ForwarderConf>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(conf.keepalive_interval());
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                for handle in &links {
                    if handle.state() != LinkState::Connected {
                        continue;
                    }
                    let ping = FramePacket::frame(cmd::KPALIVE_REQ, conf.nid, Flag::System, &[]);
                    if handle.sys_tx.try_send(ping).is_err() {
                        debug!(link = handle.id, "system queue full, keepalive skipped");
                    }
                }
            }
        }
    }
}
