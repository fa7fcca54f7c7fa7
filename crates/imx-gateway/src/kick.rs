//! Delayed eviction.
//!
//! Connections that must be force-closed are queued with a deadline. One
//! sweeper moves queued items into a `DelayQueue` and closes each cid
//! through the registry when its deadline expires, earliest first.
//! Past-due items close immediately.

use crate::conn::ConnRegistry;
use futures_util::StreamExt;
use imx_core::{ImxError, ImxResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KickItem {
    pub cid: u64,
    pub deadline: Instant,
}

/// Producer side of the eviction queue.
#[derive(Clone)]
pub struct KickQueue {
    tx: mpsc::Sender<KickItem>,
    delay: Duration,
}

impl KickQueue {
    pub fn new(capacity: usize, delay: Duration) -> (Self, mpsc::Receiver<KickItem>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, delay }, rx)
    }

    /// Schedule `cid` for closure after the configured delay.
    pub async fn push(&self, cid: u64) -> ImxResult<()> {
        self.push_at(cid, Instant::now() + self.delay).await
    }

    /// Schedule `cid` for closure at `deadline`. Waits while the queue is
    /// full.
    async fn push_at(&self, cid: u64, deadline: Instant) -> ImxResult<()> {
        debug!(cid, "kick queued");
        self.tx
            .send(KickItem { cid, deadline })
            .await
            .map_err(|_| ImxError::QueueClosed("kick"))
    }
}

/// Evict queued connections as their deadlines pass, until shutdown or
/// until every producer is gone and nothing is pending.
pub async fn run_sweeper(
    mut rx: mpsc::Receiver<KickItem>,
    conns: Arc<ConnRegistry>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut pending: DelayQueue<u64> = DelayQueue::new();
    let mut open = true;

    while open || !pending.is_empty() {
        tokio::select! {
            _ = shutdown.recv() => break,
            item = rx.recv(), if open => match item {
                Some(item) => {
                    pending.insert_at(item.cid, item.deadline);
                }
                None => open = false,
            },
            Some(expired) = pending.next(), if !pending.is_empty() => {
                let cid = expired.into_inner();
                if conns.close(cid) {
                    info!(cid, "connection kicked");
                } else {
                    debug!(cid, "kick target already gone");
                }
            }
        }
    }
    debug!("kick sweeper stopped");
}
