//! Forwarder configuration (`[forwarder]` section of the gateway TOML).

use serde::Deserialize;
use std::time::Duration;

/// Connection parameters for the backend tier.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConf {
    /// Node id stamped on every outbound frame.
    #[serde(default = "default_nid")]
    pub nid: u32,
    /// Backend address (`host:port`).
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Number of parallel TCP links.
    #[serde(default = "default_link_num")]
    pub link_num: usize,
    /// Handler tasks spawned per connected link.
    #[serde(default = "default_worker_num")]
    pub worker_num: usize,
    /// Capacity of the shared outbound queue.
    #[serde(default = "default_queue_len")]
    pub send_queue_len: usize,
    /// Capacity of the shared inbound queue.
    #[serde(default = "default_queue_len")]
    pub recv_queue_len: usize,
    /// Fixed delay between a link failure and the next dial.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    /// Period of the keepalive ticker.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Link authentication user.
    #[serde(default = "default_usr")]
    pub usr: String,
    /// Link authentication password.
    #[serde(default)]
    pub passwd: String,
}

impl Default for ForwarderConf {
    fn default() -> Self {
        Self {
            nid: default_nid(),
            addr: default_addr(),
            link_num: default_link_num(),
            worker_num: default_worker_num(),
            send_queue_len: default_queue_len(),
            recv_queue_len: default_queue_len(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            usr: default_usr(),
            passwd: String::new(),
        }
    }
}

impl ForwarderConf {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms.max(1))
    }
}

fn default_nid() -> u32 {
    1
}
fn default_addr() -> String {
    "127.0.0.1:9100".to_string()
}
fn default_link_num() -> usize {
    10
}
fn default_worker_num() -> usize {
    4
}
fn default_queue_len() -> usize {
    4096
}
fn default_reconnect_interval_ms() -> u64 {
    3_000
}
fn default_keepalive_interval_ms() -> u64 {
    30_000
}
fn default_usr() -> String {
    "imx".to_string()
}
