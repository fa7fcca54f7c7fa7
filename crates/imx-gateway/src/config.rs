//! Gateway configuration: TOML file + CLI overrides.

use imx_core::{ImxError, ImxResult};
use imx_forwarder::ForwarderConf;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub forwarder: ForwarderConf,
}

/// `[gateway]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_nid")]
    pub nid: u32,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_send_queue_len")]
    pub send_queue_len: usize,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_kick_queue_len")]
    pub kick_queue_len: usize,
    #[serde(default = "default_kick_delay")]
    pub kick_delay_secs: u64,
    #[serde(default = "default_router_shards")]
    pub router_shards: usize,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            nid: default_nid(),
            bind: default_bind(),
            port: default_port(),
            path: default_path(),
            max_connections: default_max_connections(),
            send_queue_len: default_send_queue_len(),
            ping_interval_secs: default_ping_interval(),
            write_timeout_secs: default_write_timeout(),
            kick_queue_len: default_kick_queue_len(),
            kick_delay_secs: default_kick_delay(),
            router_shards: default_router_shards(),
            report_interval_secs: default_report_interval(),
        }
    }
}

fn default_nid() -> u32 {
    1
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_path() -> String {
    "/im".to_string()
}
fn default_max_connections() -> usize {
    100_000
}
fn default_send_queue_len() -> usize {
    1024
}
fn default_ping_interval() -> u64 {
    30
}
fn default_write_timeout() -> u64 {
    10
}
fn default_kick_queue_len() -> usize {
    4096
}
fn default_kick_delay() -> u64 {
    1
}
fn default_router_shards() -> usize {
    64
}
fn default_report_interval() -> u64 {
    5
}

/// Resolved gateway configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub nid: u32,
    pub bind: String,
    pub port: u16,
    pub path: String,
    pub max_connections: usize,
    pub send_queue_len: usize,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub kick_queue_len: usize,
    pub kick_delay: Duration,
    pub router_shards: usize,
    /// Zero disables the liveness reporter.
    pub report_interval: Duration,
    pub forwarder: ForwarderConf,
}

impl GatewayConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_nid: Option<u32>,
        cli_forwarder: Option<&str>,
    ) -> ImxResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let mut conf = Self::from_file(file_config);
        if let Some(port) = cli_port {
            conf.port = port;
        }
        if let Some(nid) = cli_nid {
            conf.nid = nid;
            conf.forwarder.nid = nid;
        }
        if let Some(addr) = cli_forwarder {
            conf.forwarder.addr = addr.to_string();
        }
        Ok(conf)
    }

    /// Resolve a parsed file. The gateway node id is authoritative for the
    /// forwarder as well.
    pub fn from_file(file: ConfigFile) -> Self {
        let g = file.gateway;
        let mut forwarder = file.forwarder;
        forwarder.nid = g.nid;
        Self {
            nid: g.nid,
            bind: g.bind,
            port: g.port,
            path: g.path,
            max_connections: g.max_connections,
            send_queue_len: g.send_queue_len.max(1),
            ping_interval: Duration::from_secs(g.ping_interval_secs.max(1)),
            write_timeout: Duration::from_secs(g.write_timeout_secs.max(1)),
            kick_queue_len: g.kick_queue_len.max(1),
            kick_delay: Duration::from_secs(g.kick_delay_secs),
            router_shards: g.router_shards.max(1),
            report_interval: Duration::from_secs(g.report_interval_secs),
            forwarder,
        }
    }

    /// `bind:port` listen address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

fn parse(content: &str) -> ImxResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| ImxError::Other(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
