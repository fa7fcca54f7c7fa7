//! imx-forwarder: client side of the forwarder protocol.
//!
//! A [`ForwarderProxy`] keeps a pool of persistent TCP links to the backend
//! tier. Outbound frames go into one shared bounded MPMC queue that every
//! link's writer drains; inbound frames from every link go into one shared
//! queue that a pool of handler tasks drains, dispatching by command through
//! a [`Registry`](imx_core::Registry). Both queues are `flume` channels, so
//! consumers contend only on the channel itself.
//!
//! # Quick Start
//!
//! ```no_run
//! use imx_forwarder::{ForwarderConf, ForwarderProxy, HandlerFuture};
//!
//! fn on_ack(cmd: u32, nid: u32, body: Vec<u8>, _ctx: ()) -> HandlerFuture {
//!     Box::pin(async move {
//!         println!("cmd {cmd:#06x} from {nid}: {} bytes", body.len());
//!         Ok(())
//!     })
//! }
//!
//! # async fn example() -> imx_core::ImxResult<()> {
//! let proxy = ForwarderProxy::new(ForwarderConf::default());
//! proxy.register(imx_core::cmd::ONLINE_ACK, on_ack, ());
//! proxy.launch();
//! proxy.async_send(imx_core::cmd::ONLINE, b"...").await?;
//! proxy.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod link;
pub mod proxy;

use imx_core::ImxResult;
use std::future::Future;
use std::pin::Pin;

pub use config::ForwarderConf;
pub use link::{read_frame, LinkState};
pub use proxy::ForwarderProxy;

/// Future returned by a downlink handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ImxResult<()>> + Send + 'static>>;

/// Downlink handler: `(cmd, nid, body, ctx)`.
pub type Handler<C> = fn(u32, u32, Vec<u8>, C) -> HandlerFuture;
