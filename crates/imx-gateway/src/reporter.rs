//! Periodic `LSN_RPT` liveness report to the backend.

use crate::server::Gateway;
use imx_core::messages::LsnReport;
use imx_core::{cbor_encode, cmd, Flag, FramePacket, ImxResult};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, warn};

pub async fn run(gw: Weak<Gateway>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                let Some(gw) = gw.upgrade() else { break };
                if let Err(e) = report(&gw).await {
                    warn!(error = %e, "liveness report failed");
                }
            }
        }
    }
    debug!("liveness reporter stopped");
}

/// Build the current report.
pub fn snapshot(gw: &Gateway) -> LsnReport {
    let (ip, port) = match gw.local_addr() {
        Some(addr) => (addr.ip().to_string(), addr.port()),
        None => (gw.conf.bind.clone(), gw.conf.port),
    };
    LsnReport {
        nid: gw.nid(),
        ip,
        port,
        connections: gw.conns().len() as u64,
    }
}

async fn report(gw: &Gateway) -> ImxResult<()> {
    let report = snapshot(gw);
    let body = cbor_encode(&report)?;
    let frame = FramePacket::frame(cmd::LSN_RPT, gw.nid(), Flag::System, &body);
    gw.proxy.send_packet(frame).await?;
    debug!(
        connections = report.connections,
        sessions = gw.router().len(),
        rooms = gw.chat().room_num(),
        "liveness reported"
    );
    Ok(())
}
