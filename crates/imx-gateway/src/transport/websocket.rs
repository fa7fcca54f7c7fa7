//! WebSocket listener using tokio-tungstenite.
//!
//! Accepts TCP connections, performs the upgrade on the configured path only
//! and hands finished WebSocket streams to the gateway. Each binary frame
//! carries exactly one session message.

use futures_util::{Stream, StreamExt};
use imx_core::codec::{MAX_BODY_LEN, MESG_HEADER_LEN};
use imx_core::{ImxError, ImxResult};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

pub type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// Maximum frame size for WebSocket messages (1 MiB, matching the largest
/// body a header may announce).
const MAX_WS_FRAME_SIZE: usize = MAX_BODY_LEN + MESG_HEADER_LEN;

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    pub remote_addr: SocketAddr,
}

/// Start accepting WebSocket upgrades on `listener` for `path`.
///
/// Returns a receiver that yields upgraded connections and the handle of
/// the accept loop, which ends on `shutdown`.
pub fn start_listener(
    listener: TcpListener,
    path: String,
    mut shutdown: broadcast::Receiver<()>,
) -> (mpsc::Receiver<WebSocketConnection>, JoinHandle<()>) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, path = %path, "WebSocket listener started");
    }

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    let handle = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                r = listener.accept() => r,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let tx = tx.clone();
                    let path = path.clone();
                    tokio::spawn(async move {
                        match upgrade(stream, &path).await {
                            Ok(ws_stream) => {
                                debug!(remote = %addr, "WebSocket connection accepted");
                                let conn = WebSocketConnection {
                                    ws_stream,
                                    remote_addr: addr,
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("WebSocket connection channel closed");
                                }
                            }
                            Err(e) => {
                                warn!(remote = %addr, error = %e, "WebSocket handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    (rx, handle)
}

/// Run the upgrade handshake, refusing any path but `path` with 404.
async fn upgrade(stream: TcpStream, path: &str) -> Result<WsStream, WsError> {
    let guard = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == path {
            return Ok(resp);
        }
        let mut refusal = ErrorResponse::new(Some(format!("no endpoint at {}", req.uri().path())));
        *refusal.status_mut() = StatusCode::NOT_FOUND;
        Err(refusal)
    };
    tokio_tungstenite::accept_hdr_async(stream, guard).await
}

/// Helper: receive the next binary message.
///
/// Returns `None` if the connection is closed. Text messages are ignored;
/// control frames are answered by tungstenite itself.
pub async fn ws_recv_binary<S>(ws: &mut S) -> ImxResult<Option<Vec<u8>>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                if data.len() > MAX_WS_FRAME_SIZE {
                    return Err(ImxError::InvalidMessage(format!(
                        "WS frame too large: {} bytes (max {})",
                        data.len(),
                        MAX_WS_FRAME_SIZE
                    )));
                }
                return Ok(Some(data.to_vec()));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(ImxError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{Sink, SinkExt};
    use tokio_tungstenite::connect_async;

    async fn ws_send_binary<S>(ws: &mut S, data: Vec<u8>) -> ImxResult<()>
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        ws.send(Message::Binary(data.into()))
            .await
            .map_err(|e| ImxError::Transport(format!("WS send failed: {e}")))
    }

    #[tokio::test]
    async fn upgrade_on_configured_path_only() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (mut rx, handle) = start_listener(listener, "/im".into(), shutdown_tx.subscribe());

        assert!(connect_async(format!("ws://{addr}/other")).await.is_err());

        let (mut client, _) = connect_async(format!("ws://{addr}/im")).await.unwrap();
        let mut server = rx.recv().await.unwrap();
        ws_send_binary(&mut client, vec![1, 2, 3]).await.unwrap();
        let got = ws_recv_binary(&mut server.ws_stream).await.unwrap();
        assert_eq!(got, Some(vec![1, 2, 3]));

        let _ = shutdown_tx.send(());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn text_frames_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (mut rx, _handle) = start_listener(listener, "/im".into(), shutdown_tx.subscribe());

        let (mut client, _) = connect_async(format!("ws://{addr}/im")).await.unwrap();
        let mut server = rx.recv().await.unwrap();
        client.send(Message::Text("hi".into())).await.unwrap();
        ws_send_binary(&mut client, vec![9]).await.unwrap();
        client.close(None).await.unwrap();

        let got = ws_recv_binary(&mut server.ws_stream).await.unwrap();
        assert_eq!(got, Some(vec![9]));
        let end = ws_recv_binary(&mut server.ws_stream).await.unwrap();
        assert_eq!(end, None);
    }
}
