// Status feed over WebSocket: every message published on the feed goes to
// every connected client as one JSON text frame.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use wingman_types::{sys_debug, sys_info, sys_warn, StatusMessage};

pub static ACTIVE_STATUS_CONNECTIONS: AtomicU32 = AtomicU32::new(0);

/// Forward `feed` to the socket until the client goes away.
///
/// A client that falls behind by more than the feed capacity skips the
/// oldest messages and keeps going. A keepalive ping goes out every
/// `ping_interval`.
pub async fn forward_status_feed<S>(
    ws_stream: WebSocketStream<S>,
    mut feed: broadcast::Receiver<StatusMessage>,
    ping_interval: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let active = ACTIVE_STATUS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    sys_info!("[WS_STATUS] Client connected ({} active)", active);

    let mut keepalive = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            message = feed.recv() => match message {
                Ok(message) => {
                    if ws_sender.send(WsMessage::Text(message.to_json())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    sys_warn!("[WS_STATUS] Client fell behind, skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = keepalive.tick() => {
                if ws_sender.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = ws_sender.send(WsMessage::Pong(data)).await;
                }
                Some(Err(e)) => {
                    sys_debug!("[WS_STATUS] Socket error: {}", e);
                    break;
                }
                _ => {}
            },
        }
    }

    let active = ACTIVE_STATUS_CONNECTIONS
        .fetch_sub(1, Ordering::SeqCst)
        .saturating_sub(1);
    sys_info!("[WS_STATUS] Client disconnected ({} active)", active);
}
