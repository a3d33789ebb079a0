use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use wingman_db::StatusFeed;
use wingman_types::sys_error;

use crate::response_helpers::json_error;
use crate::websocket::forward_status_feed;
use crate::websocket_utils::{
    build_websocket_upgrade_response, calculate_websocket_accept_key, get_websocket_key,
    is_websocket_upgrade,
};

/// GET /ws/status
///
/// The subscription is taken before the 101 goes out, so the client sees
/// every message published after its handshake completes.
pub async fn handle_status_websocket(
    req: Request<Body>,
    feed: StatusFeed,
    ping_interval: Duration,
) -> Result<Response<Body>, Infallible> {
    if !is_websocket_upgrade(&req) {
        return Ok(json_error(StatusCode::BAD_REQUEST, "WebSocket upgrade required"));
    }
    let Some(key) = get_websocket_key(&req) else {
        return Ok(json_error(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key"));
    };
    let accept_key = calculate_websocket_accept_key(&key);
    let subscription = feed.subscribe();

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let ws_stream = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                forward_status_feed(ws_stream, subscription, ping_interval).await;
            }
            Err(e) => sys_error!("[WS_STATUS] Upgrade failed: {}", e),
        }
    });

    Ok(build_websocket_upgrade_response(&accept_key))
}
