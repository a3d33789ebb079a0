// Relays the engine's metrics websocket onto the status feed.
//
// The engine opens its metrics socket some time after it reports ready and
// drops it when it exits, so the relay reconnects until `stop` fires.

use futures_util::StreamExt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use wingman_db::SharedDatabase;
use wingman_types::{sys_debug, sys_warn, MetricsSnapshot, StatusMessage};

pub fn spawn_metrics_relay(
    db: SharedDatabase,
    alias: String,
    url: String,
    reconnect: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        sys_debug!("[METRICS] Relaying {} from {}", alias, url);
        loop {
            let connected = tokio::select! {
                _ = stop.cancelled() => break,
                result = connect_async(url.as_str()) => result,
            };

            match connected {
                Ok((mut socket, _)) => loop {
                    let frame = tokio::select! {
                        _ = stop.cancelled() => return,
                        frame = socket.next() => frame,
                    };
                    match frame {
                        Some(Ok(Message::Text(text))) => relay_frame(&db, &alias, &text),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            sys_debug!("[METRICS] {} socket error: {}", alias, e);
                            break;
                        }
                    }
                },
                Err(e) => sys_debug!("[METRICS] {} not reachable yet: {}", alias, e),
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(reconnect) => {}
            }
        }
        sys_debug!("[METRICS] Relay for {} stopped", alias);
    })
}

fn relay_frame(db: &SharedDatabase, alias: &str, text: &str) {
    match MetricsSnapshot::from_frame(text, alias) {
        Ok(snapshot) => db.publish(StatusMessage::MetricsSnapshot(snapshot)),
        Err(e) => sys_warn!("[METRICS] Dropping malformed frame from {}: {}", alias, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use wingman_db::Database;

    #[tokio::test]
    async fn test_frames_reach_the_feed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("not json".to_string())).await.unwrap();
            ws.send(Message::Text(
                r#"{"timings":{"tokensPerSecond":42.0}}"#.to_string(),
            ))
            .await
            .unwrap();
            // Keep the socket open until the relay is stopped.
            let _ = ws.next().await;
        });

        let db = Arc::new(Database::new(":memory:").unwrap());
        let mut feed = db.feed().subscribe();
        let stop = CancellationToken::new();
        let relay = spawn_metrics_relay(
            db.clone(),
            "chat".to_string(),
            format!("ws://127.0.0.1:{port}"),
            Duration::from_millis(50),
            stop.clone(),
        );

        let message = tokio::time::timeout(Duration::from_secs(5), feed.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            StatusMessage::MetricsSnapshot(snapshot) => {
                assert_eq!(snapshot.alias, "chat");
                assert_eq!(snapshot.timings.tokens_per_second, 42.0);
            }
            other => panic!("unexpected {other:?}"),
        }

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stops_while_engine_is_unreachable() {
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let db = Arc::new(Database::new(":memory:").unwrap());
        let stop = CancellationToken::new();
        let relay = spawn_metrics_relay(
            db,
            "chat".to_string(),
            format!("ws://127.0.0.1:{port}"),
            Duration::from_millis(20),
            stop.clone(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .unwrap()
            .unwrap();
    }
}
