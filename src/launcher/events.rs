// Events the launcher sends to whatever shell hosts it.

use serde::Serialize;
use tokio::sync::mpsc;
use wingman_types::{sys_debug, sys_info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LauncherEvent {
    Status { text: String },
    ReportError { message: String },
    Navigate { url: String },
    ServiceRestarted { attempt: u32 },
    Exited,
}

#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<LauncherEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LauncherEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: LauncherEvent) {
        if self.tx.send(event).is_err() {
            sys_debug!("[LAUNCHER] Shell is gone, event dropped");
        }
    }

    pub fn status(&self, text: impl Into<String>) {
        let text = text.into();
        sys_info!("[LAUNCHER] {}", text);
        self.emit(LauncherEvent::Status { text });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_shape() {
        let navigate = serde_json::to_value(LauncherEvent::Navigate {
            url: "http://127.0.0.1:49152".to_string(),
        })
        .unwrap();
        assert_eq!(
            navigate,
            json!({"event": "navigate", "url": "http://127.0.0.1:49152"})
        );

        let restarted = serde_json::to_value(LauncherEvent::ServiceRestarted { attempt: 2 }).unwrap();
        assert_eq!(restarted, json!({"event": "serviceRestarted", "attempt": 2}));

        let exited = serde_json::to_value(LauncherEvent::Exited).unwrap();
        assert_eq!(exited, json!({"event": "exited"}));
    }

    #[tokio::test]
    async fn test_sink_survives_closed_shell() {
        let (sink, rx) = EventSink::channel();
        sink.status("starting");
        drop(rx);
        sink.emit(LauncherEvent::Exited);
    }
}
