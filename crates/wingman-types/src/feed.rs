use serde::{Deserialize, Serialize};

use crate::{DownloadItem, MetricsSnapshot, ServiceStatus, WingmanItem, DOWNLOAD_SERVICE};

/// One message on the status feed.
///
/// Serialized as a single JSON object whose `isa` field names the payload kind,
/// e.g. `{"isa":"DownloadItem","modelRepo":...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "isa")]
pub enum StatusMessage {
    DownloadItem(DownloadItem),
    WingmanItem(WingmanItem),
    DownloadServiceAppItem(ServiceStatus),
    WingmanServiceAppItem(ServiceStatus),
    MetricsSnapshot(MetricsSnapshot),
}

impl StatusMessage {
    /// Wrap a service status in the variant matching its name.
    pub fn service(status: ServiceStatus) -> Self {
        if status.name == DOWNLOAD_SERVICE {
            StatusMessage::DownloadServiceAppItem(status)
        } else {
            StatusMessage::WingmanServiceAppItem(status)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StatusMessage::DownloadItem(_) => "DownloadItem",
            StatusMessage::WingmanItem(_) => "WingmanItem",
            StatusMessage::DownloadServiceAppItem(_) => "DownloadServiceAppItem",
            StatusMessage::WingmanServiceAppItem(_) => "WingmanServiceAppItem",
            StatusMessage::MetricsSnapshot(_) => "MetricsSnapshot",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"isa":"Unknown"}"#.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ServiceState, WINGMAN_SERVICE};

    #[test]
    fn test_discriminator_field() {
        let msg = StatusMessage::DownloadItem(DownloadItem::new("org/model", "a.gguf", 5));
        let value: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["isa"], "DownloadItem");
        assert_eq!(value["filePath"], "a.gguf");
    }

    #[test]
    fn test_service_variant_follows_name() {
        let download = ServiceStatus::new(DOWNLOAD_SERVICE, ServiceState::Ready, 1);
        let wingman = ServiceStatus::new(WINGMAN_SERVICE, ServiceState::Inferring, 1);
        assert_eq!(StatusMessage::service(download).kind(), "DownloadServiceAppItem");
        assert_eq!(StatusMessage::service(wingman).kind(), "WingmanServiceAppItem");
    }

    #[test]
    fn test_parse_back() {
        let msg = StatusMessage::WingmanItem(WingmanItem::new("chat", "org/model", "m.gguf", 3));
        let parsed: StatusMessage = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(parsed, msg);
    }
}
