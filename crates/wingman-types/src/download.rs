use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a model file download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Idle,
    Queued,
    Downloading,
    Complete,
    Error,
    Cancelled,
    Unknown,
}

impl DownloadStatus {
    pub const ALL: [DownloadStatus; 7] = [
        DownloadStatus::Idle,
        DownloadStatus::Queued,
        DownloadStatus::Downloading,
        DownloadStatus::Complete,
        DownloadStatus::Error,
        DownloadStatus::Cancelled,
        DownloadStatus::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DownloadStatus::Idle => "idle",
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Complete => "complete",
            DownloadStatus::Error => "error",
            DownloadStatus::Cancelled => "cancelled",
            DownloadStatus::Unknown => "unknown",
        }
    }

    /// Parse a stored status. Anything unrecognised maps to `Unknown`.
    pub fn from_db(value: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == value)
            .unwrap_or(DownloadStatus::Unknown)
    }

    /// Queued or in flight.
    pub fn is_active(self) -> bool {
        matches!(self, DownloadStatus::Queued | DownloadStatus::Downloading)
    }

    /// Statuses that may be re-enqueued after a reset.
    pub fn is_resettable(self) -> bool {
        matches!(
            self,
            DownloadStatus::Idle
                | DownloadStatus::Cancelled
                | DownloadStatus::Error
                | DownloadStatus::Unknown
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record tracking the download of one file from one repository.
///
/// Keyed by `(model_repo, file_path)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub model_repo: String,
    pub file_path: String,
    pub status: DownloadStatus,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub download_speed: String,
    pub progress: f64,
    pub error: Option<String>,
    pub created: i64,
    pub updated: i64,
}

impl DownloadItem {
    /// A fresh `idle` row with zeroed counters.
    pub fn new(model_repo: &str, file_path: &str, now: i64) -> Self {
        Self {
            model_repo: model_repo.to_string(),
            file_path: file_path.to_string(),
            status: DownloadStatus::Idle,
            total_bytes: 0,
            downloaded_bytes: 0,
            download_speed: String::new(),
            progress: 0.0,
            error: None,
            created: now,
            updated: now,
        }
    }

    pub fn is_same_key(&self, model_repo: &str, file_path: &str) -> bool {
        self.model_repo == model_repo && self.file_path == file_path
    }
}

/// Percentage of `downloaded` over `total`, clamped to 0..=100.
pub fn compute_progress(downloaded: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_db_text() {
        for status in DownloadStatus::ALL {
            assert_eq!(DownloadStatus::from_db(status.as_str()), status);
        }
        assert_eq!(DownloadStatus::from_db("paused"), DownloadStatus::Unknown);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DownloadStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }

    #[test]
    fn test_item_uses_camel_case_fields() {
        let item = DownloadItem::new("org/model", "model.Q4.bin", 1);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["modelRepo"], "org/model");
        assert_eq!(json["downloadedBytes"], 0);
        assert_eq!(json["status"], "idle");
    }

    #[test]
    fn test_compute_progress() {
        assert_eq!(compute_progress(0, 0), 0.0);
        assert_eq!(compute_progress(400, 1000), 40.0);
        assert_eq!(compute_progress(1000, 1000), 100.0);
        assert_eq!(compute_progress(1200, 1000), 100.0);
    }
}
