use serde::{Deserialize, Serialize};

/// Service-status row name for the download worker.
pub const DOWNLOAD_SERVICE: &str = "DownloadService";
/// Service-status row name for the inference supervisor.
pub const WINGMAN_SERVICE: &str = "WingmanService";

/// Coarse health of a background service, independent of any single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Starting,
    Ready,
    Preparing,
    Downloading,
    Inferring,
    Stopping,
    Stopped,
    Error,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub status: ServiceState,
    /// Snapshot of the job the service is working on, if any.
    pub current: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created: i64,
    pub updated: i64,
}

impl ServiceStatus {
    pub fn new(name: &str, status: ServiceState, now: i64) -> Self {
        Self {
            name: name.to_string(),
            status,
            current: None,
            error: None,
            created: now,
            updated: now,
        }
    }

    pub fn with_current<T: Serialize>(mut self, job: &T) -> Self {
        self.current = serde_json::to_value(job).ok();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
