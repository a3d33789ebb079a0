use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one inference process ("wingman") for an alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WingmanStatus {
    Queued,
    Preparing,
    Inferring,
    Complete,
    Error,
    Cancelling,
    Cancelled,
    Unknown,
}

impl WingmanStatus {
    pub const ALL: [WingmanStatus; 8] = [
        WingmanStatus::Queued,
        WingmanStatus::Preparing,
        WingmanStatus::Inferring,
        WingmanStatus::Complete,
        WingmanStatus::Error,
        WingmanStatus::Cancelling,
        WingmanStatus::Cancelled,
        WingmanStatus::Unknown,
    ];

    /// Non-terminal statuses. At most one row per alias may be in one of these.
    pub const ACTIVE: [WingmanStatus; 4] = [
        WingmanStatus::Queued,
        WingmanStatus::Preparing,
        WingmanStatus::Inferring,
        WingmanStatus::Cancelling,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WingmanStatus::Queued => "queued",
            WingmanStatus::Preparing => "preparing",
            WingmanStatus::Inferring => "inferring",
            WingmanStatus::Complete => "complete",
            WingmanStatus::Error => "error",
            WingmanStatus::Cancelling => "cancelling",
            WingmanStatus::Cancelled => "cancelled",
            WingmanStatus::Unknown => "unknown",
        }
    }

    pub fn from_db(value: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == value)
            .unwrap_or(WingmanStatus::Unknown)
    }

    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }
}

impl fmt::Display for WingmanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted record for the inference process serving one alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WingmanItem {
    pub alias: String,
    pub status: WingmanStatus,
    pub model_repo: String,
    pub file_path: String,
    pub address: String,
    pub port: u16,
    pub metrics_port: u16,
    pub context_size: u32,
    /// Layers to offload to the GPU. Negative means "as many as fit".
    pub gpu_layers: i32,
    pub force: bool,
    pub error: Option<String>,
    pub created: i64,
    pub updated: i64,
}

impl WingmanItem {
    pub fn new(alias: &str, model_repo: &str, file_path: &str, now: i64) -> Self {
        Self {
            alias: alias.to_string(),
            status: WingmanStatus::Queued,
            model_repo: model_repo.to_string(),
            file_path: file_path.to_string(),
            address: "127.0.0.1".to_string(),
            port: 0,
            metrics_port: 0,
            context_size: 0,
            gpu_layers: -1,
            force: false,
            error: None,
            created: now,
            updated: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_statuses() {
        assert!(WingmanStatus::Preparing.is_active());
        assert!(WingmanStatus::Cancelling.is_active());
        assert!(!WingmanStatus::Cancelled.is_active());
        assert!(!WingmanStatus::Error.is_active());
        assert!(!WingmanStatus::Complete.is_active());
    }

    #[test]
    fn test_unknown_db_text() {
        assert_eq!(WingmanStatus::from_db("inferring"), WingmanStatus::Inferring);
        assert_eq!(WingmanStatus::from_db("bogus"), WingmanStatus::Unknown);
    }
}
