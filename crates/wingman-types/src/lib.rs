// Shared data model for the Wingman job orchestration layer.
//
// Everything that crosses a crate boundary (job rows, service statuses,
// status feed messages, model file naming) lives here so the store, the
// workers and the web layer agree on one JSON shape.

pub mod download;
pub mod feed;
pub mod format;
pub mod logger;
pub mod metrics;
pub mod model_file;
pub mod service;
pub mod variant;
pub mod wingman;

pub use download::{DownloadItem, DownloadStatus};
pub use feed::StatusMessage;
pub use metrics::MetricsSnapshot;
pub use model_file::{format_model_file_name, parse_model_file_name, validate_model_key};
pub use service::{ServiceState, ServiceStatus, DOWNLOAD_SERVICE, WINGMAN_SERVICE};
pub use variant::ExecutableVariant;
pub use wingman::{WingmanItem, WingmanStatus};

#[doc(hidden)]
pub use log as __log;
