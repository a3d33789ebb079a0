//! Background workers behind `wingman_server` and the launcher: the model
//! downloader, the inference supervisor and the host helpers they share.

pub mod download;
pub mod gpu;
pub mod inference;
pub mod instance_lock;
pub mod net;

pub use download::{DownloadSettings, DownloadWorker};
pub use inference::{StartRequest, StopOutcome, Supervisor, SupervisorError, SupervisorSettings};
pub use instance_lock::{InstanceLock, LockError};
