//! Background model downloader.
//!
//! One blocking loop on a dedicated thread. Each tick claims the oldest
//! queued job, streams it into `{models_dir}/{name}.download` and renames
//! it into place once complete. Cancellation is cooperative: the worker
//! re-reads the row at every progress checkpoint and stops as soon as it is
//! no longer `downloading`.

pub mod control;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wingman_config::WingmanConfig;
use wingman_db::SharedDatabase;
use wingman_types::download::compute_progress;
use wingman_types::format::{format_speed, sanitize_error};
use wingman_types::{
    sys_error, sys_info, sys_warn, DownloadItem, DownloadStatus, ServiceState, DOWNLOAD_SERVICE,
};

pub use control::{
    cancel_download, enqueue_download, list_downloaded_models, model_path, partial_path,
    reset_download, verify_downloads, CancelOutcome, DownloadedModel, EnqueueOutcome,
};

/// Longest error text stored on a job.
pub const MAX_ERROR_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub hub_base_url: String,
    pub models_dir: PathBuf,
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl DownloadSettings {
    pub fn from_config(config: &WingmanConfig) -> Self {
        Self {
            hub_base_url: config.download.hub_base_url.clone(),
            models_dir: config.models_dir(),
            poll_interval: Duration::from_millis(config.download.poll_interval_ms),
            progress_interval: Duration::from_millis(config.download.progress_interval_ms),
            chunk_size: config.download.chunk_size,
            connect_timeout: Duration::from_secs(config.download.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.download.read_timeout_secs),
        }
    }
}

/// How a claimed job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Complete(DownloadItem),
    Cancelled(DownloadItem),
    Failed(DownloadItem),
    /// The worker is shutting down; the row stays `downloading` and is
    /// requeued by recovery on the next start.
    Interrupted,
}

/// `{base}/{repo}/resolve/main/{file}` with each path segment percent-encoded.
pub fn download_url(hub_base_url: &str, model_repo: &str, file_path: &str) -> String {
    let encoded = file_path
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!(
        "{}/{model_repo}/resolve/main/{encoded}",
        hub_base_url.trim_end_matches('/')
    )
}

pub struct DownloadWorker {
    db: SharedDatabase,
    settings: DownloadSettings,
    agent: ureq::Agent,
}

impl DownloadWorker {
    pub fn new(db: SharedDatabase, settings: DownloadSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(settings.connect_timeout)
            .timeout_read(settings.read_timeout)
            .user_agent("wingman/0.1")
            .build();
        Self {
            db,
            settings,
            agent,
        }
    }

    /// Run the polling loop on its own OS thread until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Result<JoinHandle<()>, String> {
        std::thread::Builder::new()
            .name("download-worker".to_string())
            .spawn(move || self.run(&shutdown))
            .map_err(|e| format!("Failed to start download worker thread: {e}"))
    }

    pub fn run(&self, shutdown: &CancellationToken) {
        sys_info!(
            "[DOWNLOAD] Worker started, polling every {:?}",
            self.settings.poll_interval
        );
        self.set_service(ServiceState::Ready, None, None);

        while !shutdown.is_cancelled() {
            if self.tick(shutdown).is_some() {
                continue;
            }
            sleep_unless_cancelled(self.settings.poll_interval, shutdown);
        }

        self.set_service(ServiceState::Stopped, None, None);
        sys_info!("[DOWNLOAD] Worker stopped");
    }

    /// Claim and process at most one job. `None` when nothing was claimed.
    pub fn tick(&self, shutdown: &CancellationToken) -> Option<DownloadOutcome> {
        let item = match self.db.claim_next_download() {
            Ok(Some(item)) => item,
            Ok(None) => return None,
            Err(e) => {
                sys_error!("[DOWNLOAD] Failed to claim next job: {}", e);
                return None;
            }
        };

        sys_info!("[DOWNLOAD] Starting {}/{}", item.model_repo, item.file_path);
        self.set_service(ServiceState::Downloading, Some(&item), None);

        let outcome = match self.transfer(item.clone(), shutdown) {
            Ok(outcome) => outcome,
            Err(message) => self.fail(&item, &message),
        };

        match &outcome {
            DownloadOutcome::Complete(done) => {
                sys_info!(
                    "[DOWNLOAD] Finished {}/{} ({} bytes)",
                    done.model_repo,
                    done.file_path,
                    done.downloaded_bytes
                );
                self.set_service(ServiceState::Ready, None, None);
            }
            DownloadOutcome::Cancelled(row) => {
                sys_info!(
                    "[DOWNLOAD] Stopped {}/{} at {} bytes",
                    row.model_repo,
                    row.file_path,
                    row.downloaded_bytes
                );
                self.set_service(ServiceState::Ready, None, None);
            }
            DownloadOutcome::Failed(row) => {
                self.set_service(ServiceState::Error, Some(row), row.error.clone());
            }
            DownloadOutcome::Interrupted => {}
        }
        Some(outcome)
    }

    fn transfer(
        &self,
        mut item: DownloadItem,
        shutdown: &CancellationToken,
    ) -> Result<DownloadOutcome, String> {
        let url = download_url(&self.settings.hub_base_url, &item.model_repo, &item.file_path);
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                return Err(format!("HTTP {code}: {}", response.status_text()));
            }
            Err(e) => return Err(format!("Download failed: {e}")),
        };

        let total: u64 = response
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        item.total_bytes = total;

        let models_dir = &self.settings.models_dir;
        std::fs::create_dir_all(models_dir)
            .map_err(|e| format!("Cannot create {}: {e}", models_dir.display()))?;
        let partial = partial_path(models_dir, &item.model_repo, &item.file_path);
        let dest = model_path(models_dir, &item.model_repo, &item.file_path);
        let mut file = std::fs::File::create(&partial)
            .map_err(|e| format!("Cannot create {}: {e}", partial.display()))?;

        let mut reader = response.into_reader();
        let mut buf = vec![0u8; self.settings.chunk_size.max(1)];
        let mut last_tick = Instant::now();
        let mut last_bytes = 0u64;

        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(format!("Read error: {e}")),
            };
            file.write_all(&buf[..n])
                .map_err(|e| format!("Write error: {e}"))?;
            item.downloaded_bytes += n as u64;

            let elapsed = last_tick.elapsed();
            if elapsed >= self.settings.progress_interval {
                let delta = item.downloaded_bytes - last_bytes;
                if let Some(stop) = self.checkpoint(&mut item, elapsed, delta, shutdown)? {
                    return Ok(stop);
                }
                last_tick = Instant::now();
                last_bytes = item.downloaded_bytes;
            }
        }

        file.flush().map_err(|e| format!("Write error: {e}"))?;
        drop(file);

        if total > 0 && item.downloaded_bytes != total {
            return Err(format!(
                "Transfer incomplete: received {} of {total} bytes",
                item.downloaded_bytes
            ));
        }

        item.status = DownloadStatus::Complete;
        item.total_bytes = item.downloaded_bytes;
        item.progress = 100.0;
        item.download_speed = String::new();
        item.error = None;

        // The row decides first; a file only goes live for a `complete` row.
        let Some(stored) = self
            .db
            .update_download_item_if(&item, &[DownloadStatus::Downloading])?
        else {
            sys_info!(
                "[DOWNLOAD] {}/{} was stopped after its last chunk, discarding it",
                item.model_repo,
                item.file_path
            );
            discard(&partial);
            return Ok(self.cancelled(&item));
        };

        if let Err(e) = std::fs::rename(&partial, &dest) {
            let text = sanitize_error(&format!("Cannot move download into place: {e}"), MAX_ERROR_CHARS);
            sys_error!("[DOWNLOAD] {}/{}: {}", item.model_repo, item.file_path, text);
            discard(&partial);
            return Ok(match self.db.transition_download_item(
                &item.model_repo,
                &item.file_path,
                DownloadStatus::Error,
                &[DownloadStatus::Complete],
                Some(&text),
            )? {
                Some(row) => DownloadOutcome::Failed(row),
                None => self.cancelled(&item),
            });
        }
        Ok(DownloadOutcome::Complete(stored))
    }

    /// Throttled progress write. `Some` means the transfer must stop.
    fn checkpoint(
        &self,
        item: &mut DownloadItem,
        elapsed: Duration,
        delta: u64,
        shutdown: &CancellationToken,
    ) -> Result<Option<DownloadOutcome>, String> {
        if shutdown.is_cancelled() {
            sys_info!(
                "[DOWNLOAD] Shutdown during {}/{}, leaving it for recovery",
                item.model_repo,
                item.file_path
            );
            return Ok(Some(DownloadOutcome::Interrupted));
        }

        match self.db.get_download_item(&item.model_repo, &item.file_path)? {
            Some(row) if row.status == DownloadStatus::Downloading => {}
            Some(row) => return Ok(Some(DownloadOutcome::Cancelled(row))),
            None => {
                sys_warn!(
                    "[DOWNLOAD] {}/{} was reset while downloading",
                    item.model_repo,
                    item.file_path
                );
                let mut gone = item.clone();
                gone.status = DownloadStatus::Cancelled;
                return Ok(Some(DownloadOutcome::Cancelled(gone)));
            }
        }

        item.progress = compute_progress(item.downloaded_bytes, item.total_bytes);
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { delta as f64 / secs } else { 0.0 };
        item.download_speed = format_speed(speed);

        match self.db.update_download_progress(item)? {
            Some(stored) => {
                self.set_service(ServiceState::Downloading, Some(&stored), None);
                Ok(None)
            }
            None => Ok(Some(self.cancelled(item))),
        }
    }

    fn cancelled(&self, item: &DownloadItem) -> DownloadOutcome {
        let row = self
            .db
            .get_download_item(&item.model_repo, &item.file_path)
            .ok()
            .flatten()
            .unwrap_or_else(|| item.clone());
        DownloadOutcome::Cancelled(row)
    }

    fn fail(&self, item: &DownloadItem, message: &str) -> DownloadOutcome {
        let text = sanitize_error(message, MAX_ERROR_CHARS);
        sys_error!(
            "[DOWNLOAD] {}/{} failed: {}",
            item.model_repo,
            item.file_path,
            text
        );
        match self.db.transition_download_item(
            &item.model_repo,
            &item.file_path,
            DownloadStatus::Error,
            &[DownloadStatus::Downloading],
            Some(&text),
        ) {
            Ok(Some(row)) => DownloadOutcome::Failed(row),
            Ok(None) => self.cancelled(item),
            Err(e) => {
                sys_error!("[DOWNLOAD] Could not record failure: {}", e);
                let mut failed = item.clone();
                failed.status = DownloadStatus::Error;
                failed.error = Some(text);
                DownloadOutcome::Failed(failed)
            }
        }
    }

    fn set_service(&self, state: ServiceState, current: Option<&DownloadItem>, error: Option<String>) {
        let current = current.and_then(|item| serde_json::to_value(item).ok());
        if let Err(e) = self
            .db
            .update_service_state(DOWNLOAD_SERVICE, state, current, error)
        {
            sys_warn!("[DOWNLOAD] Failed to update service status: {}", e);
        }
    }
}

fn discard(partial: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(partial) {
        if e.kind() != std::io::ErrorKind::NotFound {
            sys_warn!("[DOWNLOAD] Could not remove {}: {}", partial.display(), e);
        }
    }
}

fn sleep_unless_cancelled(total: Duration, shutdown: &CancellationToken) {
    let slice = Duration::from_millis(100);
    let started = Instant::now();
    while !shutdown.is_cancelled() && started.elapsed() < total {
        std::thread::sleep(slice.min(total.saturating_sub(started.elapsed())));
    }
}
