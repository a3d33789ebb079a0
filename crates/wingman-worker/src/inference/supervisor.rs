//! Inference process supervisor.
//!
//! Owns every running engine process, keyed by alias. A start request
//! reserves the alias in the store, spawns the engine with piped output and
//! waits for the readiness sentinel. Output lines are scanned for known
//! fault signatures while the process runs:
//!
//! * load failures (out of memory, start failures) mark the job `error` and
//!   kill the process, with no restart;
//! * a GPU command buffer fault writes a kill marker, cancels the job, runs
//!   the reset executable once and queues an automatic restart of the same
//!   request, up to `max_auto_restarts` times per alias.
//!
//! A monitor task applies `cancelling` rows written by stop requests and
//! performs queued restarts.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wingman_config::WingmanConfig;
use wingman_db::{current_timestamp_millis, SharedDatabase};
use wingman_types::format::sanitize_error;
use wingman_types::{
    sys_debug, sys_error, sys_info, sys_warn, validate_model_key, ExecutableVariant,
    ServiceState, WingmanItem, WingmanStatus, WINGMAN_SERVICE,
};

use super::context::resolve_context_size;
use super::faults::{detect_fault, FaultAction, FaultMatch, INFERENCE_FAULTS};
use super::metrics_relay::spawn_metrics_relay;
use crate::download::{model_path, MAX_ERROR_CHARS};
use crate::net::is_port_free;

/// Live statuses a fault or an exit may still overwrite. `cancelling` is
/// left for the stop path.
const RUNNING: [WingmanStatus; 3] = [
    WingmanStatus::Queued,
    WingmanStatus::Preparing,
    WingmanStatus::Inferring,
];

const EXIT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub models_dir: PathBuf,
    pub data_dir: PathBuf,
    pub inference_executable: PathBuf,
    pub reset_executable: PathBuf,
    /// Interface the engine listens on, also stored on each job.
    pub address: String,
    pub base_port: u16,
    pub default_context_size: u32,
    pub max_context_size: u32,
    pub readiness_timeout: Duration,
    pub monitor_interval: Duration,
    pub readiness_sentinel: String,
    pub max_auto_restarts: u32,
    pub metrics_reconnect: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &WingmanConfig, variant: ExecutableVariant) -> Self {
        let inference = &config.inference;
        Self {
            models_dir: config.models_dir(),
            data_dir: config.data_dir(),
            inference_executable: config.inference_executable(variant),
            reset_executable: config.reset_executable(variant),
            address: "127.0.0.1".to_string(),
            base_port: inference.base_port,
            default_context_size: inference.default_context_size,
            max_context_size: inference.max_context_size,
            readiness_timeout: Duration::from_secs(inference.readiness_timeout_secs),
            monitor_interval: Duration::from_millis(inference.monitor_interval_ms),
            readiness_sentinel: inference.readiness_sentinel.clone(),
            max_auto_restarts: inference.max_auto_restarts,
            metrics_reconnect: Duration::from_millis(inference.metrics_reconnect_ms),
        }
    }

    pub fn kill_marker_path(&self, alias: &str) -> PathBuf {
        self.data_dir.join(format!("{alias}.kill"))
    }
}

fn default_gpu_layers() -> i32 {
    -1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub alias: String,
    pub model_repo: String,
    pub file_path: String,
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: i32,
    #[serde(default)]
    pub context_size: Option<u32>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Replace a running job with the same alias instead of refusing.
    #[serde(default)]
    pub force: bool,
}

impl StartRequest {
    pub fn new(alias: &str, model_repo: &str, file_path: &str) -> Self {
        Self {
            alias: alias.to_string(),
            model_repo: model_repo.to_string(),
            file_path: file_path.to_string(),
            gpu_layers: default_gpu_layers(),
            context_size: None,
            port: None,
            force: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid start request: {0}")]
    InvalidRequest(String),
    #[error("alias '{0}' is already running")]
    AlreadyRunning(String),
    #[error("start of '{0}' was cancelled")]
    Cancelled(String),
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("no free port at or above {0}")]
    NoPort(u16),
    #[error("failed to spawn inference process: {0}")]
    Spawn(String),
    #[error("'{alias}' did not become ready within {secs}s")]
    ReadinessTimeout { alias: String, secs: u64 },
    #[error("model failed to load: {0}")]
    LoadFailed(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("start task failed: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopping(WingmanItem),
    NotActive(WingmanItem),
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
enum Readiness {
    Pending,
    Ready,
    Failed(String),
}

struct ProcessEntry {
    generation: u64,
    request: StartRequest,
    port: u16,
    metrics_port: u16,
    readiness: watch::Sender<Readiness>,
    fault: Mutex<Option<String>>,
    load_failed: AtomicBool,
    forced_reset: AtomicBool,
    kill: CancellationToken,
    exited: CancellationToken,
}

impl ProcessEntry {
    fn settle(&self, outcome: Readiness) {
        self.readiness.send_if_modified(|current| {
            if *current == Readiness::Pending {
                *current = outcome;
                true
            } else {
                false
            }
        });
    }

    fn fault_text(&self) -> Option<String> {
        lock(&self.fault).clone()
    }
}

struct Inner {
    db: SharedDatabase,
    settings: SupervisorSettings,
    processes: Mutex<HashMap<String, Arc<ProcessEntry>>>,
    restart_counts: Mutex<HashMap<String, u32>>,
    restart_tx: mpsc::UnboundedSender<StartRequest>,
    restart_rx: Mutex<Option<mpsc::UnboundedReceiver<StartRequest>>>,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(db: SharedDatabase, settings: SupervisorSettings) -> Self {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            inner: Arc::new(Inner {
                db,
                settings,
                processes: Mutex::new(HashMap::new()),
                restart_counts: Mutex::new(HashMap::new()),
                restart_tx,
                restart_rx: Mutex::new(Some(restart_rx)),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        };
        supervisor.set_service(ServiceState::Ready, None, None);
        supervisor
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn list(&self) -> Result<Vec<WingmanItem>, String> {
        self.inner.db.list_wingman_items()
    }

    pub fn status(&self, alias: &str) -> Result<Option<WingmanItem>, String> {
        self.inner.db.get_wingman_item(alias)
    }

    pub fn is_running(&self, alias: &str) -> bool {
        lock(&self.inner.processes).contains_key(alias)
    }

    pub fn running_aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = lock(&self.inner.processes).keys().cloned().collect();
        aliases.sort();
        aliases
    }

    fn entry(&self, alias: &str) -> Option<Arc<ProcessEntry>> {
        lock(&self.inner.processes).get(alias).cloned()
    }

    /// Start an engine for `request` and wait until it is ready.
    ///
    /// The launch runs on its own task: a caller that goes away mid-load
    /// leaves the job to finish, and the outcome still lands in the store.
    pub async fn start(&self, request: StartRequest) -> Result<WingmanItem, SupervisorError> {
        lock(&self.inner.restart_counts).remove(&request.alias);
        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.launch(request).await })
            .await
            .unwrap_or_else(|e| Err(SupervisorError::Internal(e.to_string())))
    }

    async fn launch(&self, request: StartRequest) -> Result<WingmanItem, SupervisorError> {
        let settings = &self.inner.settings;
        let db = &self.inner.db;

        if request.alias.trim().is_empty() {
            return Err(SupervisorError::InvalidRequest("alias must not be empty".to_string()));
        }
        validate_model_key(&request.model_repo, &request.file_path)
            .map_err(SupervisorError::InvalidRequest)?;
        let alias = request.alias.clone();

        let live_row = db
            .get_wingman_item(&alias)
            .map_err(SupervisorError::Store)?
            .filter(|item| item.status.is_active());
        if live_row.is_some() || self.is_running(&alias) {
            if !request.force {
                return Err(SupervisorError::AlreadyRunning(alias));
            }
            sys_info!("[SUPERVISOR] Replacing running '{}'", alias);
            self.stop_and_wait(&alias).await?;
        }

        let mut item = WingmanItem::new(
            &alias,
            &request.model_repo,
            &request.file_path,
            current_timestamp_millis(),
        );
        item.address = settings.address.clone();
        item.gpu_layers = request.gpu_layers;
        item.force = request.force;
        let mut item = match db.reserve_wingman_item(&item).map_err(SupervisorError::Store)? {
            Ok(stored) => stored,
            Err(_) => return Err(SupervisorError::AlreadyRunning(alias)),
        };

        let model = model_path(&settings.models_dir, &request.model_repo, &request.file_path);
        if !model.exists() {
            let shown = model.display().to_string();
            self.fail_row(&alias, &format!("model file not found: {shown}"));
            return Err(SupervisorError::ModelNotFound(shown));
        }
        let exe = &settings.inference_executable;
        if !exe.exists() {
            let shown = exe.display().to_string();
            self.fail_row(&alias, &format!("inference executable not found: {shown}"));
            return Err(SupervisorError::ExecutableNotFound(shown));
        }

        item.context_size = resolve_context_size(
            request.context_size,
            settings.default_context_size,
            settings.max_context_size,
            &model,
        );
        let (port, metrics_port) = match self.allocate_ports(request.port) {
            Ok(ports) => ports,
            Err(e) => {
                self.fail_row(&alias, &e.to_string());
                return Err(e);
            }
        };
        item.port = port;
        item.metrics_port = metrics_port;

        let marker = settings.kill_marker_path(&alias);
        if let Err(e) = std::fs::remove_file(&marker) {
            if e.kind() != std::io::ErrorKind::NotFound {
                sys_warn!("[SUPERVISOR] Could not clear kill marker {}: {}", marker.display(), e);
            }
        }

        sys_info!(
            "[SUPERVISOR] Starting '{}' ({}/{}) on port {}, ctx {}",
            alias,
            request.model_repo,
            request.file_path,
            port,
            item.context_size
        );
        let spawned = Command::new(exe)
            .arg("--port")
            .arg(port.to_string())
            .arg("--metrics-port")
            .arg(metrics_port.to_string())
            .arg("--model")
            .arg(&model)
            .arg("--alias")
            .arg(&alias)
            .arg("--ctx-size")
            .arg(item.context_size.to_string())
            .arg("--gpu-layers")
            .arg(request.gpu_layers.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let text = e.to_string();
                self.fail_row(&alias, &format!("failed to spawn inference process: {text}"));
                return Err(SupervisorError::Spawn(text));
            }
        };

        let (readiness, mut ready_rx) = watch::channel(Readiness::Pending);
        let entry = Arc::new(ProcessEntry {
            generation: self.inner.next_generation.fetch_add(1, Ordering::SeqCst),
            request: request.clone(),
            port,
            metrics_port,
            readiness,
            fault: Mutex::new(None),
            load_failed: AtomicBool::new(false),
            forced_reset: AtomicBool::new(false),
            kill: CancellationToken::new(),
            exited: CancellationToken::new(),
        });
        lock(&self.inner.processes).insert(alias.clone(), entry.clone());
        if let Some(stdout) = child.stdout.take() {
            self.spawn_output_reader(stdout, entry.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_output_reader(stderr, entry.clone());
        }
        self.spawn_exit_watcher(child, entry.clone());

        item.status = WingmanStatus::Preparing;
        let item = match db.update_wingman_item_if(&item, &[WingmanStatus::Queued]) {
            Ok(Some(item)) => item,
            Ok(None) => {
                sys_info!("[SUPERVISOR] '{}' was stopped before it started", alias);
                self.kill_and_wait(&entry).await;
                return Err(SupervisorError::Cancelled(alias));
            }
            Err(e) => {
                self.kill_and_wait(&entry).await;
                return Err(SupervisorError::Store(e));
            }
        };
        self.set_service(ServiceState::Preparing, Some(&item), None);

        let settled = tokio::time::timeout(
            settings.readiness_timeout,
            ready_rx.wait_for(|state| *state != Readiness::Pending),
        )
        .await
        .ok()
        .map(|result| match result {
            Ok(state) => state.clone(),
            Err(_) => Readiness::Failed("inference process went away".to_string()),
        });
        let Some(outcome) = settled else {
            let secs = settings.readiness_timeout.as_secs();
            sys_warn!("[SUPERVISOR] '{}' not ready after {}s, killing it", alias, secs);
            self.mark_failed(
                &entry,
                &format!("inference process did not become ready within {secs}s"),
            );
            self.kill_and_wait(&entry).await;
            return Err(SupervisorError::ReadinessTimeout { alias, secs });
        };

        match outcome {
            Readiness::Ready => self.promote(&entry, item).await,
            Readiness::Failed(_) if self.stopped_while_loading(&entry) => {
                sys_info!("[SUPERVISOR] '{}' was stopped while loading", alias);
                Err(SupervisorError::Cancelled(alias))
            }
            Readiness::Failed(text) => Err(SupervisorError::LoadFailed(text)),
            Readiness::Pending => Err(SupervisorError::LoadFailed(
                "inference process never reported ready".to_string(),
            )),
        }
    }

    fn stopped_while_loading(&self, entry: &ProcessEntry) -> bool {
        if entry.forced_reset.load(Ordering::SeqCst) || entry.load_failed.load(Ordering::SeqCst) {
            return false;
        }
        matches!(
            self.inner.db.get_wingman_item(&entry.request.alias),
            Ok(Some(row)) if matches!(row.status, WingmanStatus::Cancelling | WingmanStatus::Cancelled)
        )
    }

    /// `preparing -> inferring` once the engine reported ready.
    async fn promote(
        &self,
        entry: &Arc<ProcessEntry>,
        item: WingmanItem,
    ) -> Result<WingmanItem, SupervisorError> {
        let alias = item.alias.clone();
        let promoted = self
            .inner
            .db
            .transition_wingman_item(&alias, WingmanStatus::Inferring, &[WingmanStatus::Preparing], None)
            .map_err(SupervisorError::Store)?;
        let Some(item) = promoted else {
            // Stopped while loading; the monitor or the stop path owns it now.
            sys_info!("[SUPERVISOR] '{}' became ready after a stop request", alias);
            self.kill_and_wait(entry).await;
            return Err(SupervisorError::Cancelled(alias));
        };

        sys_info!(
            "[SUPERVISOR] '{}' is inferring on {}:{}",
            alias,
            item.address,
            item.port
        );
        self.set_service(ServiceState::Inferring, Some(&item), None);
        spawn_metrics_relay(
            self.inner.db.clone(),
            alias,
            format!("ws://{}:{}", item.address, item.metrics_port),
            self.inner.settings.metrics_reconnect,
            entry.exited.clone(),
        );
        Ok(item)
    }

    fn allocate_ports(&self, requested: Option<u16>) -> Result<(u16, u16), SupervisorError> {
        let port = match requested.filter(|p| *p > 0) {
            Some(port) => port,
            None => self.free_port(self.inner.settings.base_port, &[])?,
        };
        let metrics_port = self.free_port(port.saturating_add(1), &[port])?;
        Ok((port, metrics_port))
    }

    /// First bindable port at or above `from` that no supervised engine has
    /// been handed yet.
    fn free_port(&self, from: u16, exclude: &[u16]) -> Result<u16, SupervisorError> {
        let mut taken: Vec<u16> = lock(&self.inner.processes)
            .values()
            .flat_map(|entry| [entry.port, entry.metrics_port])
            .collect();
        taken.extend_from_slice(exclude);
        let host = &self.inner.settings.address;
        (from.max(1)..=u16::MAX)
            .find(|port| !taken.contains(port) && is_port_free(host, *port))
            .ok_or(SupervisorError::NoPort(from))
    }

    fn spawn_output_reader<R>(&self, stream: R, entry: Arc<ProcessEntry>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        supervisor.inspect_line(&entry, line.trim_end());
                    }
                }
            }
        });
    }

    fn inspect_line(&self, entry: &Arc<ProcessEntry>, line: &str) {
        if line.is_empty() {
            return;
        }
        sys_debug!("[{}] {}", entry.request.alias, line);
        if line.contains(&self.inner.settings.readiness_sentinel) {
            entry.settle(Readiness::Ready);
        }
        if let Some(fault) = detect_fault(line, &INFERENCE_FAULTS) {
            self.handle_fault(entry, fault);
        }
    }

    fn handle_fault(&self, entry: &Arc<ProcessEntry>, fault: FaultMatch) {
        let alias = &entry.request.alias;
        match fault.action {
            FaultAction::ForcedReset => {
                if entry.forced_reset.swap(true, Ordering::SeqCst) {
                    return;
                }
                sys_warn!("[SUPERVISOR] GPU fault in '{}': {}", alias, fault.line);
                *lock(&entry.fault) = Some(fault.line.clone());
                entry.settle(Readiness::Failed(fault.line));
                let supervisor = self.clone();
                let entry = entry.clone();
                tokio::spawn(async move { supervisor.forced_reset(entry).await });
            }
            FaultAction::FlagLoadFailure | FaultAction::ReportFatal => {
                if entry.forced_reset.load(Ordering::SeqCst)
                    || entry.load_failed.load(Ordering::SeqCst)
                {
                    return;
                }
                sys_error!("[SUPERVISOR] '{}' failed ({:?}): {}", alias, fault.category, fault.line);
                self.mark_failed(entry, &fault.line);
                entry.kill.cancel();
            }
        }
    }

    /// Record a terminal failure on the job and the service, then release
    /// anyone waiting for readiness.
    fn mark_failed(&self, entry: &Arc<ProcessEntry>, text: &str) {
        if entry.load_failed.swap(true, Ordering::SeqCst) {
            return;
        }
        let text = sanitize_error(text, MAX_ERROR_CHARS);
        *lock(&entry.fault) = Some(text.clone());
        self.fail_row(&entry.request.alias, &text);
        entry.settle(Readiness::Failed(text));
    }

    /// Move a live row to `error` and mirror it on the service status.
    fn fail_row(&self, alias: &str, text: &str) {
        let text = sanitize_error(text, MAX_ERROR_CHARS);
        match self
            .inner
            .db
            .transition_wingman_item(alias, WingmanStatus::Error, &RUNNING, Some(&text))
        {
            Ok(Some(item)) => self.set_service(ServiceState::Error, Some(&item), Some(text)),
            Ok(None) => {}
            Err(e) => sys_warn!("[SUPERVISOR] Failed to record error for '{}': {}", alias, e),
        }
    }

    async fn forced_reset(&self, entry: Arc<ProcessEntry>) {
        let alias = entry.request.alias.clone();
        let settings = &self.inner.settings;
        let db = &self.inner.db;

        let marker = settings.kill_marker_path(&alias);
        let written = std::fs::create_dir_all(&settings.data_dir)
            .and_then(|_| std::fs::write(&marker, current_timestamp_millis().to_string()));
        if let Err(e) = written {
            sys_warn!("[SUPERVISOR] Could not write kill marker {}: {}", marker.display(), e);
        }

        if let Err(e) = db.transition_wingman_item(
            &alias,
            WingmanStatus::Cancelled,
            &WingmanStatus::ACTIVE,
            None,
        ) {
            sys_warn!("[SUPERVISOR] Failed to cancel '{}': {}", alias, e);
        }
        self.kill_and_wait(&entry).await;
        self.run_reset().await;

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let attempt = {
            let mut counts = lock(&self.inner.restart_counts);
            let count = counts.entry(alias.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let max = settings.max_auto_restarts;
        if attempt <= max {
            sys_info!("[SUPERVISOR] Restarting '{}' after reset ({}/{})", alias, attempt, max);
            let mut request = entry.request.clone();
            request.force = true;
            if self.inner.restart_tx.send(request).is_err() {
                sys_warn!("[SUPERVISOR] Restart queue closed, '{}' stays down", alias);
            }
        } else {
            let text = format!("'{alias}' kept faulting after {max} automatic restarts");
            sys_error!("[SUPERVISOR] {}", text);
            self.set_service(ServiceState::Error, None, Some(text));
        }
    }

    async fn run_reset(&self) {
        let exe = &self.inner.settings.reset_executable;
        if !exe.exists() {
            sys_warn!("[SUPERVISOR] Reset executable {} missing, skipping reset", exe.display());
            return;
        }
        sys_info!("[SUPERVISOR] Running {}", exe.display());
        match Command::new(exe)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => sys_info!("[SUPERVISOR] Reset finished: {}", status),
            Err(e) => sys_error!("[SUPERVISOR] Reset failed to run: {}", e),
        }
    }

    fn spawn_exit_watcher(&self, mut child: Child, entry: Arc<ProcessEntry>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = entry.kill.cancelled() => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|s| s.code());
            supervisor.on_exit(&entry, code);
            entry.exited.cancel();
        });
    }

    fn on_exit(&self, entry: &Arc<ProcessEntry>, code: Option<i32>) {
        let alias = &entry.request.alias;
        let db = &self.inner.db;
        let now_idle = {
            let mut table = lock(&self.inner.processes);
            if table.get(alias).map(|e| e.generation) == Some(entry.generation) {
                table.remove(alias);
            }
            table.is_empty()
        };

        let exit_text = match code {
            Some(code) => format!("inference process exited with code {code}"),
            None => "inference process was terminated".to_string(),
        };
        sys_info!("[SUPERVISOR] '{}': {}", alias, exit_text);
        entry.settle(Readiness::Failed(
            entry.fault_text().unwrap_or_else(|| exit_text.clone()),
        ));

        if entry.forced_reset.load(Ordering::SeqCst) || entry.load_failed.load(Ordering::SeqCst) {
            return;
        }

        let stopped = db.transition_wingman_item(
            alias,
            WingmanStatus::Cancelled,
            &[WingmanStatus::Cancelling],
            None,
        );
        if !matches!(stopped, Ok(Some(_))) {
            if code == Some(0) {
                let _ = db.transition_wingman_item(alias, WingmanStatus::Complete, &RUNNING, None);
            } else {
                let text = entry.fault_text().unwrap_or(exit_text);
                if let Ok(Some(_)) = db.transition_wingman_item(
                    alias,
                    WingmanStatus::Error,
                    &RUNNING,
                    Some(&sanitize_error(&text, MAX_ERROR_CHARS)),
                ) {
                    self.set_service(ServiceState::Error, None, Some(text));
                    return;
                }
            }
        }

        if now_idle && !self.inner.shutting_down.load(Ordering::SeqCst) {
            self.set_service(ServiceState::Ready, None, None);
        }
    }

    async fn kill_and_wait(&self, entry: &ProcessEntry) {
        entry.kill.cancel();
        if tokio::time::timeout(EXIT_GRACE, entry.exited.cancelled())
            .await
            .is_err()
        {
            sys_warn!(
                "[SUPERVISOR] '{}' did not exit within {}s of being killed",
                entry.request.alias,
                EXIT_GRACE.as_secs()
            );
        }
    }

    /// Cancel whatever runs under `alias` and wait for the process to go.
    async fn stop_and_wait(&self, alias: &str) -> Result<(), SupervisorError> {
        let db = &self.inner.db;
        db.transition_wingman_item(alias, WingmanStatus::Cancelling, &RUNNING, None)
            .map_err(SupervisorError::Store)?;
        if let Some(entry) = self.entry(alias) {
            self.kill_and_wait(&entry).await;
        }
        db.transition_wingman_item(alias, WingmanStatus::Cancelled, &WingmanStatus::ACTIVE, None)
            .map_err(SupervisorError::Store)?;
        Ok(())
    }

    /// Ask for `alias` to stop. The monitor kills the process and finishes
    /// the `cancelling -> cancelled` transition.
    pub fn stop(&self, alias: &str) -> Result<StopOutcome, String> {
        let db = &self.inner.db;
        let Some(existing) = db.get_wingman_item(alias)? else {
            return Ok(StopOutcome::NotFound);
        };
        if existing.status == WingmanStatus::Cancelling {
            return Ok(StopOutcome::Stopping(existing));
        }
        match db.transition_wingman_item(alias, WingmanStatus::Cancelling, &RUNNING, None)? {
            Some(item) => {
                sys_info!("[SUPERVISOR] Stop requested for '{}'", alias);
                Ok(StopOutcome::Stopping(item))
            }
            None => Ok(StopOutcome::NotActive(
                db.get_wingman_item(alias)?.unwrap_or(existing),
            )),
        }
    }

    /// Run the reconcile loop until `shutdown` fires.
    pub fn spawn_monitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let supervisor = self.clone();
        let restarts = lock(&self.inner.restart_rx).take();
        if restarts.is_none() {
            sys_warn!("[SUPERVISOR] Monitor already running, restarts go to the first one");
        }
        tokio::spawn(async move { supervisor.monitor(restarts, shutdown).await })
    }

    async fn monitor(
        &self,
        mut restarts: Option<mpsc::UnboundedReceiver<StartRequest>>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.inner.settings.monitor_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        sys_info!("[SUPERVISOR] Monitor started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(request) = next_restart(&mut restarts) => {
                    let supervisor = self.clone();
                    tokio::spawn(async move {
                        let alias = request.alias.clone();
                        if let Err(e) = supervisor.launch(request).await {
                            sys_error!("[SUPERVISOR] Automatic restart of '{}' failed: {}", alias, e);
                        }
                    });
                }
                _ = ticker.tick() => self.reconcile_cancellations().await,
            }
        }
        sys_info!("[SUPERVISOR] Monitor stopped");
    }

    async fn reconcile_cancellations(&self) {
        let rows = match self
            .inner
            .db
            .list_wingman_items_with_status(WingmanStatus::Cancelling)
        {
            Ok(rows) => rows,
            Err(e) => {
                sys_warn!("[SUPERVISOR] Failed to list cancelling jobs: {}", e);
                return;
            }
        };
        for row in rows {
            if let Some(entry) = self.entry(&row.alias) {
                self.kill_and_wait(&entry).await;
            }
            if let Ok(Some(_)) = self.inner.db.transition_wingman_item(
                &row.alias,
                WingmanStatus::Cancelled,
                &[WingmanStatus::Cancelling],
                None,
            ) {
                sys_info!("[SUPERVISOR] '{}' stopped", row.alias);
            }
        }
    }

    /// Cancel every job, kill every engine and wait for them to exit.
    pub async fn shutdown_all(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let entries: Vec<Arc<ProcessEntry>> =
            lock(&self.inner.processes).values().cloned().collect();
        self.set_service(ServiceState::Stopping, None, None);

        for entry in &entries {
            let _ = self.inner.db.transition_wingman_item(
                &entry.request.alias,
                WingmanStatus::Cancelled,
                &WingmanStatus::ACTIVE,
                None,
            );
            entry.kill.cancel();
        }
        for entry in &entries {
            self.kill_and_wait(entry).await;
        }

        sys_info!("[SUPERVISOR] Stopped {} inference process(es)", entries.len());
        self.set_service(ServiceState::Stopped, None, None);
    }

    fn set_service(&self, state: ServiceState, current: Option<&WingmanItem>, error: Option<String>) {
        let current = current.and_then(|item| serde_json::to_value(item).ok());
        if let Err(e) = self
            .inner
            .db
            .update_service_state(WINGMAN_SERVICE, state, current, error)
        {
            sys_warn!("[SUPERVISOR] Failed to update service status: {}", e);
        }
    }
}

async fn next_restart(
    restarts: &mut Option<mpsc::UnboundedReceiver<StartRequest>>,
) -> Option<StartRequest> {
    match restarts {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
