//! Runtime configuration for the Wingman binaries.
//!
//! Everything lives under one home directory:
//!
//! ```text
//! {home}/config.json   optional overrides, merged over the defaults
//! {home}/models/       downloaded model files
//! {home}/data/         SQLite store, lock files, kill markers
//! {home}/logs/         log4rs output
//! {home}/bin/{variant}/ inference + reset executables
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use wingman_types::{sys_info, sys_warn, ExecutableVariant};

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const HOME_ENV: &str = "WINGMAN_HOME";
pub const HUB_URL_ENV: &str = "WINGMAN_HUB_URL";
pub const LOG_LEVEL_ENV: &str = "WINGMAN_LOG_LEVEL";

/// Stdout line the inference engine prints once it accepts requests.
pub const INFERENCE_READY_SENTINEL: &str = "wingman inference ready";
/// Stdout line `wingman_server` prints once its HTTP listener is bound.
pub const SERVICE_READY_SENTINEL: &str = "wingman service ready";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WingmanConfig {
    /// Resolved home directory. Never read from the file itself.
    #[serde(skip)]
    pub home: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub launcher: LauncherConfig,

    #[serde(default)]
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Base URL of the model hub; files resolve at
    /// `{hub_base_url}/{repo}/resolve/main/{file}`.
    #[serde(default = "default_hub_base_url")]
    pub hub_base_url: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Minimum gap between progress writes.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// First port tried for an inference API when the request names none.
    #[serde(default = "default_inference_base_port")]
    pub base_port: u16,

    /// 0 means "read it from the model file".
    #[serde(default)]
    pub default_context_size: u32,

    #[serde(default = "default_max_context_size")]
    pub max_context_size: u32,

    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    #[serde(default = "default_inference_sentinel")]
    pub readiness_sentinel: String,

    /// Automatic restarts per alias after a forced reset.
    #[serde(default = "default_max_auto_restarts")]
    pub max_auto_restarts: u32,

    #[serde(default = "default_metrics_reconnect_ms")]
    pub metrics_reconnect_ms: u64,

    #[serde(default = "default_inference_executable")]
    pub executable_name: String,

    #[serde(default = "default_reset_executable")]
    pub reset_executable_name: String,

    /// Overrides `{home}/bin`.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    /// Used when `wingman_server` is started without `--port`.
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    #[serde(default = "default_service_ready_timeout_secs")]
    pub service_ready_timeout_secs: u64,

    #[serde(default = "default_max_service_restarts")]
    pub max_service_restarts: u32,

    /// UI server command line, e.g. `["node", "ui/server.js"]`. No UI
    /// process is started when empty; the launcher then navigates straight
    /// to the service.
    #[serde(default)]
    pub ui_command: Vec<String>,

    #[serde(default = "default_ui_ready_timeout_secs")]
    pub ui_ready_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_capacity")]
    pub capacity: usize,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_hub_base_url() -> String {
    "https://huggingface.co".to_string()
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_progress_interval_ms() -> u64 {
    1000
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_inference_base_port() -> u16 {
    6567
}

fn default_max_context_size() -> u32 {
    131_072
}

fn default_readiness_timeout_secs() -> u64 {
    300
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_inference_sentinel() -> String {
    INFERENCE_READY_SENTINEL.to_string()
}

fn default_max_auto_restarts() -> u32 {
    3
}

fn default_metrics_reconnect_ms() -> u64 {
    2000
}

fn default_inference_executable() -> String {
    "wingman_inference".to_string()
}

fn default_reset_executable() -> String {
    "wingman_reset".to_string()
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    6568
}

fn default_port_range_start() -> u16 {
    49152
}

fn default_port_range_end() -> u16 {
    65535
}

fn default_service_ready_timeout_secs() -> u64 {
    60
}

fn default_max_service_restarts() -> u32 {
    3
}

fn default_ui_ready_timeout_secs() -> u64 {
    30
}

fn default_feed_capacity() -> usize {
    256
}

fn default_ping_interval_secs() -> u64 {
    30
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            hub_base_url: default_hub_base_url(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_port: default_inference_base_port(),
            default_context_size: 0,
            max_context_size: default_max_context_size(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
            monitor_interval_ms: default_monitor_interval_ms(),
            readiness_sentinel: default_inference_sentinel(),
            max_auto_restarts: default_max_auto_restarts(),
            metrics_reconnect_ms: default_metrics_reconnect_ms(),
            executable_name: default_inference_executable(),
            reset_executable_name: default_reset_executable(),
            bin_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            service_ready_timeout_secs: default_service_ready_timeout_secs(),
            max_service_restarts: default_max_service_restarts(),
            ui_command: Vec::new(),
            ui_ready_timeout_secs: default_ui_ready_timeout_secs(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: default_feed_capacity(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl WingmanConfig {
    /// Defaults rooted at `home`, without touching the filesystem.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            log_level: default_log_level(),
            download: DownloadConfig::default(),
            inference: InferenceConfig::default(),
            server: ServerConfig::default(),
            launcher: LauncherConfig::default(),
            feed: FeedConfig::default(),
        }
    }

    /// Resolve the home directory, read `{home}/config.json` if present and
    /// apply environment overrides.
    pub fn load(home_override: Option<&Path>) -> Result<Self, String> {
        let home = resolve_home(home_override)?;
        let path = home.join(CONFIG_FILE_NAME);

        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
            let mut parsed: WingmanConfig = serde_json::from_str(&text)
                .map_err(|e| format!("Failed to parse {}: {e}", path.display()))?;
            parsed.home = home;
            sys_info!("[CONFIG] Loaded {}", path.display());
            parsed
        } else {
            Self::with_home(home)
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(HUB_URL_ENV) {
            let trimmed = url.trim().trim_end_matches('/');
            if !trimmed.is_empty() {
                self.download.hub_base_url = trimmed.to_string();
            }
        }
        if let Ok(level) = std::env::var(LOG_LEVEL_ENV) {
            let trimmed = level.trim();
            if !trimmed.is_empty() {
                self.log_level = trimmed.to_lowercase();
            }
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.home.join("models")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.inference
            .bin_dir
            .clone()
            .unwrap_or_else(|| self.home.join("bin"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("wingman.db")
    }

    /// `{bin_dir}/{variant}/{executable_name}`, with the platform suffix.
    pub fn inference_executable(&self, variant: ExecutableVariant) -> PathBuf {
        self.bin_dir()
            .join(variant.as_str())
            .join(executable_file_name(&self.inference.executable_name))
    }

    pub fn reset_executable(&self, variant: ExecutableVariant) -> PathBuf {
        self.bin_dir()
            .join(variant.as_str())
            .join(executable_file_name(&self.inference.reset_executable_name))
    }

    /// Create every directory the binaries write into.
    pub fn ensure_dirs(&self) -> Result<(), String> {
        for dir in [self.models_dir(), self.data_dir(), self.logs_dir(), self.bin_dir()] {
            std::fs::create_dir_all(&dir)
                .map_err(|e| format!("Failed to create {}: {e}", dir.display()))?;
        }
        Ok(())
    }

    /// Log level as understood by the `log` crate; unknown values fall back to info.
    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.log_level.as_str() {
            "off" => log::LevelFilter::Off,
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            "info" => log::LevelFilter::Info,
            other => {
                sys_warn!("[CONFIG] Unknown log level '{}', using info", other);
                log::LevelFilter::Info
            }
        }
    }
}

/// `--home`, then `WINGMAN_HOME`, then `~/.wingman`.
pub fn resolve_home(home_override: Option<&Path>) -> Result<PathBuf, String> {
    if let Some(home) = home_override {
        return Ok(home.to_path_buf());
    }
    if let Ok(from_env) = std::env::var(HOME_ENV) {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".wingman"))
        .ok_or_else(|| "Could not determine the user's home directory".to_string())
}

pub fn executable_file_name(name: &str) -> String {
    format!("{name}{}", std::env::consts::EXE_SUFFIX)
}

/// Pull `--flag value` out of an argument list.
pub fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|pair| pair[0] == flag)
        .map(|pair| pair[1].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WingmanConfig::with_home("/tmp/wm");
        assert_eq!(config.download.poll_interval_ms, 5000);
        assert_eq!(config.download.chunk_size, 65536);
        assert_eq!(config.inference.readiness_timeout_secs, 300);
        assert_eq!(config.launcher.port_range_start, 49152);
        assert_eq!(config.launcher.port_range_end, 65535);
        assert_eq!(config.feed.capacity, 256);
        assert_eq!(config.models_dir(), PathBuf::from("/tmp/wm/models"));
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/wm/data"));
    }

    #[test]
    fn test_partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"download":{"poll_interval_ms":10},"inference":{"max_auto_restarts":1}}"#,
        )
        .unwrap();

        let config = WingmanConfig::load(Some(dir.path())).unwrap();
        assert_eq!(config.home, dir.path());
        assert_eq!(config.download.poll_interval_ms, 10);
        assert_eq!(config.download.progress_interval_ms, 1000);
        assert_eq!(config.inference.max_auto_restarts, 1);
        assert_eq!(config.inference.readiness_sentinel, INFERENCE_READY_SENTINEL);
    }

    #[test]
    fn test_broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "{ nope").unwrap();
        assert!(WingmanConfig::load(Some(dir.path())).is_err());
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = WingmanConfig::with_home(dir.path());
        config.ensure_dirs().unwrap();
        assert!(config.models_dir().is_dir());
        assert!(config.data_dir().is_dir());
        assert!(config.logs_dir().is_dir());
        assert!(config.bin_dir().is_dir());
    }

    #[test]
    fn test_executable_layout() {
        let config = WingmanConfig::with_home("/opt/wm");
        let exe = config.inference_executable(ExecutableVariant::Cuda);
        assert!(exe.starts_with("/opt/wm/bin/cuda"));
        assert!(exe
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("wingman_inference"));
    }

    #[test]
    fn test_arg_value() {
        let args: Vec<String> = ["wingman_server", "--port", "5000", "--variant", "cpu"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(arg_value(&args, "--port").as_deref(), Some("5000"));
        assert_eq!(arg_value(&args, "--variant").as_deref(), Some("cpu"));
        assert_eq!(arg_value(&args, "--home"), None);
    }
}
