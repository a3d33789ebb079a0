//! Host launcher: pick the inference build for this machine, start
//! `wingman_server` on a free port, optionally start the UI server, then
//! keep the service alive until the shell asks us to stop.
//!
//! Progress and failures go to the shell as [`LauncherEvent`]s. A failed
//! stage ends the launch attempt but never the shell.

pub mod events;
pub mod service;

pub use events::{EventSink, LauncherEvent};
pub use service::RunningService;

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use wingman_config::WingmanConfig;
use wingman_types::{sys_error, sys_info, sys_warn, ExecutableVariant};
use wingman_worker::gpu::{detect_gpu_vendors, select_variant};
use wingman_worker::net::{find_available_port, wait_for_port, PortError};

const LOCALHOST: &str = "127.0.0.1";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("service executable not found at {0}")]
    ServiceMissing(String),
    #[error("no {variant} inference executable at {path}")]
    InferenceMissing {
        variant: ExecutableVariant,
        path: String,
    },
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("service cannot run on this machine: {0}")]
    ServiceFault(String),
    #[error("service exited before it was ready ({0})")]
    ServiceExited(String),
    #[error("service was not ready after {secs}s")]
    ServiceTimeout { secs: u64 },
    #[error("UI server did not open port {port} within {secs}s")]
    UiTimeout { port: u16, secs: u64 },
    #[error("service kept crashing, gave up after {attempts} restarts")]
    RestartsExhausted { attempts: u32 },
    #[error("launcher task failed: {0}")]
    Internal(String),
    #[error("launch cancelled")]
    Cancelled,
}

impl LaunchError {
    fn is_cancelled(&self) -> bool {
        matches!(
            self,
            LaunchError::Cancelled | LaunchError::Port(PortError::Cancelled)
        )
    }
}

#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub config: WingmanConfig,
    pub service_executable: PathBuf,
    pub host: String,
    pub port_range: RangeInclusive<u16>,
    pub service_ready_timeout: Duration,
    pub max_service_restarts: u32,
    /// Program and arguments of the UI server; empty means no UI process.
    pub ui_command: Vec<String>,
    pub ui_ready_timeout: Duration,
    /// Time the service gets to exit after its lifeline closes.
    pub stop_grace: Duration,
}

impl LaunchSettings {
    pub fn from_config(config: &WingmanConfig, service_executable: PathBuf) -> Self {
        let launcher = &config.launcher;
        Self {
            config: config.clone(),
            service_executable,
            host: LOCALHOST.to_string(),
            port_range: launcher.port_range_start..=launcher.port_range_end,
            service_ready_timeout: Duration::from_secs(launcher.service_ready_timeout_secs),
            max_service_restarts: launcher.max_service_restarts,
            ui_command: launcher.ui_command.clone(),
            ui_ready_timeout: Duration::from_secs(launcher.ui_ready_timeout_secs),
            stop_grace: Duration::from_secs(10),
        }
    }
}

fn http_url(host: &str, port: u16) -> String {
    format!("http://{host}:{port}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Launcher {
    settings: LaunchSettings,
    events: EventSink,
    shutdown: CancellationToken,
    finished: CancellationToken,
    shutting_down: AtomicBool,
    ui: Mutex<Option<Child>>,
}

impl Launcher {
    pub fn new(settings: LaunchSettings, events: EventSink) -> Self {
        Self {
            settings,
            events,
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            ui: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &LaunchSettings {
        &self.settings
    }

    /// Run the launch sequence and keep the service alive until shutdown.
    /// Failures are reported to the shell, not returned.
    pub async fn launch(&self) {
        if let Err(e) = self.run().await {
            if e.is_cancelled() {
                sys_info!("[LAUNCHER] Launch cancelled");
            } else {
                sys_error!("[LAUNCHER] {}", e);
                self.events.emit(LauncherEvent::ReportError {
                    message: e.to_string(),
                });
            }
        }
        if self.shutdown.is_cancelled() {
            self.stop_ui().await;
        }
        self.finished.cancel();
    }

    /// Stop the UI server, then the service. Only the first call does
    /// anything; later calls return `false`.
    pub async fn shutdown(&self) -> bool {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.events.status("Shutting down");
        self.stop_ui().await;
        self.shutdown.cancel();

        let wait = self.settings.stop_grace + Duration::from_secs(1);
        if tokio::time::timeout(wait, self.finished.cancelled()).await.is_err() {
            sys_warn!("[LAUNCHER] Launch task still running after {:?}", wait);
        }
        self.events.emit(LauncherEvent::Exited);
        true
    }

    async fn run(&self) -> Result<(), LaunchError> {
        self.events.status("Detecting GPU");
        let vendors = tokio::task::spawn_blocking(detect_gpu_vendors)
            .await
            .unwrap_or_default();
        let variant = self.resolve_variant(select_variant(std::env::consts::OS, &vendors))?;
        self.events.status(format!("Using the {variant} inference build"));

        if !self.settings.service_executable.is_file() {
            return Err(LaunchError::ServiceMissing(
                self.settings.service_executable.display().to_string(),
            ));
        }

        let port = self.scan_ports(self.settings.port_range.clone()).await?;
        self.events.status(format!("Starting service on port {port}"));
        let service = service::start_service(&self.settings, variant, port, &self.shutdown).await?;
        self.events.status("Service ready");

        let url = match self.start_ui(port).await {
            Ok(Some(url)) => url,
            Ok(None) => http_url(&self.settings.host, port),
            Err(e) => {
                service.stop(self.settings.stop_grace).await;
                return Err(e);
            }
        };
        self.events.emit(LauncherEvent::Navigate { url });

        self.keep_alive(service, variant, port).await
    }

    /// The preferred build, or the CPU build when the preferred one is not
    /// installed.
    fn resolve_variant(
        &self,
        preferred: ExecutableVariant,
    ) -> Result<ExecutableVariant, LaunchError> {
        let config = &self.settings.config;
        let preferred_path = config.inference_executable(preferred);
        if preferred_path.is_file() {
            return Ok(preferred);
        }
        if preferred != ExecutableVariant::Cpu
            && config.inference_executable(ExecutableVariant::Cpu).is_file()
        {
            sys_warn!(
                "[LAUNCHER] {} build missing at {}, falling back to cpu",
                preferred,
                preferred_path.display()
            );
            return Ok(ExecutableVariant::Cpu);
        }
        Err(LaunchError::InferenceMissing {
            variant: preferred,
            path: preferred_path.display().to_string(),
        })
    }

    async fn scan_ports(&self, range: RangeInclusive<u16>) -> Result<u16, LaunchError> {
        let host = self.settings.host.clone();
        let cancel = self.shutdown.clone();
        tokio::task::spawn_blocking(move || find_available_port(&host, range, &cancel))
            .await
            .map_err(|e| LaunchError::Internal(e.to_string()))?
            .map_err(LaunchError::from)
    }

    async fn start_ui(&self, api_port: u16) -> Result<Option<String>, LaunchError> {
        let Some((program, args)) = self.settings.ui_command.split_first() else {
            return Ok(None);
        };
        let host = self.settings.host.as_str();
        let first = api_port
            .saturating_add(1)
            .max(*self.settings.port_range.start());
        let ui_port = self
            .scan_ports(first..=*self.settings.port_range.end())
            .await?;
        let api_url = http_url(host, api_port);

        self.events.status(format!("Starting UI on port {ui_port}"));
        let child = Command::new(program)
            .args(args)
            .env("PORT", ui_port.to_string())
            .env("WINGMAN_API_PORT", api_port.to_string())
            .env("WINGMAN_API_URL", &api_url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                what: "UI server",
                source,
            })?;
        *lock(&self.ui) = Some(child);

        let ready = tokio::select! {
            ready = wait_for_port(host, ui_port, self.settings.ui_ready_timeout) => ready,
            _ = self.shutdown.cancelled() => return Err(LaunchError::Cancelled),
        };
        if !ready {
            self.stop_ui().await;
            return Err(LaunchError::UiTimeout {
                port: ui_port,
                secs: self.settings.ui_ready_timeout.as_secs(),
            });
        }
        Ok(Some(http_url(host, ui_port)))
    }

    async fn stop_ui(&self) {
        let child = lock(&self.ui).take();
        if let Some(mut child) = child {
            sys_info!("[LAUNCHER] Stopping UI server");
            if let Err(e) = child.kill().await {
                sys_warn!("[LAUNCHER] Failed to stop UI server: {}", e);
            }
        }
    }

    /// Restart the service on the same port whenever it dies, up to the
    /// configured number of times.
    async fn keep_alive(
        &self,
        mut service: RunningService,
        variant: ExecutableVariant,
        port: u16,
    ) -> Result<(), LaunchError> {
        let mut attempt = 0;
        loop {
            let exited = tokio::select! {
                code = service.wait() => Some(code),
                _ = self.shutdown.cancelled() => None,
            };
            let Some(code) = exited else {
                service.stop(self.settings.stop_grace).await;
                return Ok(());
            };
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            sys_warn!(
                "[LAUNCHER] Service (pid {:?}) died: {}",
                service.id(),
                service::describe_exit(code)
            );
            attempt += 1;
            if attempt > self.settings.max_service_restarts {
                return Err(LaunchError::RestartsExhausted {
                    attempts: self.settings.max_service_restarts,
                });
            }
            self.events.emit(LauncherEvent::ServiceRestarted { attempt });
            service = service::start_service(&self.settings, variant, port, &self.shutdown).await?;
            self.events.status("Service ready");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::service::STDIN_LIFELINE_FLAG;
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;
    use wingman_config::executable_file_name;

    struct Fixture {
        dir: tempfile::TempDir,
        settings: LaunchSettings,
    }

    fn write_script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// A home with a cpu inference build and a fake service running `body`.
    fn fixture(body: &str, with_engine: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = WingmanConfig::with_home(dir.path().join("home"));
        config.ensure_dirs().unwrap();
        if with_engine {
            let engine = config.inference_executable(ExecutableVariant::Cpu);
            std::fs::create_dir_all(engine.parent().unwrap()).unwrap();
            write_script(&engine, "exit 0");
        }

        let service = dir.path().join(executable_file_name("fake_server"));
        let body = body.replace("{dir}", &dir.path().display().to_string());
        write_script(&service, &body);

        let mut settings = LaunchSettings::from_config(&config, service);
        settings.port_range = 47200..=47300;
        settings.service_ready_timeout = Duration::from_secs(5);
        settings.ui_ready_timeout = Duration::from_secs(1);
        settings.stop_grace = Duration::from_secs(2);
        settings.max_service_restarts = 1;
        Fixture { dir, settings }
    }

    fn start(
        settings: LaunchSettings,
    ) -> (
        Arc<Launcher>,
        UnboundedReceiver<LauncherEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (sink, rx) = EventSink::channel();
        let launcher = Arc::new(Launcher::new(settings, sink));
        let task = tokio::spawn({
            let launcher = launcher.clone();
            async move { launcher.launch().await }
        });
        (launcher, rx, task)
    }

    async fn next_event<F>(rx: &mut UnboundedReceiver<LauncherEvent>, wanted: F) -> LauncherEvent
    where
        F: Fn(&LauncherEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                let event = rx.recv().await.unwrap();
                if wanted(&event) {
                    return event;
                }
                assert!(
                    !matches!(event, LauncherEvent::ReportError { .. }),
                    "unexpected {event:?}"
                );
            }
        })
        .await
        .unwrap()
    }

    fn port_argument(args_line: &str) -> u16 {
        let words: Vec<&str> = args_line.split_whitespace().collect();
        let at = words.iter().position(|w| *w == "--port").unwrap();
        words[at + 1].parse().unwrap()
    }

    // Waits on stdin, so it exits as soon as the launcher drops the lifeline.
    const WELL_BEHAVED: &str = r#"echo "$@" >> "{dir}/args"
echo "wingman service ready"
read line"#;

    #[tokio::test]
    async fn test_navigates_to_service_without_ui() {
        let fx = fixture(WELL_BEHAVED, true);
        let (launcher, mut rx, task) = start(fx.settings.clone());

        let event = next_event(&mut rx, |e| matches!(e, LauncherEvent::Navigate { .. })).await;
        let args = std::fs::read_to_string(fx.dir.path().join("args")).unwrap();
        let port = port_argument(&args);
        assert!((47200..=47300).contains(&port));
        assert_eq!(
            event,
            LauncherEvent::Navigate {
                url: format!("http://127.0.0.1:{port}")
            }
        );
        assert!(args.contains("--variant cpu"));
        assert!(args.contains(STDIN_LIFELINE_FLAG));

        assert!(launcher.shutdown().await);
        assert!(!launcher.shutdown().await);
        next_event(&mut rx, |e| *e == LauncherEvent::Exited).await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_service_fault_is_reported() {
        let fx = fixture(
            r#"echo "wingman_server: error while loading shared libraries: libcudart.so.12" >&2
exit 127"#,
            true,
        );
        let (_launcher, mut rx, task) = start(fx.settings.clone());

        let message = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if let LauncherEvent::ReportError { message } = rx.recv().await.unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert!(message.contains("shared libraries"), "{message}");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_crashing_service_restarts_on_same_port() {
        let fx = fixture(
            r#"echo "$@" >> "{dir}/args"
echo "wingman service ready"
sleep 1
exit 1"#,
            true,
        );
        let (_launcher, mut rx, task) = start(fx.settings.clone());

        next_event(&mut rx, |e| matches!(e, LauncherEvent::Navigate { .. })).await;
        let restarted = next_event(&mut rx, |e| {
            matches!(e, LauncherEvent::ServiceRestarted { .. })
        })
        .await;
        assert_eq!(restarted, LauncherEvent::ServiceRestarted { attempt: 1 });

        let gave_up = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if let LauncherEvent::ReportError { message } = rx.recv().await.unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert!(gave_up.contains("gave up after 1 restarts"), "{gave_up}");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        let args = std::fs::read_to_string(fx.dir.path().join("args")).unwrap();
        let lines: Vec<&str> = args.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(port_argument(lines[0]), port_argument(lines[1]));
    }

    #[tokio::test]
    async fn test_missing_inference_build_is_reported() {
        let fx = fixture(WELL_BEHAVED, false);
        let (_launcher, mut rx, task) = start(fx.settings.clone());

        let message = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if let LauncherEvent::ReportError { message } = rx.recv().await.unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert!(message.contains("inference executable"), "{message}");
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!fx.dir.path().join("args").exists());
    }

    #[tokio::test]
    async fn test_ui_gets_ports_and_times_out() {
        let mut fx = fixture(WELL_BEHAVED, true);
        let env_file = fx.dir.path().join("ui_env");
        fx.settings.ui_command = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!(
                "echo \"$PORT $WINGMAN_API_PORT $WINGMAN_API_URL\" > {}; sleep 30",
                env_file.display()
            ),
        ];
        let (_launcher, mut rx, task) = start(fx.settings.clone());

        let message = tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                if let LauncherEvent::ReportError { message } = rx.recv().await.unwrap() {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert!(message.contains("UI server did not open port"), "{message}");
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();

        let api_port = port_argument(&std::fs::read_to_string(fx.dir.path().join("args")).unwrap());
        let env = std::fs::read_to_string(&env_file).unwrap();
        let fields: Vec<&str> = env.split_whitespace().collect();
        assert_eq!(fields.len(), 3);
        assert!(fields[0].parse::<u16>().unwrap() > api_port);
        assert_eq!(fields[1], api_port.to_string());
        assert_eq!(fields[2], format!("http://127.0.0.1:{api_port}"));
    }
}
