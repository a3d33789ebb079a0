// The `wingman_server` child process: spawning it, scanning its output until
// it reports ready, and stopping it.

use super::{LaunchError, LaunchSettings};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wingman_config::SERVICE_READY_SENTINEL;
use wingman_types::{sys_debug, sys_info, sys_warn, ExecutableVariant};
use wingman_worker::inference::{detect_fault, SERVICE_FAULTS};

/// Flag telling the service to shut down once its stdin closes.
pub const STDIN_LIFELINE_FLAG: &str = "--stdin-lifeline";

/// How long to keep reading output after an early exit, so a fault line that
/// raced the exit still gets reported.
const LATE_OUTPUT_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSignal {
    Ready,
    Fault(String),
}

/// Readiness or fault signal carried by one line of service output.
pub fn classify_line(line: &str) -> Option<ServiceSignal> {
    if line.contains(SERVICE_READY_SENTINEL) {
        return Some(ServiceSignal::Ready);
    }
    detect_fault(line, &SERVICE_FAULTS).map(|hit| ServiceSignal::Fault(hit.line))
}

pub fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by a signal".to_string(),
    }
}

/// A service that has printed its readiness line.
#[derive(Debug)]
pub struct RunningService {
    child: Child,
    lifeline: Option<ChildStdin>,
}

impl RunningService {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&mut self) -> Option<i32> {
        self.child.wait().await.ok().and_then(|status| status.code())
    }

    /// Close the lifeline and give the service `grace` to wind down its
    /// inference processes before killing it.
    pub async fn stop(mut self, grace: Duration) {
        drop(self.lifeline.take());
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => sys_info!("[LAUNCHER] Service stopped ({})", status),
            Ok(Err(e)) => sys_warn!("[LAUNCHER] Waiting for the service failed: {}", e),
            Err(_) => {
                sys_warn!("[LAUNCHER] Service ignored shutdown, killing it");
                if let Err(e) = self.child.kill().await {
                    sys_warn!("[LAUNCHER] Kill failed: {}", e);
                }
            }
        }
    }
}

enum Step {
    Signal(ServiceSignal),
    StreamsClosed,
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

fn spawn_scanner<R>(stream: R, signals: mpsc::UnboundedSender<ServiceSignal>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    sys_debug!("[SERVICE] {}", line);
                    if let Some(signal) = classify_line(line) {
                        // Nobody listens once startup is over; the scanner
                        // keeps draining so the pipe never fills up.
                        let _ = signals.send(signal);
                    }
                }
            }
        }
    });
}

async fn late_fault(signals: &mut mpsc::UnboundedReceiver<ServiceSignal>) -> Option<String> {
    while let Ok(Some(signal)) = tokio::time::timeout(LATE_OUTPUT_WINDOW, signals.recv()).await {
        if let ServiceSignal::Fault(line) = signal {
            return Some(line);
        }
    }
    None
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        sys_warn!("[LAUNCHER] Kill failed: {}", e);
    }
}

/// Spawn the service on `port` and wait until it reports ready.
pub async fn start_service(
    settings: &LaunchSettings,
    variant: ExecutableVariant,
    port: u16,
    cancel: &CancellationToken,
) -> Result<RunningService, LaunchError> {
    let mut command = Command::new(&settings.service_executable);
    command
        .arg("--variant")
        .arg(variant.as_str())
        .arg("--port")
        .arg(port.to_string())
        .arg("--home")
        .arg(&settings.config.home)
        .arg(STDIN_LIFELINE_FLAG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
        what: "service",
        source,
    })?;
    sys_info!(
        "[LAUNCHER] Spawned {} (pid {:?}) on port {}",
        settings.service_executable.display(),
        child.id(),
        port
    );

    let (signals_tx, mut signals) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        spawn_scanner(stdout, signals_tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_scanner(stderr, signals_tx);
    }
    let lifeline = child.stdin.take();

    let deadline = tokio::time::sleep(settings.service_ready_timeout);
    tokio::pin!(deadline);
    let mut streams_open = true;

    loop {
        let step = tokio::select! {
            signal = signals.recv(), if streams_open => match signal {
                Some(signal) => Step::Signal(signal),
                None => Step::StreamsClosed,
            },
            status = child.wait() => Step::Exited(status.ok().and_then(|s| s.code())),
            _ = &mut deadline => Step::TimedOut,
            _ = cancel.cancelled() => Step::Cancelled,
        };

        match step {
            Step::Signal(ServiceSignal::Ready) => {
                return Ok(RunningService { child, lifeline });
            }
            Step::Signal(ServiceSignal::Fault(line)) => {
                kill(&mut child).await;
                return Err(LaunchError::ServiceFault(line));
            }
            Step::StreamsClosed => streams_open = false,
            Step::Exited(code) => {
                if let Some(line) = late_fault(&mut signals).await {
                    return Err(LaunchError::ServiceFault(line));
                }
                return Err(LaunchError::ServiceExited(describe_exit(code)));
            }
            Step::TimedOut => {
                kill(&mut child).await;
                return Err(LaunchError::ServiceTimeout {
                    secs: settings.service_ready_timeout.as_secs(),
                });
            }
            Step::Cancelled => {
                kill(&mut child).await;
                return Err(LaunchError::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_ready_line() {
        assert_eq!(
            classify_line("wingman service ready 127.0.0.1:49152"),
            Some(ServiceSignal::Ready)
        );
        assert_eq!(classify_line("2024-01-01 - INFO - [SERVER] listening"), None);
    }

    #[test]
    fn test_classify_fatal_lines() {
        let missing = "wingman_server: error while loading shared libraries: libcudart.so.12";
        assert_eq!(
            classify_line(missing),
            Some(ServiceSignal::Fault(missing.to_string()))
        );
        assert!(matches!(
            classify_line("zsh: illegal hardware instruction  ./wingman_server"),
            Some(ServiceSignal::Fault(_))
        ));
        // Engine-only faults do not stop the service from launching.
        assert_eq!(classify_line("CUDA error: out of memory"), None);
    }

    #[test]
    fn test_describe_exit() {
        assert_eq!(describe_exit(Some(3)), "exit code 3");
        assert_eq!(describe_exit(None), "terminated by a signal");
    }
}
