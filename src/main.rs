// Launcher binary: boots `wingman_server` for this machine and reports
// progress to the hosting shell as one JSON event per stdout line.
//
// Usage: wingman [--home DIR]

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use wingman::launcher::{EventSink, LaunchSettings, Launcher, LauncherEvent};
use wingman::logging::setup_logging;
use wingman_config::{arg_value, executable_file_name, WingmanConfig};
use wingman_types::{sys_info, sys_warn};
use wingman_worker::InstanceLock;

fn emit_to_shell(event: &LauncherEvent) {
    if let LauncherEvent::Navigate { url } = event {
        sys_info!("[LAUNCHER] Ready at {}", url);
    }
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => sys_warn!("[LAUNCHER] Cannot encode event {:?}: {}", event, e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let home = arg_value(&args, "--home").map(PathBuf::from);

    let config = WingmanConfig::load(home.as_deref()).map_err(anyhow::Error::msg)?;
    config.ensure_dirs().map_err(anyhow::Error::msg)?;
    if let Err(e) = setup_logging(&config.logs_dir(), "wingman", config.log_level_filter()) {
        eprintln!("Failed to set up logging: {e}");
    }
    let _lock = InstanceLock::acquire(&config.data_dir(), "wingman")?;

    let service_executable = std::env::current_exe()
        .context("cannot locate the launcher executable")?
        .with_file_name(executable_file_name("wingman_server"));

    let (sink, mut events) = EventSink::channel();
    let launcher = Arc::new(Launcher::new(
        LaunchSettings::from_config(&config, service_executable),
        sink,
    ));
    let launch = tokio::spawn({
        let launcher = launcher.clone();
        async move { launcher.launch().await }
    });

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut stopping = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    emit_to_shell(&event);
                    if event == LauncherEvent::Exited {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut interrupted, if !stopping => {
                stopping = true;
                let launcher = launcher.clone();
                tokio::spawn(async move {
                    launcher.shutdown().await;
                });
            }
        }
    }

    if let Err(e) = launch.await {
        sys_warn!("[LAUNCHER] Launch task failed: {}", e);
    }
    Ok(())
}
