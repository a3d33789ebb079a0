// Orchestration service: job store, download worker, inference supervisor and
// the HTTP/WebSocket control surface on one port.
//
// Usage: wingman_server [--variant cuda|metal|vulkan|cpu] [--port N] [--home DIR] [--stdin-lifeline]

use anyhow::{anyhow, Context};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use wingman::launcher::service::STDIN_LIFELINE_FLAG;
use wingman::logging::setup_logging;
use wingman_config::{arg_value, WingmanConfig, SERVICE_READY_SENTINEL};
use wingman_db::{Database, StatusFeed};
use wingman_types::{sys_info, sys_warn, ExecutableVariant};
use wingman_web::{spawn_server, AppState};
use wingman_worker::gpu::{detect_gpu_vendors, select_variant};
use wingman_worker::{DownloadSettings, DownloadWorker, InstanceLock, Supervisor, SupervisorSettings};

#[derive(Debug, PartialEq, Eq)]
struct ServerArgs {
    home: Option<PathBuf>,
    variant: Option<ExecutableVariant>,
    port: Option<u16>,
    /// Exit once stdin closes; set by the launcher.
    lifeline: bool,
}

fn parse_args(args: &[String]) -> anyhow::Result<ServerArgs> {
    let variant = match arg_value(args, "--variant") {
        Some(value) => Some(
            ExecutableVariant::parse(&value).ok_or_else(|| anyhow!("unknown variant '{value}'"))?,
        ),
        None => None,
    };
    let port = arg_value(args, "--port")
        .map(|value| {
            value
                .parse::<u16>()
                .with_context(|| format!("invalid --port '{value}'"))
        })
        .transpose()?;

    Ok(ServerArgs {
        home: arg_value(args, "--home").map(PathBuf::from),
        variant,
        port,
        lifeline: args.iter().any(|arg| arg == STDIN_LIFELINE_FLAG),
    })
}

async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

async fn shutdown_signal(lifeline: bool) {
    let lifeline_closed = async {
        if lifeline {
            stdin_closed().await;
        } else {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                sys_warn!("[SERVER] Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => sys_info!("[SERVER] Interrupted"),
        _ = lifeline_closed => sys_info!("[SERVER] Launcher went away"),
        _ = terminate => sys_info!("[SERVER] Terminated"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let raw_args: Vec<String> = std::env::args().collect();
    let args = parse_args(&raw_args)?;

    let config = WingmanConfig::load(args.home.as_deref()).map_err(anyhow::Error::msg)?;
    config.ensure_dirs().map_err(anyhow::Error::msg)?;
    if let Err(e) = setup_logging(&config.logs_dir(), "wingman_server", config.log_level_filter()) {
        eprintln!("Failed to set up logging: {e}");
    }
    let _lock = InstanceLock::acquire(&config.data_dir(), "wingman_server")?;

    let variant = match args.variant {
        Some(variant) => variant,
        None => select_variant(std::env::consts::OS, &detect_gpu_vendors()),
    };
    sys_info!(
        "[SERVER] Home {}, {} inference build",
        config.home.display(),
        variant
    );

    let db = Arc::new(
        Database::with_feed(
            &config.db_path().to_string_lossy(),
            StatusFeed::new(config.feed.capacity),
        )
        .map_err(anyhow::Error::msg)?,
    );
    let shutdown = CancellationToken::new();

    let worker = Arc::new(DownloadWorker::new(db.clone(), DownloadSettings::from_config(&config)));
    let worker_thread = worker.spawn(shutdown.clone()).map_err(anyhow::Error::msg)?;

    let supervisor = Supervisor::new(db.clone(), SupervisorSettings::from_config(&config, variant));
    let monitor = supervisor.spawn_monitor(shutdown.clone());

    let port = args.port.unwrap_or(config.server.port);
    let addr: SocketAddr = format!("{}:{}", config.server.host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.server.host, port))?;
    let state = AppState::new(db.clone(), supervisor.clone(), &config);
    let (bound, server) = spawn_server(state, addr, shutdown.clone()).map_err(anyhow::Error::msg)?;

    // The launcher waits for this line.
    println!("{SERVICE_READY_SENTINEL} {bound}");
    sys_info!("[SERVER] Listening on http://{}", bound);

    shutdown_signal(args.lifeline).await;

    sys_info!("[SERVER] Shutting down");
    supervisor.shutdown_all().await;
    shutdown.cancel();
    if let Err(e) = monitor.await {
        sys_warn!("[SERVER] Monitor task failed: {}", e);
    }
    if let Err(e) = server.await {
        sys_warn!("[SERVER] HTTP server task failed: {}", e);
    }
    match tokio::task::spawn_blocking(move || worker_thread.join()).await {
        Ok(Ok(())) => {}
        _ => sys_warn!("[SERVER] Download worker did not stop cleanly"),
    }
    sys_info!("[SERVER] Stopped");
    Ok(())
}
