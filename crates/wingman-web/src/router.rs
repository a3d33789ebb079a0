// HTTP control surface: shared state, path dispatch and the hyper server.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wingman_config::WingmanConfig;
use wingman_db::SharedDatabase;
use wingman_types::{sys_debug, sys_error, sys_info};
use wingman_worker::Supervisor;

use crate::response_helpers::{cors_preflight, json_error};
use crate::routes;

#[derive(Clone)]
pub struct AppState {
    pub db: SharedDatabase,
    pub supervisor: Supervisor,
    pub models_dir: PathBuf,
    pub ping_interval: Duration,
}

impl AppState {
    pub fn new(db: SharedDatabase, supervisor: Supervisor, config: &WingmanConfig) -> Self {
        Self {
            db,
            supervisor,
            models_dir: config.models_dir(),
            ping_interval: Duration::from_secs(config.feed.ping_interval_secs.max(1)),
        }
    }
}

pub async fn handle_request(
    req: Request<Body>,
    state: AppState,
) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    sys_debug!("[HTTP] {} {}", method, path);

    match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => Ok(cors_preflight()),
        (&Method::GET, "/health") => routes::health::handle().await,

        (&Method::GET, "/api/downloads") => routes::downloads::handle_get_downloads(state.db).await,
        (&Method::GET, "/api/downloads/item") => {
            routes::downloads::handle_get_item(req, state.db).await
        }
        (&Method::POST, "/api/downloads/enqueue") => {
            routes::downloads::handle_post_enqueue(req, state.db, state.models_dir).await
        }
        (&Method::POST, "/api/downloads/cancel") => {
            routes::downloads::handle_post_cancel(req, state.db).await
        }
        (&Method::POST, "/api/downloads/reset") => {
            routes::downloads::handle_post_reset(req, state.db, state.models_dir).await
        }
        (&Method::POST, "/api/downloads/verify") => {
            routes::downloads::handle_post_verify(state.db, state.models_dir).await
        }

        (&Method::GET, "/api/models") => routes::models::handle_get_models(state.models_dir).await,

        (&Method::GET, "/api/inference") => {
            routes::inference::handle_get_inference(state.supervisor).await
        }
        (&Method::POST, "/api/inference/start") => {
            routes::inference::handle_post_start(req, state.supervisor).await
        }
        (&Method::POST, "/api/inference/stop") => {
            routes::inference::handle_post_stop(req, state.supervisor).await
        }
        (&Method::GET, "/api/inference/status") => {
            routes::inference::handle_get_status(req, state.supervisor).await
        }

        (&Method::GET, "/api/services") => routes::services::handle_get_services(state.db).await,

        (&Method::GET, "/ws/status") => {
            let feed = state.db.feed().clone();
            routes::status::handle_status_websocket(req, feed, state.ping_interval).await
        }

        _ => Ok(json_error(StatusCode::NOT_FOUND, "Not found")),
    }
}

/// Bind `addr` and serve until `shutdown` fires. Returns the bound address,
/// which differs from `addr` when it asked for port 0.
pub fn spawn_server(
    state: AppState,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>), String> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone())))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| format!("Failed to bind {addr}: {e}"))?
        .serve(make_svc);
    let bound = server.local_addr();
    sys_info!("[HTTP] Listening on http://{}", bound);

    let handle = tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = graceful.await {
            sys_error!("[HTTP] Server error: {}", e);
        }
        sys_info!("[HTTP] Server stopped");
    });
    Ok((bound, handle))
}
