use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;
use std::path::PathBuf;
use wingman_worker::download::list_downloaded_models;

use crate::response_helpers::{json_error, json_response};

/// GET /api/models - model files on disk, decoded back into their keys.
pub async fn handle_get_models(models_dir: PathBuf) -> Result<Response<Body>, Infallible> {
    let listed = tokio::task::spawn_blocking(move || list_downloaded_models(&models_dir))
        .await
        .unwrap_or_else(|e| Err(format!("Model listing task failed: {e}")));
    Ok(match listed {
        Ok(models) => json_response(StatusCode::OK, &models),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e),
    })
}
