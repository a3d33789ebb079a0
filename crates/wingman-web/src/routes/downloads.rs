/// Download job control.
///
/// GET  /api/downloads                          - every download row
/// GET  /api/downloads/item?modelRepo&filePath  - one row or 404
/// POST /api/downloads/enqueue  { modelRepo, filePath }
/// POST /api/downloads/cancel   { modelRepo, filePath }
/// POST /api/downloads/reset    { modelRepo, filePath }
/// POST /api/downloads/verify   - drop complete rows whose file is gone
use hyper::{Body, Request, Response, StatusCode};
use serde::Deserialize;
use std::convert::Infallible;
use std::path::PathBuf;
use wingman_db::SharedDatabase;
use wingman_types::validate_model_key;
use wingman_worker::download::{
    cancel_download, enqueue_download, reset_download, verify_downloads, CancelOutcome,
    EnqueueOutcome,
};

use crate::request_parsing::{parse_json_body, require_query_param};
use crate::response_helpers::{json_error, json_response};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelKey {
    model_repo: String,
    file_path: String,
}

async fn read_key(req: Request<Body>) -> Result<ModelKey, Response<Body>> {
    let key: ModelKey = parse_json_body(req.into_body()).await?;
    validate_model_key(&key.model_repo, &key.file_path)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, &e))?;
    Ok(key)
}

fn internal(e: String) -> Response<Body> {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &e)
}

pub async fn handle_get_downloads(db: SharedDatabase) -> Result<Response<Body>, Infallible> {
    Ok(match db.list_download_items() {
        Ok(items) => json_response(StatusCode::OK, &items),
        Err(e) => internal(e),
    })
}

pub async fn handle_get_item(
    req: Request<Body>,
    db: SharedDatabase,
) -> Result<Response<Body>, Infallible> {
    let key = require_query_param(req.uri(), "modelRepo")
        .and_then(|repo| Ok((repo, require_query_param(req.uri(), "filePath")?)));
    let (model_repo, file_path) = match key {
        Ok(key) => key,
        Err(response) => return Ok(response),
    };
    Ok(match db.get_download_item(&model_repo, &file_path) {
        Ok(Some(item)) => json_response(StatusCode::OK, &item),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Download not found"),
        Err(e) => internal(e),
    })
}

/// 200 with the queued row, or 208 when the key is already queued,
/// downloading or complete on disk.
pub async fn handle_post_enqueue(
    req: Request<Body>,
    db: SharedDatabase,
    models_dir: PathBuf,
) -> Result<Response<Body>, Infallible> {
    let key = match read_key(req).await {
        Ok(key) => key,
        Err(response) => return Ok(response),
    };
    Ok(
        match enqueue_download(&db, &models_dir, &key.model_repo, &key.file_path) {
            Ok(EnqueueOutcome::Queued(item)) => json_response(StatusCode::OK, &item),
            Ok(EnqueueOutcome::AlreadyPresent(item)) => {
                json_response(StatusCode::ALREADY_REPORTED, &item)
            }
            Err(e) => internal(e),
        },
    )
}

pub async fn handle_post_cancel(
    req: Request<Body>,
    db: SharedDatabase,
) -> Result<Response<Body>, Infallible> {
    let key = match read_key(req).await {
        Ok(key) => key,
        Err(response) => return Ok(response),
    };
    Ok(match cancel_download(&db, &key.model_repo, &key.file_path) {
        Ok(CancelOutcome::Cancelled(item)) => json_response(StatusCode::OK, &item),
        Ok(CancelOutcome::NotActive(item)) => json_error(
            StatusCode::CONFLICT,
            &format!("Download is {}, not active", item.status.as_str()),
        ),
        Ok(CancelOutcome::NotFound) => json_error(StatusCode::NOT_FOUND, "Download not found"),
        Err(e) => internal(e),
    })
}

pub async fn handle_post_reset(
    req: Request<Body>,
    db: SharedDatabase,
    models_dir: PathBuf,
) -> Result<Response<Body>, Infallible> {
    let key = match read_key(req).await {
        Ok(key) => key,
        Err(response) => return Ok(response),
    };
    Ok(
        match reset_download(&db, &models_dir, &key.model_repo, &key.file_path) {
            Ok(removed) => json_response(
                StatusCode::OK,
                &serde_json::json!({ "success": true, "removed": removed }),
            ),
            Err(e) => internal(e),
        },
    )
}

pub async fn handle_post_verify(
    db: SharedDatabase,
    models_dir: PathBuf,
) -> Result<Response<Body>, Infallible> {
    let verified = tokio::task::spawn_blocking(move || verify_downloads(&db, &models_dir))
        .await
        .unwrap_or_else(|e| Err(format!("Verify task failed: {e}")));
    Ok(match verified {
        Ok(items) => json_response(StatusCode::OK, &items),
        Err(e) => internal(e),
    })
}
