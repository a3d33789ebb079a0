use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;
use wingman_db::SharedDatabase;

use crate::response_helpers::{json_error, json_response};

/// GET /api/services - DownloadService and WingmanService rows.
pub async fn handle_get_services(db: SharedDatabase) -> Result<Response<Body>, Infallible> {
    Ok(match db.list_service_statuses() {
        Ok(statuses) => json_response(StatusCode::OK, &statuses),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e),
    })
}
