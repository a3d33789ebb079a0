use hyper::{Body, Response, StatusCode};
use std::convert::Infallible;

use crate::response_helpers::json_raw;

/// GET /health
pub async fn handle() -> Result<Response<Body>, Infallible> {
    Ok(json_raw(
        StatusCode::OK,
        r#"{"status":"ok","service":"wingman"}"#.to_string(),
    ))
}
