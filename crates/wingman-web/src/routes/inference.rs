/// Inference job control.
///
/// GET  /api/inference                 - every inference row
/// POST /api/inference/start           - StartRequest, waits for readiness
/// POST /api/inference/stop  { alias }
/// GET  /api/inference/status?alias=
use hyper::{Body, Request, Response, StatusCode};
use serde::Deserialize;
use std::convert::Infallible;
use wingman_types::sys_warn;
use wingman_worker::{StartRequest, StopOutcome, Supervisor, SupervisorError};

use crate::request_parsing::{parse_json_body, require_query_param};
use crate::response_helpers::{json_error, json_response};

#[derive(Debug, Deserialize)]
struct StopRequest {
    alias: String,
}

fn error_status(error: &SupervisorError) -> StatusCode {
    match error {
        SupervisorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SupervisorError::AlreadyRunning(_) | SupervisorError::Cancelled(_) => StatusCode::CONFLICT,
        SupervisorError::ModelNotFound(_) | SupervisorError::ExecutableNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        SupervisorError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        SupervisorError::LoadFailed(_)
        | SupervisorError::NoPort(_)
        | SupervisorError::Spawn(_)
        | SupervisorError::Store(_)
        | SupervisorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn handle_get_inference(supervisor: Supervisor) -> Result<Response<Body>, Infallible> {
    Ok(match supervisor.list() {
        Ok(items) => json_response(StatusCode::OK, &items),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e),
    })
}

pub async fn handle_post_start(
    req: Request<Body>,
    supervisor: Supervisor,
) -> Result<Response<Body>, Infallible> {
    let request: StartRequest = match parse_json_body(req.into_body()).await {
        Ok(request) => request,
        Err(response) => return Ok(response),
    };
    let alias = request.alias.clone();
    Ok(match supervisor.start(request).await {
        Ok(item) => json_response(StatusCode::OK, &item),
        Err(e) => {
            sys_warn!("[INFERENCE] Start of '{}' failed: {}", alias, e);
            json_error(error_status(&e), &e.to_string())
        }
    })
}

pub async fn handle_post_stop(
    req: Request<Body>,
    supervisor: Supervisor,
) -> Result<Response<Body>, Infallible> {
    let request: StopRequest = match parse_json_body(req.into_body()).await {
        Ok(request) => request,
        Err(response) => return Ok(response),
    };
    Ok(match supervisor.stop(&request.alias) {
        Ok(StopOutcome::Stopping(item)) => json_response(StatusCode::OK, &item),
        Ok(StopOutcome::NotActive(item)) => json_error(
            StatusCode::CONFLICT,
            &format!("'{}' is {}, not running", item.alias, item.status.as_str()),
        ),
        Ok(StopOutcome::NotFound) => json_error(StatusCode::NOT_FOUND, "Alias not found"),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e),
    })
}

pub async fn handle_get_status(
    req: Request<Body>,
    supervisor: Supervisor,
) -> Result<Response<Body>, Infallible> {
    let alias = match require_query_param(req.uri(), "alias") {
        Ok(alias) => alias,
        Err(response) => return Ok(response),
    };
    Ok(match supervisor.status(&alias) {
        Ok(Some(item)) => json_response(StatusCode::OK, &item),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Alias not found"),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&SupervisorError::AlreadyRunning("chat".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&SupervisorError::ModelNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&SupervisorError::ReadinessTimeout {
                alias: "chat".into(),
                secs: 1
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_status(&SupervisorError::LoadFailed("oom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            error_status(&SupervisorError::Cancelled("chat".into())),
            StatusCode::CONFLICT
        );
    }
}
