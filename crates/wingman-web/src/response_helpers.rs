// JSON response builders shared by every route. All of them carry the CORS
// headers so the UI can call the API from its own origin.

use hyper::http::response::Builder;
use hyper::{Body, Response, StatusCode};
use serde::Serialize;

const CORS_ORIGIN: &str = "*";
const CORS_METHODS: &str = "GET, POST, OPTIONS";
const CORS_HEADERS: &str = "content-type, authorization";

fn with_cors(status: StatusCode) -> Builder {
    Response::builder()
        .status(status)
        .header("access-control-allow-origin", CORS_ORIGIN)
        .header("access-control-allow-methods", CORS_METHODS)
        .header("access-control-allow-headers", CORS_HEADERS)
}

/// Serialize `body` as the response.
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let json = serde_json::to_string(body)
        .unwrap_or_else(|_| r#"{"error":"Serialization failed"}"#.to_string());
    json_raw(status, json)
}

/// `{"error": message}`
pub fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &serde_json::json!({ "error": message }))
}

pub fn json_raw(status: StatusCode, json: String) -> Response<Body> {
    with_cors(status)
        .header("content-type", "application/json")
        .body(Body::from(json))
        .unwrap()
}

pub fn empty_response(status: StatusCode) -> Response<Body> {
    with_cors(status).body(Body::empty()).unwrap()
}

pub fn cors_preflight() -> Response<Body> {
    empty_response(StatusCode::NO_CONTENT)
}
