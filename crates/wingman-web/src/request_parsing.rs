// Request body and query helpers for the route handlers.

use hyper::{Body, Response, StatusCode, Uri};
use serde::de::DeserializeOwned;
use wingman_types::{sys_debug, sys_warn};

use crate::response_helpers::json_error;

/// Read and deserialize a JSON body. On failure the `Err` is a ready-made
/// 400 response.
pub async fn parse_json_body<T: DeserializeOwned>(body: Body) -> Result<T, Response<Body>> {
    let bytes = hyper::body::to_bytes(body)
        .await
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "Failed to read request body"))?;

    if let Ok(text) = std::str::from_utf8(&bytes) {
        if !text.is_empty() {
            sys_debug!("[REQUEST] Body: {}", text);
        }
    }

    serde_json::from_slice::<T>(&bytes).map_err(|e| {
        sys_warn!("[REQUEST] JSON parsing error: {}", e);
        json_error(StatusCode::BAD_REQUEST, &format!("Invalid JSON: {e}"))
    })
}

/// URL-decoded value of query parameter `key`.
pub fn get_query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == key)
        .and_then(|(_, value)| {
            urlencoding::decode(&value.replace('+', " "))
                .ok()
                .map(|decoded| decoded.into_owned())
        })
}

/// Like [`get_query_param`], but a missing or empty value is a 400.
pub fn require_query_param(uri: &Uri, key: &str) -> Result<String, Response<Body>> {
    get_query_param(uri, key)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                &format!("Missing query parameter '{key}'"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Key {
        model_repo: String,
    }

    #[test]
    fn test_get_query_param() {
        let uri: Uri = "/api/downloads/item?modelRepo=org%2Fmodel&filePath=a.gguf"
            .parse()
            .unwrap();
        assert_eq!(get_query_param(&uri, "modelRepo").as_deref(), Some("org/model"));
        assert_eq!(get_query_param(&uri, "filePath").as_deref(), Some("a.gguf"));
        assert_eq!(get_query_param(&uri, "alias"), None);
    }

    #[test]
    fn test_require_query_param() {
        let uri: Uri = "/api/inference/status?alias=".parse().unwrap();
        let response = require_query_param(&uri, "alias").unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let uri: Uri = "/api/inference/status?alias=my+chat".parse().unwrap();
        assert_eq!(require_query_param(&uri, "alias").unwrap(), "my chat");
    }

    #[tokio::test]
    async fn test_parse_json_body() {
        let key: Key = parse_json_body(Body::from(r#"{"modelRepo":"org/model"}"#))
            .await
            .unwrap();
        assert_eq!(key.model_repo, "org/model");

        let response = parse_json_body::<Key>(Body::from("{")).await.err().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
