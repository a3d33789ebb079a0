//! HTTP control surface and status WebSocket for `wingman_server`.

pub mod request_parsing;
pub mod response_helpers;
pub mod router;
pub mod routes;
pub mod websocket;
pub mod websocket_utils;

pub use router::{handle_request, spawn_server, AppState};
