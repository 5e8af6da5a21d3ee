//! HTTP API: canonical envelopes and the router.
//!
//! Every response is `{success, data, meta}`. Validation errors map to 400
//! with `VALIDATION_ERROR`, missing resources to 404, unimplemented
//! actions to 501, and everything else to an opaque 500 (details logged).

pub mod actions;
pub mod chat;
pub mod data;
pub mod health;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use mira_domain::Error;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat::chat))
        .route("/actions", post(actions::actions))
        .route("/data", get(data::data))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub(crate) fn success(data: Value) -> Response {
    Json(json!({
        "success": true,
        "data": data,
        "meta": {"timestamp": chrono::Utc::now().to_rfc3339()},
    }))
    .into_response()
}

pub(crate) fn failure(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": {"code": code, "message": message},
            "meta": {"timestamp": chrono::Utc::now().to_rfc3339()},
        })),
    )
        .into_response()
}

/// Map a domain error onto the canonical envelope. Internal details stay
/// in the logs.
pub(crate) fn error_response(error: &Error) -> Response {
    match error {
        Error::Validation(msg) => failure(StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg),
        Error::NotFound(msg) => failure(StatusCode::NOT_FOUND, "NOT_FOUND", msg),
        Error::PermissionDenied(msg) => failure(StatusCode::FORBIDDEN, "PERMISSION_DENIED", msg),
        other => {
            tracing::error!(error = %other, "request failed");
            failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred",
            )
        }
    }
}
