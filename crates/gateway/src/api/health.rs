//! `GET /health` — component status with latencies; 503 when any
//! component is unhealthy.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use std::time::Instant;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Response {
    let mut components = Vec::new();
    let mut healthy = true;

    // KV store: write/read probe.
    {
        let started = Instant::now();
        let probe_key = "health:probe";
        state.kv.setex(probe_key, 5, "ok");
        let ok = state.kv.get(probe_key).as_deref() == Some("ok");
        healthy &= ok;
        components.push(json!({
            "name": "kv",
            "healthy": ok,
            "latency_ms": started.elapsed().as_millis() as u64,
        }));
    }

    // Continuum repository: state dir readable.
    {
        let started = Instant::now();
        let ok = state.repo.load_or_create(state.user.user_id).is_ok();
        healthy &= ok;
        components.push(json!({
            "name": "continuum_repository",
            "healthy": ok,
            "latency_ms": started.elapsed().as_millis() as u64,
        }));
    }

    // LLM: credentials configured (no probe request; that would bill).
    {
        let ok = state.cfg.api.api_key.is_some() || state.cfg.api.emergency_fallback_enabled;
        healthy &= ok;
        components.push(json!({
            "name": "llm_provider",
            "healthy": ok,
            "detail": if ok { "configured" } else { "no API key configured" },
        }));
    }

    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "success": healthy,
            "data": {
                "healthy": healthy,
                "components": components,
                "uptime_secs": state.started_at.elapsed().as_secs(),
            },
            "meta": {"timestamp": chrono::Utc::now().to_rfc3339()},
        })),
    )
        .into_response()
}
