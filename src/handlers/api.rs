//! Health and statistics handlers.

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use serde_json::{Value, json};

use crate::state::AppState;

/// `GET /health`
///
/// Reports per-component state. Returns 503 with `"initializing"` while a
/// mandatory component (VAD pool, session manager) is absent; the speaker
/// module reports `disabled` when not configured without affecting overall
/// health.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let vad_pool = match &state.vad_pool {
        Some(pool) => serde_json::to_value(pool.stats()).unwrap_or_default(),
        None => json!({"status": "not_initialized"}),
    };
    let sessions = match &state.session_manager {
        Some(manager) => serde_json::to_value(manager.stats()).unwrap_or_default(),
        None => json!({"status": "not_initialized"}),
    };
    let speaker = match &state.speaker {
        Some(manager) => serde_json::to_value(manager.stats().await).unwrap_or_default(),
        None => json!({"status": "disabled"}),
    };

    let (status_code, status) = if state.is_initialized() {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "initializing")
    };

    let body = json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
        "components": {
            "vad_pool": vad_pool,
            "sessions": sessions,
            "speaker": speaker,
        },
    });

    (status_code, Json(body))
}

/// `GET /stats` — aggregated counters.
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut body = json!({
        "timestamp": Utc::now().to_rfc3339(),
    });
    if let Some(pool) = &state.vad_pool {
        if let Ok(stats) = serde_json::to_value(pool.stats()) {
            body["vad_pool"] = stats;
        }
    }
    if let Some(manager) = &state.session_manager {
        if let Ok(stats) = serde_json::to_value(manager.stats()) {
            body["sessions"] = stats;
        }
    }
    if let Some(manager) = &state.speaker {
        if let Ok(stats) = serde_json::to_value(manager.stats().await) {
            body["speaker"] = stats;
        }
    }
    Json(body)
}
