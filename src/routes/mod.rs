//! Router assembly.

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{api, speaker, ws};
use crate::state::AppState;

/// Build the complete application router.
///
/// The speaker surface is mounted only when the speaker module is enabled
/// and its manager was constructed.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/ws", get(ws::ws_stream_handler))
        .route("/health", get(api::health))
        .route("/stats", get(api::stats));

    if state.speaker.is_some() {
        router = router.nest("/api/v1/speaker", speaker_router());
    }

    router
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn speaker_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(speaker::register_speaker))
        .route("/identify", post(speaker::identify_speaker))
        .route("/verify/{speaker_id}", post(speaker::verify_speaker))
        .route("/list", get(speaker::list_speakers))
        .route("/stats", get(speaker::speaker_stats))
        .route("/{speaker_id}", delete(speaker::delete_speaker))
}
