pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::interview::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Interview sessions
        .route("/api/v1/interviews", post(handlers::handle_create))
        .route("/api/v1/interviews/:id", get(handlers::handle_get))
        .route("/api/v1/interviews/:id/start", post(handlers::handle_start))
        .route("/api/v1/interviews/:id/stop", post(handlers::handle_stop))
        .route("/api/v1/interviews/:id/save", post(handlers::handle_save))
        .route(
            "/api/v1/interviews/:id/teardown",
            post(handlers::handle_teardown),
        )
        .route(
            "/api/v1/interviews/:id/retry-feedback",
            post(handlers::handle_retry_feedback),
        )
        .route(
            "/api/v1/interviews/:id/regenerate-feedback",
            post(handlers::handle_regenerate_feedback),
        )
        // Voice service callbacks
        .route(
            "/api/v1/interviews/:id/voice-events",
            post(handlers::handle_voice_event),
        )
        .route(
            "/api/v1/webhooks/recording",
            post(handlers::handle_recording_webhook),
        )
        .with_state(state)
}
