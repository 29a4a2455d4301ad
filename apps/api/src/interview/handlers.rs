//! Axum route handlers for the Interview API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use crate::errors::AppError;
use crate::interview::controller::{CommandKind, SessionView};
use crate::interview::voice::VoiceEvent;
use crate::models::interview::{InterviewSession, PlannedQuestion};
use crate::state::AppState;

// ────────────────────────────────────────────────────────────────────────────
// Request types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInterviewRequest {
    pub subject_ref: String,
    pub candidate_ref: String,
    pub planned_questions: Vec<PlannedQuestion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingWebhook {
    pub call_id: String,
    pub recording_url: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/interviews
pub async fn handle_create(
    State(state): State<AppState>,
    Json(req): Json<CreateInterviewRequest>,
) -> Result<(StatusCode, Json<InterviewSession>), AppError> {
    if req.subject_ref.trim().is_empty() || req.candidate_ref.trim().is_empty() {
        return Err(AppError::Validation(
            "subjectRef and candidateRef cannot be empty".to_string(),
        ));
    }
    if req.planned_questions.iter().any(|q| q.text.trim().is_empty()) {
        return Err(AppError::Validation(
            "planned questions must have text".to_string(),
        ));
    }

    let session = state
        .registry
        .create(req.subject_ref, req.candidate_ref, req.planned_questions)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/v1/interviews/:id
pub async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.registry.view(id).await?))
}

/// POST /api/v1/interviews/:id/start
pub async fn handle_start(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.registry.start(id).await?))
}

/// POST /api/v1/interviews/:id/stop
pub async fn handle_stop(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.registry.command(id, CommandKind::Stop).await?))
}

/// POST /api/v1/interviews/:id/save
pub async fn handle_save(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(state.registry.command(id, CommandKind::Save).await?))
}

/// POST /api/v1/interviews/:id/teardown
///
/// Sent by the client as it navigates away. Always answers 204.
pub async fn handle_teardown(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> StatusCode {
    if let Err(e) = state.registry.command(id, CommandKind::Teardown).await {
        debug!("Teardown for session {id} ignored: {e}");
    }
    StatusCode::NO_CONTENT
}

/// POST /api/v1/interviews/:id/retry-feedback
pub async fn handle_retry_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(
        state.registry.command(id, CommandKind::RetryFeedback).await?,
    ))
}

/// POST /api/v1/interviews/:id/regenerate-feedback
pub async fn handle_regenerate_feedback(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    Ok(Json(
        state
            .registry
            .command(id, CommandKind::RegenerateFeedback)
            .await?,
    ))
}

/// POST /api/v1/interviews/:id/voice-events
///
/// Callback target for the voice service.
pub async fn handle_voice_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(event): Json<VoiceEvent>,
) -> Result<StatusCode, AppError> {
    state.voice_router.dispatch(id, event).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/v1/webhooks/recording
pub async fn handle_recording_webhook(
    State(state): State<AppState>,
    Json(req): Json<RecordingWebhook>,
) -> Result<StatusCode, AppError> {
    state
        .registry
        .attach_recording(&req.call_id, req.recording_url)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
