//! Document store for interview sessions.
//!
//! The engine only needs `get` and `patch`, both atomic at the field-set level.
//! `write_transcript` is the checkpoint write: a full overwrite that refuses to replace
//! a longer stored transcript with a shorter one.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::interview::{
    Feedback, InterviewSession, InterviewSessionRow, SessionStatus, Transcript, TranscriptEntry,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Session {0} not found")]
    NotFound(Uuid),

    #[error("Corrupt session record {id}: {message}")]
    Corrupt { id: Uuid, message: String },
}

/// A partial update. `None` leaves a field untouched; `feedback: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub transcript: Option<Transcript>,
    pub status: Option<SessionStatus>,
    pub feedback: Option<Option<Feedback>>,
    pub recording_ref: Option<String>,
    pub call_id: Option<String>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = Some(transcript);
        self
    }

    pub fn with_feedback(mut self, feedback: Option<Feedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &InterviewSession) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<InterviewSession>, StoreError>;

    /// Applies every field of `patch` in one atomic write and advances `updated_at`.
    async fn patch(&self, id: Uuid, patch: SessionPatch) -> Result<(), StoreError>;

    /// Overwrites the stored transcript unless the stored one is longer.
    /// Returns whether the write took effect.
    async fn write_transcript(
        &self,
        id: Uuid,
        transcript: &[TranscriptEntry],
    ) -> Result<bool, StoreError>;

    async fn find_by_call_id(&self, call_id: &str) -> Result<Option<Uuid>, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Postgres
// ────────────────────────────────────────────────────────────────────────────

pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn insert(&self, session: &InterviewSession) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO interview_sessions
                (id, subject_ref, candidate_ref, planned_questions, transcript, status,
                 feedback, recording_ref, call_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.id)
        .bind(&session.subject_ref)
        .bind(&session.candidate_ref)
        .bind(Json(&session.planned_questions))
        .bind(Json(&session.transcript))
        .bind(session.status.as_str())
        .bind(session.feedback.as_ref().map(Json))
        .bind(&session.recording_ref)
        .bind(&session.call_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<InterviewSession>, StoreError> {
        let row: Option<InterviewSessionRow> =
            sqlx::query_as("SELECT * FROM interview_sessions WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| {
            InterviewSession::try_from(r).map_err(|message| StoreError::Corrupt { id, message })
        })
        .transpose()
    }

    async fn patch(&self, id: Uuid, patch: SessionPatch) -> Result<(), StoreError> {
        let clear_or_set_feedback = patch.feedback.is_some();
        let feedback = patch.feedback.flatten();

        let result = sqlx::query(
            r#"
            UPDATE interview_sessions SET
                transcript    = COALESCE($2, transcript),
                status        = COALESCE($3, status),
                feedback      = CASE WHEN $4 THEN $5 ELSE feedback END,
                recording_ref = COALESCE($6, recording_ref),
                call_id       = COALESCE($7, call_id),
                updated_at    = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(patch.transcript.map(Json))
        .bind(patch.status.map(|s| s.as_str()))
        .bind(clear_or_set_feedback)
        .bind(feedback.map(Json))
        .bind(patch.recording_ref)
        .bind(patch.call_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn write_transcript(
        &self,
        id: Uuid,
        transcript: &[TranscriptEntry],
    ) -> Result<bool, StoreError> {
        // The UPDATE runs even though only `current` is selected; `len` is the stored
        // length before the write, absent when the session does not exist.
        let stored_len = sqlx::query_scalar::<_, i32>(
            r#"
            WITH current AS (
                SELECT id, jsonb_array_length(transcript) AS len
                FROM interview_sessions
                WHERE id = $1
                FOR UPDATE
            ), updated AS (
                UPDATE interview_sessions s
                SET transcript = $2, updated_at = NOW()
                FROM current
                WHERE s.id = current.id AND current.len <= $3
                RETURNING s.id
            )
            SELECT len FROM current
            "#,
        )
        .bind(id)
        .bind(Json(transcript))
        .bind(transcript.len() as i32)
        .fetch_optional(&self.pool)
        .await?;

        transcript_write_outcome(id, stored_len.map(|n| n as usize), transcript.len())
    }

    async fn find_by_call_id(&self, call_id: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(
            sqlx::query_scalar::<_, Uuid>("SELECT id FROM interview_sessions WHERE call_id = $1")
                .bind(call_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }
}

/// Shared by both backends: a missing session is `NotFound`; otherwise the write lands
/// unless it would shorten the stored transcript.
fn transcript_write_outcome(
    id: Uuid,
    stored_len: Option<usize>,
    incoming_len: usize,
) -> Result<bool, StoreError> {
    match stored_len {
        None => Err(StoreError::NotFound(id)),
        Some(len) => Ok(len <= incoming_len),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-process (development and tests)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, InterviewSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: &InterviewSession) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<InterviewSession>, StoreError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn patch(&self, id: Uuid, patch: SessionPatch) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if let Some(transcript) = patch.transcript {
            session.transcript = transcript;
        }
        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(feedback) = patch.feedback {
            session.feedback = feedback;
        }
        if let Some(recording_ref) = patch.recording_ref {
            session.recording_ref = Some(recording_ref);
        }
        if let Some(call_id) = patch.call_id {
            session.call_id = Some(call_id);
        }
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn write_transcript(
        &self,
        id: Uuid,
        transcript: &[TranscriptEntry],
    ) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&id);
        let stored_len = session.as_ref().map(|s| s.transcript.len());
        let written = transcript_write_outcome(id, stored_len, transcript.len())?;

        if let Some(session) = session.filter(|_| written) {
            session.transcript = transcript.to_vec();
            session.updated_at = Utc::now();
        }
        Ok(written)
    }

    async fn find_by_call_id(&self, call_id: &str) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.call_id.as_deref() == Some(call_id))
            .map(|s| s.id))
    }
}
