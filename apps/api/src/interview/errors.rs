//! Error taxonomy for the interview engine.
//!
//! Only `FeedbackError` changes session status. Connection and persistence failures are
//! reported to the caller as notices while the session carries on.

use thiserror::Error;
use uuid::Uuid;

use crate::models::interview::SessionStatus;

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("voice service request failed: {0}")]
    Transport(String),

    #[error("voice service rejected the call (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("voice connection lost: {0}")]
    Lost(String),
}

#[derive(Debug, Clone, Error)]
#[error("checkpoint for session {session_id} failed: {message}")]
pub struct PersistenceError {
    pub session_id: Uuid,
    pub message: String,
}

#[derive(Debug, Clone, Error)]
pub enum FeedbackError {
    #[error("no conversation recorded")]
    EmptyTranscript,

    #[error("feedback generation failed: {0}")]
    Generation(String),

    #[error("feedback response did not match the expected shape: {0}")]
    Parse(String),
}

impl FeedbackError {
    /// Generation and parse failures leave the session retryable.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FeedbackError::EmptyTranscript)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(Uuid),

    #[error("cannot {action} while session is {status}")]
    InvalidTransition {
        action: &'static str,
        status: SessionStatus,
    },

    #[error("session has no planned questions")]
    NoQuestions,

    #[error("another session for this candidate and application is already in progress")]
    Conflict,

    #[error("session controller is no longer running")]
    ControllerGone,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Feedback(#[from] FeedbackError),
}
