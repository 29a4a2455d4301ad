use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Which side of the interview produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Speaker {
    Ai,
    Candidate,
}

/// One canonical line of the interview transcript.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

pub type Transcript = Vec<TranscriptEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedQuestion {
    pub text: String,
    pub category: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    NotStarted,
    InProgress,
    Ended,
    FeedbackPending,
    Completed,
    EndedWithError,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::NotStarted => "NOT_STARTED",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Ended => "ENDED",
            SessionStatus::FeedbackPending => "FEEDBACK_PENDING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::EndedWithError => "ENDED_WITH_ERROR",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(SessionStatus::NotStarted),
            "IN_PROGRESS" => Ok(SessionStatus::InProgress),
            "ENDED" => Ok(SessionStatus::Ended),
            "FEEDBACK_PENDING" => Ok(SessionStatus::FeedbackPending),
            "COMPLETED" => Ok(SessionStatus::Completed),
            "ENDED_WITH_ERROR" => Ok(SessionStatus::EndedWithError),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Feedback contract
// ────────────────────────────────────────────────────────────────────────────

/// Per-dimension scores, each on a 1–10 scale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub technical_skills: u8,
    pub communication: u8,
    pub problem_solving: u8,
    pub experience: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recommendation {
    #[serde(rename = "Recommended")]
    Recommended,
    #[serde(rename = "Not Recommended")]
    NotRecommended,
}

/// Structured evaluation of a finished interview.
///
/// Field names follow the evaluation service's JSON contract exactly so the
/// stored value is the service's answer verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub rating: Rating,
    pub summary: String,
    #[serde(rename = "Recommendation")]
    pub recommendation: Recommendation,
    #[serde(rename = "RecommendationMsg")]
    pub recommendation_msg: String,
}

impl Feedback {
    /// Checks constraints serde cannot express. Returns a description of the first violation.
    pub fn validate(&self) -> Result<(), String> {
        let scores = [
            ("technicalSkills", self.rating.technical_skills),
            ("communication", self.rating.communication),
            ("problemSolving", self.rating.problem_solving),
            ("experience", self.rating.experience),
        ];
        for (name, score) in scores {
            if !(1..=10).contains(&score) {
                return Err(format!("rating.{name} must be between 1 and 10, got {score}"));
            }
        }
        if self.summary.trim().is_empty() {
            return Err("summary must not be empty".to_string());
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Aggregate root
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterviewSession {
    pub id: Uuid,
    pub subject_ref: String,
    pub candidate_ref: String,
    pub planned_questions: Vec<PlannedQuestion>,
    pub transcript: Transcript,
    pub status: SessionStatus,
    pub feedback: Option<Feedback>,
    pub recording_ref: Option<String>,
    /// Identifier the voice service assigned to the call, used to correlate webhooks.
    pub call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InterviewSession {
    pub fn new(
        subject_ref: impl Into<String>,
        candidate_ref: impl Into<String>,
        planned_questions: Vec<PlannedQuestion>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subject_ref: subject_ref.into(),
            candidate_ref: candidate_ref.into(),
            planned_questions,
            transcript: Vec::new(),
            status: SessionStatus::NotStarted,
            feedback: None,
            recording_ref: None,
            call_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct InterviewSessionRow {
    pub id: Uuid,
    pub subject_ref: String,
    pub candidate_ref: String,
    pub planned_questions: Json<Vec<PlannedQuestion>>,
    pub transcript: Json<Transcript>,
    pub status: String,
    pub feedback: Option<Json<Feedback>>,
    pub recording_ref: Option<String>,
    pub call_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<InterviewSessionRow> for InterviewSession {
    type Error = String;

    fn try_from(row: InterviewSessionRow) -> Result<Self, Self::Error> {
        Ok(InterviewSession {
            id: row.id,
            subject_ref: row.subject_ref,
            candidate_ref: row.candidate_ref,
            planned_questions: row.planned_questions.0,
            transcript: row.transcript.0,
            status: row.status.parse()?,
            feedback: row.feedback.map(|f| f.0),
            recording_ref: row.recording_ref,
            call_id: row.call_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
