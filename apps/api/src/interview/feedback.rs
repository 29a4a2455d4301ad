//! Feedback Pipeline: sends a finished transcript to the evaluation service and turns
//! its answer into a validated `Feedback`.
//!
//! The pipeline makes exactly one request per call; retrying is the caller's decision
//! (`retry_feedback` on the controller).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::interview::errors::FeedbackError;
use crate::interview::prompts::{FEEDBACK_PROMPT_TEMPLATE, FEEDBACK_SYSTEM};
use crate::interview::reconciler::{to_conversation, ConversationTurn};
use crate::llm_client::prompts::{EVIDENCE_INSTRUCTION, JSON_ONLY_SYSTEM};
use crate::llm_client::{strip_json_fences, LlmClient};
use crate::models::interview::{Feedback, TranscriptEntry};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRequest {
    pub conversation: Vec<ConversationTurn>,
}

/// The external evaluation service. Returns the raw response text; transport and
/// availability failures are `FeedbackError::Generation`.
#[async_trait]
pub trait EvaluationService: Send + Sync {
    async fn complete(&self, request: &EvaluationRequest) -> Result<String, FeedbackError>;
}

#[async_trait]
impl EvaluationService for LlmClient {
    async fn complete(&self, request: &EvaluationRequest) -> Result<String, FeedbackError> {
        let prompt = build_feedback_prompt(request);
        let system = format!("{FEEDBACK_SYSTEM} {JSON_ONLY_SYSTEM}");
        self.complete_text(&prompt, &system)
            .await
            .map_err(|e| FeedbackError::Generation(e.to_string()))
    }
}

fn build_feedback_prompt(request: &EvaluationRequest) -> String {
    let transcript = request
        .conversation
        .iter()
        .map(|turn| format!("- {}: {}", turn.role, turn.content))
        .collect::<Vec<_>>()
        .join("\n");

    FEEDBACK_PROMPT_TEMPLATE
        .replace("{transcript}", &transcript)
        .replace("{evidence_instruction}", EVIDENCE_INSTRUCTION)
}

#[derive(Debug, Deserialize)]
struct FeedbackEnvelope {
    feedback: Feedback,
}

/// Strips code fences, parses the `{"feedback": {...}}` envelope and validates ranges.
pub fn parse_feedback(raw: &str) -> Result<Feedback, FeedbackError> {
    let text = strip_json_fences(raw);
    let envelope: FeedbackEnvelope =
        serde_json::from_str(text).map_err(|e| FeedbackError::Parse(e.to_string()))?;
    envelope.feedback.validate().map_err(FeedbackError::Parse)?;
    Ok(envelope.feedback)
}

#[derive(Clone)]
pub struct FeedbackPipeline {
    service: Arc<dyn EvaluationService>,
    timeout: Duration,
}

impl FeedbackPipeline {
    pub fn new(service: Arc<dyn EvaluationService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }

    pub async fn evaluate(
        &self,
        transcript: &[TranscriptEntry],
    ) -> Result<Feedback, FeedbackError> {
        if transcript.is_empty() {
            return Err(FeedbackError::EmptyTranscript);
        }

        let request = EvaluationRequest {
            conversation: to_conversation(transcript),
        };

        let raw = match tokio::time::timeout(self.timeout, self.service.complete(&request)).await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                error!(kind = "generation", "Feedback generation failed: {e}");
                return Err(e);
            }
            Err(_) => {
                let e = FeedbackError::Generation(format!(
                    "evaluation timed out after {}s",
                    self.timeout.as_secs()
                ));
                error!(kind = "generation", "Feedback generation failed: {e}");
                return Err(e);
            }
        };

        match parse_feedback(&raw) {
            Ok(feedback) => {
                info!(
                    "Feedback generated for {} transcript entries: {:?}",
                    transcript.len(),
                    feedback.recommendation
                );
                Ok(feedback)
            }
            Err(e) => {
                error!(
                    kind = "parse",
                    "Feedback response rejected: {e}; raw={:?}",
                    raw.chars().take(200).collect::<String>()
                );
                Err(e)
            }
        }
    }

    /// Runs `evaluate` on its own task so the controller loop stays responsive.
    pub fn spawn(
        &self,
        transcript: Vec<TranscriptEntry>,
    ) -> JoinHandle<Result<Feedback, FeedbackError>> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.evaluate(&transcript).await })
    }
}
