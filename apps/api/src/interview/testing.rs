//! Test doubles for the voice service, the evaluation service and the store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::interview::errors::{ConnectionError, FeedbackError};
use crate::interview::feedback::{EvaluationRequest, EvaluationService};
use crate::interview::store::{InMemorySessionStore, SessionPatch, SessionStore, StoreError};
use crate::interview::voice::{VoiceCall, VoiceConnector, VoiceEvent, VoiceLink};
use crate::models::interview::{InterviewSession, PlannedQuestion, TranscriptEntry};

pub fn questions() -> Vec<PlannedQuestion> {
    vec![
        PlannedQuestion {
            text: "Tell me about a project you are proud of".to_string(),
            category: "behavioral".to_string(),
        },
        PlannedQuestion {
            text: "How does ownership work in Rust?".to_string(),
            category: "technical".to_string(),
        },
    ]
}

pub fn sample_session() -> InterviewSession {
    InterviewSession::new("application-1", "candidate-1", questions())
}

/// A valid evaluation response with the given recommendation string.
pub fn feedback_json(recommendation: &str) -> String {
    format!(
        r#"{{
  "feedback": {{
    "rating": {{
      "technicalSkills": 8,
      "communication": 7,
      "problemSolving": 6,
      "experience": 5
    }},
    "summary": "Clear answers with good depth on ownership.",
    "Recommendation": "{recommendation}",
    "RecommendationMsg": "Proceed to the next round."
  }}
}}"#
    )
}

// ────────────────────────────────────────────────────────────────────────────
// Evaluation service
// ────────────────────────────────────────────────────────────────────────────

pub struct ScriptedEvaluator {
    responses: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<EvaluationRequest>>,
    delay: Option<Duration>,
}

impl ScriptedEvaluator {
    /// `Err` entries are served as transport failures.
    pub fn new(responses: Vec<Result<String, String>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<EvaluationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl EvaluationService for ScriptedEvaluator {
    async fn complete(&self, request: &EvaluationRequest) -> Result<String, FeedbackError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(raw)) => Ok(raw),
            Some(Err(message)) => Err(FeedbackError::Generation(message)),
            None => Err(FeedbackError::Generation("no scripted response".to_string())),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Voice service
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeVoiceConnector {
    senders: Mutex<Vec<mpsc::Sender<VoiceEvent>>>,
    connects: AtomicUsize,
    hang_ups: Arc<AtomicUsize>,
    fail: AtomicBool,
    delay: Option<Duration>,
}

impl FakeVoiceConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let connector = Self::default();
        connector.fail.store(true, Ordering::SeqCst);
        connector
    }

    /// Each connect waits `delay` before the call opens.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn hang_ups(&self) -> usize {
        self.hang_ups.load(Ordering::SeqCst)
    }

    /// Sender for the most recently opened call.
    pub fn sender(&self) -> mpsc::Sender<VoiceEvent> {
        self.senders
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no call has been opened")
    }

    /// Drops every sender so the open calls' event streams end.
    pub fn drop_connections(&self) {
        self.senders.lock().unwrap().clear();
    }
}

#[async_trait]
impl VoiceConnector for FakeVoiceConnector {
    async fn connect(
        &self,
        _session_id: Uuid,
        _questions: &[PlannedQuestion],
    ) -> Result<VoiceLink, ConnectionError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::Rejected {
                status: 503,
                message: "voice service unavailable".to_string(),
            });
        }
        let n = self.connects.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().push(tx);
        Ok(VoiceLink {
            call: Box::new(FakeCall {
                id: format!("call-{n}"),
                hang_ups: Arc::clone(&self.hang_ups),
            }),
            events: rx,
        })
    }
}

struct FakeCall {
    id: String,
    hang_ups: Arc<AtomicUsize>,
}

#[async_trait]
impl VoiceCall for FakeCall {
    fn call_id(&self) -> &str {
        &self.id
    }

    async fn hang_up(&self) -> Result<(), ConnectionError> {
        self.hang_ups.fetch_add(1, Ordering::SeqCst);
        Err(ConnectionError::Lost("already gone".to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Store
// ────────────────────────────────────────────────────────────────────────────

/// In-memory store whose transcript writes and patches can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemorySessionStore,
    failing_transcript_writes: AtomicUsize,
    transcript_writes: AtomicUsize,
    fail_patches: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` transcript writes fail.
    pub fn fail_next_transcript_writes(&self, n: usize) {
        self.failing_transcript_writes.store(n, Ordering::SeqCst);
    }

    pub fn fail_patches(&self, fail: bool) {
        self.fail_patches.store(fail, Ordering::SeqCst);
    }

    pub fn transcript_writes(&self) -> usize {
        self.transcript_writes.load(Ordering::SeqCst)
    }
}

fn simulated_outage() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn insert(&self, session: &InterviewSession) -> Result<(), StoreError> {
        self.inner.insert(session).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<InterviewSession>, StoreError> {
        self.inner.get(id).await
    }

    async fn patch(&self, id: Uuid, patch: SessionPatch) -> Result<(), StoreError> {
        if self.fail_patches.load(Ordering::SeqCst) {
            return Err(simulated_outage());
        }
        self.inner.patch(id, patch).await
    }

    async fn write_transcript(
        &self,
        id: Uuid,
        transcript: &[TranscriptEntry],
    ) -> Result<bool, StoreError> {
        self.transcript_writes.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_transcript_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_transcript_writes
                .store(remaining - 1, Ordering::SeqCst);
            return Err(simulated_outage());
        }
        self.inner.write_transcript(id, transcript).await
    }

    async fn find_by_call_id(&self, call_id: &str) -> Result<Option<Uuid>, StoreError> {
        self.inner.find_by_call_id(call_id).await
    }
}
