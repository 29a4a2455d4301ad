//! Session Controller: the state machine that sequences one interview.
//!
//! ```text
//! NOT_STARTED --connected--> IN_PROGRESS --ended | stop | deadline--> ENDED
//! ENDED --(transcript)--> FEEDBACK_PENDING --ok--> COMPLETED
//!                                          --err--> ENDED_WITH_ERROR --retry--> FEEDBACK_PENDING
//! COMPLETED --regenerate--> FEEDBACK_PENDING
//! ```
//!
//! The controller owns the session, the canonical transcript and the voice adapter. Its
//! methods can be driven directly, or `run` processes voice events, caller commands, the
//! checkpoint timer and the in-flight evaluation one at a time on a single task.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::interview::checkpoint::CheckpointPersister;
use crate::interview::errors::{FeedbackError, PersistenceError, SessionError};
use crate::interview::feedback::FeedbackPipeline;
use crate::interview::reconciler::merge;
use crate::interview::store::{SessionPatch, SessionStore};
use crate::interview::voice::{AdapterSignal, VoiceConnector, VoiceEvent, VoiceSessionAdapter};
use crate::models::interview::{
    Feedback, InterviewSession, SessionStatus, Speaker, TranscriptEntry,
};

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub checkpoint_interval: Duration,
    pub max_duration: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(30),
            max_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Non-fatal conditions surfaced to the caller alongside the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionNotice {
    CheckpointFailed { message: String },
    EmptyTranscript,
    VoiceError { message: String, fatal: bool },
    FeedbackFailed { message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub session: InterviewSession,
    /// Who is talking right now. Presentation only; never persisted.
    pub speaking: Option<Speaker>,
    pub notices: Vec<SessionNotice>,
    pub live: bool,
}

impl SessionView {
    pub fn stored(session: InterviewSession) -> Self {
        Self {
            session,
            speaking: None,
            notices: Vec::new(),
            live: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Stop,
    Save,
    Teardown,
    RetryFeedback,
    RegenerateFeedback,
}

pub struct SessionCommand {
    pub kind: CommandKind,
    pub reply: oneshot::Sender<Result<SessionView, SessionError>>,
}

pub struct SessionController {
    session: InterviewSession,
    adapter: VoiceSessionAdapter,
    persister: CheckpointPersister,
    pipeline: FeedbackPipeline,
    store: Arc<dyn SessionStore>,
    settings: ControllerSettings,
    speaking: Option<Speaker>,
    notices: Vec<SessionNotice>,
    deadline: Option<Instant>,
}

impl SessionController {
    pub fn new(
        session: InterviewSession,
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn VoiceConnector>,
        pipeline: FeedbackPipeline,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            session,
            adapter: VoiceSessionAdapter::new(connector),
            persister: CheckpointPersister::new(Arc::clone(&store)),
            pipeline,
            store,
            settings,
            speaking: None,
            notices: Vec::new(),
            deadline: None,
        }
    }

    pub fn session(&self) -> &InterviewSession {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    pub fn notices(&self) -> &[SessionNotice] {
        &self.notices
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            session: self.session.clone(),
            speaking: self.speaking,
            notices: self.notices.clone(),
            live: true,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Caller operations
    // ────────────────────────────────────────────────────────────────────────

    /// Opens the voice connection. The session moves to IN_PROGRESS once the voice
    /// service reports `connected`. A no-op once the session has left NOT_STARTED or
    /// while a connection is already open.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.session.status != SessionStatus::NotStarted {
            debug!("start() ignored for session {}: {}", self.session.id, self.session.status);
            return Ok(());
        }
        if self.session.planned_questions.is_empty() {
            return Err(SessionError::NoQuestions);
        }
        if self.adapter.is_open() {
            return Ok(());
        }

        let call_id = self
            .adapter
            .open(self.session.id, &self.session.planned_questions)
            .await?;

        self.session.call_id = Some(call_id.clone());
        self.persist(SessionPatch {
            call_id: Some(call_id),
            ..Default::default()
        })
        .await;
        Ok(())
    }

    /// Ends the interview. Status changes before this returns; the voice connection is
    /// closed in the background.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        match self.session.status {
            SessionStatus::InProgress => {
                self.end_session("stopped by caller").await;
            }
            SessionStatus::NotStarted => {
                // The call never connected; drop it so a later start() opens a fresh one.
                self.adapter.close();
            }
            _ => debug!("stop() ignored for session {}: {}", self.session.id, self.session.status),
        }
        Ok(())
    }

    /// Writes the current transcript now.
    pub async fn checkpoint(&mut self) -> Result<(), PersistenceError> {
        let result = self
            .persister
            .flush(self.session.id, &self.session.transcript)
            .await;
        if let Err(e) = &result {
            self.notices.push(SessionNotice::CheckpointFailed {
                message: e.to_string(),
            });
        }
        result
    }

    /// The caller is going away. Flushes while the interview is live; never fails.
    pub async fn teardown(&mut self) {
        if self.session.status == SessionStatus::InProgress {
            info!("Caller tearing down session {}, checkpointing", self.session.id);
            let _ = self.checkpoint().await;
        }
    }

    pub async fn retry_feedback(&mut self) -> Result<(), SessionError> {
        if self.session.status != SessionStatus::EndedWithError {
            return Err(SessionError::InvalidTransition {
                action: "retry feedback",
                status: self.session.status,
            });
        }
        self.set_status(SessionStatus::FeedbackPending).await;
        Ok(())
    }

    /// Discards the current feedback and evaluates the transcript again.
    pub async fn regenerate_feedback(&mut self) -> Result<(), SessionError> {
        if self.session.status != SessionStatus::Completed {
            return Err(SessionError::InvalidTransition {
                action: "regenerate feedback",
                status: self.session.status,
            });
        }
        let _ = self.checkpoint().await;

        self.session.status = SessionStatus::FeedbackPending;
        self.session.feedback = None;
        self.persist(SessionPatch::status(SessionStatus::FeedbackPending).with_feedback(None))
            .await;
        info!("Regenerating feedback for session {}", self.session.id);
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Voice events
    // ────────────────────────────────────────────────────────────────────────

    pub async fn handle_voice_event(&mut self, event: VoiceEvent) {
        match VoiceSessionAdapter::translate(event) {
            AdapterSignal::Connected => self.on_connected().await,
            AdapterSignal::Snapshot(incoming) => self.apply_snapshot(&incoming),
            AdapterSignal::SpeakerChanged(side) => self.speaking = Some(side),
            AdapterSignal::Ended => match self.session.status {
                SessionStatus::InProgress => self.end_session("voice service ended the call").await,
                SessionStatus::NotStarted => {
                    warn!("Voice call for session {} ended before connecting", self.session.id);
                    self.adapter.close();
                }
                _ => {}
            },
            AdapterSignal::Error { reason, fatal } => {
                warn!("Voice error on session {} (fatal={fatal}): {reason}", self.session.id);
                self.notices.push(SessionNotice::VoiceError {
                    message: reason,
                    fatal,
                });
                if fatal {
                    self.connection_lost().await;
                }
            }
        }
    }

    async fn on_connected(&mut self) {
        if self.session.status != SessionStatus::NotStarted {
            return;
        }
        self.deadline = Some(Instant::now() + self.settings.max_duration);
        self.set_status(SessionStatus::InProgress).await;
    }

    fn apply_snapshot(&mut self, incoming: &[TranscriptEntry]) {
        if !matches!(
            self.session.status,
            SessionStatus::NotStarted | SessionStatus::InProgress
        ) {
            debug!("Snapshot after session {} ended, ignored", self.session.id);
            return;
        }
        let merged = merge(&self.session.transcript, incoming);
        if merged.len() == self.session.transcript.len() {
            return;
        }
        self.session.transcript = merged;
        self.session.updated_at = chrono::Utc::now();
    }

    /// The connection cannot recover; behaves like the remote side hanging up.
    async fn connection_lost(&mut self) {
        match self.session.status {
            SessionStatus::InProgress => self.end_session("voice connection lost").await,
            SessionStatus::NotStarted => self.adapter.close(),
            _ => {}
        }
    }

    async fn end_session(&mut self, reason: &str) {
        if self.session.status != SessionStatus::InProgress {
            return;
        }
        info!(
            "Ending session {} ({reason}) with {} transcript entries",
            self.session.id,
            self.session.transcript.len()
        );

        self.session.status = SessionStatus::Ended;
        self.deadline = None;
        self.speaking = None;

        if let Err(e) = self
            .persister
            .flush_final(self.session.id, &self.session.transcript)
            .await
        {
            warn!("Final checkpoint failed, continuing with in-memory transcript: {e}");
            self.notices.push(SessionNotice::CheckpointFailed {
                message: e.to_string(),
            });
        }
        self.persist(SessionPatch::status(SessionStatus::Ended)).await;
        self.adapter.close();

        if self.session.transcript.is_empty() {
            warn!("Session {} ended with no conversation recorded", self.session.id);
            self.notices.push(SessionNotice::EmptyTranscript);
            return;
        }
        self.set_status(SessionStatus::FeedbackPending).await;
    }

    // ────────────────────────────────────────────────────────────────────────
    // Feedback
    // ────────────────────────────────────────────────────────────────────────

    /// The transcript to evaluate, when the session is waiting on feedback.
    pub fn pending_evaluation(&self) -> Option<Vec<TranscriptEntry>> {
        (self.session.status == SessionStatus::FeedbackPending)
            .then(|| self.session.transcript.clone())
    }

    /// Evaluates inline. Returns the pipeline's error when evaluation failed.
    #[cfg(test)]
    pub async fn run_feedback(&mut self) -> Result<(), FeedbackError> {
        let Some(transcript) = self.pending_evaluation() else {
            return Ok(());
        };
        let result = self.pipeline.evaluate(&transcript).await;
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        self.apply_evaluation(result).await;
        outcome
    }

    pub async fn apply_evaluation(&mut self, result: Result<Feedback, FeedbackError>) {
        if self.session.status != SessionStatus::FeedbackPending {
            warn!(
                "Evaluation result for session {} arrived in {}, dropped",
                self.session.id, self.session.status
            );
            return;
        }

        let feedback = match result {
            Ok(feedback) => feedback,
            Err(e) if !e.is_retryable() => {
                debug!("Nothing to evaluate for session {}: {e}", self.session.id);
                self.notices.push(SessionNotice::EmptyTranscript);
                self.set_status(SessionStatus::Ended).await;
                return;
            }
            Err(e) => {
                error!("Feedback for session {} failed: {e}", self.session.id);
                self.fail_feedback(e.to_string()).await;
                return;
            }
        };

        // Finalize: feedback, transcript and status land together or not at all.
        let patch = SessionPatch::status(SessionStatus::Completed)
            .with_transcript(self.session.transcript.clone())
            .with_feedback(Some(feedback.clone()));
        match self.store.patch(self.session.id, patch).await {
            Ok(()) => {
                self.session.feedback = Some(feedback);
                self.session.status = SessionStatus::Completed;
                self.session.updated_at = chrono::Utc::now();
                info!("Session {} completed", self.session.id);
            }
            Err(e) => {
                error!("Failed to persist feedback for session {}: {e}", self.session.id);
                self.fail_feedback(format!("could not save feedback: {e}")).await;
            }
        }
    }

    async fn fail_feedback(&mut self, message: String) {
        self.notices.push(SessionNotice::FeedbackFailed { message });
        self.set_status(SessionStatus::EndedWithError).await;
    }

    // ────────────────────────────────────────────────────────────────────────
    // Persistence helpers
    // ────────────────────────────────────────────────────────────────────────

    async fn set_status(&mut self, status: SessionStatus) {
        info!(
            "Session {}: {} -> {}",
            self.session.id, self.session.status, status
        );
        self.session.status = status;
        self.session.updated_at = chrono::Utc::now();
        self.persist(SessionPatch::status(status)).await;
    }

    /// Store failures outside finalize are reported, never fatal.
    async fn persist(&mut self, patch: SessionPatch) {
        if let Err(e) = self.store.patch(self.session.id, patch).await {
            warn!("Failed to persist session {}: {e}", self.session.id);
            self.notices.push(SessionNotice::CheckpointFailed {
                message: e.to_string(),
            });
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Event loop
    // ────────────────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: SessionCommand) {
        let result = match command.kind {
            CommandKind::Stop => self.stop().await,
            CommandKind::Save => self.checkpoint().await.map_err(SessionError::from),
            CommandKind::Teardown => {
                self.teardown().await;
                Ok(())
            }
            CommandKind::RetryFeedback => self.retry_feedback().await,
            CommandKind::RegenerateFeedback => self.regenerate_feedback().await,
        };
        let _ = command.reply.send(result.map(|()| self.view()));
    }

    fn is_settled(&self, evaluating: bool, listening: bool) -> bool {
        if evaluating {
            return false;
        }
        match self.session.status {
            SessionStatus::NotStarted => !listening,
            SessionStatus::InProgress | SessionStatus::FeedbackPending => false,
            SessionStatus::Ended | SessionStatus::Completed | SessionStatus::EndedWithError => true,
        }
    }

    /// Drives the session until nothing else can happen without a new caller request.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        view: watch::Sender<SessionView>,
    ) -> InterviewSession {
        let period = self.settings.checkpoint_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut events = self.adapter.take_events();
        let mut evaluation: Option<JoinHandle<Result<Feedback, FeedbackError>>> = None;
        let mut caller_attached = true;
        let mut ticking = false;

        loop {
            if evaluation.is_none() {
                if let Some(transcript) = self.pending_evaluation() {
                    evaluation = Some(self.pipeline.spawn(transcript));
                }
            }
            if !matches!(
                self.session.status,
                SessionStatus::NotStarted | SessionStatus::InProgress
            ) || !self.adapter.is_open()
            {
                events = None;
            }

            let _ = view.send(self.view());
            if self.is_settled(evaluation.is_some(), events.is_some()) {
                break;
            }

            let deadline = self.deadline;
            let in_progress = self.session.status == SessionStatus::InProgress;
            // The checkpoint period counts from `connected`, not from when the loop started.
            if in_progress && !ticking {
                ticker.reset();
            }
            ticking = in_progress;

            tokio::select! {
                event = next_event(&mut events) => match event {
                    Some(event) => self.handle_voice_event(event).await,
                    None => {
                        events = None;
                        self.connection_lost().await;
                    }
                },
                command = commands.recv(), if caller_attached => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        caller_attached = false;
                        self.teardown().await;
                    }
                },
                _ = ticker.tick(), if in_progress => {
                    let _ = self.checkpoint().await;
                }
                _ = sleep_until_deadline(deadline), if deadline.is_some() => {
                    self.end_session("interview time limit reached").await;
                }
                joined = join_evaluation(&mut evaluation) => {
                    evaluation = None;
                    let result = joined.unwrap_or_else(|e| {
                        Err(FeedbackError::Generation(format!("evaluation task failed: {e}")))
                    });
                    self.apply_evaluation(result).await;
                }
            }
        }

        self.adapter.close();
        let mut final_view = self.view();
        final_view.live = false;
        let _ = view.send(final_view);
        debug!("Controller for session {} exiting in {}", self.session.id, self.session.status);
        self.session
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<VoiceEvent>>) -> Option<VoiceEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_evaluation(
    evaluation: &mut Option<JoinHandle<Result<Feedback, FeedbackError>>>,
) -> Result<Result<Feedback, FeedbackError>, JoinError> {
    match evaluation {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}
