//! Live session controllers, one per session at most.
//!
//! Each running controller owns its session on its own task; callers talk to it through a
//! `SessionHandle`. When a controller settles, its handle is dropped from the registry and
//! later requests (retry, regenerate) resume the session from the store. A stored session
//! still waiting on feedback with no controller behind it is picked up again on the next
//! request and re-evaluated.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::interview::controller::{
    CommandKind, ControllerSettings, SessionCommand, SessionController, SessionView,
};
use crate::interview::errors::SessionError;
use crate::interview::feedback::FeedbackPipeline;
use crate::interview::store::{SessionPatch, SessionStore, StoreError};
use crate::interview::voice::VoiceConnector;
use crate::models::interview::{InterviewSession, PlannedQuestion, SessionStatus};

const COMMAND_BUFFER: usize = 16;

#[derive(Clone)]
pub struct SessionHandle {
    /// Distinguishes successive controllers of the same session.
    instance: Uuid,
    commands: mpsc::Sender<SessionCommand>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub async fn send(&self, kind: CommandKind) -> Result<SessionView, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand { kind, reply })
            .await
            .map_err(|_| SessionError::ControllerGone)?;
        response.await.map_err(|_| SessionError::ControllerGone)?
    }

    /// False once the controller task has exited, even if its handle is still registered.
    fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn is_live_pairing(&self, subject_ref: &str, candidate_ref: &str) -> bool {
        let view = self.view.borrow();
        view.session.subject_ref == subject_ref
            && view.session.candidate_ref == candidate_ref
            && matches!(
                view.session.status,
                SessionStatus::NotStarted | SessionStatus::InProgress
            )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no session for call {0}")]
    UnknownCall(String),
}

#[derive(Default)]
struct Slots {
    running: HashMap<Uuid, SessionHandle>,
    /// Sessions whose voice connection is being opened, keyed to their pairing.
    starting: HashMap<Uuid, (String, String)>,
}

impl Slots {
    fn pairing_taken(&self, subject_ref: &str, candidate_ref: &str) -> bool {
        self.running
            .values()
            .any(|h| h.is_live_pairing(subject_ref, candidate_ref))
            || self
                .starting
                .values()
                .any(|(s, c)| s == subject_ref && c == candidate_ref)
    }
}

pub struct SessionRegistry {
    slots: Mutex<Slots>,
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn VoiceConnector>,
    pipeline: FeedbackPipeline,
    settings: ControllerSettings,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn VoiceConnector>,
        pipeline: FeedbackPipeline,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            store,
            connector,
            pipeline,
            settings,
        }
    }

    pub async fn create(
        &self,
        subject_ref: String,
        candidate_ref: String,
        planned_questions: Vec<PlannedQuestion>,
    ) -> Result<InterviewSession, RegistryError> {
        if planned_questions.is_empty() {
            return Err(SessionError::NoQuestions.into());
        }
        let session = InterviewSession::new(subject_ref, candidate_ref, planned_questions);
        self.store.insert(&session).await?;
        info!("Created interview session {}", session.id);
        Ok(session)
    }

    pub async fn live_count(&self) -> usize {
        self.slots.lock().await.running.len()
    }

    pub async fn handle(&self, id: Uuid) -> Option<SessionHandle> {
        self.slots.lock().await.running.get(&id).cloned()
    }

    pub async fn view(&self, id: Uuid) -> Result<SessionView, RegistryError> {
        if let Some(handle) = self.handle(id).await {
            return Ok(handle.view());
        }
        Ok(SessionView::stored(self.load(id).await?))
    }

    /// Opens the voice connection and hands the session to a running controller.
    /// Starting a session that is already live, connecting, or past NOT_STARTED returns
    /// its view.
    pub async fn start(self: &Arc<Self>, id: Uuid) -> Result<SessionView, RegistryError> {
        let session = {
            let mut slots = self.slots.lock().await;
            if let Some(handle) = slots.running.get(&id) {
                return Ok(handle.view());
            }
            let session = self.load(id).await?;
            if session.status != SessionStatus::NotStarted || slots.starting.contains_key(&id) {
                return Ok(SessionView::stored(session));
            }
            if slots.pairing_taken(&session.subject_ref, &session.candidate_ref) {
                return Err(SessionError::Conflict.into());
            }
            // Holds the pairing while the connection opens outside the lock.
            slots.starting.insert(
                id,
                (session.subject_ref.clone(), session.candidate_ref.clone()),
            );
            session
        };

        // On its own task so a caller that goes away cannot leave the marker behind.
        let registry = Arc::clone(self);
        let connecting = tokio::spawn(async move {
            let mut controller = registry.controller(session);
            let opened = controller.start().await;

            let mut slots = registry.slots.lock().await;
            slots.starting.remove(&id);
            opened?;
            let handle = registry.spawn(controller);
            let view = handle.view();
            slots.running.insert(id, handle);
            Ok::<_, RegistryError>(view)
        });
        connecting.await.unwrap_or_else(|e| {
            warn!("Start task for session {id} failed: {e}");
            Err(SessionError::ControllerGone.into())
        })
    }

    /// Sends a caller command to the live controller, or resumes the session from the
    /// store for commands that make sense after the interview is over.
    pub async fn command(
        self: &Arc<Self>,
        id: Uuid,
        kind: CommandKind,
    ) -> Result<SessionView, RegistryError> {
        if let Some(handle) = self.handle(id).await {
            match handle.send(kind).await {
                Err(SessionError::ControllerGone) => {}
                result => return Ok(result?),
            }
        }

        let session = self.load(id).await?;
        match session.status {
            // Stored mid-evaluation by a controller that is gone: evaluate again.
            SessionStatus::FeedbackPending => return self.adopt(id).await,
            SessionStatus::Ended if !session.transcript.is_empty() => {
                return self.resume_ended(id).await;
            }
            _ => {}
        }

        match kind {
            CommandKind::RetryFeedback | CommandKind::RegenerateFeedback => {
                self.resume(id, kind).await
            }
            // Nothing live to flush; what is stored is already the latest transcript.
            CommandKind::Save => Ok(SessionView::stored(session)),
            CommandKind::Stop | CommandKind::Teardown => match session.status {
                SessionStatus::InProgress => {
                    // A session left IN_PROGRESS by a dead controller: close it out
                    // with the transcript last checkpointed.
                    self.store
                        .patch(id, SessionPatch::status(SessionStatus::Ended))
                        .await?;
                    self.resume_ended(id).await
                }
                _ => Ok(SessionView::stored(session)),
            },
        }
    }

    async fn resume(
        self: &Arc<Self>,
        id: Uuid,
        kind: CommandKind,
    ) -> Result<SessionView, RegistryError> {
        let mut slots = self.slots.lock().await;
        if let Some(handle) = slots.running.get(&id) {
            match handle.send(kind).await {
                // Exited between lookups; its task has not removed the handle yet.
                Err(SessionError::ControllerGone) => {
                    slots.running.remove(&id);
                }
                result => return Ok(result?),
            }
        }

        let session = self.load(id).await?;
        let mut controller = self.controller(session);
        match kind {
            CommandKind::RetryFeedback => controller.retry_feedback().await?,
            CommandKind::RegenerateFeedback => controller.regenerate_feedback().await?,
            _ => {}
        }

        let handle = self.spawn(controller);
        let view = handle.view();
        slots.running.insert(id, handle);
        Ok(view)
    }

    /// Moves a stored ENDED session on to feedback when it has a transcript.
    async fn resume_ended(self: &Arc<Self>, id: Uuid) -> Result<SessionView, RegistryError> {
        let session = self.load(id).await?;
        if session.status == SessionStatus::Ended && !session.transcript.is_empty() {
            self.store
                .patch(id, SessionPatch::status(SessionStatus::FeedbackPending))
                .await?;
        }
        self.adopt(id).await
    }

    /// Gives a stored FEEDBACK_PENDING session a controller, which re-issues the
    /// evaluation. Any other stored status is returned as is.
    async fn adopt(self: &Arc<Self>, id: Uuid) -> Result<SessionView, RegistryError> {
        let mut slots = self.slots.lock().await;
        if let Some(handle) = slots.running.get(&id) {
            if handle.is_running() {
                return Ok(handle.view());
            }
            slots.running.remove(&id);
        }

        let session = self.load(id).await?;
        if session.status != SessionStatus::FeedbackPending {
            return Ok(SessionView::stored(session));
        }
        info!("Resuming evaluation for orphaned session {id}");
        let handle = self.spawn(self.controller(session));
        let view = handle.view();
        slots.running.insert(id, handle);
        Ok(view)
    }

    /// Attaches a recording to the session that owns `call_id`.
    pub async fn attach_recording(
        &self,
        call_id: &str,
        recording_ref: String,
    ) -> Result<Uuid, RegistryError> {
        let id = self
            .store
            .find_by_call_id(call_id)
            .await?
            .ok_or_else(|| RegistryError::UnknownCall(call_id.to_string()))?;
        self.store
            .patch(
                id,
                SessionPatch {
                    recording_ref: Some(recording_ref),
                    ..Default::default()
                },
            )
            .await?;
        info!("Attached recording to session {id} (call {call_id})");
        Ok(id)
    }

    async fn load(&self, id: Uuid) -> Result<InterviewSession, RegistryError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id).into())
    }

    fn controller(&self, session: InterviewSession) -> SessionController {
        SessionController::new(
            session,
            Arc::clone(&self.store),
            Arc::clone(&self.connector),
            self.pipeline.clone(),
            self.settings,
        )
    }

    fn spawn(self: &Arc<Self>, controller: SessionController) -> SessionHandle {
        let session_id = controller.session().id;
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (view_tx, view_rx) = watch::channel(controller.view());

        let instance = Uuid::new_v4();
        let handle = SessionHandle {
            instance,
            commands: commands_tx,
            view: view_rx,
        };

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let session = controller.run(commands_rx, view_tx).await;
            let mut slots = registry.slots.lock().await;
            // Only remove our own handle; a newer controller may have taken the slot.
            if slots
                .running
                .get(&session_id)
                .is_some_and(|h| h.instance == instance)
            {
                slots.running.remove(&session_id);
            }
            info!("Session {session_id} settled in {}", session.status);
        });

        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::interview::reconciler::ConversationTurn;
    use crate::interview::testing::{
        feedback_json, questions, FakeVoiceConnector, FlakyStore, ScriptedEvaluator,
    };
    use crate::interview::voice::VoiceEvent;
    use crate::models::interview::{Speaker, TranscriptEntry};

    struct Fixture {
        registry: Arc<SessionRegistry>,
        store: Arc<FlakyStore>,
        connector: Arc<FakeVoiceConnector>,
        evaluator: Arc<ScriptedEvaluator>,
    }

    fn fixture(responses: Vec<Result<String, String>>) -> Fixture {
        fixture_with(FakeVoiceConnector::new(), responses)
    }

    fn fixture_with(
        connector: FakeVoiceConnector,
        responses: Vec<Result<String, String>>,
    ) -> Fixture {
        let store = Arc::new(FlakyStore::new());
        let connector = Arc::new(connector);
        let evaluator = Arc::new(ScriptedEvaluator::new(responses));
        let registry = Arc::new(SessionRegistry::new(
            store.clone(),
            connector.clone(),
            FeedbackPipeline::new(evaluator.clone(), Duration::from_secs(30)),
            ControllerSettings::default(),
        ));
        Fixture {
            registry,
            store,
            connector,
            evaluator,
        }
    }

    async fn create(f: &Fixture, candidate: &str) -> Uuid {
        f.registry
            .create("application-1".to_string(), candidate.to_string(), questions())
            .await
            .unwrap()
            .id
    }

    async fn wait_until(f: &Fixture, id: Uuid, done: impl Fn(&SessionView) -> bool) -> SessionView {
        for _ in 0..200 {
            let view = f.registry.view(id).await.unwrap();
            if done(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never reached the expected state");
    }

    async fn talk(f: &Fixture, id: Uuid) {
        let voice = f.connector.sender();
        voice.send(VoiceEvent::Connected).await.unwrap();
        voice
            .send(VoiceEvent::Message {
                conversation: vec![
                    ConversationTurn::new("assistant", "Hi"),
                    ConversationTurn::new("user", "Hello"),
                ],
            })
            .await
            .unwrap();
        wait_until(f, id, |v| v.session.transcript.len() == 2).await;
    }

    #[tokio::test]
    async fn test_create_rejects_empty_question_list() {
        let f = fixture(vec![]);
        let err = f
            .registry
            .create("application-1".to_string(), "candidate-1".to_string(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Session(SessionError::NoQuestions)));
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let f = fixture(vec![]);
        let err = f.registry.view(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Session(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_second_start_reuses_live_controller() {
        let f = fixture(vec![]);
        let id = create(&f, "candidate-1").await;

        let first = f.registry.start(id).await.unwrap();
        let second = f.registry.start(id).await.unwrap();

        assert!(first.live && second.live);
        assert_eq!(f.connector.connects(), 1);
        assert_eq!(second.session.status, SessionStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_one_live_session_per_pairing() {
        let f = fixture(vec![]);
        let first = create(&f, "candidate-1").await;
        let duplicate = create(&f, "candidate-1").await;
        let other = create(&f, "candidate-2").await;

        f.registry.start(first).await.unwrap();
        let err = f.registry.start(duplicate).await.unwrap_err();
        assert!(matches!(err, RegistryError::Session(SessionError::Conflict)));
        f.registry.start(other).await.unwrap();
        assert_eq!(f.connector.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_connect_does_not_block_other_sessions() {
        let f = fixture_with(
            FakeVoiceConnector::new().with_connect_delay(Duration::from_secs(5)),
            vec![],
        );
        let slow = create(&f, "candidate-1").await;
        let duplicate = create(&f, "candidate-1").await;
        let other = create(&f, "candidate-2").await;

        let registry = Arc::clone(&f.registry);
        let starting = tokio::spawn(async move { registry.start(slow).await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        let view = tokio::time::timeout(Duration::from_secs(1), f.registry.view(other))
            .await
            .expect("view waited on another session's connect")
            .unwrap();
        assert_eq!(view.session.status, SessionStatus::NotStarted);

        // The pairing is held while the first call is still connecting.
        let err = f.registry.start(duplicate).await.unwrap_err();
        assert!(matches!(err, RegistryError::Session(SessionError::Conflict)));
        let again = f.registry.start(slow).await.unwrap();
        assert!(!again.live);

        let started = starting.await.unwrap().unwrap();
        assert!(started.live);
        assert_eq!(f.connector.connects(), 1);
        assert!(f.registry.handle(slow).await.is_some());
    }

    #[tokio::test]
    async fn test_failed_connect_releases_pairing() {
        let f = fixture_with(FakeVoiceConnector::failing(), vec![]);
        let first = create(&f, "candidate-1").await;
        let second = create(&f, "candidate-1").await;

        let err = f.registry.start(first).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Session(SessionError::Connection(_))
        ));
        // Not a pairing conflict: the failed start left nothing reserved.
        let err = f.registry.start(second).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Session(SessionError::Connection(_))
        ));
        assert_eq!(f.registry.live_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_through_registry_reaches_completed() {
        let f = fixture(vec![Ok(feedback_json("Recommended"))]);
        let id = create(&f, "candidate-1").await;
        f.registry.start(id).await.unwrap();
        talk(&f, id).await;

        let stopped = f.registry.command(id, CommandKind::Stop).await.unwrap();
        assert_eq!(stopped.session.status, SessionStatus::FeedbackPending);

        wait_until(&f, id, |v| !v.live).await;
        assert!(f.registry.handle(id).await.is_none());
        let session = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.feedback.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_resumes_a_settled_session() {
        let f = fixture(vec![
            Err("upstream unavailable".to_string()),
            Ok(feedback_json("Not Recommended")),
        ]);
        let id = create(&f, "candidate-1").await;
        f.registry.start(id).await.unwrap();
        talk(&f, id).await;
        f.registry.command(id, CommandKind::Stop).await.unwrap();

        let failed = wait_until(&f, id, |v| !v.live).await;
        assert_eq!(failed.session.status, SessionStatus::EndedWithError);
        assert_eq!(failed.session.transcript.len(), 2);

        let retried = f
            .registry
            .command(id, CommandKind::RetryFeedback)
            .await
            .unwrap();
        assert_eq!(retried.session.status, SessionStatus::FeedbackPending);

        let done = wait_until(&f, id, |v| !v.live).await;
        assert_eq!(done.session.status, SessionStatus::Completed);
        assert_eq!(f.evaluator.calls(), 2);
    }

    #[tokio::test]
    async fn test_regenerate_requires_completed_session() {
        let f = fixture(vec![]);
        let id = create(&f, "candidate-1").await;
        let err = f
            .registry
            .command(id, CommandKind::RegenerateFeedback)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Session(SessionError::InvalidTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_recovers_orphaned_in_progress_session() {
        let f = fixture(vec![Ok(feedback_json("Recommended"))]);
        let id = create(&f, "candidate-1").await;
        f.store
            .patch(
                id,
                SessionPatch::status(SessionStatus::InProgress).with_transcript(two_lines()),
            )
            .await
            .unwrap();

        let view = f.registry.command(id, CommandKind::Stop).await.unwrap();
        assert_eq!(view.session.status, SessionStatus::FeedbackPending);

        let done = wait_until(&f, id, |v| !v.live).await;
        assert_eq!(done.session.status, SessionStatus::Completed);
    }

    fn two_lines() -> Vec<TranscriptEntry> {
        vec![
            TranscriptEntry::new(Speaker::Ai, "Hi"),
            TranscriptEntry::new(Speaker::Candidate, "Hello"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_feedback_pending_is_evaluated_again() {
        let f = fixture(vec![Ok(feedback_json("Recommended"))]);
        let id = create(&f, "candidate-1").await;
        f.store
            .patch(
                id,
                SessionPatch::status(SessionStatus::FeedbackPending).with_transcript(two_lines()),
            )
            .await
            .unwrap();

        let view = f
            .registry
            .command(id, CommandKind::RetryFeedback)
            .await
            .unwrap();
        assert!(view.live);
        assert_eq!(view.session.status, SessionStatus::FeedbackPending);

        let done = wait_until(&f, id, |v| !v.live).await;
        assert_eq!(done.session.status, SessionStatus::Completed);
        assert_eq!(f.evaluator.calls(), 1);
        assert!(f.store.get(id).await.unwrap().unwrap().feedback.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_orphaned_ended_session_with_transcript_moves_on_to_feedback() {
        let f = fixture(vec![Ok(feedback_json("Recommended"))]);
        let id = create(&f, "candidate-1").await;
        f.store
            .patch(
                id,
                SessionPatch::status(SessionStatus::Ended).with_transcript(two_lines()),
            )
            .await
            .unwrap();

        let view = f.registry.command(id, CommandKind::Stop).await.unwrap();
        assert_eq!(view.session.status, SessionStatus::FeedbackPending);

        let done = wait_until(&f, id, |v| !v.live).await;
        assert_eq!(done.session.status, SessionStatus::Completed);
        assert_eq!(f.evaluator.calls(), 1);
    }

    #[tokio::test]
    async fn test_ended_session_without_transcript_stays_ended() {
        let f = fixture(vec![]);
        let id = create(&f, "candidate-1").await;
        f.store
            .patch(id, SessionPatch::status(SessionStatus::Ended))
            .await
            .unwrap();

        let view = f.registry.command(id, CommandKind::Stop).await.unwrap();
        assert!(!view.live);
        assert_eq!(view.session.status, SessionStatus::Ended);
        assert_eq!(f.evaluator.calls(), 0);
        assert!(f.registry.handle(id).await.is_none());
    }

    #[tokio::test]
    async fn test_save_without_live_controller_returns_stored_session() {
        let f = fixture(vec![]);
        let id = create(&f, "candidate-1").await;
        let view = f.registry.command(id, CommandKind::Save).await.unwrap();
        assert!(!view.live);
        assert_eq!(view.session.status, SessionStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_recording_attaches_by_call_id() {
        let f = fixture(vec![]);
        let id = create(&f, "candidate-1").await;
        f.registry.start(id).await.unwrap();

        let attached = f
            .registry
            .attach_recording("call-0", "https://recordings.example/call-0.wav".to_string())
            .await
            .unwrap();
        assert_eq!(attached, id);
        let session = f.store.get(id).await.unwrap().unwrap();
        assert_eq!(
            session.recording_ref.as_deref(),
            Some("https://recordings.example/call-0.wav")
        );

        let err = f
            .registry
            .attach_recording("call-404", "x".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownCall(_)));
    }
}
