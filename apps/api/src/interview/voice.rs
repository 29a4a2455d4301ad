//! Voice Session Adapter: owns the single voice connection of a session and turns the
//! voice service's events into signals the controller understands.
//!
//! The hosted connector starts a call over the service's REST API; the service then posts
//! events back to `/api/v1/interviews/:id/voice-events`, which the `VoiceEventRouter`
//! forwards into the session's channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::interview::errors::ConnectionError;
use crate::interview::prompts::{INTERVIEWER_FIRST_MESSAGE, INTERVIEWER_SYSTEM_TEMPLATE};
use crate::interview::reconciler::{from_conversation, ConversationTurn};
use crate::models::interview::{PlannedQuestion, Speaker, Transcript};

const EVENT_BUFFER: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Events as the voice service delivers them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum VoiceEvent {
    Connected,
    Message {
        conversation: Vec<ConversationTurn>,
    },
    SpeakerChanged {
        side: Speaker,
    },
    Ended,
    Error {
        message: String,
        /// Set when the connection cannot recover.
        #[serde(default)]
        fatal: bool,
    },
}

/// What the controller acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterSignal {
    Connected,
    Snapshot(Transcript),
    SpeakerChanged(Speaker),
    Ended,
    Error { reason: String, fatal: bool },
}

/// A live call. Dropping it does not hang up; call `hang_up`.
#[async_trait]
pub trait VoiceCall: Send + Sync {
    fn call_id(&self) -> &str;

    async fn hang_up(&self) -> Result<(), ConnectionError>;
}

pub struct VoiceLink {
    pub call: Box<dyn VoiceCall>,
    pub events: mpsc::Receiver<VoiceEvent>,
}

/// Opens voice calls. Carried by the registry as `Arc<dyn VoiceConnector>`.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn connect(
        &self,
        session_id: Uuid,
        questions: &[PlannedQuestion],
    ) -> Result<VoiceLink, ConnectionError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Adapter
// ────────────────────────────────────────────────────────────────────────────

pub struct VoiceSessionAdapter {
    connector: Arc<dyn VoiceConnector>,
    call: Option<Box<dyn VoiceCall>>,
    events: Option<mpsc::Receiver<VoiceEvent>>,
}

impl VoiceSessionAdapter {
    pub fn new(connector: Arc<dyn VoiceConnector>) -> Self {
        Self {
            connector,
            call: None,
            events: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.call.is_some()
    }

    /// Opens the connection, or returns the existing call id if one is already open.
    pub async fn open(
        &mut self,
        session_id: Uuid,
        questions: &[PlannedQuestion],
    ) -> Result<String, ConnectionError> {
        if let Some(call) = &self.call {
            debug!("Voice connection for session {session_id} already open, reusing");
            return Ok(call.call_id().to_string());
        }

        let link = self.connector.connect(session_id, questions).await?;
        let call_id = link.call.call_id().to_string();
        info!("Voice call {call_id} opened for session {session_id}");

        self.call = Some(link.call);
        self.events = Some(link.events);
        Ok(call_id)
    }

    /// Hands the event stream to the controller loop.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<VoiceEvent>> {
        self.events.take()
    }

    /// Hangs up in the background. Failures are logged and never reach the session.
    pub fn close(&mut self) {
        self.events = None;
        let Some(call) = self.call.take() else {
            return;
        };
        tokio::spawn(async move {
            match call.hang_up().await {
                Ok(()) => debug!("Voice call {} closed", call.call_id()),
                Err(e) => warn!("Failed to close voice call {}: {e}", call.call_id()),
            }
        });
    }

    pub fn translate(event: VoiceEvent) -> AdapterSignal {
        match event {
            VoiceEvent::Connected => AdapterSignal::Connected,
            VoiceEvent::Message { conversation } => {
                AdapterSignal::Snapshot(from_conversation(&conversation))
            }
            VoiceEvent::SpeakerChanged { side } => AdapterSignal::SpeakerChanged(side),
            VoiceEvent::Ended => AdapterSignal::Ended,
            VoiceEvent::Error { message, fatal } => AdapterSignal::Error {
                reason: message,
                fatal,
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Event routing
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum RouteError {
    #[error("no live voice connection for session {0}")]
    UnknownSession(Uuid),

    #[error("voice connection for session {0} is closed")]
    Closed(Uuid),
}

/// Maps session ids to the channel their controller listens on.
#[derive(Default)]
pub struct VoiceEventRouter {
    routes: RwLock<HashMap<Uuid, mpsc::Sender<VoiceEvent>>>,
}

impl VoiceEventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session_id: Uuid) -> mpsc::Receiver<VoiceEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.routes.write().await.insert(session_id, tx);
        rx
    }

    pub async fn unregister(&self, session_id: Uuid) {
        self.routes.write().await.remove(&session_id);
    }

    pub async fn dispatch(&self, session_id: Uuid, event: VoiceEvent) -> Result<(), RouteError> {
        let sender = self
            .routes
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(RouteError::UnknownSession(session_id))?;

        if sender.send(event).await.is_err() {
            self.unregister(session_id).await;
            return Err(RouteError::Closed(session_id));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Hosted voice service
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateCallResponse {
    id: String,
}

/// Starts calls on the hosted voice service and routes its callbacks through the router.
pub struct HostedVoiceConnector {
    client: Client,
    api_url: String,
    api_key: String,
    public_base_url: String,
    router: Arc<VoiceEventRouter>,
}

impl HostedVoiceConnector {
    pub fn new(
        api_url: String,
        api_key: String,
        public_base_url: String,
        router: Arc<VoiceEventRouter>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(REQUEST_TIMEOUT).build()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            router,
        })
    }

    fn callback_url(&self, session_id: Uuid) -> String {
        format!(
            "{}/api/v1/interviews/{session_id}/voice-events",
            self.public_base_url
        )
    }
}

/// Renders the planned questions into the interviewer's instructions.
pub fn build_interviewer_prompt(questions: &[PlannedQuestion]) -> String {
    let list = questions
        .iter()
        .enumerate()
        .map(|(i, q)| format!("{}. [{}] {}", i + 1, q.category, q.text))
        .collect::<Vec<_>>()
        .join("\n");
    INTERVIEWER_SYSTEM_TEMPLATE.replace("{questions}", &list)
}

#[async_trait]
impl VoiceConnector for HostedVoiceConnector {
    async fn connect(
        &self,
        session_id: Uuid,
        questions: &[PlannedQuestion],
    ) -> Result<VoiceLink, ConnectionError> {
        // Register before the call starts so no early event is dropped.
        let events = self.router.register(session_id).await;

        let body = json!({
            "assistant": {
                "firstMessage": INTERVIEWER_FIRST_MESSAGE,
                "model": {
                    "messages": [
                        { "role": "system", "content": build_interviewer_prompt(questions) }
                    ]
                },
                "server": { "url": self.callback_url(session_id) }
            },
            "metadata": { "sessionId": session_id }
        });

        let response = self
            .client
            .post(format!("{}/call", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.router.unregister(session_id).await;
                return Err(ConnectionError::Transport(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            self.router.unregister(session_id).await;
            return Err(ConnectionError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let created: CreateCallResponse = match response.json().await {
            Ok(c) => c,
            Err(e) => {
                self.router.unregister(session_id).await;
                return Err(ConnectionError::Transport(e.to_string()));
            }
        };

        Ok(VoiceLink {
            call: Box::new(HostedCall {
                client: self.client.clone(),
                api_url: self.api_url.clone(),
                api_key: self.api_key.clone(),
                call_id: created.id,
                session_id,
                router: Arc::clone(&self.router),
            }),
            events,
        })
    }
}

struct HostedCall {
    client: Client,
    api_url: String,
    api_key: String,
    call_id: String,
    session_id: Uuid,
    router: Arc<VoiceEventRouter>,
}

#[async_trait]
impl VoiceCall for HostedCall {
    fn call_id(&self) -> &str {
        &self.call_id
    }

    async fn hang_up(&self) -> Result<(), ConnectionError> {
        self.router.unregister(self.session_id).await;

        let response = self
            .client
            .post(format!("{}/call/{}/end", self.api_url, self.call_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
