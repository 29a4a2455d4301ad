use std::sync::Arc;

use crate::interview::registry::SessionRegistry;
use crate::interview::voice::VoiceEventRouter;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Live controllers and the path to the session store.
    pub registry: Arc<SessionRegistry>,
    /// Forwards voice service callbacks into the owning session's controller.
    pub voice_router: Arc<VoiceEventRouter>,
}
