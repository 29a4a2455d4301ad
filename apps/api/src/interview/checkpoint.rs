//! Checkpoint Persister: durable writes of the in-memory transcript.
//!
//! The timer, a caller teardown, a manual save and the end-of-session flush all go through
//! `flush`. Each call overwrites the stored transcript in full; the store refuses to replace
//! a longer transcript with a shorter one, so overlapping calls settle on the longest.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::interview::errors::PersistenceError;
use crate::interview::store::SessionStore;
use crate::models::interview::TranscriptEntry;

#[derive(Clone)]
pub struct CheckpointPersister {
    store: Arc<dyn SessionStore>,
}

impl CheckpointPersister {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub async fn flush(
        &self,
        session_id: Uuid,
        transcript: &[TranscriptEntry],
    ) -> Result<(), PersistenceError> {
        match self.store.write_transcript(session_id, transcript).await {
            Ok(true) => {
                debug!(
                    "Checkpointed {} transcript entries for session {session_id}",
                    transcript.len()
                );
                Ok(())
            }
            Ok(false) => {
                debug!("Stored transcript for session {session_id} is already longer, skipped");
                Ok(())
            }
            Err(e) => {
                warn!("Checkpoint for session {session_id} failed: {e}");
                Err(PersistenceError {
                    session_id,
                    message: e.to_string(),
                })
            }
        }
    }

    /// The end-of-session flush: one retry, then the failure is returned for the caller
    /// to report. The in-memory transcript is still intact either way.
    pub async fn flush_final(
        &self,
        session_id: Uuid,
        transcript: &[TranscriptEntry],
    ) -> Result<(), PersistenceError> {
        match self.flush(session_id, transcript).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("Retrying final checkpoint for session {session_id}");
                self.flush(session_id, transcript).await
            }
        }
    }
}
