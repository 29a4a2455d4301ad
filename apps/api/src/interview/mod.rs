// Live Interview Session Engine.
// Reconciles the voice service's transcript snapshots, checkpoints them, and drives
// feedback generation once the interview ends. All LLM calls go through llm_client.

pub mod checkpoint;
pub mod controller;
pub mod errors;
pub mod feedback;
pub mod handlers;
pub mod prompts;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod voice;

#[cfg(test)]
pub mod testing;
