// Prompt fragments shared by every structured evaluation call.
// Task-specific prompts live beside the code that sends them (see interview/prompts.rs).

/// Appended to a system prompt whose answer is parsed as JSON.
pub const JSON_ONLY_SYSTEM: &str = "Reply with a single JSON object and nothing else: \
    no prose before or after it, no markdown fences, no comments inside it.";

/// Keeps an evaluation tied to what was actually said in the interview.
pub const EVIDENCE_INSTRUCTION: &str = "\
    Judge only what appears in the transcript. \
    Never credit an answer the candidate did not give. \
    When the conversation is too short to judge a dimension, \
    score it low and say so in the summary.";
