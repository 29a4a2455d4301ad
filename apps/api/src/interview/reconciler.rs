//! Transcript Reconciler: folds full-conversation snapshots into the canonical transcript.
//!
//! The voice service republishes the whole conversation on every event, so each
//! snapshot overlaps everything seen before. `merge` keeps `current` as-is and appends
//! every snapshot line not already present, judged by exact `(speaker, text)` equality.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::interview::{Speaker, Transcript, TranscriptEntry};

/// One turn as the voice and evaluation services represent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

impl ConversationTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Maps an upstream role to a transcript speaker. Control roles (system, tool, ...) map to None.
pub fn speaker_for_role(role: &str) -> Option<Speaker> {
    match role.to_ascii_lowercase().as_str() {
        "assistant" | "bot" | "ai" => Some(Speaker::Ai),
        "user" | "candidate" => Some(Speaker::Candidate),
        _ => None,
    }
}

pub fn role_for_speaker(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::Ai => "assistant",
        Speaker::Candidate => "user",
    }
}

/// Translates an upstream snapshot into transcript entries, dropping control-role
/// and blank turns.
pub fn from_conversation(conversation: &[ConversationTurn]) -> Transcript {
    conversation
        .iter()
        .filter_map(|turn| {
            let speaker = speaker_for_role(&turn.role)?;
            let text = turn.content.trim();
            if text.is_empty() {
                return None;
            }
            Some(TranscriptEntry::new(speaker, text))
        })
        .collect()
}

pub fn to_conversation(transcript: &[TranscriptEntry]) -> Vec<ConversationTurn> {
    transcript
        .iter()
        .map(|e| ConversationTurn::new(role_for_speaker(e.speaker), e.text.clone()))
        .collect()
}

/// Returns `current` extended with every entry of `incoming` not already present.
///
/// Order of `current` is preserved; new entries keep their snapshot order. An entry
/// repeated inside `incoming` is taken once.
pub fn merge(current: &[TranscriptEntry], incoming: &[TranscriptEntry]) -> Transcript {
    let mut seen: HashSet<&TranscriptEntry> = current.iter().collect();
    let mut merged = current.to_vec();

    for entry in incoming {
        if seen.insert(entry) {
            merged.push(entry.clone());
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ai(text: &str) -> TranscriptEntry {
        TranscriptEntry::new(Speaker::Ai, text)
    }

    fn candidate(text: &str) -> TranscriptEntry {
        TranscriptEntry::new(Speaker::Candidate, text)
    }

    #[test]
    fn test_merge_appends_new_lines_from_growing_snapshot() {
        let current = vec![ai("Hi")];
        let incoming = vec![ai("Hi"), candidate("Hello")];
        assert_eq!(merge(&current, &incoming), vec![ai("Hi"), candidate("Hello")]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let current = vec![ai("Hi"), candidate("Hello")];
        let snapshot = vec![
            ai("Hi"),
            candidate("Hello"),
            ai("Tell me about Rust"),
            candidate("I like ownership"),
        ];
        let once = merge(&current, &snapshot);
        let twice = merge(&once, &snapshot);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_never_shrinks() {
        let current = vec![ai("Hi"), candidate("Hello"), ai("Question one")];
        let stale_snapshot = vec![ai("Hi")];
        let merged = merge(&current, &stale_snapshot);
        assert_eq!(merged, current);
        assert!(merge(&current, &[]).len() >= current.len());
    }

    #[test]
    fn test_merge_catches_new_line_at_arbitrary_position() {
        let current = vec![ai("Hi"), ai("Question one")];
        // The upstream inserted the candidate reply between two known lines.
        let incoming = vec![ai("Hi"), candidate("Hello"), ai("Question one")];
        let merged = merge(&current, &incoming);
        assert_eq!(merged, vec![ai("Hi"), ai("Question one"), candidate("Hello")]);
    }

    #[test]
    fn test_merge_keeps_no_duplicates_across_overlapping_snapshots() {
        let snapshots = vec![
            vec![ai("Hi")],
            vec![ai("Hi"), candidate("Hello")],
            vec![ai("Hi"), candidate("Hello"), candidate("Hello")],
            vec![ai("Hi"), candidate("Hello"), ai("Next")],
        ];
        let mut transcript = Vec::new();
        for snapshot in &snapshots {
            transcript = merge(&transcript, snapshot);
        }
        let unique: HashSet<_> = transcript.iter().collect();
        assert_eq!(unique.len(), transcript.len());
        assert_eq!(transcript.len(), 3);
    }

    #[test]
    fn test_same_text_different_speaker_is_distinct() {
        let merged = merge(&[ai("Yes")], &[candidate("Yes")]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_from_conversation_filters_control_roles() {
        let conversation = vec![
            ConversationTurn::new("system", "You are an interviewer"),
            ConversationTurn::new("assistant", "Hi"),
            ConversationTurn::new("tool", "{}"),
            ConversationTurn::new("user", " Hello "),
            ConversationTurn::new("user", "   "),
        ];
        assert_eq!(
            from_conversation(&conversation),
            vec![ai("Hi"), candidate("Hello")]
        );
    }

    #[test]
    fn test_conversation_round_trip_preserves_roles() {
        let transcript = vec![ai("Hi"), candidate("Hello")];
        let conversation = to_conversation(&transcript);
        assert_eq!(conversation[0].role, "assistant");
        assert_eq!(conversation[1].role, "user");
        assert_eq!(from_conversation(&conversation), transcript);
    }
}
