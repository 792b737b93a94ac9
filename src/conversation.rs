//! Conversation state: phases, turns, and the spoken-text ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Orchestrator-wide phase. Exactly one at a time; transitions drive all
/// side effects (capture enablement, barge-in eligibility, UI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    /// Not running.
    Idle,
    /// Waiting for the user to speak.
    Listening,
    /// STT is transcribing a captured utterance.
    Transcribing,
    /// LLM is generating but no audio has been enqueued yet.
    Thinking,
    /// At least one synthesized clause is enqueued or playing.
    Speaking,
}

impl AgentPhase {
    /// Whether a speech-start event in this phase is a barge-in.
    pub fn barge_in_eligible(self) -> bool {
        matches!(self, Self::Speaking | Self::Thinking)
    }
}

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// Latency metrics attached to a completed assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnMetrics {
    /// Time spent in STT for the triggering utterance.
    pub stt_ms: u64,
    /// Time spent in LLM generation.
    pub llm_ms: u64,
    /// LLM decode throughput.
    pub llm_tokens_per_sec: f64,
}

/// One turn of the conversation. Turns are append-only; an interrupted
/// assistant turn holds only the text that was actually voiced, never the
/// full planned response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique turn id.
    pub id: Uuid,
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// True when a barge-in cut this assistant turn short.
    pub interrupted: bool,
    pub metrics: Option<TurnMetrics>,
}

impl ConversationTurn {
    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(TurnRole::User, content, false, None)
    }

    /// Create a completed assistant turn.
    pub fn assistant(content: impl Into<String>, metrics: Option<TurnMetrics>) -> Self {
        Self::new(TurnRole::Assistant, content, false, metrics)
    }

    /// Create an interrupted assistant turn holding the voiced prefix.
    pub fn assistant_interrupted(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Assistant, content, true, None)
    }

    fn new(
        role: TurnRole,
        content: impl Into<String>,
        interrupted: bool,
        metrics: Option<TurnMetrics>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            interrupted,
            metrics,
        }
    }
}

/// Role of an LLM-facing chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// LLM-facing projection of the conversation. The history handed to the LLM
/// must stay consistent with what the user actually heard (an interrupted
/// turn contributes only its voiced prefix).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Ordered record of clauses submitted to TTS for the current generation,
/// plus how many finished playback. Source of truth for "what has the user
/// actually heard", consulted only at barge-in time.
#[derive(Debug, Default)]
pub struct SentenceLedger {
    /// Clause texts in submission order.
    sentences: Vec<String>,
    /// How many of `sentences` fully finished playback.
    played: usize,
}

impl SentenceLedger {
    /// Record a clause submitted to TTS.
    pub fn push(&mut self, clause: impl Into<String>) {
        self.sentences.push(clause.into());
    }

    /// Record that the next clause in order finished playback.
    pub fn mark_played(&mut self) {
        self.played = (self.played + 1).min(self.sentences.len());
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn played(&self) -> usize {
        self.played
    }

    /// The text actually voiced when a barge-in fires: completed clauses plus
    /// the one audibly in progress (`played + 1`, clamped to the ledger
    /// length).
    ///
    /// The in-progress clause is included deliberately: the user heard part
    /// of it. When synthesis latency means that clause was submitted but not
    /// yet audible, the result may include text the user never heard; this
    /// matches the behavior of the playback-count bookkeeping and is accepted
    /// as-is.
    pub fn spoken_so_far(&self) -> String {
        let upto = (self.played + 1).min(self.sentences.len());
        self.sentences[..upto].join(" ")
    }

    /// Clear for a new generation.
    pub fn reset(&mut self) {
        self.sentences.clear();
        self.played = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Ledger truncation ────────────────────────────────────

    #[test]
    fn spoken_so_far_includes_in_progress_clause() {
        let mut ledger = SentenceLedger::default();
        ledger.push("Hello there.");
        ledger.push("How can I help?");
        ledger.push("I was thinking...");
        ledger.mark_played();

        assert_eq!(ledger.spoken_so_far(), "Hello there. How can I help?");
    }

    #[test]
    fn spoken_so_far_clamps_to_ledger_length() {
        let mut ledger = SentenceLedger::default();
        ledger.push("Only clause.");
        ledger.mark_played();

        assert_eq!(ledger.spoken_so_far(), "Only clause.");
    }

    #[test]
    fn spoken_so_far_empty_ledger_is_empty() {
        let ledger = SentenceLedger::default();
        assert_eq!(ledger.spoken_so_far(), "");
    }

    #[test]
    fn spoken_so_far_nothing_played_includes_first_clause() {
        let mut ledger = SentenceLedger::default();
        ledger.push("First.");
        ledger.push("Second.");

        // Nothing finished playback yet: the first clause counts as the one
        // in progress.
        assert_eq!(ledger.spoken_so_far(), "First.");
    }

    #[test]
    fn mark_played_saturates_at_length() {
        let mut ledger = SentenceLedger::default();
        ledger.push("One.");
        ledger.mark_played();
        ledger.mark_played();
        assert_eq!(ledger.played(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let mut ledger = SentenceLedger::default();
        ledger.push("One.");
        ledger.mark_played();
        ledger.reset();
        assert!(ledger.is_empty());
        assert_eq!(ledger.played(), 0);
        assert_eq!(ledger.spoken_so_far(), "");
    }

    // ── Phases and turns ─────────────────────────────────────

    #[test]
    fn barge_in_eligibility() {
        assert!(AgentPhase::Speaking.barge_in_eligible());
        assert!(AgentPhase::Thinking.barge_in_eligible());
        assert!(!AgentPhase::Listening.barge_in_eligible());
        assert!(!AgentPhase::Idle.barge_in_eligible());
        assert!(!AgentPhase::Transcribing.barge_in_eligible());
    }

    #[test]
    fn turn_constructors() {
        let user = ConversationTurn::user("hi");
        assert_eq!(user.role, TurnRole::User);
        assert!(!user.interrupted);

        let cut = ConversationTurn::assistant_interrupted("partial");
        assert_eq!(cut.role, TurnRole::Assistant);
        assert!(cut.interrupted);
        assert!(cut.metrics.is_none());

        let full = ConversationTurn::assistant(
            "done",
            Some(TurnMetrics {
                stt_ms: 120,
                llm_ms: 800,
                llm_tokens_per_sec: 42.0,
            }),
        );
        assert!(!full.interrupted);
        assert!(full.metrics.is_some());
    }

    #[test]
    fn turn_ids_are_unique() {
        let a = ConversationTurn::user("a");
        let b = ConversationTurn::user("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn chat_message_roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::system("s")).unwrap();
        assert!(json.contains("\"system\""));
    }
}
