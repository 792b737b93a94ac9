//! Error types for the voice-agent pipeline.

use crate::models::ModelRole;

/// Top-level error type for the voice-agent system.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Audio device or playback scheduling error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text transcription error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model generation error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// A model failed to load. Recoverable: re-invoking load retries.
    #[error("{role} load failed: {message}")]
    LoadFailed {
        /// Which model slot failed.
        role: ModelRole,
        /// Underlying loader error.
        message: String,
    },

    /// A pending command was superseded by a newer one ("cancelled by new
    /// command"). Recognized sentinel, never surfaced as a failure.
    #[error("superseded by a newer command")]
    Superseded,

    /// Worker transport error (worker thread gone, reply channel closed).
    #[error("transport error: {0}")]
    Transport(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl AgentError {
    /// Whether re-invoking the failed operation can succeed.
    ///
    /// Load failures are always retryable; the superseded sentinel is not an
    /// error at all and callers should discard it silently.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LoadFailed { .. } | Self::Superseded)
    }

    /// Whether this is the recognized "cancelled by new command" condition.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgentError>;
