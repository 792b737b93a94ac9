//! Model roles, lifecycle states, and the engine contracts consumed by the
//! pipeline.
//!
//! The actual inference engines are external collaborators: opaque services
//! with a load/run/dispose lifecycle, driven from dedicated worker threads.
//! This module defines their blocking trait contracts plus the shared
//! load-option/outcome types; [`scripted`] provides deterministic engines
//! for tests and the latency harness.

pub mod scripted;

use crate::conversation::ChatMessage;
use crate::pipeline::messages::{SynthesizedClause, TranscriptResult};
use crate::progress::FileProgress;
use serde::{Deserialize, Serialize};

/// Which model slot a session occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    Stt,
    Llm,
    Tts,
}

impl std::fmt::Display for ModelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stt => write!(f, "STT"),
            Self::Llm => write!(f, "LLM"),
            Self::Tts => write!(f, "TTS"),
        }
    }
}

/// Lifecycle state of one model slot. Independently lifecycled per role;
/// the error state is recoverable by re-invoking load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    #[default]
    NotLoaded,
    Initializing,
    Ready,
    Error,
}

/// Inference backend requested at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Pick GPU when available, fall back to CPU.
    #[default]
    Auto,
    Gpu,
    Cpu,
}

/// Options handed to an engine's load call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadOptions {
    pub backend: Backend,
}

/// Result of a successful load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadOutcome {
    /// Backend the engine actually selected.
    pub backend: Backend,
    /// Wall-clock load time in milliseconds.
    pub load_ms: u64,
}

/// Sampling options for one LLM generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub max_new_tokens: u32,
    pub temperature: f32,
}

/// Summary of one finished (or cancelled) LLM generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOutcome {
    /// Every token emitted, concatenated.
    pub full_text: String,
    pub total_ms: u64,
    pub token_count: usize,
    pub tokens_per_sec: f64,
    /// True when generation stopped because the cancel flag was observed.
    pub cancelled: bool,
}

/// Per-file download progress reported during a load.
pub type ProgressFn<'a> = &'a (dyn Fn(FileProgress) + Send + Sync);

/// Blocking speech-to-text engine contract. All methods run on the STT
/// worker thread.
pub trait SttEngine: Send + 'static {
    /// Load the model, reporting per-file download progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be retrieved or initialized;
    /// callers treat this as the recoverable load-failed condition.
    fn load(&mut self, opts: &LoadOptions, progress: ProgressFn<'_>) -> crate::Result<LoadOutcome>;

    /// Transcribe mono PCM.
    ///
    /// # Errors
    ///
    /// Returns an error if transcription fails.
    fn transcribe(&mut self, samples: &[f32], sample_rate: u32) -> crate::Result<TranscriptResult>;

    /// Release engine resources.
    fn dispose(&mut self) {}
}

/// Blocking text-to-speech engine contract.
pub trait TtsEngine: Send + 'static {
    /// Load the model, reporting per-file download progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be retrieved or initialized.
    fn load(&mut self, opts: &LoadOptions, progress: ProgressFn<'_>) -> crate::Result<LoadOutcome>;

    /// Synthesize one clause.
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis fails; the pipeline swallows per-clause
    /// failures.
    fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> crate::Result<SynthesizedClause>;

    /// Release engine resources.
    fn dispose(&mut self) {}
}

/// Blocking LLM engine contract. One engine object serves successive model
/// selections: `load` with a new `model_id` disposes the previous weights.
pub trait LlmEngine: Send + 'static {
    /// Load (or switch to) `model_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be retrieved or initialized.
    fn load(
        &mut self,
        model_id: &str,
        opts: &LoadOptions,
        progress: ProgressFn<'_>,
    ) -> crate::Result<LoadOutcome>;

    /// Generate a streamed response. `emit` is called once per decoded
    /// token; `cancelled` is polled between token emissions and, once it
    /// returns true, the engine stops decoding and returns with
    /// `cancelled: true` (already-emitted tokens are not retracted).
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails mid-stream.
    fn generate(
        &mut self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
        emit: &mut dyn FnMut(&str),
        cancelled: &dyn Fn() -> bool,
    ) -> crate::Result<GenerateOutcome>;

    /// Release engine resources.
    fn dispose(&mut self) {}
}
