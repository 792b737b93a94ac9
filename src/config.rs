//! Configuration types for the voice-agent pipeline.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the voice agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Audio output settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
    /// Clause segmentation settings.
    pub segmenter: SegmenterConfig,
    /// Pipeline coordination settings.
    pub pipeline: PipelineConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| AgentError::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| AgentError::Config(format!("cannot serialize config: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Default config file location (`~/.config/aloud/config.toml` or the
    /// platform equivalent).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("aloud")
            .join("config.toml")
    }
}

/// Audio output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output sample rate in Hz. Synthesized clauses at other rates are
    /// resampled to this rate when enqueued.
    pub output_sample_rate: u32,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_sample_rate: 24_000,
            output_device: None,
        }
    }
}

/// Voice activity detection configuration (energy-based reference detector).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech detection.
    ///
    /// Audio chunks with RMS above this value are classified as speech.
    /// Typical values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.01:  normal sensitivity (default)
    ///   - 0.02:  reduced sensitivity (noisy environments)
    pub threshold: f32,
    /// Minimum silence duration in ms to end a speech segment.
    pub min_silence_duration_ms: u32,
    /// Minimum speech duration in ms to consider a segment valid.
    pub min_speech_duration_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            min_silence_duration_ms: 900,
            min_speech_duration_ms: 250,
        }
    }
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Model identifier handed to the STT loader.
    pub model_id: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model_id: "parakeet-tdt-0.6b".to_owned(),
        }
    }
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier handed to the LLM loader. Switching this at runtime
    /// reloads only the LLM slot.
    pub model_id: String,
    /// System prompt prepended to the LLM-facing message history.
    pub system_prompt: String,
    /// Maximum new tokens per response.
    pub max_new_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model_id: "qwen3-1.7b".to_owned(),
            system_prompt: "You are a helpful voice assistant. Keep responses \
                            short and conversational; they will be spoken aloud."
                .to_owned(),
            max_new_tokens: 512,
            temperature: 0.7,
        }
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Model identifier handed to the TTS loader.
    pub model_id: String,
    /// Voice identifier passed to every synthesis call.
    pub voice: String,
    /// Speaking speed multiplier (1.0 = native).
    pub speed: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model_id: "kokoro-82m".to_owned(),
            voice: "af_heart".to_owned(),
            speed: 1.0,
        }
    }
}

/// Clause segmentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Minimum whitespace-separated words before a clause-punctuation cut
    /// (`,` `;` `:` em-dash) is taken. Sentence-final punctuation always
    /// cuts regardless of length.
    pub min_clause_words: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_clause_words: 4,
        }
    }
}

/// Pipeline coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Safety timeout in seconds when waiting for playback to drain after a
    /// response finishes synthesizing. If the queue's all-ended signal never
    /// fires, the orchestrator returns to listening after this long.
    pub drain_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert_eq!(config.segmenter.min_clause_words, 4);
        assert_eq!(config.pipeline.drain_timeout_secs, 30);
        assert!(!config.llm.system_prompt.is_empty());
    }

    #[test]
    fn config_serializes_to_toml() {
        let config = AgentConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("output_sample_rate"));
        assert!(toml_str.contains("min_clause_words"));
        assert!(toml_str.contains("drain_timeout_secs"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AgentConfig::default();
        config.audio.output_sample_rate = 48_000;
        config.llm.temperature = 1.2;
        config.pipeline.drain_timeout_secs = 10;

        config.save_to_file(&path).unwrap();
        let loaded = AgentConfig::from_file(&path).unwrap();
        assert_eq!(loaded.audio.output_sample_rate, 48_000);
        assert!((loaded.llm.temperature - 1.2).abs() < f32::EPSILON);
        assert_eq!(loaded.pipeline.drain_timeout_secs, 10);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = AgentConfig::from_file(Path::new("/nonexistent/aloud/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: AgentConfig = toml::from_str("[llm]\nmodel_id = \"other\"").unwrap();
        assert_eq!(config.llm.model_id, "other");
        assert_eq!(config.audio.output_sample_rate, 24_000);
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = AgentConfig::default_path();
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
