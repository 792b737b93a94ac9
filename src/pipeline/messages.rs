//! Message types passed between pipeline stages.

use crate::models::Backend;
use std::time::Instant;

/// A chunk of raw audio samples fed to the VAD stage.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples at `sample_rate`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Timestamp when this chunk was captured.
    pub captured_at: Instant,
}

/// A complete speech segment detected by VAD, ready for STT.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Concatenated audio samples for the entire utterance.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// When the speech segment started.
    pub started_at: Instant,
}

/// Timing metadata attached to an STT or TTS result.
#[derive(Debug, Clone, Copy)]
pub struct RunMetrics {
    /// Wall-clock inference time in milliseconds.
    pub total_ms: u64,
    /// Backend the engine ran on.
    pub backend: Backend,
}

/// A transcription result from the STT engine.
#[derive(Debug, Clone)]
pub struct TranscriptResult {
    /// The transcribed text.
    pub text: String,
    pub metrics: RunMetrics,
}

/// Synthesized audio for one clause, ready to enqueue for playback.
#[derive(Debug, Clone)]
pub struct SynthesizedClause {
    /// Mono f32 audio samples.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    pub metrics: RunMetrics,
}

impl SynthesizedClause {
    /// Real-time factor: synthesis time over resulting audio duration.
    /// Below 1.0 means faster than real time.
    pub fn real_time_factor(&self) -> f64 {
        let duration_s = self.samples.len() as f64 / f64::from(self.sample_rate.max(1));
        if duration_s == 0.0 {
            return 0.0;
        }
        (self.metrics.total_ms as f64 / 1000.0) / duration_s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_time_factor_below_one_is_faster_than_realtime() {
        let clause = SynthesizedClause {
            samples: vec![0.0; 24_000],
            sample_rate: 24_000,
            metrics: RunMetrics {
                total_ms: 500,
                backend: Backend::Cpu,
            },
        };
        assert!((clause.real_time_factor() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn real_time_factor_of_empty_audio_is_zero() {
        let clause = SynthesizedClause {
            samples: Vec::new(),
            sample_rate: 24_000,
            metrics: RunMetrics {
                total_ms: 10,
                backend: Backend::Cpu,
            },
        };
        assert!(clause.real_time_factor().abs() < f64::EPSILON);
    }
}
