//! Voice activity detection adapter.
//!
//! The orchestrator consumes VAD as a black box: a stream of
//! [`VadEvent`]s plus an idempotent start/stop control bound to capture.
//! `SpeechStart` fires the instant voiced audio is detected, in any phase,
//! including while the agent itself is speaking (that is the barge-in
//! trigger). `SpeechEnd` carries the captured utterance.
//!
//! [`EnergyVad`] is the bundled reference detector: RMS energy thresholding
//! with minimum speech/silence durations. External detectors integrate by
//! sending [`VadEvent`]s into the same channel.

use crate::config::VadConfig;
use crate::pipeline::messages::{AudioChunk, SpeechSegment};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Speech boundary events emitted by a voice activity detector.
#[derive(Debug, Clone)]
pub enum VadEvent {
    /// Voiced audio just started. No payload.
    SpeechStart,
    /// Speech ended; carries the captured utterance.
    SpeechEnd(SpeechSegment),
}

/// Idempotent capture gate shared with the detector stage. While inactive,
/// incoming audio is discarded and no events are emitted.
#[derive(Debug, Clone, Default)]
pub struct VadControl {
    active: Arc<AtomicBool>,
}

impl VadControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin emitting events. Idempotent.
    pub fn start(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!("VAD started");
        }
    }

    /// Stop emitting events. Idempotent.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("VAD stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Energy-based voice activity detector.
pub struct EnergyVad {
    /// Accumulated samples for the current speech segment.
    speech_buffer: Vec<f32>,
    in_speech: bool,
    /// Number of consecutive silent chunks observed inside a segment.
    silence_chunks: u32,
    /// Silent chunks required to end a segment.
    silence_chunk_threshold: u32,
    speech_start: Option<Instant>,
    sample_rate: u32,
    threshold: f32,
    min_speech_samples: usize,
}

impl EnergyVad {
    /// Create a detector for `sample_rate` input audio.
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        // Chunk cadence assumed ~32ms (512 samples at 16kHz); the silence
        // threshold only needs that granularity.
        let chunk_duration_ms: u32 = 32;
        let silence_chunk_threshold = (config.min_silence_duration_ms / chunk_duration_ms).max(1);
        let min_speech_samples =
            (config.min_speech_duration_ms as usize * sample_rate as usize) / 1000;

        info!(
            "VAD initialized: threshold={}, silence={} chunks, min_speech={}ms",
            config.threshold, silence_chunk_threshold, config.min_speech_duration_ms
        );

        Self {
            speech_buffer: Vec::new(),
            in_speech: false,
            silence_chunks: 0,
            silence_chunk_threshold,
            speech_start: None,
            sample_rate,
            threshold: config.threshold,
            min_speech_samples,
        }
    }

    /// Process one audio chunk, returning the boundary events it produced
    /// (at most a `SpeechStart` and a `SpeechEnd`).
    pub fn process_chunk(&mut self, chunk: &AudioChunk) -> Vec<VadEvent> {
        let mut events = Vec::new();
        let energy = rms_energy(&chunk.samples);
        let is_speech = energy > self.threshold;

        if is_speech {
            if !self.in_speech {
                self.in_speech = true;
                self.speech_start = Some(chunk.captured_at);
                self.speech_buffer.clear();
                events.push(VadEvent::SpeechStart);
            }
            self.silence_chunks = 0;
            self.speech_buffer.extend_from_slice(&chunk.samples);
        } else if self.in_speech {
            self.silence_chunks += 1;
            // Keep silence inside the tolerance window as segment padding.
            self.speech_buffer.extend_from_slice(&chunk.samples);

            if self.silence_chunks >= self.silence_chunk_threshold {
                self.in_speech = false;
                self.silence_chunks = 0;

                if self.speech_buffer.len() >= self.min_speech_samples {
                    let segment = SpeechSegment {
                        samples: std::mem::take(&mut self.speech_buffer),
                        sample_rate: self.sample_rate,
                        started_at: self.speech_start.take().unwrap_or(chunk.captured_at),
                    };
                    events.push(VadEvent::SpeechEnd(segment));
                } else {
                    debug!("dropping too-short speech segment");
                    self.speech_buffer.clear();
                }
            }
        }

        events
    }

    /// Reset detector state.
    pub fn reset(&mut self) {
        self.speech_buffer.clear();
        self.in_speech = false;
        self.silence_chunks = 0;
        self.speech_start = None;
    }
}

/// Run the detector stage: audio chunks in, boundary events out. Events are
/// only emitted while `control` is active; chunks arriving while inactive
/// are discarded and the detector state reset.
pub async fn run_vad_stage(
    config: VadConfig,
    sample_rate: u32,
    mut rx: mpsc::Receiver<AudioChunk>,
    tx: mpsc::UnboundedSender<VadEvent>,
    control: VadControl,
    cancel: CancellationToken,
) {
    let mut vad = EnergyVad::new(&config, sample_rate);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                if !control.is_active() {
                    vad.reset();
                    continue;
                }
                for event in vad.process_chunk(&chunk) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
