//! Deterministic scripted engines for tests and the latency harness.
//!
//! Each engine fulfills its contract from a pre-written script instead of
//! running inference, with configurable pacing so pipeline timing and
//! cancellation paths can be exercised reproducibly.

use crate::conversation::ChatMessage;
use crate::error::{AgentError, Result};
use crate::models::{
    Backend, GenerateOptions, GenerateOutcome, LlmEngine, LoadOptions, LoadOutcome, ProgressFn,
    SttEngine, TtsEngine,
};
use crate::pipeline::messages::{RunMetrics, SynthesizedClause, TranscriptResult};
use crate::progress::FileProgress;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

fn scripted_load(delay: Duration, file: &str, progress: ProgressFn<'_>) -> LoadOutcome {
    let started = Instant::now();
    progress(FileProgress {
        file: file.to_owned(),
        loaded: 0,
        total: 1_000,
    });
    if !delay.is_zero() {
        std::thread::sleep(delay);
    }
    progress(FileProgress {
        file: file.to_owned(),
        loaded: 1_000,
        total: 1_000,
    });
    LoadOutcome {
        backend: Backend::Cpu,
        load_ms: started.elapsed().as_millis() as u64,
    }
}

/// STT engine that replays scripted transcripts in order. Once the script
/// is exhausted every call transcribes to the empty string.
pub struct ScriptedStt {
    replies: VecDeque<Result<String>>,
    load_delay: Duration,
    transcribe_delay: Duration,
    fail_load: bool,
}

impl ScriptedStt {
    pub fn new(transcripts: Vec<&str>) -> Self {
        Self {
            replies: transcripts
                .into_iter()
                .map(|t| Ok(t.to_owned()))
                .collect(),
            load_delay: Duration::ZERO,
            transcribe_delay: Duration::ZERO,
            fail_load: false,
        }
    }

    /// Queue a transcription failure after the already-queued replies.
    pub fn then_fail(mut self, message: &str) -> Self {
        self.replies.push_back(Err(AgentError::Stt(message.to_owned())));
        self
    }

    /// Every load attempt fails (recoverable-load testing).
    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn with_transcribe_delay(mut self, delay: Duration) -> Self {
        self.transcribe_delay = delay;
        self
    }
}

impl SttEngine for ScriptedStt {
    fn load(&mut self, _opts: &LoadOptions, progress: ProgressFn<'_>) -> Result<LoadOutcome> {
        if self.fail_load {
            return Err(AgentError::Stt("scripted load failure".into()));
        }
        Ok(scripted_load(self.load_delay, "stt-model.bin", progress))
    }

    fn transcribe(&mut self, _samples: &[f32], _sample_rate: u32) -> Result<TranscriptResult> {
        if !self.transcribe_delay.is_zero() {
            std::thread::sleep(self.transcribe_delay);
        }
        let text = match self.replies.pop_front() {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e),
            None => String::new(),
        };
        Ok(TranscriptResult {
            text,
            metrics: RunMetrics {
                total_ms: self.transcribe_delay.as_millis() as u64,
                backend: Backend::Cpu,
            },
        })
    }
}

/// LLM engine that replays scripted token streams, one list per generate
/// call. An optional gate makes each token wait for an external signal so
/// tests can interleave barge-ins deterministically.
pub struct ScriptedLlm {
    responses: VecDeque<Vec<String>>,
    token_delay: Duration,
    gate: Option<crossbeam_channel::Receiver<()>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<Vec<&str>>) -> Self {
        Self {
            responses: responses
                .into_iter()
                .map(|tokens| tokens.into_iter().map(str::to_owned).collect())
                .collect(),
            token_delay: Duration::ZERO,
            gate: None,
        }
    }

    /// Split `text` into whitespace-preserving word tokens, one response.
    pub fn from_text(text: &str) -> Self {
        let mut tokens = Vec::new();
        let mut current = String::new();
        for ch in text.chars() {
            current.push(ch);
            if ch == ' ' {
                tokens.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
        Self {
            responses: VecDeque::from([tokens]),
            token_delay: Duration::ZERO,
            gate: None,
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Block before each token until the paired sender signals.
    pub fn with_gate(mut self, gate: crossbeam_channel::Receiver<()>) -> Self {
        self.gate = Some(gate);
        self
    }
}

impl LlmEngine for ScriptedLlm {
    fn load(
        &mut self,
        _model_id: &str,
        _opts: &LoadOptions,
        progress: ProgressFn<'_>,
    ) -> Result<LoadOutcome> {
        Ok(scripted_load(Duration::ZERO, "llm-model.gguf", progress))
    }

    fn generate(
        &mut self,
        _messages: &[ChatMessage],
        _opts: &GenerateOptions,
        emit: &mut dyn FnMut(&str),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<GenerateOutcome> {
        let started = Instant::now();
        let tokens = self.responses.pop_front().unwrap_or_default();
        let mut full_text = String::new();
        let mut token_count = 0usize;

        for token in &tokens {
            if cancelled() {
                return Ok(GenerateOutcome {
                    full_text,
                    total_ms: started.elapsed().as_millis() as u64,
                    token_count,
                    tokens_per_sec: 0.0,
                    cancelled: true,
                });
            }
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            if !self.token_delay.is_zero() {
                std::thread::sleep(self.token_delay);
            }
            emit(token);
            full_text.push_str(token);
            token_count += 1;
        }

        let total_ms = started.elapsed().as_millis() as u64;
        let tokens_per_sec = if total_ms > 0 {
            token_count as f64 * 1000.0 / total_ms as f64
        } else {
            token_count as f64 * 1000.0
        };
        Ok(GenerateOutcome {
            full_text,
            total_ms,
            token_count,
            tokens_per_sec,
            cancelled: false,
        })
    }
}

/// TTS engine that emits a fixed number of samples per character of input,
/// so clause boundaries translate to predictable audio durations.
pub struct ScriptedTts {
    sample_rate: u32,
    samples_per_char: usize,
    synth_delay: Duration,
    fail_containing: Option<String>,
}

impl ScriptedTts {
    pub fn new(sample_rate: u32, samples_per_char: usize) -> Self {
        Self {
            sample_rate,
            samples_per_char,
            synth_delay: Duration::ZERO,
            fail_containing: None,
        }
    }

    pub fn with_synth_delay(mut self, delay: Duration) -> Self {
        self.synth_delay = delay;
        self
    }

    /// Fail synthesis for any clause containing `needle` (per-clause
    /// failure testing).
    pub fn failing_on(mut self, needle: &str) -> Self {
        self.fail_containing = Some(needle.to_owned());
        self
    }
}

impl TtsEngine for ScriptedTts {
    fn load(&mut self, _opts: &LoadOptions, progress: ProgressFn<'_>) -> Result<LoadOutcome> {
        Ok(scripted_load(Duration::ZERO, "tts-model.onnx", progress))
    }

    fn synthesize(&mut self, text: &str, _voice: &str, _speed: f32) -> Result<SynthesizedClause> {
        if let Some(needle) = &self.fail_containing
            && text.contains(needle.as_str())
        {
            return Err(AgentError::Tts(format!("scripted failure for '{text}'")));
        }
        if !self.synth_delay.is_zero() {
            std::thread::sleep(self.synth_delay);
        }
        let n = text.chars().count().max(1) * self.samples_per_char;
        Ok(SynthesizedClause {
            samples: vec![0.1; n],
            sample_rate: self.sample_rate,
            metrics: RunMetrics {
                total_ms: self.synth_delay.as_millis() as u64,
                backend: Backend::Cpu,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn scripted_stt_replays_then_goes_silent() {
        let mut stt = ScriptedStt::new(vec!["hello", "again"]);
        let progress: ProgressFn<'_> = &|_| {};
        stt.load(&LoadOptions::default(), progress).unwrap();
        assert_eq!(stt.transcribe(&[0.0], 16_000).unwrap().text, "hello");
        assert_eq!(stt.transcribe(&[0.0], 16_000).unwrap().text, "again");
        assert_eq!(stt.transcribe(&[0.0], 16_000).unwrap().text, "");
    }

    #[test]
    fn scripted_llm_from_text_reassembles() {
        let mut llm = ScriptedLlm::from_text("one two three");
        let mut collected = String::new();
        let outcome = llm
            .generate(
                &[],
                &GenerateOptions {
                    max_new_tokens: 64,
                    temperature: 0.0,
                },
                &mut |t| collected.push_str(t),
                &|| false,
            )
            .unwrap();
        assert_eq!(collected, "one two three");
        assert_eq!(outcome.full_text, "one two three");
        assert_eq!(outcome.token_count, 3);
    }

    #[test]
    fn scripted_tts_audio_scales_with_text() {
        let mut tts = ScriptedTts::new(24_000, 10);
        let clause = tts.synthesize("abcde", "voice", 1.0).unwrap();
        assert_eq!(clause.samples.len(), 50);
        assert_eq!(clause.sample_rate, 24_000);
    }

    #[test]
    fn scripted_tts_failure_needle() {
        let mut tts = ScriptedTts::new(24_000, 10).failing_on("bad");
        assert!(tts.synthesize("a bad clause", "v", 1.0).is_err());
        assert!(tts.synthesize("a good clause", "v", 1.0).is_ok());
    }
}
