//! Text-to-speech session: one loaded TTS engine behind its worker
//! transport. Synthesis calls are strictly sequential, since the transport has a
//! single in-flight slot, and the pipeline's synthesis chain serializes
//! submissions.

use crate::error::{AgentError, Result};
use crate::models::{LoadOptions, LoadOutcome, ModelRole, ModelState, ProgressFn, TtsEngine};
use crate::pipeline::messages::SynthesizedClause;
use crate::worker::transport::{InferenceRunner, InferenceTransport, ProgressHook};
use tokio::sync::watch;
use tracing::{debug, info};

/// One synthesis request handed to the TTS worker.
#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub speed: f32,
}

impl InferenceRunner for Box<dyn TtsEngine> {
    type Request = SynthesisRequest;
    type Response = SynthesizedClause;

    fn load(&mut self, opts: &LoadOptions, progress: ProgressFn<'_>) -> Result<LoadOutcome> {
        (**self).load(opts, progress)
    }

    fn run(&mut self, req: SynthesisRequest) -> Result<SynthesizedClause> {
        self.synthesize(&req.text, &req.voice, req.speed)
    }

    fn dispose(&mut self) {
        (**self).dispose();
    }
}

/// A text-to-speech model session.
pub struct TtsSession {
    transport: InferenceTransport<SynthesisRequest, SynthesizedClause>,
    state: watch::Sender<ModelState>,
}

impl TtsSession {
    /// Create a session around an (unloaded) engine. Must be called inside
    /// a tokio runtime.
    pub fn new(engine: Box<dyn TtsEngine>) -> Self {
        let (state, _) = watch::channel(ModelState::NotLoaded);
        Self {
            transport: InferenceTransport::spawn(engine, "aloud-tts"),
            state,
        }
    }

    /// Install the download progress callback for the next load.
    pub fn set_progress_hook(&self, hook: ProgressHook) {
        self.transport.set_progress_hook(hook);
    }

    /// Load the model. Recoverable on failure.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::LoadFailed`] on engine failure, or the
    /// [`AgentError::Superseded`] sentinel.
    pub async fn load(&self, opts: LoadOptions) -> Result<LoadOutcome> {
        self.state.send_replace(ModelState::Initializing);
        match self.transport.load(opts).await {
            Ok(outcome) => {
                info!("TTS model ready in {}ms", outcome.load_ms);
                self.state.send_replace(ModelState::Ready);
                Ok(outcome)
            }
            Err(e) if e.is_superseded() => {
                debug!("TTS load superseded by a newer command");
                Err(e)
            }
            Err(e) => {
                self.state.send_replace(ModelState::Error);
                Err(AgentError::LoadFailed {
                    role: ModelRole::Tts,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Synthesize one clause. Callers must not overlap calls: the transport
    /// slot does not queue.
    ///
    /// # Errors
    ///
    /// Returns an error if synthesis fails; the chain logs and swallows
    /// per-clause failures.
    pub async fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<SynthesizedClause> {
        self.transport
            .run(SynthesisRequest {
                text: text.to_owned(),
                voice: voice.to_owned(),
                speed,
            })
            .await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModelState {
        *self.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn state_rx(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    /// Dispose the engine and drop the worker.
    pub fn shutdown(&self) {
        self.transport.post_dispose();
        self.transport.terminate();
        self.state.send_replace(ModelState::NotLoaded);
    }
}
