//! Speech-to-text session: one loaded STT engine behind its worker
//! transport, with an explicit load/dispose lifecycle.

use crate::error::{AgentError, Result};
use crate::models::{LoadOptions, LoadOutcome, ModelRole, ModelState, ProgressFn, SttEngine};
use crate::pipeline::messages::TranscriptResult;
use crate::worker::transport::{InferenceRunner, InferenceTransport, ProgressHook};
use tokio::sync::watch;
use tracing::{debug, info};

impl InferenceRunner for Box<dyn SttEngine> {
    type Request = (Vec<f32>, u32);
    type Response = TranscriptResult;

    fn load(&mut self, opts: &LoadOptions, progress: ProgressFn<'_>) -> Result<LoadOutcome> {
        (**self).load(opts, progress)
    }

    fn run(&mut self, (samples, sample_rate): Self::Request) -> Result<TranscriptResult> {
        self.transcribe(&samples, sample_rate)
    }

    fn dispose(&mut self) {
        (**self).dispose();
    }
}

/// A speech-to-text model session. Holds at most one ready engine; the
/// engine itself runs on a dedicated worker thread.
pub struct SttSession {
    transport: InferenceTransport<(Vec<f32>, u32), TranscriptResult>,
    state: watch::Sender<ModelState>,
}

impl SttSession {
    /// Create a session around an (unloaded) engine. Must be called inside
    /// a tokio runtime.
    pub fn new(engine: Box<dyn SttEngine>) -> Self {
        let (state, _) = watch::channel(ModelState::NotLoaded);
        Self {
            transport: InferenceTransport::spawn(engine, "aloud-stt"),
            state,
        }
    }

    /// Install the download progress callback for the next load.
    pub fn set_progress_hook(&self, hook: ProgressHook) {
        self.transport.set_progress_hook(hook);
    }

    /// Load the model. Recoverable on failure: just call again.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::LoadFailed`] on engine failure, or the
    /// [`AgentError::Superseded`] sentinel when a newer load replaced this
    /// one (callers ignore it silently).
    pub async fn load(&self, opts: LoadOptions) -> Result<LoadOutcome> {
        self.state.send_replace(ModelState::Initializing);
        match self.transport.load(opts).await {
            Ok(outcome) => {
                info!("STT model ready in {}ms", outcome.load_ms);
                self.state.send_replace(ModelState::Ready);
                Ok(outcome)
            }
            Err(e) if e.is_superseded() => {
                debug!("STT load superseded by a newer command");
                Err(e)
            }
            Err(e) => {
                self.state.send_replace(ModelState::Error);
                Err(AgentError::LoadFailed {
                    role: ModelRole::Stt,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Transcribe one captured utterance.
    ///
    /// # Errors
    ///
    /// Returns an error if transcription fails; the orchestrator treats
    /// this as a soft failure.
    pub async fn transcribe(&self, samples: Vec<f32>, sample_rate: u32) -> Result<TranscriptResult> {
        self.transport.run((samples, sample_rate)).await
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
