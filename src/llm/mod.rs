//! Language model session: streamed generation with cancellation and
//! transparent model switching.
//!
//! The session owns one LLM worker for its whole life. Switching the
//! selected model is just another load command to the same worker; the
//! engine disposes the previous weights internally. A load superseded by a
//! newer selection resolves as the recognized cancelled-by-new-command
//! condition and is ignored silently.

use crate::conversation::ChatMessage;
use crate::error::{AgentError, Result};
use crate::models::{
    GenerateOptions, GenerateOutcome, LlmEngine, LoadOptions, LoadOutcome, ModelRole, ModelState,
    ProgressFn,
};
use crate::worker::transport::{GenerateHooks, LlmRunner, LlmTransport, ProgressHook};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

impl LlmRunner for Box<dyn LlmEngine> {
    fn load(
        &mut self,
        model_id: &str,
        opts: &LoadOptions,
        progress: ProgressFn<'_>,
    ) -> Result<LoadOutcome> {
        (**self).load(model_id, opts, progress)
    }

    fn generate(
        &mut self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
        emit: &mut dyn FnMut(&str),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<GenerateOutcome> {
        (**self).generate(messages, opts, emit, cancelled)
    }

    fn dispose(&mut self) {
        (**self).dispose();
    }
}

/// A language model session.
pub struct LlmSession {
    transport: LlmTransport,
    state: watch::Sender<ModelState>,
    model_id: Mutex<Option<String>>,
}

impl LlmSession {
    /// Create a session around an (unloaded) engine. Must be called inside
    /// a tokio runtime.
    pub fn new(engine: Box<dyn LlmEngine>) -> Self {
        let (state, _) = watch::channel(ModelState::NotLoaded);
        Self {
            transport: LlmTransport::spawn(engine, "aloud-llm"),
            state,
            model_id: Mutex::new(None),
        }
    }

    /// Install the download progress callback for the next load.
    pub fn set_progress_hook(&self, hook: ProgressHook) {
        self.transport.set_progress_hook(hook);
    }

    /// Load `model_id`, or switch to it if another model is loaded. Only
    /// the LLM slot reloads; STT and TTS are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::LoadFailed`] on engine failure, or
    /// [`AgentError::Superseded`] when a newer selection replaced this load
    /// mid-flight, a non-error callers must swallow.
    pub async fn load(&self, model_id: &str, opts: LoadOptions) -> Result<LoadOutcome> {
        self.state.send_replace(ModelState::Initializing);
        match self.transport.load(model_id.to_owned(), opts).await {
            Ok(outcome) => {
                info!("LLM model '{model_id}' ready in {}ms", outcome.load_ms);
                if let Ok(mut current) = self.model_id.lock() {
                    *current = Some(model_id.to_owned());
                }
                self.state.send_replace(ModelState::Ready);
                Ok(outcome)
            }
            Err(e) if e.is_superseded() => {
                // A newer selection owns the slot's state now.
                debug!("LLM load of '{model_id}' cancelled by new command");
                Err(e)
            }
            Err(e) => {
                self.state.send_replace(ModelState::Error);
                Err(AgentError::LoadFailed {
                    role: ModelRole::Llm,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Start a streamed generation. Progress arrives through `hooks`; the
    /// call itself does not block.
    pub fn generate(&self, messages: Vec<ChatMessage>, opts: GenerateOptions, hooks: GenerateHooks) {
        self.transport.post_generate(messages, opts, hooks);
    }

    /// Cancel the in-flight generation. Already-emitted tokens are not
    /// retracted.
    pub fn cancel(&self) {
        self.transport.cancel();
    }

    /// The currently loaded model id, if any.
    pub fn model_id(&self) -> Option<String> {
        self.model_id.lock().ok().and_then(|id| id.clone())
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
