//! The agent orchestrator: the state machine coordinating
//! STT → LLM (token stream) → TTS (chunked synthesis) → AudioQueue, with
//! barge-in and cancellation semantics.
//!
//! Each utterance runs as one *generation*, identified by a monotonically
//! increasing counter. The counter is bumped at the start of every pipeline
//! run, on every barge-in, and on stop; any asynchronous completion whose
//! captured generation no longer matches the live counter is stale and must
//! not mutate conversation state.

use crate::audio::output::{AudioOutput, PlaybackStream};
use crate::audio::queue::AudioQueue;
use crate::config::AgentConfig;
use crate::conversation::{
    AgentPhase, ChatMessage, ConversationTurn, SentenceLedger, TurnMetrics,
};
use crate::error::{AgentError, Result};
use crate::llm::LlmSession;
use crate::models::{
    GenerateOptions, GenerateOutcome, LlmEngine, LoadOptions, LoadOutcome, ModelRole, ModelState,
    SttEngine, TtsEngine,
};
use crate::pipeline::AgentEvent;
use crate::pipeline::messages::SpeechSegment;
use crate::progress::{FileProgress, ProgressCallback, ProgressTracker};
use crate::stt::SttSession;
use crate::text::ClauseExtractor;
use crate::tts::TtsSession;
use crate::vad::{VadControl, VadEvent};
use crate::worker::transport::{GenerateHooks, ProgressHook};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Broadcast capacity for runtime events.
const EVENT_CHANNEL_SIZE: usize = 64;

/// The three inference engines handed to the orchestrator at construction.
pub struct EngineSet {
    pub stt: Box<dyn SttEngine>,
    pub llm: Box<dyn LlmEngine>,
    pub tts: Box<dyn TtsEngine>,
}

/// Events surfaced by the LLM streaming hooks into the pipeline run.
enum LlmStreamEvent {
    Token(String),
    Done(GenerateOutcome),
    Error(AgentError),
}

/// Abort handle for the current generation's synthesis chain, kept where
/// the barge-in handler can reach it.
struct ChainHandle {
    abort: Arc<AtomicBool>,
}

impl ChainHandle {
    fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// The playback resources of the current generation.
struct ActivePlayback {
    queue: Arc<AudioQueue>,
    _stream: Box<dyn PlaybackStream>,
}

/// Orchestrates the full voice-agent pipeline. Clones share the same
/// underlying agent; hosts drive it via [`run`](Self::run) plus the
/// lifecycle methods.
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    config: AgentConfig,
    phase: watch::Sender<AgentPhase>,
    generation: AtomicU64,
    conversation: Mutex<Vec<ConversationTurn>>,
    /// LLM-facing projection: system prompt plus what the user actually
    /// heard.
    history: Mutex<Vec<ChatMessage>>,
    ledger: Mutex<SentenceLedger>,
    stt: SttSession,
    llm: LlmSession,
    tts: TtsSession,
    output: Arc<dyn AudioOutput>,
    playback: Mutex<Option<ActivePlayback>>,
    chain: Mutex<Option<ChainHandle>>,
    vad_control: VadControl,
    events: broadcast::Sender<AgentEvent>,
    cancel: CancellationToken,
}

impl AgentOrchestrator {
    /// Create an orchestrator. Spawns one worker thread per engine; must be
    /// called inside a tokio runtime.
    pub fn new(config: AgentConfig, engines: EngineSet, output: Arc<dyn AudioOutput>) -> Self {
        let (phase, _) = watch::channel(AgentPhase::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let history = vec![ChatMessage::system(config.llm.system_prompt.clone())];

        Self {
            inner: Arc::new(AgentInner {
                stt: SttSession::new(engines.stt),
                llm: LlmSession::new(engines.llm),
                tts: TtsSession::new(engines.tts),
                config,
                phase,
                generation: AtomicU64::new(0),
                conversation: Mutex::new(Vec::new()),
                history: Mutex::new(history),
                ledger: Mutex::new(SentenceLedger::default()),
                output,
                playback: Mutex::new(None),
                chain: Mutex::new(None),
                vad_control: VadControl::new(),
                events,
                cancel: CancellationToken::new(),
            }),
        }
    }

    // ── Model lifecycle ──────────────────────────────────────

    /// Load the STT model.
    ///
    /// # Errors
    ///
    /// Returns the recoverable [`AgentError::LoadFailed`] condition on
    /// engine failure.
    pub async fn load_stt(&self, opts: LoadOptions) -> Result<LoadOutcome> {
        self.inner.emit_model_state(ModelRole::Stt, ModelState::Initializing);
        let result = self.inner.stt.load(opts).await;
        self.inner
            .emit_model_state(ModelRole::Stt, self.inner.stt.state());
        result
    }

    /// Load the TTS model.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::LoadFailed`] on engine failure.
    pub async fn load_tts(&self, opts: LoadOptions) -> Result<LoadOutcome> {
        self.inner.emit_model_state(ModelRole::Tts, ModelState::Initializing);
        let result = self.inner.tts.load(opts).await;
        self.inner
            .emit_model_state(ModelRole::Tts, self.inner.tts.state());
        result
    }

    /// Load (or switch to) an LLM model. Only the LLM slot reloads. A load
    /// superseded by a newer selection returns `Ok(None)`, the recognized
    /// cancelled-by-new-command condition, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::LoadFailed`] on engine failure.
    pub async fn load_llm(&self, model_id: &str, opts: LoadOptions) -> Result<Option<LoadOutcome>> {
        self.inner.emit_model_state(ModelRole::Llm, ModelState::Initializing);
        let result = self.inner.llm.load(model_id, opts).await;
        self.inner
            .emit_model_state(ModelRole::Llm, self.inner.llm.state());
        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if e.is_superseded() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load all three models with the same options, sequentially.
    ///
    /// # Errors
    ///
    /// Returns the first load failure.
    pub async fn load_models(&self, opts: LoadOptions) -> Result<()> {
        self.load_stt(opts.clone()).await?;
        let model_id = self.inner.config.llm.model_id.clone();
        self.load_llm(&model_id, opts.clone()).await?;
        self.load_tts(opts).await?;
        Ok(())
    }

    /// Install a UI-facing progress callback for one role's next load.
    /// Per-file byte progress from the loader is aggregated, throttled, and
    /// smoothed by a [`ProgressTracker`] before reaching `callback`.
    pub fn set_load_progress(&self, role: ModelRole, callback: ProgressCallback) {
        let tracker = Mutex::new(ProgressTracker::new(callback));
        let hook: ProgressHook = Box::new(move |event: FileProgress| {
            if let Ok(mut tracker) = tracker.lock() {
                tracker.update(&event);
            }
        });
        match role {
            ModelRole::Stt => self.inner.stt.set_progress_hook(hook),
            ModelRole::Llm => self.inner.llm.set_progress_hook(hook),
            ModelRole::Tts => self.inner.tts.set_progress_hook(hook),
        }
    }

    /// Lifecycle state of one model slot.
    pub fn model_state(&self, role: ModelRole) -> ModelState {
        match role {
            ModelRole::Stt => self.inner.stt.state(),
            ModelRole::Llm => self.inner.llm.state(),
            ModelRole::Tts => self.inner.tts.state(),
        }
    }

    // ── Conversation lifecycle ───────────────────────────────

    /// Start the conversation: requires all three models ready. Enables
    /// speech capture and moves to listening.
    ///
    /// # Errors
    ///
    /// Returns a pipeline error if any model slot is not ready.
    pub fn start(&self) -> Result<()> {
        for role in [ModelRole::Stt, ModelRole::Llm, ModelRole::Tts] {
            if self.model_state(role) != ModelState::Ready {
                return Err(AgentError::Pipeline(format!(
                    "{role} model is not ready"
                )));
            }
        }
        self.inner.vad_control.start();
        self.inner.set_phase(AgentPhase::Listening);
        Ok(())
    }

    /// Hard reset from any phase: cancel generation, stop playback, clear
    /// the pending synthesis chain, disable capture. Idempotent.
    pub fn stop(&self) {
        self.inner.hard_reset();
        self.inner.vad_control.stop();
        self.inner.set_phase(AgentPhase::Idle);
    }

    /// Stop and release every worker. The orchestrator is unusable
    /// afterwards.
    pub fn dispose(&self) {
        self.stop();
        self.inner.cancel.cancel();
        self.inner.stt.shutdown();
        self.inner.llm.shutdown();
        self.inner.tts.shutdown();
    }

    /// Consume VAD events until [`dispose`](Self::dispose) or the channel
    /// closes. Barge-in is handled here, independent of any in-flight
    /// pipeline run.
    pub async fn run(&self, mut vad_rx: mpsc::UnboundedReceiver<VadEvent>) {
        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,
                event = vad_rx.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        VadEvent::SpeechStart => self.inner.handle_speech_start(),
                        VadEvent::SpeechEnd(segment) => self.inner.handle_speech_end(segment),
                    }
                }
            }
        }
    }

    // ── Observability ────────────────────────────────────────

    /// Current phase.
    pub fn phase(&self) -> AgentPhase {
        self.inner.phase_now()
    }

    /// Subscribe to phase changes.
    pub fn phase_rx(&self) -> watch::Receiver<AgentPhase> {
        self.inner.phase.subscribe()
    }

    /// Subscribe to runtime events.
    pub fn events(&self) -> broadcast::Receiver<AgentEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of the conversation so far.
    pub fn conversation(&self) -> Vec<ConversationTurn> {
        self.inner
            .conversation
            .lock()
            .map(|turns| turns.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the LLM-facing message history (system prompt plus what
    /// the user actually heard).
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.inner
            .history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// The capture gate shared with the VAD stage.
    pub fn vad_control(&self) -> VadControl {
        self.inner.vad_control.clone()
    }
}

impl AgentInner {
    fn phase_now(&self) -> AgentPhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: AgentPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            info!("phase: {previous:?} -> {phase:?}");
            self.emit(AgentEvent::Phase(phase));
        }
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    fn emit_model_state(&self, role: ModelRole, state: ModelState) {
        self.emit(AgentEvent::ModelState { role, state });
    }

    fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_live(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Teardown shared by stop and barge-in: invalidate the in-flight
    /// generation, cancel the LLM, short-circuit the synthesis chain, stop
    /// playback, reset the ledger. Fire-and-forget relative to the caller's
    /// phase transition.
    fn hard_reset(&self) {
        self.bump_generation();
        self.llm.cancel();
        if let Ok(mut chain) = self.chain.lock()
            && let Some(handle) = chain.take()
        {
            handle.abort();
        }
        if let Ok(mut playback) = self.playback.lock()
            && let Some(active) = playback.take()
        {
            active.queue.stop();
        }
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.reset();
        }
    }

    /// Speech started. In listening this is just the user talking; while
    /// the agent is thinking or speaking it is a barge-in.
    fn handle_speech_start(&self) {
        if self.phase_now().barge_in_eligible() {
            self.barge_in();
        }
    }

    /// The barge-in protocol. Synchronous on purpose: the phase transition
    /// must not wait for teardown side effects to settle.
    fn barge_in(&self) {
        // 1. What did the user actually hear? Completed clauses plus the one
        //    audibly in progress.
        let spoken = self
            .ledger
            .lock()
            .map(|ledger| ledger.spoken_so_far())
            .unwrap_or_default();

        // 2-5. Invalidate the in-flight run and tear it down.
        self.hard_reset();

        // 3. Record the truncated turn so the next LLM call is conditioned
        //    on what was heard, not on what was planned.
        if !spoken.trim().is_empty() {
            let turn = ConversationTurn::assistant_interrupted(spoken.clone());
            if let Ok(mut conversation) = self.conversation.lock() {
                conversation.push(turn.clone());
            }
            if let Ok(mut history) = self.history.lock() {
                history.push(ChatMessage::assistant(spoken));
            }
            self.emit(AgentEvent::Turn(turn));
        }

        info!("barge-in: returning to listening");
        self.emit(AgentEvent::BargeIn);

        // 6. Keep listening; the interrupting utterance is already being
        //    captured.
        self.set_phase(AgentPhase::Listening);
    }

    /// Speech ended: start a pipeline run if we are listening for one. The
    /// phase claim happens synchronously so a second segment arriving
    /// before the run task is scheduled cannot start a second run.
    fn handle_speech_end(self: &Arc<Self>, segment: SpeechSegment) {
        if self.phase_now() != AgentPhase::Listening {
            debug!("ignoring speech segment outside listening phase");
            return;
        }
        self.set_phase(AgentPhase::Transcribing);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.process_speech(segment).await;
        });
    }

    /// One full pipeline run: STT → LLM token stream → clause extraction →
    /// sequential TTS chain → gapless playback.
    async fn process_speech(self: Arc<Self>, segment: SpeechSegment) {
        let generation = self.bump_generation();
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.reset();
        }

        let stt_started = Instant::now();
        let transcript = match self
            .stt
            .transcribe(segment.samples, segment.sample_rate)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                // Soft failure: one missed utterance must not derail the
                // session.
                warn!("transcription failed, returning to listening: {e}");
                self.return_to_listening(generation);
                return;
            }
        };
        let stt_ms = stt_started.elapsed().as_millis() as u64;

        let text = transcript.text.trim().to_owned();
        if text.is_empty() {
            debug!("empty transcript, nothing to do");
            self.return_to_listening(generation);
            return;
        }

        let user_turn = ConversationTurn::user(text.clone());
        if let Ok(mut conversation) = self.conversation.lock() {
            conversation.push(user_turn.clone());
        }
        if let Ok(mut history) = self.history.lock() {
            history.push(ChatMessage::user(text));
        }
        self.emit(AgentEvent::Turn(user_turn));

        self.set_phase(AgentPhase::Thinking);

        // Fresh audio queue per generation; barge-in stops and discards it.
        let queue = Arc::new(AudioQueue::new(self.config.audio.output_sample_rate));
        let stream = match self.output.attach(Arc::clone(&queue)) {
            Ok(s) => s,
            Err(e) => {
                error!("audio output unavailable: {e}");
                self.return_to_listening(generation);
                return;
            }
        };
        if let Ok(mut playback) = self.playback.lock() {
            *playback = Some(ActivePlayback {
                queue: Arc::clone(&queue),
                _stream: stream,
            });
        }

        let chain = SynthesisChain::spawn(Arc::clone(&self), generation, Arc::clone(&queue));
        if let Ok(mut slot) = self.chain.lock() {
            *slot = Some(chain.handle());
        }

        // Stream the LLM through the clause extractor. The hooks forward
        // into a channel so extraction stays on this task while barge-in
        // runs independently on the event loop.
        let messages = self
            .history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default();
        let opts = GenerateOptions {
            max_new_tokens: self.config.llm.max_new_tokens,
            temperature: self.config.llm.temperature,
        };
        let (stream_tx, mut stream_rx) = mpsc::unbounded_channel::<LlmStreamEvent>();
        let token_tx = stream_tx.clone();
        let done_tx = stream_tx.clone();
        let error_tx = stream_tx;
        self.llm.generate(
            messages,
            opts,
            GenerateHooks {
                on_token: Box::new(move |token| {
                    let _ = token_tx.send(LlmStreamEvent::Token(token));
                }),
                on_done: Box::new(move |outcome| {
                    let _ = done_tx.send(LlmStreamEvent::Done(outcome));
                }),
                on_error: Box::new(move |e| {
                    let _ = error_tx.send(LlmStreamEvent::Error(e));
                }),
            },
        );

        let mut extractor = ClauseExtractor::new(self.config.segmenter.min_clause_words);
        let outcome = loop {
            let Some(event) = stream_rx.recv().await else {
                debug!("LLM stream hooks dropped without a terminal event");
                return;
            };
            match event {
                LlmStreamEvent::Token(token) => {
                    if !self.is_live(generation) {
                        // Barge-in invalidated this run; stop consuming.
                        return;
                    }
                    for clause in extractor.push(&token) {
                        self.submit_clause(generation, &chain, clause);
                    }
                }
                LlmStreamEvent::Done(outcome) => break outcome,
                LlmStreamEvent::Error(e) => {
                    error!("LLM generation failed: {e}");
                    chain.abort();
                    if let Ok(mut playback) = self.playback.lock()
                        && let Some(active) = playback.take()
                    {
                        active.queue.stop();
                    }
                    self.return_to_listening(generation);
                    return;
                }
            }
        };

        // Flush trailing buffered text as the final clause, then wait for
        // every submitted clause to finish synthesizing and enqueueing.
        if let Some(rest) = extractor.flush() {
            self.submit_clause(generation, &chain, rest);
        }
        chain.finish().await;

        // A barge-in mid-flight already appended the truncated turn; this
        // completion is stale.
        if !self.is_live(generation) {
            debug!("generation {generation} superseded; discarding completion");
            return;
        }

        if outcome.full_text.trim().is_empty() {
            debug!("LLM produced no text");
            self.return_to_listening(generation);
            return;
        }

        let metrics = TurnMetrics {
            stt_ms,
            llm_ms: outcome.total_ms,
            llm_tokens_per_sec: outcome.tokens_per_sec,
        };
        let turn = ConversationTurn::assistant(outcome.full_text.clone(), Some(metrics));
        if let Ok(mut conversation) = self.conversation.lock() {
            conversation.push(turn.clone());
        }
        if let Ok(mut history) = self.history.lock() {
            history.push(ChatMessage::assistant(outcome.full_text));
        }
        self.emit(AgentEvent::Turn(turn));

        // The run is committed; consume the ledger so a barge-in during the
        // remaining playback cannot append a second, truncated copy of this
        // turn.
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.reset();
        }

        self.await_playback_drained(&queue).await;

        if self.is_live(generation) {
            if let Ok(mut playback) = self.playback.lock() {
                playback.take();
            }
            if let Ok(mut slot) = self.chain.lock() {
                slot.take();
            }
            self.set_phase(AgentPhase::Listening);
        }
    }

    /// Wait until the queue reports full drain, with the configured safety
    /// timeout in case the end signal never fires.
    async fn await_playback_drained(&self, queue: &Arc<AudioQueue>) {
        let (drained_tx, drained_rx) = oneshot::channel::<()>();
        queue.on_all_ended(Box::new(move || {
            let _ = drained_tx.send(());
        }));

        let timeout = Duration::from_secs(self.config.pipeline.drain_timeout_secs);
        tokio::select! {
            _ = drained_rx => {}
            () = tokio::time::sleep(timeout) => {
                let remaining = queue.scheduled_end_time() - queue.current_time();
                warn!(
                    "playback drain signal missing after {}s ({remaining:.1}s scheduled); continuing",
                    timeout.as_secs()
                );
            }
            () = self.cancel.cancelled() => {}
        }
    }

    fn submit_clause(&self, generation: u64, chain: &SynthesisChain, clause: String) {
        if !self.is_live(generation) {
            return;
        }
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.push(clause.clone());
        }
        self.emit(AgentEvent::AssistantClause(clause.clone()));
        chain.submit(clause);
    }

    /// Playback finished one clause; keep the barge-in ledger accurate.
    fn on_clause_played(&self, generation: u64) {
        if !self.is_live(generation) {
            return;
        }
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.mark_played();
        }
    }

    /// First audio exists for this generation: until now there was nothing
    /// to speak.
    fn enter_speaking(&self, generation: u64) {
        if self.is_live(generation) && self.phase_now() == AgentPhase::Thinking {
            self.set_phase(AgentPhase::Speaking);
        }
    }

    fn return_to_listening(&self, generation: u64) {
        if self.is_live(generation) && self.phase_now() != AgentPhase::Idle {
            self.set_phase(AgentPhase::Listening);
        }
    }
}

/// Strictly sequential synthesis chain for one generation. Clauses are
/// submitted eagerly as the LLM streams, but each synthesis call completes
/// before the next begins: the TTS transport has a single in-flight slot.
struct SynthesisChain {
    tx: Option<mpsc::UnboundedSender<String>>,
    abort: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl SynthesisChain {
    fn spawn(inner: Arc<AgentInner>, generation: u64, queue: Arc<AudioQueue>) -> Self {
        let abort = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let task_abort = Arc::clone(&abort);
        let task = tokio::spawn(async move {
            let voice = inner.config.tts.voice.clone();
            let speed = inner.config.tts.speed;
            let mut first_clause = true;

            while let Some(clause) = rx.recv().await {
                if task_abort.load(Ordering::SeqCst) {
                    // Chain reset: discard still-pending synthesize calls.
                    continue;
                }
                match inner.tts.synthesize(&clause, &voice, speed).await {
                    Ok(audio) => {
                        if task_abort.load(Ordering::SeqCst) {
                            continue;
                        }
                        let played_inner = Arc::clone(&inner);
                        queue.enqueue(
                            audio.samples,
                            audio.sample_rate,
                            Some(Box::new(move || {
                                played_inner.on_clause_played(generation);
                            })),
                        );
                        if first_clause {
                            first_clause = false;
                            inner.enter_speaking(generation);
                        }
                    }
                    Err(e) if e.is_superseded() => {
                        debug!("synthesis call superseded after chain reset");
                    }
                    Err(e) => {
                        // One bad clause leaves a gap; it does not abort the
                        // rest of the response.
                        warn!("TTS failed for clause, skipping: {e}");
                    }
                }
            }
        });

        Self {
            tx: Some(tx),
            abort,
            task,
        }
    }

    fn handle(&self) -> ChainHandle {
        ChainHandle {
            abort: Arc::clone(&self.abort),
        }
    }

    fn submit(&self, clause: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(clause);
        }
    }

    fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Close the chain and wait for every submitted clause to be processed.
    async fn finish(mut self) {
        self.tx.take();
        let _ = self.task.await;
    }
}
