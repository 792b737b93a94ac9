//! Request/response and streaming transports over a worker thread boundary.
//!
//! Contract highlights:
//! - At most one outstanding request/response pair per transport. The slot
//!   does not queue: a second `send` overwrites the first, whose caller
//!   observes the recognized [`AgentError::Superseded`] condition.
//! - Streaming callbacks are swapped in before the triggering command and
//!   cleared on the terminal reply; stale callbacks never fire after
//!   clearing (replies are sequence-tagged and mismatches are dropped).
//! - A worker-side error rejects the pending request and, when a streaming
//!   callback is active, invokes its error path, each exactly once.
//! - `terminate()` drops all worker state; in-flight awaits are abandoned.

use crate::conversation::ChatMessage;
use crate::error::{AgentError, Result};
use crate::models::{GenerateOptions, GenerateOutcome, LoadOptions, LoadOutcome, ProgressFn};
use crate::progress::FileProgress;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Per-file progress callback installed for the duration of a load.
pub type ProgressHook = Box<dyn Fn(FileProgress) + Send + Sync>;

/// Blocking worker body hosted on a dedicated thread by
/// [`InferenceTransport::spawn`].
pub trait InferenceRunner: Send + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    /// Load the underlying model.
    ///
    /// # Errors
    ///
    /// Returns an error if the model cannot be retrieved or initialized.
    fn load(&mut self, opts: &LoadOptions, progress: ProgressFn<'_>) -> Result<LoadOutcome>;

    /// Run one inference request.
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails.
    fn run(&mut self, req: Self::Request) -> Result<Self::Response>;

    /// Release model resources.
    fn dispose(&mut self) {}
}

enum InferenceCommand<Req> {
    Load { seq: u64, opts: LoadOptions },
    Run { seq: u64, req: Req },
    Dispose,
}

enum InferenceReply<Resp> {
    Progress(FileProgress),
    Loaded { seq: u64, outcome: LoadOutcome },
    Output { seq: u64, resp: Resp },
    Failed { seq: u64, error: AgentError },
}

enum TerminalOk<Resp> {
    Loaded(LoadOutcome),
    Output(Resp),
}

type Pending<Resp> = Mutex<Option<(u64, oneshot::Sender<Result<TerminalOk<Resp>>>)>>;

struct InferenceShared<Resp> {
    pending: Pending<Resp>,
    progress: Mutex<Option<ProgressHook>>,
}

/// Request/response bridge to one inference worker thread (STT or TTS
/// shape). Must be created inside a tokio runtime.
pub struct InferenceTransport<Req, Resp> {
    cmd_tx: Mutex<Option<crossbeam_channel::Sender<InferenceCommand<Req>>>>,
    shared: Arc<InferenceShared<Resp>>,
    router: Mutex<Option<tokio::task::JoinHandle<()>>>,
    next_seq: AtomicU64,
}

impl<Req: Send + 'static, Resp: Send + 'static> InferenceTransport<Req, Resp> {
    /// Spawn the worker thread hosting `runner` and the reply router.
    pub fn spawn<R>(runner: R, thread_name: &str) -> Self
    where
        R: InferenceRunner<Request = Req, Response = Resp>,
    {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<InferenceCommand<Req>>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<InferenceReply<Resp>>();

        if let Err(e) = std::thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || inference_worker_loop(runner, &cmd_rx, &reply_tx))
        {
            warn!("failed to spawn inference worker thread: {e}");
        }

        let shared = Arc::new(InferenceShared {
            pending: Mutex::new(None),
            progress: Mutex::new(None),
        });
        let router = tokio::spawn(route_inference_replies(Arc::clone(&shared), reply_rx));

        Self {
            cmd_tx: Mutex::new(Some(cmd_tx)),
            shared,
            router: Mutex::new(Some(router)),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Install the progress callback for an upcoming load. Cleared
    /// automatically on the load's terminal reply.
    pub fn set_progress_hook(&self, hook: ProgressHook) {
        if let Ok(mut slot) = self.shared.progress.lock() {
            *slot = Some(hook);
        }
    }

    /// Load the worker's model.
    ///
    /// # Errors
    ///
    /// Returns the engine's load error, [`AgentError::Superseded`] when a
    /// newer command overwrote this one, or a transport error when the
    /// worker is gone.
    pub async fn load(&self, opts: LoadOptions) -> Result<LoadOutcome> {
        let seq = self.next_seq();
        match self
            .request(seq, InferenceCommand::Load { seq, opts })
            .await?
        {
            TerminalOk::Loaded(outcome) => Ok(outcome),
            TerminalOk::Output(_) => Err(AgentError::Transport(
                "run reply arrived for a load command".into(),
            )),
        }
    }

    /// Run one inference request.
    ///
    /// # Errors
    ///
    /// Returns the engine's error, [`AgentError::Superseded`], or a
    /// transport error.
    pub async fn run(&self, req: Req) -> Result<Resp> {
        let seq = self.next_seq();
        match self.request(seq, InferenceCommand::Run { seq, req }).await? {
            TerminalOk::Output(resp) => Ok(resp),
            TerminalOk::Loaded(_) => Err(AgentError::Transport(
                "load reply arrived for a run command".into(),
            )),
        }
    }

    /// Fire-and-forget dispose of the worker's model.
    pub fn post_dispose(&self) {
        if let Ok(guard) = self.cmd_tx.lock()
            && let Some(tx) = guard.as_ref()
        {
            let _ = tx.send(InferenceCommand::Dispose);
        }
    }

    /// Drop all worker state. Any in-flight request is abandoned; callers
    /// must not await it afterward.
    pub fn terminate(&self) {
        if let Ok(mut guard) = self.cmd_tx.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.router.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.take();
        }
        if let Ok(mut progress) = self.shared.progress.lock() {
            progress.take();
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn request(&self, seq: u64, cmd: InferenceCommand<Req>) -> Result<TerminalOk<Resp>> {
        let (tx, rx) = oneshot::channel();
        install_pending(&self.shared.pending, seq, tx)?;

        let sent = {
            let guard = self
                .cmd_tx
                .lock()
                .map_err(|_| AgentError::Transport("command channel lock poisoned".into()))?;
            match guard.as_ref() {
                Some(cmd_tx) => cmd_tx.send(cmd).is_ok(),
                None => false,
            }
        };
        if !sent {
            if let Ok(mut pending) = self.shared.pending.lock()
                && pending.as_ref().is_some_and(|(s, _)| *s == seq)
            {
                pending.take();
            }
            return Err(AgentError::Transport("worker is terminated".into()));
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped: this command was overwritten by a newer one
            // (or the transport was terminated mid-flight).
            Err(_) => Err(AgentError::Superseded),
        }
    }
}

fn install_pending<Resp>(
    pending: &Pending<Resp>,
    seq: u64,
    tx: oneshot::Sender<Result<TerminalOk<Resp>>>,
) -> Result<()> {
    let mut slot = pending
        .lock()
        .map_err(|_| AgentError::Transport("pending slot lock poisoned".into()))?;
    if let Some((old_seq, _old_tx)) = slot.take() {
        // Single-slot discipline: callers are expected to serialize. The
        // overwritten caller observes Superseded when its sender drops.
        warn!("pending command {old_seq} overwritten by {seq}");
    }
    *slot = Some((seq, tx));
    Ok(())
}

fn inference_worker_loop<R: InferenceRunner>(
    mut runner: R,
    cmd_rx: &crossbeam_channel::Receiver<InferenceCommand<R::Request>>,
    reply_tx: &mpsc::UnboundedSender<InferenceReply<R::Response>>,
) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            InferenceCommand::Load { seq, opts } => {
                let progress = |p: FileProgress| {
                    let _ = reply_tx.send(InferenceReply::Progress(p));
                };
                let reply = match runner.load(&opts, &progress) {
                    Ok(outcome) => InferenceReply::Loaded { seq, outcome },
                    Err(error) => InferenceReply::Failed { seq, error },
                };
                let _ = reply_tx.send(reply);
            }
            InferenceCommand::Run { seq, req } => {
                let reply = match runner.run(req) {
                    Ok(resp) => InferenceReply::Output { seq, resp },
                    Err(error) => InferenceReply::Failed { seq, error },
                };
                let _ = reply_tx.send(reply);
            }
            InferenceCommand::Dispose => runner.dispose(),
        }
    }
    runner.dispose();
}

async fn route_inference_replies<Resp: Send>(
    shared: Arc<InferenceShared<Resp>>,
    mut reply_rx: mpsc::UnboundedReceiver<InferenceReply<Resp>>,
) {
    while let Some(reply) = reply_rx.recv().await {
        match reply {
            InferenceReply::Progress(p) => {
                if let Ok(hook) = shared.progress.lock()
                    && let Some(hook) = hook.as_ref()
                {
                    hook(p);
                }
            }
            InferenceReply::Loaded { seq, outcome } => {
                resolve_pending(&shared.pending, seq, Ok(TerminalOk::Loaded(outcome)));
                clear_hook(&shared.progress);
            }
            InferenceReply::Output { seq, resp } => {
                resolve_pending(&shared.pending, seq, Ok(TerminalOk::Output(resp)));
            }
            InferenceReply::Failed { seq, error } => {
                // Both notification paths, each exactly once: the pending
                // request is rejected and the active progress hook is
                // dropped (its stream simply ends).
                resolve_pending(&shared.pending, seq, Err(error));
                clear_hook(&shared.progress);
            }
        }
    }
}

fn resolve_pending<Resp>(
    pending: &Pending<Resp>,
    seq: u64,
    result: Result<TerminalOk<Resp>>,
) {
    let Ok(mut slot) = pending.lock() else {
        return;
    };
    match slot.take() {
        Some((pending_seq, tx)) if pending_seq == seq => {
            let _ = tx.send(result);
        }
        Some(other) => {
            // Stale terminal reply racing a newer command: discard it and
            // keep the newer pending pair installed.
            debug!("discarding stale reply for command {seq}");
            *slot = Some(other);
        }
        None => debug!("terminal reply {seq} with no pending command"),
    }
}

fn clear_hook(progress: &Mutex<Option<ProgressHook>>) {
    if let Ok(mut hook) = progress.lock() {
        hook.take();
    }
}

// ── LLM transport ────────────────────────────────────────────

/// Blocking LLM worker body hosted by [`LlmTransport::spawn`].
pub trait LlmRunner: Send + 'static {
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
    ) -> Result<LoadOutcome>;

    /// Generate a streamed response, polling `cancelled` between tokens.
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
    ) -> Result<GenerateOutcome>;

    /// Release model resources.
    fn dispose(&mut self) {}
}

/// Streaming callbacks for one generation, installed before the generate
/// command is posted and cleared on its terminal reply.
pub struct GenerateHooks {
    pub on_token: Box<dyn FnMut(String) + Send>,
    pub on_done: Box<dyn FnOnce(GenerateOutcome) + Send>,
    pub on_error: Box<dyn FnOnce(AgentError) + Send>,
}

enum LlmCommand {
    Load {
        seq: u64,
        model_id: String,
        opts: LoadOptions,
    },
    Generate {
        seq: u64,
        messages: Vec<ChatMessage>,
        opts: GenerateOptions,
    },
    Dispose,
}

enum LlmReply {
    Progress(FileProgress),
    Loaded { seq: u64, outcome: LoadOutcome },
    Token { seq: u64, text: String },
    Done { seq: u64, outcome: GenerateOutcome },
    Failed { seq: u64, error: AgentError },
}

struct LlmShared {
    pending: Pending<LoadOutcome>,
    progress: Mutex<Option<ProgressHook>>,
    hooks: Mutex<Option<(u64, GenerateHooks)>>,
}

/// Streaming bridge to the LLM worker thread. Must be created inside a
/// tokio runtime.
pub struct LlmTransport {
    cmd_tx: Mutex<Option<crossbeam_channel::Sender<LlmCommand>>>,
    shared: Arc<LlmShared>,
    router: Mutex<Option<tokio::task::JoinHandle<()>>>,
    cancel_flag: Arc<AtomicBool>,
    next_seq: AtomicU64,
}

impl LlmTransport {
    /// Spawn the worker thread hosting `runner` and the reply router.
    pub fn spawn<R: LlmRunner>(runner: R, thread_name: &str) -> Self {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded::<LlmCommand>();
        let (reply_tx, reply_rx) = mpsc::unbounded_channel::<LlmReply>();
        let cancel_flag = Arc::new(AtomicBool::new(false));

        let worker_cancel = Arc::clone(&cancel_flag);
        if let Err(e) = std::thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || llm_worker_loop(runner, &cmd_rx, &reply_tx, &worker_cancel))
        {
            warn!("failed to spawn LLM worker thread: {e}");
        }

        let shared = Arc::new(LlmShared {
            pending: Mutex::new(None),
            progress: Mutex::new(None),
            hooks: Mutex::new(None),
        });
        let router = tokio::spawn(route_llm_replies(Arc::clone(&shared), reply_rx));

        Self {
            cmd_tx: Mutex::new(Some(cmd_tx)),
            shared,
            router: Mutex::new(Some(router)),
            cancel_flag,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Install the progress callback for an upcoming load.
    pub fn set_progress_hook(&self, hook: ProgressHook) {
        if let Ok(mut slot) = self.shared.progress.lock() {
            *slot = Some(hook);
        }
    }

    /// Load (or switch to) `model_id` on the worker.
    ///
    /// # Errors
    ///
    /// Returns the engine's load error, [`AgentError::Superseded`] when a
    /// newer load overwrote this one, or a transport error.
    pub async fn load(&self, model_id: String, opts: LoadOptions) -> Result<LoadOutcome> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        install_pending(&self.shared.pending, seq, tx)?;

        if !self.post(LlmCommand::Load {
            seq,
            model_id,
            opts,
        }) {
            if let Ok(mut pending) = self.shared.pending.lock()
                && pending.as_ref().is_some_and(|(s, _)| *s == seq)
            {
                pending.take();
            }
            return Err(AgentError::Transport("worker is terminated".into()));
        }

        match rx.await {
            Ok(Ok(TerminalOk::Loaded(outcome))) => Ok(outcome),
            Ok(Ok(TerminalOk::Output(outcome))) => Ok(outcome),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AgentError::Superseded),
        }
    }

    /// Start a generation. Fire-and-forget: progress is reported through
    /// `hooks`, not the pending slot. The cancel flag is reset before the
    /// command is posted.
    pub fn post_generate(
        &self,
        messages: Vec<ChatMessage>,
        opts: GenerateOptions,
        hooks: GenerateHooks,
    ) {
        let seq = self.next_seq();
        self.cancel_flag.store(false, Ordering::SeqCst);
        if let Ok(mut slot) = self.shared.hooks.lock() {
            if slot.is_some() {
                warn!("replacing active generation hooks (seq {seq})");
            }
            *slot = Some((seq, hooks));
        }
        if !self.post(LlmCommand::Generate {
            seq,
            messages,
            opts,
        }) {
            // Worker gone: fail the stream immediately.
            if let Ok(mut slot) = self.shared.hooks.lock()
                && let Some((_, hooks)) = slot.take()
            {
                (hooks.on_error)(AgentError::Transport("worker is terminated".into()));
            }
        }
    }

    /// Request cancellation of the in-flight generation. The worker checks
    /// the flag between token emissions; already-emitted tokens are not
    /// retracted.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Fire-and-forget dispose of the worker's model.
    pub fn post_dispose(&self) {
        let _ = self.post(LlmCommand::Dispose);
    }

    /// Drop all worker state. In-flight awaits are abandoned.
    pub fn terminate(&self) {
        if let Ok(mut guard) = self.cmd_tx.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.router.lock()
            && let Some(handle) = guard.take()
        {
            handle.abort();
        }
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.take();
        }
        if let Ok(mut progress) = self.shared.progress.lock() {
            progress.take();
        }
        if let Ok(mut hooks) = self.shared.hooks.lock() {
            hooks.take();
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn post(&self, cmd: LlmCommand) -> bool {
        match self.cmd_tx.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|tx| tx.send(cmd).is_ok()),
            Err(_) => false,
        }
    }
}

fn llm_worker_loop<R: LlmRunner>(
    mut runner: R,
    cmd_rx: &crossbeam_channel::Receiver<LlmCommand>,
    reply_tx: &mpsc::UnboundedSender<LlmReply>,
    cancel_flag: &Arc<AtomicBool>,
) {
    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            LlmCommand::Load {
                seq,
                model_id,
                opts,
            } => {
                let progress = |p: FileProgress| {
                    let _ = reply_tx.send(LlmReply::Progress(p));
                };
                let reply = match runner.load(&model_id, &opts, &progress) {
                    Ok(outcome) => LlmReply::Loaded { seq, outcome },
                    Err(error) => LlmReply::Failed { seq, error },
                };
                let _ = reply_tx.send(reply);
            }
            LlmCommand::Generate {
                seq,
                messages,
                opts,
            } => {
                let mut emit = |token: &str| {
                    let _ = reply_tx.send(LlmReply::Token {
                        seq,
                        text: token.to_owned(),
                    });
                };
                let flag = Arc::clone(cancel_flag);
                let cancelled = move || flag.load(Ordering::SeqCst);
                let reply = match runner.generate(&messages, &opts, &mut emit, &cancelled) {
                    Ok(outcome) => LlmReply::Done { seq, outcome },
                    Err(error) => LlmReply::Failed { seq, error },
                };
                let _ = reply_tx.send(reply);
            }
            LlmCommand::Dispose => runner.dispose(),
        }
    }
    runner.dispose();
}

async fn route_llm_replies(shared: Arc<LlmShared>, mut reply_rx: mpsc::UnboundedReceiver<LlmReply>) {
    while let Some(reply) = reply_rx.recv().await {
        match reply {
            LlmReply::Progress(p) => {
                if let Ok(hook) = shared.progress.lock()
                    && let Some(hook) = hook.as_ref()
                {
                    hook(p);
                }
            }
            LlmReply::Loaded { seq, outcome } => {
                resolve_pending(&shared.pending, seq, Ok(TerminalOk::Loaded(outcome)));
                clear_hook(&shared.progress);
            }
            LlmReply::Token { seq, text } => {
                if let Ok(mut slot) = shared.hooks.lock()
                    && let Some((hook_seq, hooks)) = slot.as_mut()
                    && *hook_seq == seq
                {
                    (hooks.on_token)(text);
                }
            }
            LlmReply::Done { seq, outcome } => {
                let taken = take_hooks_if_current(&shared.hooks, seq);
                if let Some(hooks) = taken {
                    (hooks.on_done)(outcome);
                } else {
                    debug!("discarding stale generation completion (seq {seq})");
                }
            }
            LlmReply::Failed { seq, error } => {
                // Worker error: reject the matching pending request and
                // notify the matching generation's error path, exactly once
                // each.
                let message = error.to_string();
                resolve_pending(&shared.pending, seq, Err(error));
                clear_hook(&shared.progress);
                if let Some(hooks) = take_hooks_if_current(&shared.hooks, seq) {
                    (hooks.on_error)(AgentError::Llm(message));
                }
            }
        }
    }
}

fn take_hooks_if_current(
    hooks: &Mutex<Option<(u64, GenerateHooks)>>,
    seq: u64,
) -> Option<GenerateHooks> {
    let mut slot = hooks.lock().ok()?;
    match slot.take() {
        Some((hook_seq, hooks)) if hook_seq == seq => Some(hooks),
        Some(other) => {
            *slot = Some(other);
            None
        }
        None => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::models::Backend;
    use std::time::Duration;

    struct EchoRunner {
        loaded: bool,
        /// Optional gate: `run` blocks until the paired sender fires.
        gate: Option<crossbeam_channel::Receiver<()>>,
    }

    impl EchoRunner {
        fn new() -> Self {
            Self {
                loaded: false,
                gate: None,
            }
        }
    }

    impl InferenceRunner for EchoRunner {
        type Request = String;
        type Response = String;

        fn load(&mut self, _opts: &LoadOptions, progress: ProgressFn<'_>) -> Result<LoadOutcome> {
            progress(FileProgress {
                file: "weights.bin".into(),
                loaded: 10,
                total: 100,
            });
            progress(FileProgress {
                file: "weights.bin".into(),
                loaded: 100,
                total: 100,
            });
            self.loaded = true;
            Ok(LoadOutcome {
                backend: Backend::Cpu,
                load_ms: 1,
            })
        }

        fn run(&mut self, req: String) -> Result<String> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv();
            }
            if !self.loaded {
                return Err(AgentError::Stt("not loaded".into()));
            }
            if req == "boom" {
                return Err(AgentError::Stt("inference exploded".into()));
            }
            Ok(format!("echo:{req}"))
        }
    }

    // ── Inference transport ──────────────────────────────────

    #[tokio::test]
    async fn load_then_run_round_trips() {
        let t = InferenceTransport::spawn(EchoRunner::new(), "test-echo");
        let outcome = t.load(LoadOptions::default()).await.unwrap();
        assert_eq!(outcome.backend, Backend::Cpu);
        let out = t.run("hello".to_owned()).await.unwrap();
        assert_eq!(out, "echo:hello");
        t.terminate();
    }

    #[tokio::test]
    async fn progress_hook_fires_during_load_and_is_cleared_after() {
        let t = InferenceTransport::spawn(EchoRunner::new(), "test-progress");
        let (tx, mut rx) = mpsc::unbounded_channel();
        t.set_progress_hook(Box::new(move |p| {
            let _ = tx.send(p);
        }));

        t.load(LoadOptions::default()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().loaded, 10);
        assert_eq!(rx.recv().await.unwrap().loaded, 100);

        // Hook was cleared on the terminal reply: a second load emits no
        // further events on the old hook.
        t.load(LoadOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        t.terminate();
    }

    #[tokio::test]
    async fn run_error_rejects_the_pending_request() {
        let t = InferenceTransport::spawn(EchoRunner::new(), "test-error");
        t.load(LoadOptions::default()).await.unwrap();
        let err = t.run("boom".to_owned()).await.unwrap_err();
        assert!(matches!(err, AgentError::Stt(_)));

        // The transport stays usable afterwards.
        let out = t.run("again".to_owned()).await.unwrap();
        assert_eq!(out, "echo:again");
        t.terminate();
    }

    #[tokio::test]
    async fn overwritten_command_resolves_as_superseded() {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let mut runner = EchoRunner::new();
        runner.loaded = true;
        runner.gate = Some(gate_rx);
        let t = Arc::new(InferenceTransport::spawn(runner, "test-superseded"));

        let t1 = Arc::clone(&t);
        let first = tokio::spawn(async move { t1.run("first".to_owned()).await });
        // Let the worker pick up the first command and block on the gate.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let t2 = Arc::clone(&t);
        let second = tokio::spawn(async move { t2.run("second".to_owned()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Release both runs: the first command's terminal reply is stale and
        // must be dropped; the second resolves normally.
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();

        let first = first.await.unwrap();
        assert!(matches!(first, Err(AgentError::Superseded)));
        let second = second.await.unwrap().unwrap();
        assert_eq!(second, "echo:second");
        t.terminate();
    }

    #[tokio::test]
    async fn run_after_terminate_fails_fast() {
        let t = InferenceTransport::spawn(EchoRunner::new(), "test-terminate");
        t.terminate();
        let err = t.run("x".to_owned()).await.unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }

    // ── LLM transport ────────────────────────────────────────

    struct ScriptRunner {
        tokens: Vec<&'static str>,
        token_gate: Option<crossbeam_channel::Receiver<()>>,
        fail_generate: bool,
    }

    impl LlmRunner for ScriptRunner {
        fn load(
            &mut self,
            _model_id: &str,
            _opts: &LoadOptions,
            _progress: ProgressFn<'_>,
        ) -> Result<LoadOutcome> {
            Ok(LoadOutcome {
                backend: Backend::Cpu,
                load_ms: 1,
            })
        }

        fn generate(
            &mut self,
            _messages: &[ChatMessage],
            _opts: &GenerateOptions,
            emit: &mut dyn FnMut(&str),
            cancelled: &dyn Fn() -> bool,
        ) -> Result<GenerateOutcome> {
            if self.fail_generate {
                return Err(AgentError::Llm("generation failed".into()));
            }
            let mut emitted = Vec::new();
            for token in &self.tokens {
                if cancelled() {
                    return Ok(GenerateOutcome {
                        full_text: emitted.concat(),
                        total_ms: 1,
                        token_count: emitted.len(),
                        tokens_per_sec: 0.0,
                        cancelled: true,
                    });
                }
                if let Some(gate) = &self.token_gate {
                    let _ = gate.recv();
                }
                emit(token);
                emitted.push((*token).to_owned());
            }
            Ok(GenerateOutcome {
                full_text: emitted.concat(),
                total_ms: 1,
                token_count: emitted.len(),
                tokens_per_sec: 100.0,
                cancelled: false,
            })
        }
    }

    fn collecting_hooks() -> (
        GenerateHooks,
        mpsc::UnboundedReceiver<String>,
        oneshot::Receiver<Result<GenerateOutcome>>,
    ) {
        let (tok_tx, tok_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let hooks = GenerateHooks {
            on_token: Box::new(move |t| {
                let _ = tok_tx.send(t);
            }),
            on_done: Box::new(move |outcome| {
                let _ = done_tx.send(Ok(outcome));
            }),
            on_error: Box::new(|_| {}),
        };
        (hooks, tok_rx, done_rx)
    }

    #[tokio::test]
    async fn tokens_stream_in_order_then_done() {
        let t = LlmTransport::spawn(
            ScriptRunner {
                tokens: vec!["Hel", "lo ", "there"],
                token_gate: None,
                fail_generate: false,
            },
            "test-llm",
        );
        t.load("m".into(), LoadOptions::default()).await.unwrap();

        let (hooks, mut tok_rx, done_rx) = collecting_hooks();
        t.post_generate(
            Vec::new(),
            GenerateOptions {
                max_new_tokens: 16,
                temperature: 0.7,
            },
            hooks,
        );

        let outcome = done_rx.await.unwrap().unwrap();
        assert_eq!(outcome.full_text, "Hello there");
        assert!(!outcome.cancelled);

        let mut tokens = Vec::new();
        while let Ok(tok) = tok_rx.try_recv() {
            tokens.push(tok);
        }
        assert_eq!(tokens, vec!["Hel", "lo ", "there"]);
        t.terminate();
    }

    #[tokio::test]
    async fn cancel_stops_between_token_emissions() {
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let t = LlmTransport::spawn(
            ScriptRunner {
                tokens: vec!["a", "b", "c", "d"],
                token_gate: Some(gate_rx),
                fail_generate: false,
            },
            "test-llm-cancel",
        );
        t.load("m".into(), LoadOptions::default()).await.unwrap();

        let (hooks, _tok_rx, done_rx) = collecting_hooks();
        t.post_generate(
            Vec::new(),
            GenerateOptions {
                max_new_tokens: 16,
                temperature: 0.7,
            },
            hooks,
        );

        // Allow two tokens through, then cancel.
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        t.cancel();
        gate_tx.send(()).unwrap();

        let outcome = done_rx.await.unwrap().unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.token_count < 4);
        t.terminate();
    }

    #[tokio::test]
    async fn generation_error_invokes_error_hook_once() {
        let t = LlmTransport::spawn(
            ScriptRunner {
                tokens: vec![],
                token_gate: None,
                fail_generate: true,
            },
            "test-llm-error",
        );
        t.load("m".into(), LoadOptions::default()).await.unwrap();

        let (err_tx, err_rx) = oneshot::channel();
        let hooks = GenerateHooks {
            on_token: Box::new(|_| {}),
            on_done: Box::new(|_| panic!("done must not fire on error")),
            on_error: Box::new(move |e| {
                let _ = err_tx.send(e);
            }),
        };
        t.post_generate(
            Vec::new(),
            GenerateOptions {
                max_new_tokens: 16,
                temperature: 0.7,
            },
            hooks,
        );

        let err = err_rx.await.unwrap();
        assert!(matches!(err, AgentError::Llm(_)));
        t.terminate();
    }

    #[tokio::test]
    async fn superseded_load_is_the_recognized_condition() {
        struct SlowLoad {
            gate: crossbeam_channel::Receiver<()>,
        }
        impl LlmRunner for SlowLoad {
            fn load(
                &mut self,
                _model_id: &str,
                _opts: &LoadOptions,
                _progress: ProgressFn<'_>,
            ) -> Result<LoadOutcome> {
                let _ = self.gate.recv();
                Ok(LoadOutcome {
                    backend: Backend::Cpu,
                    load_ms: 1,
                })
            }
            fn generate(
                &mut self,
                _messages: &[ChatMessage],
                _opts: &GenerateOptions,
                _emit: &mut dyn FnMut(&str),
                _cancelled: &dyn Fn() -> bool,
            ) -> Result<GenerateOutcome> {
                Err(AgentError::Llm("unused".into()))
            }
        }

        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let t = Arc::new(LlmTransport::spawn(
            SlowLoad { gate: gate_rx },
            "test-llm-switch",
        ));

        let t1 = Arc::clone(&t);
        let first = tokio::spawn(async move { t1.load("old-model".into(), LoadOptions::default()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let t2 = Arc::clone(&t);
        let second =
            tokio::spawn(async move { t2.load("new-model".into(), LoadOptions::default()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();

        let first = first.await.unwrap();
        assert!(first.as_ref().is_err_and(AgentError::is_superseded));
        assert!(second.await.unwrap().is_ok());
        t.terminate();
    }
}
