//! Scripted end-to-end latency harness.
//!
//! Runs one scripted conversation through the full pipeline (VAD events →
//! STT → LLM token stream → clause extraction → sequential TTS → gapless
//! playback) with deterministic engines and a fast-paced output sink, then
//! prints a JSON report with time-to-first-audio.

use aloud::audio::output::PacedOutput;
use aloud::config::AgentConfig;
use aloud::conversation::{AgentPhase, ConversationTurn};
use aloud::models::LoadOptions;
use aloud::models::scripted::{ScriptedLlm, ScriptedStt, ScriptedTts};
use aloud::pipeline::messages::SpeechSegment;
use aloud::pipeline::orchestrator::{AgentOrchestrator, EngineSet};
use aloud::vad::VadEvent;
use anyhow::{Context, bail};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Serialize)]
struct HarnessReport {
    time_to_first_audio_ms: u64,
    total_turn_ms: u64,
    turns: Vec<ConversationTurn>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Runtime::new().context("failed to build tokio runtime")?;
    runtime.block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = AgentConfig::default();

    let engines = EngineSet {
        stt: Box::new(
            ScriptedStt::new(vec!["What is the weather like today?"])
                .with_transcribe_delay(Duration::from_millis(20)),
        ),
        llm: Box::new(
            ScriptedLlm::from_text(
                "It is sunny and warm out there. Expect clear skies for the rest of the afternoon.",
            )
            .with_token_delay(Duration::from_millis(5)),
        ),
        tts: Box::new(
            ScriptedTts::new(config.audio.output_sample_rate, 240)
                .with_synth_delay(Duration::from_millis(15)),
        ),
    };

    // Render well above real time so the harness finishes quickly.
    let output = Arc::new(PacedOutput::new(2048, 50.0));
    let agent = AgentOrchestrator::new(config, engines, output);

    for role in [
        aloud::models::ModelRole::Stt,
        aloud::models::ModelRole::Llm,
        aloud::models::ModelRole::Tts,
    ] {
        agent.set_load_progress(
            role,
            Box::new(move |progress| {
                tracing::info!("{role} load progress: {progress:?}");
            }),
        );
    }
    agent
        .load_models(LoadOptions::default())
        .await
        .context("model load failed")?;

    let (vad_tx, vad_rx) = mpsc::unbounded_channel::<VadEvent>();
    let mut events = agent.events();

    agent.start().context("start failed")?;
    let run_agent = agent.clone();
    let run_task = tokio::spawn(async move { run_agent.run(vad_rx).await });

    // One scripted utterance.
    let utterance_at = Instant::now();
    vad_tx.send(VadEvent::SpeechStart)?;
    vad_tx.send(VadEvent::SpeechEnd(SpeechSegment {
        samples: vec![0.1; 16_000],
        sample_rate: 16_000,
        started_at: utterance_at,
    }))?;

    // Time to first audio: the transition into speaking.
    let mut first_audio_ms = None;
    let deadline = Duration::from_secs(30);
    loop {
        let event = tokio::time::timeout(deadline, events.recv())
            .await
            .context("timed out waiting for pipeline events")?
            .context("event stream closed")?;
        match event {
            aloud::pipeline::AgentEvent::Phase(AgentPhase::Speaking) => {
                first_audio_ms.get_or_insert(utterance_at.elapsed().as_millis() as u64);
            }
            aloud::pipeline::AgentEvent::Phase(AgentPhase::Listening)
                if first_audio_ms.is_some() =>
            {
                break;
            }
            _ => {}
        }
    }
    let total_turn_ms = utterance_at.elapsed().as_millis() as u64;

    agent.dispose();
    let _ = run_task.await;

    let turns = agent.conversation();
    if turns.len() != 2 {
        bail!("expected a user and an assistant turn, got {}", turns.len());
    }

    let Some(first_audio_ms) = first_audio_ms else {
        bail!("agent never entered the speaking phase");
    };
    let report = HarnessReport {
        time_to_first_audio_ms: first_audio_ms,
        total_turn_ms,
        turns,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
