//! Output sinks that drive an [`AudioQueue`]'s render clock.

use crate::audio::queue::AudioQueue;
use crate::error::{AgentError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info};

/// A live playback stream. Dropping it halts rendering for the attached
/// queue.
pub trait PlaybackStream: Send {}

/// Something that can drive an [`AudioQueue`]: a real output device, a
/// paced background renderer, or the host itself.
pub trait AudioOutput: Send + Sync {
    /// Start rendering `queue` until the returned stream is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be started (e.g. no output
    /// device).
    fn attach(&self, queue: Arc<AudioQueue>) -> Result<Box<dyn PlaybackStream>>;
}

// ── cpal device output ───────────────────────────────────────

/// Real speaker output via cpal.
pub struct CpalOutput {
    /// Output device name (None = system default).
    pub device_name: Option<String>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }
}

impl AudioOutput for CpalOutput {
    fn attach(&self, queue: Arc<AudioQueue>) -> Result<Box<dyn PlaybackStream>> {
        // cpal streams are not Send on every platform, so the stream lives
        // on a dedicated thread that parks until the handle is dropped.
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let device_name = self.device_name.clone();

        std::thread::Builder::new()
            .name("aloud-playback".into())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), &queue) {
                    Ok(s) => {
                        let _ = ready_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until the handle drops (send side disconnects).
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AgentError::Audio(format!("failed to spawn playback thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| AgentError::Audio("playback thread died during startup".into()))??;

        Ok(Box::new(ThreadedStream { _stop_tx: stop_tx }))
    }
}

struct ThreadedStream {
    _stop_tx: crossbeam_channel::Sender<()>,
}

impl PlaybackStream for ThreadedStream {}

fn build_stream(device_name: Option<&str>, queue: &Arc<AudioQueue>) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| AgentError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| AgentError::Audio(format!("output device '{name}' not found")))?
    } else {
        host.default_output_device()
            .ok_or_else(|| AgentError::Audio("no default output device".into()))?
    };

    let device_desc = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("using output device: {device_desc}");

    let stream_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: queue.output_sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let render_queue = Arc::clone(queue);
    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                render_queue.render(data);
            },
            move |err| {
                error!("audio output stream error: {err}");
            },
            None,
        )
        .map_err(|e| AgentError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| AgentError::Audio(format!("failed to start output stream: {e}")))?;

    Ok(stream)
}

// ── Paced background renderer ────────────────────────────────

/// Renders the queue from a background thread at a configurable pace.
/// `pace = 1.0` approximates real time; larger values render faster.
/// Useful for harnesses and soak tests without an audio device.
pub struct PacedOutput {
    buffer_frames: usize,
    pace: f64,
}

impl PacedOutput {
    pub fn new(buffer_frames: usize, pace: f64) -> Self {
        Self {
            buffer_frames,
            pace: pace.max(0.01),
        }
    }
}

impl Default for PacedOutput {
    fn default() -> Self {
        Self::new(512, 1.0)
    }
}

impl AudioOutput for PacedOutput {
    fn attach(&self, queue: Arc<AudioQueue>) -> Result<Box<dyn PlaybackStream>> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let frames = self.buffer_frames;
        let interval = Duration::from_secs_f64(
            frames as f64 / f64::from(queue.output_sample_rate()) / self.pace,
        );

        std::thread::Builder::new()
            .name("aloud-paced-output".into())
            .spawn(move || {
                let mut scratch = vec![0.0f32; frames];
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                            queue.render(&mut scratch);
                        }
                    }
                }
            })
            .map_err(|e| AgentError::Audio(format!("failed to spawn paced output: {e}")))?;

        Ok(Box::new(ThreadedStream { _stop_tx: stop_tx }))
    }
}

// ── Host-pulled output ───────────────────────────────────────

/// No background rendering: the host (or a test) pulls samples itself via
/// [`latest`](Self::latest) and [`AudioQueue::render`].
#[derive(Default)]
pub struct ManualOutput {
    queues: Mutex<Vec<Arc<AudioQueue>>>,
}

impl ManualOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently attached queue.
    pub fn latest(&self) -> Option<Arc<AudioQueue>> {
        self.queues.lock().ok()?.last().cloned()
    }

    /// Render `frames` samples from the most recently attached queue.
    pub fn pump(&self, frames: usize) {
        if let Some(queue) = self.latest() {
            let mut scratch = vec![0.0f32; frames];
            queue.render(&mut scratch);
        }
    }
}

struct ManualStream;

impl PlaybackStream for ManualStream {}

impl AudioOutput for ManualOutput {
    fn attach(&self, queue: Arc<AudioQueue>) -> Result<Box<dyn PlaybackStream>> {
        if let Ok(mut queues) = self.queues.lock() {
            queues.push(queue);
        }
        Ok(Box::new(ManualStream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_output_tracks_latest_queue() {
        let output = ManualOutput::new();
        assert!(output.latest().is_none());

        let q1 = Arc::new(AudioQueue::new(16_000));
        let q2 = Arc::new(AudioQueue::new(16_000));
        let _s1 = output.attach(Arc::clone(&q1)).unwrap();
        let _s2 = output.attach(Arc::clone(&q2)).unwrap();

        let latest = output.latest().unwrap();
        assert!(Arc::ptr_eq(&latest, &q2));
    }

    #[test]
    fn manual_pump_advances_the_clock() {
        let output = ManualOutput::new();
        let q = Arc::new(AudioQueue::new(16_000));
        let _s = output.attach(Arc::clone(&q)).unwrap();
        q.enqueue(vec![0.5; 32], 16_000, None);

        output.pump(32);
        assert!(!q.is_playing());
    }

    #[test]
    fn paced_output_drains_a_queue() {
        let output = PacedOutput::new(256, 1000.0);
        let q = Arc::new(AudioQueue::new(16_000));
        let stream = output.attach(Arc::clone(&q)).unwrap();
        q.enqueue(vec![0.5; 2048], 16_000, None);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while q.is_playing() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!q.is_playing());
        drop(stream);
    }
}
