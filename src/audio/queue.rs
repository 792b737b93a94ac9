//! Gapless sequential playback scheduler over a single output clock.
//!
//! The queue is render-driven: an output sink (cpal stream, paced driver,
//! or the host itself) repeatedly calls [`AudioQueue::render`] to fill the
//! next output buffer, which advances the sample-domain clock. `enqueue`
//! may be called at unpredictable times relative to playback; units still
//! play in enqueue order with no gap and no overlap.

use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

/// Completion callback for one scheduled unit.
pub type EndedCallback = Box<dyn FnOnce() + Send>;

/// Gapless playback scheduler. One instance per pipeline generation.
pub struct AudioQueue {
    output_sample_rate: u32,
    state: Mutex<QueueState>,
}

struct QueueState {
    units: VecDeque<ScheduledUnit>,
    /// Samples rendered since creation (the output clock).
    clock: u64,
    /// Absolute sample index where the next enqueued unit starts.
    next_start: u64,
    stopped: bool,
    enqueued: usize,
    completed: usize,
    on_all_ended: Option<EndedCallback>,
}

struct ScheduledUnit {
    samples: Vec<f32>,
    /// Absolute start sample index on the output clock.
    start: u64,
    cursor: usize,
    on_ended: Option<EndedCallback>,
}

impl AudioQueue {
    /// Create an empty queue rendering at `output_sample_rate`.
    pub fn new(output_sample_rate: u32) -> Self {
        Self {
            output_sample_rate,
            state: Mutex::new(QueueState {
                units: VecDeque::new(),
                clock: 0,
                next_start: 0,
                stopped: false,
                enqueued: 0,
                completed: 0,
                on_all_ended: None,
            }),
        }
    }

    /// Output sample rate in Hz.
    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    /// Schedule `samples` to start at `max(clock, end of previously
    /// scheduled audio)`. `on_ended` fires once the unit finishes playback.
    ///
    /// After [`stop()`](Self::stop) this is a no-op.
    pub fn enqueue(&self, samples: Vec<f32>, sample_rate: u32, on_ended: Option<EndedCallback>) {
        let samples = if sample_rate == self.output_sample_rate {
            samples
        } else {
            resample_linear(&samples, sample_rate, self.output_sample_rate)
        };

        let Ok(mut st) = self.state.lock() else {
            return;
        };
        if st.stopped {
            return;
        }
        let start = st.clock.max(st.next_start);
        st.next_start = start + samples.len() as u64;
        st.enqueued += 1;
        st.units.push_back(ScheduledUnit {
            samples,
            start,
            cursor: 0,
            on_ended,
        });
    }

    /// Forcibly halt all pending and playing units. Idempotent. Pending
    /// completion callbacks (including `on_all_ended`) are discarded, not
    /// fired.
    pub fn stop(&self) {
        let Ok(mut st) = self.state.lock() else {
            return;
        };
        st.stopped = true;
        st.units.clear();
        st.on_all_ended = None;
    }

    /// Whether any scheduled audio remains.
    pub fn is_playing(&self) -> bool {
        self.state
            .lock()
            .map(|st| !st.stopped && !st.units.is_empty())
            .unwrap_or(false)
    }

    /// Output clock position in seconds.
    pub fn current_time(&self) -> f64 {
        self.state
            .lock()
            .map(|st| st.clock as f64 / f64::from(self.output_sample_rate))
            .unwrap_or(0.0)
    }

    /// End of the scheduled audio (the watermark) in seconds. The gap to
    /// [`current_time`](Self::current_time) estimates remaining playback.
    pub fn scheduled_end_time(&self) -> f64 {
        self.state
            .lock()
            .map(|st| st.next_start as f64 / f64::from(self.output_sample_rate))
            .unwrap_or(0.0)
    }

    /// Register the drained callback: fires once when every enqueued unit
    /// has finished playback. If the queue is already fully drained the
    /// callback fires immediately. Never fires after `stop()`.
    pub fn on_all_ended(&self, cb: EndedCallback) {
        let fire_now = {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if st.stopped {
                return;
            }
            if st.units.is_empty() && st.enqueued > 0 && st.completed == st.enqueued {
                true
            } else {
                if st.on_all_ended.is_some() {
                    warn!("replacing a pending on_all_ended callback");
                }
                st.on_all_ended = Some(cb);
                return;
            }
        };
        if fire_now {
            cb();
        }
    }

    /// Fill `out` with the next stretch of scheduled audio (zero-filling
    /// any unscheduled stretch) and advance the output clock. Completion
    /// callbacks run after the internal lock is released.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut finished: Vec<EndedCallback> = Vec::new();
        let mut all_ended: Option<EndedCallback> = None;

        {
            let Ok(mut st) = self.state.lock() else {
                return;
            };
            if st.stopped {
                return;
            }

            let mut pos = 0usize;
            while pos < out.len() {
                let abs = st.clock + pos as u64;
                let Some(unit) = st.units.front_mut() else {
                    break;
                };
                if unit.start > abs {
                    // Not scheduled yet at this clock position; leave the
                    // gap silent.
                    let gap = (unit.start - abs) as usize;
                    pos = (pos + gap).min(out.len());
                    continue;
                }
                let n = (out.len() - pos).min(unit.samples.len() - unit.cursor);
                out[pos..pos + n].copy_from_slice(&unit.samples[unit.cursor..unit.cursor + n]);
                unit.cursor += n;
                pos += n;
                let unit_done = unit.cursor == unit.samples.len();
                if unit_done && let Some(mut done) = st.units.pop_front() {
                    if let Some(cb) = done.on_ended.take() {
                        finished.push(cb);
                    }
                    st.completed += 1;
                }
            }
            st.clock += out.len() as u64;

            if st.units.is_empty() && st.enqueued > 0 && st.completed == st.enqueued {
                all_ended = st.on_all_ended.take();
            }
        }

        for cb in finished {
            cb();
        }
        if let Some(cb) = all_ended {
            cb();
        }
    }
}

/// Linear-interpolation resampler for synthesized clauses arriving at a
/// rate other than the output clock's.
fn resample_linear(samples: &[f32], from: u32, to: u32) -> Vec<f32> {
    if samples.is_empty() || from == to {
        return samples.to_vec();
    }
    let ratio = f64::from(from) / f64::from(to);
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let i0 = (src.floor() as usize).min(last);
            let i1 = (i0 + 1).min(last);
            let frac = (src - i0 as f64) as f32;
            samples[i0] + (samples[i1] - samples[i0]) * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter_cb(counter: &Arc<AtomicUsize>) -> EndedCallback {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    // ── Ordering and gaplessness ─────────────────────────────

    #[test]
    fn enqueue_order_is_playback_order_with_no_gap() {
        let q = AudioQueue::new(16_000);
        q.enqueue(vec![0.1; 4], 16_000, None);
        q.enqueue(vec![0.2; 4], 16_000, None);
        q.enqueue(vec![0.3; 4], 16_000, None);

        let mut out = vec![0.0f32; 12];
        q.render(&mut out);

        let mut expected = vec![0.1f32; 4];
        expected.extend(vec![0.2f32; 4]);
        expected.extend(vec![0.3f32; 4]);
        assert_eq!(out, expected);
    }

    #[test]
    fn enqueue_during_playback_stays_contiguous() {
        let q = AudioQueue::new(16_000);
        q.enqueue(vec![0.1; 4], 16_000, None);

        // Render into the middle of the first unit, then enqueue the next.
        let mut out = vec![0.0f32; 2];
        q.render(&mut out);
        assert_eq!(out, vec![0.1, 0.1]);

        q.enqueue(vec![0.2; 4], 16_000, None);
        let mut rest = vec![0.0f32; 6];
        q.render(&mut rest);
        assert_eq!(rest, vec![0.1, 0.1, 0.2, 0.2, 0.2, 0.2]);
    }

    #[test]
    fn watermark_advances_by_unit_duration() {
        let q = AudioQueue::new(16_000);
        assert!((q.scheduled_end_time() - 0.0).abs() < f64::EPSILON);
        q.enqueue(vec![0.0; 16_000], 16_000, None);
        assert!((q.scheduled_end_time() - 1.0).abs() < 1e-9);
        q.enqueue(vec![0.0; 8_000], 16_000, None);
        assert!((q.scheduled_end_time() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn current_time_tracks_rendered_samples() {
        let q = AudioQueue::new(16_000);
        q.enqueue(vec![0.0; 32], 16_000, None);
        let mut out = vec![0.0f32; 16];
        q.render(&mut out);
        assert!((q.current_time() - 0.001).abs() < 1e-9);
    }

    // ── Completion callbacks ─────────────────────────────────

    #[test]
    fn on_ended_fires_per_unit_in_order() {
        let q = AudioQueue::new(16_000);
        let played = Arc::new(AtomicUsize::new(0));
        q.enqueue(vec![0.1; 4], 16_000, Some(counter_cb(&played)));
        q.enqueue(vec![0.2; 4], 16_000, Some(counter_cb(&played)));

        let mut out = vec![0.0f32; 4];
        q.render(&mut out);
        assert_eq!(played.load(Ordering::SeqCst), 1);

        q.render(&mut out);
        assert_eq!(played.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn on_all_ended_fires_once_after_last_unit() {
        let q = AudioQueue::new(16_000);
        let drained = Arc::new(AtomicUsize::new(0));
        q.enqueue(vec![0.1; 4], 16_000, None);
        q.enqueue(vec![0.2; 4], 16_000, None);
        q.on_all_ended(counter_cb(&drained));

        let mut out = vec![0.0f32; 4];
        q.render(&mut out);
        assert_eq!(drained.load(Ordering::SeqCst), 0);
        q.render(&mut out);
        assert_eq!(drained.load(Ordering::SeqCst), 1);

        // Further renders do not re-fire.
        q.render(&mut out);
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_all_ended_fires_immediately_when_already_drained() {
        let q = AudioQueue::new(16_000);
        q.enqueue(vec![0.1; 4], 16_000, None);
        let mut out = vec![0.0f32; 4];
        q.render(&mut out);

        let drained = Arc::new(AtomicUsize::new(0));
        q.on_all_ended(counter_cb(&drained));
        assert_eq!(drained.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_all_ended_never_fires_on_empty_queue() {
        let q = AudioQueue::new(16_000);
        let drained = Arc::new(AtomicUsize::new(0));
        q.on_all_ended(counter_cb(&drained));
        let mut out = vec![0.0f32; 8];
        q.render(&mut out);
        assert_eq!(drained.load(Ordering::SeqCst), 0);
    }

    // ── Stop semantics ───────────────────────────────────────

    #[test]
    fn stop_is_idempotent_and_silences_render() {
        let q = AudioQueue::new(16_000);
        q.enqueue(vec![0.5; 8], 16_000, None);
        q.stop();
        q.stop();

        assert!(!q.is_playing());
        let mut out = vec![1.0f32; 4];
        q.render(&mut out);
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn enqueue_after_stop_is_a_no_op() {
        let q = AudioQueue::new(16_000);
        q.stop();
        q.enqueue(vec![0.5; 8], 16_000, None);
        assert!(!q.is_playing());
    }

    #[test]
    fn stop_discards_pending_callbacks() {
        let q = AudioQueue::new(16_000);
        let played = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(AtomicUsize::new(0));
        q.enqueue(vec![0.5; 8], 16_000, Some(counter_cb(&played)));
        q.on_all_ended(counter_cb(&drained));
        q.stop();

        let mut out = vec![0.0f32; 8];
        q.render(&mut out);
        assert_eq!(played.load(Ordering::SeqCst), 0);
        assert_eq!(drained.load(Ordering::SeqCst), 0);
    }

    // ── Resampling ───────────────────────────────────────────

    #[test]
    fn resample_halves_length_for_double_rate_input() {
        let q = AudioQueue::new(8_000);
        q.enqueue(vec![0.25; 32], 16_000, None);
        assert!((q.scheduled_end_time() - (16.0 / 8_000.0)).abs() < 1e-9);
    }

    #[test]
    fn resample_preserves_constant_signal() {
        let out = resample_linear(&[0.5; 100], 24_000, 16_000);
        assert!(!out.is_empty());
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn resample_same_rate_is_identity() {
        let out = resample_linear(&[0.1, 0.2, 0.3], 16_000, 16_000);
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
    }
}
