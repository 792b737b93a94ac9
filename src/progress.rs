//! Download progress aggregation for model loading.
//!
//! Model files download concurrently, each reporting its own loaded/total
//! bytes. [`ProgressTracker`] folds those per-file events into a single
//! UI-stable state: throttled `Downloading` updates with a smoothed speed,
//! then one immediate `Initializing` emission the instant the aggregate
//! completes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One file's byte progress, as reported by an engine loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    /// Loader-scoped file identifier (filename or repo path).
    pub file: String,
    /// Bytes downloaded so far.
    pub loaded: u64,
    /// Total size in bytes (0 when unknown).
    pub total: u64,
}

/// UI-facing load progress state.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadProgress {
    /// Files are still downloading.
    Downloading {
        /// Aggregate bytes downloaded across all known files.
        downloaded: u64,
        /// Aggregate total across all known files.
        total: u64,
        /// Exponentially smoothed download speed in bytes/sec.
        speed_bps: f64,
    },
    /// All bytes are on disk; the engine is initializing.
    Initializing,
}

/// Callback type for receiving UI-facing progress updates.
pub type ProgressCallback = Box<dyn Fn(LoadProgress) + Send + Sync>;

/// Minimum wall-clock gap between `Downloading` emissions.
const EMIT_THROTTLE: Duration = Duration::from_millis(500);

/// Aggregates multi-file progress events into throttled UI updates.
pub struct ProgressTracker {
    files: HashMap<String, (u64, u64)>,
    started: Instant,
    last_emit: Option<Instant>,
    throttle: Duration,
    smoothed_bps: f64,
    finished: bool,
    emit: ProgressCallback,
}

impl ProgressTracker {
    /// Create a tracker with the standard 500 ms throttle.
    pub fn new(emit: ProgressCallback) -> Self {
        Self::with_throttle(emit, EMIT_THROTTLE)
    }

    /// Create a tracker with a custom throttle interval.
    pub fn with_throttle(emit: ProgressCallback, throttle: Duration) -> Self {
        Self {
            files: HashMap::new(),
            started: Instant::now(),
            last_emit: None,
            throttle,
            smoothed_bps: 0.0,
            finished: false,
            emit,
        }
    }

    /// Record one file's progress and emit a UI update when due.
    ///
    /// The completion update (`downloaded >= total > 0`) bypasses the
    /// throttle and is emitted exactly once.
    pub fn update(&mut self, event: &FileProgress) {
        if self.finished {
            return;
        }
        self.files
            .insert(event.file.clone(), (event.loaded, event.total));

        let downloaded: u64 = self.files.values().map(|(loaded, _)| loaded).sum();
        let total: u64 = self.files.values().map(|(_, total)| total).sum();

        if total > 0 && downloaded >= total {
            self.finished = true;
            (self.emit)(LoadProgress::Initializing);
            return;
        }

        let now = Instant::now();
        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.throttle);
        if !due {
            return;
        }
        self.last_emit = Some(now);

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let instant_bps = if elapsed > 0.0 {
            downloaded as f64 / elapsed
        } else {
            0.0
        };
        self.smoothed_bps = smooth(self.smoothed_bps, instant_bps);

        (self.emit)(LoadProgress::Downloading {
            downloaded,
            total,
            speed_bps: self.smoothed_bps,
        });
    }
}

/// Exponential smoothing: the first sample passes through, later samples
/// blend 70% history with 30% instant.
fn smooth(prev: f64, instant: f64) -> f64 {
    if prev == 0.0 {
        instant
    } else {
        prev * 0.7 + instant * 0.3
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_tracker(throttle: Duration) -> (ProgressTracker, Arc<Mutex<Vec<LoadProgress>>>) {
        let events: Arc<Mutex<Vec<LoadProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let tracker = ProgressTracker::with_throttle(
            Box::new(move |p| sink.lock().unwrap().push(p)),
            throttle,
        );
        (tracker, events)
    }

    // ── Throttling ───────────────────────────────────────────

    #[test]
    fn burst_of_events_yields_one_downloading_emission() {
        let (mut tracker, events) = collecting_tracker(Duration::from_millis(500));

        for i in 0..50 {
            tracker.update(&FileProgress {
                file: "model.bin".into(),
                loaded: i,
                total: 1000,
            });
            tracker.update(&FileProgress {
                file: "vocab.txt".into(),
                loaded: i,
                total: 500,
            });
        }

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], LoadProgress::Downloading { .. }));
    }

    #[test]
    fn completion_bypasses_throttle_and_emits_once() {
        let (mut tracker, events) = collecting_tracker(Duration::from_millis(500));

        tracker.update(&FileProgress {
            file: "model.bin".into(),
            loaded: 10,
            total: 1000,
        });
        tracker.update(&FileProgress {
            file: "model.bin".into(),
            loaded: 1000,
            total: 1000,
        });
        // Late duplicate completion events are swallowed.
        tracker.update(&FileProgress {
            file: "model.bin".into(),
            loaded: 1000,
            total: 1000,
        });

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LoadProgress::Downloading { .. }));
        assert_eq!(events[1], LoadProgress::Initializing);
    }

    #[test]
    fn aggregate_sums_across_files() {
        let (mut tracker, events) = collecting_tracker(Duration::ZERO);

        tracker.update(&FileProgress {
            file: "a".into(),
            loaded: 100,
            total: 400,
        });
        tracker.update(&FileProgress {
            file: "b".into(),
            loaded: 50,
            total: 600,
        });

        let events = events.lock().unwrap();
        let Some(LoadProgress::Downloading {
            downloaded, total, ..
        }) = events.last().cloned()
        else {
            panic!("expected a downloading event");
        };
        assert_eq!(downloaded, 150);
        assert_eq!(total, 1000);
    }

    #[test]
    fn unknown_totals_do_not_trigger_completion() {
        let (mut tracker, events) = collecting_tracker(Duration::ZERO);

        tracker.update(&FileProgress {
            file: "a".into(),
            loaded: 100,
            total: 0,
        });

        let events = events.lock().unwrap();
        assert!(matches!(events[0], LoadProgress::Downloading { .. }));
    }

    // ── Speed smoothing ──────────────────────────────────────

    #[test]
    fn first_speed_sample_passes_through() {
        assert!((smooth(0.0, 1234.0) - 1234.0).abs() < f64::EPSILON);
    }

    #[test]
    fn later_samples_blend_seventy_thirty() {
        let blended = smooth(1000.0, 2000.0);
        assert!((blended - 1300.0).abs() < 1e-9);
    }
}
