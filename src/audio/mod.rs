//! Gapless audio playback scheduling and output sinks.

pub mod output;
pub mod queue;

pub use output::{AudioOutput, CpalOutput, ManualOutput, PacedOutput, PlaybackStream};
pub use queue::AudioQueue;
