//! Playback synchronization engine.
//!
//! Turns timestamped video (and optionally audio) frames from a
//! [`MediaSource`] into a playback position and a current frame. Three
//! controllers share the [`PlaybackControl`] surface:
//!
//! - [`VideoController`]: wall-clock driven, for media without audio.
//! - [`AudioVideoController`]: the audio sink's consumption drives the clock.
//! - [`LiveController`]: unbounded sources, frames released on their PTS.
//!
//! [`Controller::open`] picks the right one for a source.

pub mod audio;
pub mod config;
pub mod core;
pub mod decode;
pub mod playback;

pub use audio::{AudioOutput, AudioSink, ManualOutput};
pub use config::PlayerConfig;
pub use decode::{MediaSource, SharedFrame, SyntheticSource, VideoFrame};
pub use playback::{
    AudioCapability, AudioVideoController, ConfigError, Controller, CurrentFrame, LiveController,
    ManualClock, PlaybackControl, PlaybackError, PlaybackState, SeekOutcome, SystemClock,
    TimeSource, VideoController,
};
