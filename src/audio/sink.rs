//! Audio output collaborator interface.
//!
//! An [`AudioOutput`] is the audio context: it knows the device sample rate
//! and creates sinks. A sink takes ownership of an [`AudioFeed`] and pulls
//! PCM from it on its own schedule until it is closed.

use std::time::Duration;

use crate::audio::feed::AudioFeed;

/// Error type for audio output operations
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No audio output device available")]
    NoDevice,
    #[error("Output device does not support {0} channels")]
    UnsupportedChannels(u16),
    #[error("Audio backend error: {0}")]
    Backend(String),
    #[error("Audio sink thread is not running")]
    SinkThread,
}

/// A sink could not be created. The feed is handed back untouched.
pub struct SinkRejected {
    pub error: AudioError,
    pub feed: AudioFeed,
}

impl std::fmt::Debug for SinkRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Audio context creating pull-based sinks
pub trait AudioOutput: Send {
    fn sample_rate(&self) -> u32;

    /// Create a paused sink pulling from `feed` with roughly `buffer` of
    /// device-side buffering.
    fn create_sink(
        &self,
        feed: AudioFeed,
        buffer: Duration,
    ) -> Result<Box<dyn AudioSink>, SinkRejected>;
}

/// Live connection to the audio output
pub trait AudioSink: Send {
    fn play(&mut self) -> Result<(), AudioError>;
    fn pause(&mut self) -> Result<(), AudioError>;

    /// Effective volume in `0.0..=1.0`
    fn set_volume(&mut self, volume: f32);

    /// Bytes consumed by the device since the sink was created
    fn played_bytes(&self) -> u64;

    /// The feed reported end of stream and everything before it was played
    fn is_finished(&self) -> bool;

    /// Stop pulling and return the feed. `None` if the feed was lost with a
    /// crashed sink.
    fn close(self: Box<Self>) -> Option<AudioFeed>;
}
