//! Playback errors.

use std::time::Duration;

use crate::audio::sink::AudioError;
use crate::decode::decoder::DecodeError;

/// Construction-time configuration errors. Not retryable: reconfigure and
/// open again.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Media has no video stream")]
    NoVideo,
    #[error("Media has audio but no audio output was provided")]
    NoAudioOutput,
    #[error("Audio stream runs at {stream} Hz but the output runs at {output} Hz")]
    SampleRateMismatch { stream: u32, output: u32 },
    #[error("Audio stream has {0} channels, at most 2 are supported")]
    TooManyChannels(u32),
    #[error("Mono audio is not supported")]
    MonoAudio,
    #[error("Audio lasts {audio:?} but video lasts {video:?}")]
    DurationMismatch { video: Duration, audio: Duration },
    #[error("Invalid video frame rate {0}/{1}")]
    InvalidFrameRate(u32, u32),
}

/// Error type for controller operations
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
    #[error("{0} is not supported by this controller")]
    Unsupported(&'static str),
    #[error("Controller is closed")]
    Closed,
    #[error("Audio feed was lost with its sink")]
    AudioFeedLost,
    #[error("{0} task panicked")]
    TaskPanicked(&'static str),
    #[error("Failed to spawn task: {0}")]
    Spawn(#[from] std::io::Error),
}
