//! Playback tunables.

use std::time::Duration;

use crate::audio::feed::PartialReadPolicy;

/// Sink buffer size. 40ms is fine on desktops, web targets want ~70ms;
/// 200ms leaves headroom for slow decoders.
pub const DEFAULT_AUDIO_BUFFER: Duration = Duration::from_millis(200);

/// Live scheduler slack: frames due within this window are published immediately
pub const DEFAULT_LIVE_JITTER: Duration = Duration::from_millis(15);

/// Capacity of the live decode -> schedule handoff
pub const DEFAULT_LIVE_QUEUE_CAPACITY: usize = 64;

/// Retry delay after a transient live read error or starvation
pub const DEFAULT_LIVE_BACKOFF: Duration = Duration::from_millis(10);

/// Maximum accepted difference between audio and video stream durations
pub const DEFAULT_DURATION_TOLERANCE: Duration = Duration::from_millis(250);

/// Configuration shared by every controller variant
#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub audio_buffer: Duration,
    pub partial_reads: PartialReadPolicy,
    pub live_jitter: Duration,
    pub live_queue_capacity: usize,
    pub live_backoff: Duration,
    pub duration_tolerance: Duration,
    /// Use the video-only controller even when the media has audio
    pub ignore_audio: bool,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            audio_buffer: DEFAULT_AUDIO_BUFFER,
            partial_reads: PartialReadPolicy::Truncate,
            live_jitter: DEFAULT_LIVE_JITTER,
            live_queue_capacity: DEFAULT_LIVE_QUEUE_CAPACITY,
            live_backoff: DEFAULT_LIVE_BACKOFF,
            duration_tolerance: DEFAULT_DURATION_TOLERANCE,
            ignore_audio: false,
        }
    }
}

impl PlayerConfig {
    pub fn with_audio_buffer(mut self, buffer: Duration) -> Self {
        self.audio_buffer = buffer;
        self
    }

    pub fn with_partial_reads(mut self, policy: PartialReadPolicy) -> Self {
        self.partial_reads = policy;
        self
    }

    pub fn with_live_jitter(mut self, jitter: Duration) -> Self {
        self.live_jitter = jitter;
        self
    }

    /// Zero is bumped to one: the handoff must be able to hold a frame
    pub fn with_live_queue_capacity(mut self, capacity: usize) -> Self {
        self.live_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_live_backoff(mut self, backoff: Duration) -> Self {
        self.live_backoff = backoff;
        self
    }

    pub fn with_duration_tolerance(mut self, tolerance: Duration) -> Self {
        self.duration_tolerance = tolerance;
        self
    }

    pub fn without_audio(mut self) -> Self {
        self.ignore_audio = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlayerConfig::default();
        assert_eq!(config.audio_buffer, Duration::from_millis(200));
        assert_eq!(config.live_jitter, Duration::from_millis(15));
        assert_eq!(config.live_queue_capacity, 64);
        assert_eq!(config.partial_reads, PartialReadPolicy::Truncate);
        assert!(!config.ignore_audio);
    }

    #[test]
    fn test_builders() {
        let config = PlayerConfig::default()
            .with_partial_reads(PartialReadPolicy::Reject)
            .with_live_queue_capacity(0)
            .without_audio();
        assert_eq!(config.partial_reads, PartialReadPolicy::Reject);
        assert_eq!(config.live_queue_capacity, 1);
        assert!(config.ignore_audio);
    }
}
