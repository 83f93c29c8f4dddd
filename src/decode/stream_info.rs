//! Stream metadata reported by a media source.

use std::time::Duration;

use crate::core::time::{self, STEREO_S16_FRAME_BYTES};

/// Information shared by video and audio streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub index: usize,
    pub duration: Duration, // zero for live sources
    pub codec_name: String,
}

/// Video-specific stream information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoStreamInfo {
    pub stream_info: StreamInfo,
    pub width: u32,
    pub height: u32,
    pub frame_rate: (u32, u32), // frames per second as num/den
}

impl VideoStreamInfo {
    pub fn index(&self) -> usize {
        self.stream_info.index
    }

    pub fn duration(&self) -> Duration {
        self.stream_info.duration
    }

    /// Nominal spacing between frames, `None` if the frame rate is unusable
    pub fn frame_duration(&self) -> Option<Duration> {
        time::frame_duration(self.frame_rate.0, self.frame_rate.1)
    }
}

/// Audio-specific stream information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioStreamInfo {
    pub stream_info: StreamInfo,
    pub sample_rate: u32,
    pub channels: u32,
}

impl AudioStreamInfo {
    pub fn index(&self) -> usize {
        self.stream_info.index
    }

    pub fn duration(&self) -> Duration {
        self.stream_info.duration
    }

    /// PCM throughput once decoded to s16 stereo
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * STEREO_S16_FRAME_BYTES as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame_duration() {
        let info = VideoStreamInfo {
            stream_info: StreamInfo {
                index: 0,
                duration: Duration::from_secs(10),
                codec_name: "raw".to_string(),
            },
            width: 4,
            height: 4,
            frame_rate: (25, 1),
        };
        assert_eq!(info.frame_duration(), Some(Duration::from_millis(40)));
        assert_eq!(info.index(), 0);
    }

    #[test]
    fn test_audio_bytes_per_second() {
        let info = AudioStreamInfo {
            stream_info: StreamInfo {
                index: 1,
                duration: Duration::from_secs(10),
                codec_name: "pcm_s16le".to_string(),
            },
            sample_rate: 44_100,
            channels: 2,
        };
        assert_eq!(info.bytes_per_second(), 176_400);
    }
}
