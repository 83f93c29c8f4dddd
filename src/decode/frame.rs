//! Decoded frames handed out by a media source.

use std::sync::Arc;
use std::time::Duration;

/// Decoded video frame (RGBA8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub data: Vec<u8>,     // Raw pixel data, owned by the frame
    pub width: u32,
    pub height: u32,
    pub offset: Duration,  // Presentation offset from stream start
}

/// Frames are retained by the controller and handed to the caller at the
/// same time, so they travel behind an `Arc`.
pub type SharedFrame = Arc<VideoFrame>;

/// Decoded audio frame (interleaved s16 little-endian stereo PCM)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub offset: Duration,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, offset: Duration) -> Self {
        Self {
            data,
            width,
            height,
            offset,
        }
    }
}
