//! Decoder/demuxer collaborator interface.
//!
//! A [`MediaSource`] is a container opened for decoding. Packets are read one
//! at a time; after a packet for a stream has been read, the matching
//! `read_*_frame` call decodes it. Controllers never see codec details, only
//! presentation offsets and raw payloads.

use std::time::Duration;

use crate::decode::frame::{AudioFrame, VideoFrame};
use crate::decode::stream_info::{AudioStreamInfo, VideoStreamInfo};

/// Error type for decoding operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Decoder is not open")]
    NotOpen,
    #[error("Stream {0} is not open")]
    StreamNotOpen(usize),
    #[error("Invalid stream index: {0}")]
    InvalidStreamIndex(usize),
    #[error("Frame has no presentation timestamp")]
    MissingTimestamp,
    #[error("Seek failed: {0}")]
    SeekFailed(String),
    #[error("Read failed: {0}")]
    Read(String),
    #[error("Decoder backend error: {0}")]
    Backend(String),
}

/// Kind of elementary stream a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Other,
}

/// Demuxed packet header. The payload stays inside the source until the
/// matching frame read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub stream_index: usize,
    pub kind: StreamKind,
}

/// Result of decoding the current packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A complete frame
    Frame(T),
    /// The decoder consumed the packet but intentionally produced no frame
    Skipped,
    /// Nothing to decode for this stream
    Empty,
}

/// Opaque decoder/demuxer for a single container
pub trait MediaSource: Send {
    fn video_streams(&self) -> Vec<VideoStreamInfo>;
    fn audio_streams(&self) -> Vec<AudioStreamInfo>;

    fn open_decode(&mut self) -> Result<(), DecodeError>;
    fn close_decode(&mut self) -> Result<(), DecodeError>;

    fn open_stream(&mut self, index: usize) -> Result<(), DecodeError>;
    fn close_stream(&mut self, index: usize) -> Result<(), DecodeError>;

    /// Reposition a stream. Precision is bounded by the container's seek
    /// granularity: decoding resumes at or before `position`.
    fn rewind(&mut self, index: usize, position: Duration) -> Result<(), DecodeError>;

    /// Next packet, or `None` when no packet is available. For files that
    /// means exhaustion; live sources may return `None` transiently.
    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError>;

    fn read_video_frame(&mut self, index: usize) -> Result<Decoded<VideoFrame>, DecodeError>;
    fn read_audio_frame(&mut self, index: usize) -> Result<Decoded<AudioFrame>, DecodeError>;

    /// Release the container. The source is unusable afterwards.
    fn close(&mut self);
}

/// Read packets until the next frame of `stream` decodes. Packets of other
/// streams are dropped. `Ok(None)` means no packet was available.
pub fn next_video_frame(
    source: &mut dyn MediaSource,
    stream: usize,
) -> Result<Option<VideoFrame>, DecodeError> {
    loop {
        let Some(packet) = source.read_packet()? else {
            return Ok(None);
        };
        if packet.kind != StreamKind::Video || packet.stream_index != stream {
            continue;
        }
        // skipped frames are not the end of the stream
        if let Decoded::Frame(frame) = source.read_video_frame(stream)? {
            return Ok(Some(frame));
        }
    }
}
