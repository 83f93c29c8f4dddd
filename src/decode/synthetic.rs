//! Deterministic in-memory media source.
//!
//! Produces interleaved video and audio packets on a fixed cadence without
//! touching any codec. Useful for headless stepping of the controllers and
//! for tests. Stream 0 is always video; stream 1 is audio when enabled.
//!
//! Pixel payloads are filled with the low byte of the frame number. Audio
//! payloads carry the running sample-frame counter as a little-endian u16 on
//! both channels, so gaps or duplicates in delivered audio are detectable.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::time::{self, STEREO_S16_FRAME_BYTES};
use crate::decode::decoder::{DecodeError, Decoded, MediaSource, Packet, StreamKind};
use crate::decode::frame::{AudioFrame, VideoFrame};
use crate::decode::stream_info::{AudioStreamInfo, StreamInfo, VideoStreamInfo};

const VIDEO_STREAM: usize = 0;
const AUDIO_STREAM: usize = 1;
const FRAME_WIDTH: u32 = 4;
const FRAME_HEIGHT: u32 = 2;

#[derive(Debug, Clone)]
struct AudioLayout {
    sample_rate: u32,
    channels: u32,
    duration: Duration,
    samples_per_frame: u64,
}

#[derive(Debug, Default)]
struct Shared {
    decoding: bool,
    closed: bool,
    open_streams: Vec<usize>,
    injected_errors: u32,
    packets_read: u64,
    rewinds: u64,
}

/// Read-only view of a [`SyntheticSource`]'s lifecycle, usable after the
/// source has been boxed and handed to a controller.
#[derive(Debug, Clone)]
pub struct SourceProbe {
    shared: Arc<Mutex<Shared>>,
}

impl SourceProbe {
    pub fn is_decoding(&self) -> bool {
        self.shared.lock().decoding
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn open_streams(&self) -> Vec<usize> {
        self.shared.lock().open_streams.clone()
    }

    pub fn packets_read(&self) -> u64 {
        self.shared.lock().packets_read
    }

    pub fn rewinds(&self) -> u64 {
        self.shared.lock().rewinds
    }

    /// Make the next `count` packet reads fail
    pub fn inject_read_errors(&self, count: u32) {
        self.shared.lock().injected_errors += count;
    }
}

/// In-memory source with a fixed video cadence and optional stereo audio
pub struct SyntheticSource {
    duration: Duration,
    frame_rate: (u32, u32),
    frame_duration: Duration,
    audio: Option<AudioLayout>,
    live: bool,
    pts_origin: Duration,
    skip_every: Option<u64>,
    starve_every: Option<u64>,
    capture_start: Option<Instant>, // wall time of frame zero, set on first read
    pacing: bool,
    next_video: u64,
    next_audio: u64,
    pending: Option<(StreamKind, u64)>,
    shared: Arc<Mutex<Shared>>,
}

impl SyntheticSource {
    /// File-like source of `duration` at `frame_rate` (num/den fps).
    /// A zero frame rate is reported as-is so callers can exercise validation.
    pub fn new(duration: Duration, frame_rate: (u32, u32)) -> Self {
        let frame_duration =
            time::frame_duration(frame_rate.0, frame_rate.1).unwrap_or(Duration::ZERO);
        Self {
            duration,
            frame_rate,
            frame_duration,
            audio: None,
            live: false,
            pts_origin: Duration::ZERO,
            skip_every: None,
            starve_every: None,
            capture_start: None,
            pacing: false,
            next_video: 0,
            next_audio: 0,
            pending: None,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Unbounded source that never reports exhaustion
    pub fn live(frame_rate: (u32, u32)) -> Self {
        let mut source = Self::new(Duration::ZERO, frame_rate);
        source.live = true;
        source
    }

    /// Add a stereo audio stream covering the video duration, in 20ms frames
    pub fn with_audio(mut self, sample_rate: u32) -> Self {
        self.audio = Some(AudioLayout {
            sample_rate,
            channels: 2,
            duration: self.duration,
            samples_per_frame: (sample_rate as u64 / 50).max(1),
        });
        self
    }

    /// Report a different channel count (payloads stay stereo)
    pub fn with_audio_channels(mut self, channels: u32) -> Self {
        if let Some(audio) = self.audio.as_mut() {
            audio.channels = channels;
        }
        self
    }

    pub fn with_audio_duration(mut self, duration: Duration) -> Self {
        if let Some(audio) = self.audio.as_mut() {
            audio.duration = duration;
        }
        self
    }

    pub fn with_audio_frame(mut self, frame: Duration) -> Self {
        if let Some(audio) = self.audio.as_mut() {
            let bytes_per_second = audio.sample_rate as u64 * STEREO_S16_FRAME_BYTES as u64;
            let bytes = time::duration_to_bytes(frame, bytes_per_second);
            audio.samples_per_frame = (bytes / STEREO_S16_FRAME_BYTES as u64).max(1);
        }
        self
    }

    /// Offset added to every presentation timestamp
    pub fn with_pts_origin(mut self, origin: Duration) -> Self {
        self.pts_origin = origin;
        self
    }

    /// Every `n`-th video frame decodes as [`Decoded::Skipped`]
    pub fn skip_every(mut self, n: u64) -> Self {
        self.skip_every = Some(n.max(1));
        self
    }

    /// Live only: every `n`-th packet read reports no packet available
    pub fn starve_every(mut self, n: u64) -> Self {
        self.starve_every = Some(n.max(1));
        self
    }

    /// Live only: video packets become readable at their real-time cadence,
    /// like a camera or network feed
    pub fn paced(mut self) -> Self {
        self.pacing = self.live;
        self
    }

    pub fn probe(&self) -> SourceProbe {
        SourceProbe {
            shared: Arc::clone(&self.shared),
        }
    }

    fn video_info(&self) -> VideoStreamInfo {
        VideoStreamInfo {
            stream_info: StreamInfo {
                index: VIDEO_STREAM,
                duration: self.duration,
                codec_name: "synthetic".to_string(),
            },
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            frame_rate: self.frame_rate,
        }
    }

    fn total_samples(&self, audio: &AudioLayout) -> u64 {
        let bytes_per_second = audio.sample_rate as u64 * STEREO_S16_FRAME_BYTES as u64;
        time::duration_to_bytes(audio.duration, bytes_per_second) / STEREO_S16_FRAME_BYTES as u64
    }

    fn video_ts(&self, frame: u64) -> Option<Duration> {
        if self.frame_duration.is_zero() {
            return None;
        }
        let offset = self.frame_duration * frame as u32;
        if !self.live && offset >= self.duration {
            return None;
        }
        Some(offset)
    }

    fn audio_ts(&self, frame: u64) -> Option<Duration> {
        let audio = self.audio.as_ref()?;
        let first_sample = frame * audio.samples_per_frame;
        if !self.live && first_sample >= self.total_samples(audio) {
            return None;
        }
        Some(time::bytes_to_duration(first_sample, audio.sample_rate as u64))
    }

    fn wait_for_capture(&mut self, offset: Duration) {
        let now = Instant::now();
        let zero = *self
            .capture_start
            .get_or_insert_with(|| now.checked_sub(offset).unwrap_or(now));
        let due = zero + offset;
        if due > now {
            thread::sleep(due - now);
        }
    }

    fn check_stream(&self, index: usize) -> Result<(), DecodeError> {
        match index {
            VIDEO_STREAM => Ok(()),
            AUDIO_STREAM if self.audio.is_some() => Ok(()),
            other => Err(DecodeError::InvalidStreamIndex(other)),
        }
    }

    fn ensure_open(&self, index: usize) -> Result<(), DecodeError> {
        let shared = self.shared.lock();
        if !shared.decoding {
            return Err(DecodeError::NotOpen);
        }
        if !shared.open_streams.contains(&index) {
            return Err(DecodeError::StreamNotOpen(index));
        }
        Ok(())
    }
}

impl MediaSource for SyntheticSource {
    fn video_streams(&self) -> Vec<VideoStreamInfo> {
        vec![self.video_info()]
    }

    fn audio_streams(&self) -> Vec<AudioStreamInfo> {
        self.audio
            .iter()
            .map(|audio| AudioStreamInfo {
                stream_info: StreamInfo {
                    index: AUDIO_STREAM,
                    duration: if self.live { Duration::ZERO } else { audio.duration },
                    codec_name: "pcm_s16le".to_string(),
                },
                sample_rate: audio.sample_rate,
                channels: audio.channels,
            })
            .collect()
    }

    fn open_decode(&mut self) -> Result<(), DecodeError> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(DecodeError::Backend("source closed".to_string()));
        }
        shared.decoding = true;
        Ok(())
    }

    fn close_decode(&mut self) -> Result<(), DecodeError> {
        let mut shared = self.shared.lock();
        shared.decoding = false;
        shared.open_streams.clear();
        self.pending = None;
        Ok(())
    }

    fn open_stream(&mut self, index: usize) -> Result<(), DecodeError> {
        self.check_stream(index)?;
        let mut shared = self.shared.lock();
        if !shared.decoding {
            return Err(DecodeError::NotOpen);
        }
        if !shared.open_streams.contains(&index) {
            shared.open_streams.push(index);
        }
        Ok(())
    }

    fn close_stream(&mut self, index: usize) -> Result<(), DecodeError> {
        self.check_stream(index)?;
        self.shared.lock().open_streams.retain(|open| *open != index);
        Ok(())
    }

    fn rewind(&mut self, index: usize, position: Duration) -> Result<(), DecodeError> {
        self.check_stream(index)?;
        if self.live {
            return Err(DecodeError::SeekFailed("live source".to_string()));
        }
        self.ensure_open(index)?;
        let position = position.saturating_sub(self.pts_origin);
        if index == VIDEO_STREAM {
            self.next_video = if self.frame_duration.is_zero() {
                0
            } else {
                (position.as_nanos() / self.frame_duration.as_nanos()) as u64
            };
        } else if let Some(audio) = self.audio.as_ref() {
            let sample = time::duration_to_bytes(position, audio.sample_rate as u64);
            self.next_audio = sample / audio.samples_per_frame;
        }
        if matches!(self.pending, Some((kind, _)) if (kind == StreamKind::Video) == (index == VIDEO_STREAM))
        {
            self.pending = None;
        }
        self.shared.lock().rewinds += 1;
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError> {
        {
            let mut shared = self.shared.lock();
            if !shared.decoding {
                return Err(DecodeError::NotOpen);
            }
            if shared.injected_errors > 0 {
                shared.injected_errors -= 1;
                return Err(DecodeError::Read("injected failure".to_string()));
            }
            shared.packets_read += 1;
            if self.live {
                if let Some(n) = self.starve_every {
                    if shared.packets_read % n == 0 {
                        return Ok(None);
                    }
                }
            }
        }

        let video = self.video_ts(self.next_video);
        let audio = self.audio_ts(self.next_audio);
        let kind = match (video, audio) {
            (Some(v), Some(a)) if a < v => StreamKind::Audio,
            (Some(_), _) => StreamKind::Video,
            (None, Some(_)) => StreamKind::Audio,
            (None, None) => return Ok(None),
        };

        let packet = match kind {
            StreamKind::Video => {
                if let (true, Some(offset)) = (self.pacing, video) {
                    self.wait_for_capture(offset);
                }
                self.pending = Some((kind, self.next_video));
                self.next_video += 1;
                Packet {
                    stream_index: VIDEO_STREAM,
                    kind,
                }
            }
            _ => {
                self.pending = Some((kind, self.next_audio));
                self.next_audio += 1;
                Packet {
                    stream_index: AUDIO_STREAM,
                    kind,
                }
            }
        };
        Ok(Some(packet))
    }

    fn read_video_frame(&mut self, index: usize) -> Result<Decoded<VideoFrame>, DecodeError> {
        self.check_stream(index)?;
        self.ensure_open(index)?;
        let frame = match self.pending {
            Some((StreamKind::Video, frame)) if index == VIDEO_STREAM => frame,
            _ => return Ok(Decoded::Empty),
        };
        self.pending = None;

        if let Some(n) = self.skip_every {
            if frame % n == n - 1 {
                return Ok(Decoded::Skipped);
            }
        }

        let offset = self.pts_origin + self.frame_duration * frame as u32;
        let data = vec![frame as u8; (FRAME_WIDTH * FRAME_HEIGHT * 4) as usize];
        Ok(Decoded::Frame(VideoFrame::new(
            data,
            FRAME_WIDTH,
            FRAME_HEIGHT,
            offset,
        )))
    }

    fn read_audio_frame(&mut self, index: usize) -> Result<Decoded<AudioFrame>, DecodeError> {
        self.check_stream(index)?;
        self.ensure_open(index)?;
        let frame = match self.pending {
            Some((StreamKind::Audio, frame)) if index == AUDIO_STREAM => frame,
            _ => return Ok(Decoded::Empty),
        };
        self.pending = None;

        let Some(audio) = self.audio.clone() else {
            return Ok(Decoded::Empty);
        };
        let first = frame * audio.samples_per_frame;
        let mut last = first + audio.samples_per_frame;
        if !self.live {
            last = last.min(self.total_samples(&audio));
        }

        let mut data = Vec::with_capacity(((last - first) as usize) * STEREO_S16_FRAME_BYTES);
        for sample in first..last {
            let value = (sample as u16).to_le_bytes();
            data.extend_from_slice(&value); // left
            data.extend_from_slice(&value); // right
        }

        let offset = self.pts_origin + time::bytes_to_duration(first, audio.sample_rate as u64);
        Ok(Decoded::Frame(AudioFrame { data, offset }))
    }

    fn close(&mut self) {
        let mut shared = self.shared.lock();
        shared.closed = true;
        shared.decoding = false;
        shared.open_streams.clear();
    }
}
