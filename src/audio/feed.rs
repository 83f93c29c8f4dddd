//! Pull-based audio feed.
//!
//! The feed is the byte source an [`AudioSink`](crate::audio::sink::AudioSink)
//! pulls from. Servicing a pull decodes the container forward in packet
//! order: audio payloads are appended to a leftover buffer, video frames met
//! along the way are forwarded to the controller as [`FeedEvent::Video`].
//! Bytes are always served from the front of the leftover buffer, so every
//! decoded byte is delivered exactly once.
//!
//! # Position anchors
//!
//! The sink's played-byte counter is the authoritative clock. To translate
//! it back into a presentation offset the feed emits [`FeedEvent::Anchor`]
//! for the first byte delivered to a freshly attached sink and for the first
//! byte of every loop iteration. An anchor says "byte `at_byte` of this sink
//! is offset `offset` of iteration `iteration`".
//!
//! # Ending the stream
//!
//! Returning [`Pull::EndOfStream`] is the only way to stop the sink from
//! inside its callback. After that every pull returns `EndOfStream(0)` until
//! the feed is reset.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use tracing::{debug, trace, warn};

use crate::core::time::{self, STEREO_S16_FRAME_BYTES};
use crate::decode::decoder::{DecodeError, Decoded, MediaSource, StreamKind};
use crate::decode::frame::VideoFrame;

/// What to do with a pull whose length is not a whole number of sample frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialReadPolicy {
    /// Serve the largest aligned prefix
    Truncate,
    /// Fail the pull with [`FeedError::Misaligned`]
    Reject,
}

/// Sink contract violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("Pull of {len} bytes is not a multiple of the {frame}-byte sample frame")]
    Misaligned { len: usize, frame: usize },
}

/// Outcome of a pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    /// `n` bytes written, more will follow
    Data(usize),
    /// `n` bytes written, nothing follows
    EndOfStream(usize),
}

impl Pull {
    pub fn len(&self) -> usize {
        match *self {
            Pull::Data(n) | Pull::EndOfStream(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Pull::EndOfStream(_))
    }
}

/// Messages from the feed to its controller
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Video frame decoded ahead of need
    Video { frame: VideoFrame, iteration: u64 },
    /// Byte `at_byte` of the current sink carries offset `offset`
    Anchor {
        at_byte: u64,
        offset: Duration,
        iteration: u64,
    },
    /// Media exhausted without looping
    Ended,
    /// Decoding failed; the stream has been ended
    Failed(DecodeError),
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    byte: u64,  // absolute consumed-byte coordinate of the frame start
    offset: Duration,
    iteration: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingAnchor {
    at_byte: u64,
}

enum Step {
    Audio,
    Video(VideoFrame),
    Other,
    Exhausted,
}

/// Byte source shared between a controller and its audio sink.
///
/// While a sink is attached the feed (and the decoder inside it) belongs to
/// the sink; closing the sink hands it back.
pub struct AudioFeed {
    source: Box<dyn MediaSource>,
    video_stream: usize,
    audio_stream: usize,
    bytes_per_second: u64,
    policy: PartialReadPolicy,
    looping: Arc<AtomicBool>,
    events: Sender<FeedEvent>,

    leftover: Vec<u8>,
    marks: VecDeque<Mark>,
    decoded: u64,
    consumed: u64,
    delivered: u64, // bytes handed to the current sink
    iteration: u64,
    pending_anchor: Option<PendingAnchor>,
    progress_since_rewind: bool,
    ended: bool,
}

impl AudioFeed {
    pub fn new(
        source: Box<dyn MediaSource>,
        video_stream: usize,
        audio_stream: usize,
        sample_rate: u32,
        policy: PartialReadPolicy,
        looping: Arc<AtomicBool>,
        events: Sender<FeedEvent>,
    ) -> Self {
        Self {
            source,
            video_stream,
            audio_stream,
            bytes_per_second: sample_rate as u64 * STEREO_S16_FRAME_BYTES as u64,
            policy,
            looping,
            events,
            leftover: Vec::new(),
            marks: VecDeque::new(),
            decoded: 0,
            consumed: 0,
            delivered: 0,
            iteration: 0,
            pending_anchor: None,
            progress_since_rewind: false,
            ended: false,
        }
    }

    pub fn source_mut(&mut self) -> &mut dyn MediaSource {
        self.source.as_mut()
    }

    /// Decoded bytes not yet delivered
    pub fn buffered(&self) -> usize {
        self.leftover.len()
    }

    /// Bytes decoded since the last reset
    pub fn decoded_bytes(&self) -> u64 {
        self.decoded
    }

    /// Bytes delivered since the last reset
    pub fn delivered_bytes(&self) -> u64 {
        self.consumed
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Prepare for a new sink. Delivery counting restarts at zero and the
    /// next delivered byte is anchored.
    pub fn attach(&mut self) {
        let previous = self.delivered;
        self.delivered = 0;

        // a loop anchor still waiting for its first byte keeps its place
        // behind the leftover tail
        self.pending_anchor = self.pending_anchor.take().map(|pending| PendingAnchor {
            at_byte: pending.at_byte.saturating_sub(previous),
        });

        match self.head() {
            Some((offset, iteration)) => self.emit(FeedEvent::Anchor {
                at_byte: 0,
                offset,
                iteration,
            }),
            None if self.pending_anchor.is_none() => {
                self.pending_anchor = Some(PendingAnchor { at_byte: 0 });
            }
            None => {}
        }
    }

    /// Reposition both streams and drop everything buffered. Accounting
    /// restarts and a new iteration begins.
    pub fn seek(&mut self, position: Duration) -> Result<(), DecodeError> {
        self.reset();
        self.source.rewind(self.video_stream, position)?;
        self.source.rewind(self.audio_stream, position)?;
        Ok(())
    }

    /// Drop everything buffered without touching the decoder
    pub fn reset(&mut self) {
        self.leftover.clear();
        self.marks.clear();
        self.decoded = 0;
        self.consumed = 0;
        self.delivered = 0;
        self.iteration += 1;
        self.pending_anchor = None;
        self.progress_since_rewind = false;
        self.ended = false;
    }

    /// Decode until the first video frame, buffering any audio met on the
    /// way. `None` means the media is exhausted.
    pub fn prime(&mut self) -> Result<Option<VideoFrame>, DecodeError> {
        loop {
            match self.decode_step()? {
                Step::Video(frame) => return Ok(Some(frame)),
                Step::Exhausted => return Ok(None),
                Step::Audio | Step::Other => {}
            }
        }
    }

    /// Fill `buf` with PCM. Only whole sample frames are written.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Pull, FeedError> {
        let len = self.aligned_len(buf.len())?;
        if self.ended {
            return Ok(Pull::EndOfStream(0));
        }

        let mut exhausted = false;
        while self.leftover.len() < len {
            match self.decode_step() {
                Ok(Step::Video(frame)) => {
                    let iteration = self.iteration;
                    self.emit(FeedEvent::Video { frame, iteration });
                }
                Ok(Step::Audio) | Ok(Step::Other) => {}
                Ok(Step::Exhausted) => match self.rewind_for_loop() {
                    Ok(true) => {}
                    Ok(false) => {
                        exhausted = true;
                        break;
                    }
                    Err(err) => {
                        self.fail(err);
                        exhausted = true;
                        break;
                    }
                },
                Err(err) => {
                    self.fail(err);
                    exhausted = true;
                    break;
                }
            }
        }

        let n = len.min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.consume(n);
        trace!(
            requested = buf.len(),
            served = n,
            buffered = self.leftover.len(),
            "audio pull"
        );

        if exhausted {
            if !self.ended {
                self.ended = true;
                self.emit(FeedEvent::Ended);
            }
            return Ok(Pull::EndOfStream(n));
        }
        Ok(Pull::Data(n))
    }

    fn aligned_len(&self, len: usize) -> Result<usize, FeedError> {
        let rem = len % STEREO_S16_FRAME_BYTES;
        if rem == 0 {
            return Ok(len);
        }
        match self.policy {
            PartialReadPolicy::Truncate => Ok(len - rem),
            PartialReadPolicy::Reject => Err(FeedError::Misaligned {
                len,
                frame: STEREO_S16_FRAME_BYTES,
            }),
        }
    }

    fn decode_step(&mut self) -> Result<Step, DecodeError> {
        let Some(packet) = self.source.read_packet()? else {
            return Ok(Step::Exhausted);
        };

        match packet.kind {
            StreamKind::Video if packet.stream_index == self.video_stream => {
                match self.source.read_video_frame(self.video_stream)? {
                    Decoded::Frame(frame) => Ok(Step::Video(frame)),
                    Decoded::Skipped | Decoded::Empty => Ok(Step::Other),
                }
            }
            StreamKind::Audio if packet.stream_index == self.audio_stream => {
                match self.source.read_audio_frame(self.audio_stream)? {
                    Decoded::Frame(frame) => {
                        self.append(&frame.data, frame.offset);
                        Ok(Step::Audio)
                    }
                    Decoded::Skipped | Decoded::Empty => Ok(Step::Other),
                }
            }
            _ => Ok(Step::Other),
        }
    }

    fn append(&mut self, data: &[u8], offset: Duration) {
        if data.is_empty() {
            return;
        }
        if let Some(pending) = self.pending_anchor.take() {
            let iteration = self.iteration;
            self.emit(FeedEvent::Anchor {
                at_byte: pending.at_byte,
                offset,
                iteration,
            });
        }
        self.marks.push_back(Mark {
            byte: self.decoded,
            offset,
            iteration: self.iteration,
        });
        self.leftover.extend_from_slice(data);
        self.decoded += data.len() as u64;
        self.progress_since_rewind = true;
    }

    fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.leftover.drain(..n);
        self.consumed += n as u64;
        self.delivered += n as u64;
        while self.marks.len() > 1 && self.marks[1].byte <= self.consumed {
            self.marks.pop_front();
        }
        if self.leftover.is_empty() {
            self.marks.clear();
        }
    }

    fn head(&self) -> Option<(Duration, u64)> {
        if self.leftover.is_empty() {
            return None;
        }
        let mark = self.marks.front()?;
        let into = self.consumed.saturating_sub(mark.byte);
        Some((
            mark.offset + time::bytes_to_duration(into, self.bytes_per_second),
            mark.iteration,
        ))
    }

    fn rewind_for_loop(&mut self) -> Result<bool, DecodeError> {
        if !self.looping.load(Ordering::Acquire) {
            return Ok(false);
        }
        if !self.progress_since_rewind {
            warn!("media produced no audio since the last rewind, ending instead of looping");
            return Ok(false);
        }

        self.source.rewind(self.video_stream, Duration::ZERO)?;
        self.source.rewind(self.audio_stream, Duration::ZERO)?;
        self.iteration += 1;
        self.pending_anchor = Some(PendingAnchor {
            at_byte: self.delivered + self.leftover.len() as u64,
        });
        self.progress_since_rewind = false;
        debug!(iteration = self.iteration, "audio feed looped");
        Ok(true)
    }

    fn fail(&mut self, err: DecodeError) {
        warn!(error = %err, "audio feed decode failed");
        self.ended = true;
        self.emit(FeedEvent::Failed(err));
    }

    fn emit(&self, event: FeedEvent) {
        // a closed receiver means the controller is gone
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::synthetic::SyntheticSource;
    use crossbeam::channel::{unbounded, Receiver};

    const RATE: u32 = 1_000; // 4000 bytes per second, 20ms frames of 80 bytes

    fn feed(
        duration_ms: u64,
        policy: PartialReadPolicy,
        looping: bool,
    ) -> (AudioFeed, Receiver<FeedEvent>) {
        let mut source =
            SyntheticSource::new(Duration::from_millis(duration_ms), (25, 1)).with_audio(RATE);
        source.open_decode().unwrap();
        source.open_stream(0).unwrap();
        source.open_stream(1).unwrap();
        let (tx, rx) = unbounded();
        let feed = AudioFeed::new(
            Box::new(source),
            0,
            1,
            RATE,
            policy,
            Arc::new(AtomicBool::new(looping)),
            tx,
        );
        (feed, rx)
    }

    fn anchors(rx: &Receiver<FeedEvent>) -> Vec<(u64, Duration, u64)> {
        rx.try_iter()
            .filter_map(|event| match event {
                FeedEvent::Anchor {
                    at_byte,
                    offset,
                    iteration,
                } => Some((at_byte, offset, iteration)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_truncates_misaligned_pull() {
        let (mut feed, _rx) = feed(1_000, PartialReadPolicy::Truncate, false);
        let mut buf = [0u8; 777];
        assert_eq!(feed.read(&mut buf).unwrap(), Pull::Data(776));
    }

    #[test]
    fn test_rejects_misaligned_pull() {
        let (mut feed, _rx) = feed(1_000, PartialReadPolicy::Reject, false);
        let mut buf = [0u8; 777];
        assert_eq!(
            feed.read(&mut buf),
            Err(FeedError::Misaligned { len: 777, frame: 4 })
        );
        assert_eq!(feed.delivered_bytes(), 0);
    }

    #[test]
    fn test_leftover_is_conserved() {
        let (mut feed, _rx) = feed(1_000, PartialReadPolicy::Truncate, false);
        let mut delivered = Vec::new();
        for len in [4usize, 100, 36, 400, 8, 1200] {
            let mut buf = vec![0u8; len];
            let n = feed.read(&mut buf).unwrap().len();
            delivered.extend_from_slice(&buf[..n]);
            assert_eq!(
                feed.decoded_bytes(),
                feed.delivered_bytes() + feed.buffered() as u64
            );
        }

        // every sample frame carries its running index: no gaps, no repeats
        let samples: Vec<u16> = delivered
            .chunks_exact(4)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect();
        let expected: Vec<u16> = (0..samples.len() as u16).collect();
        assert_eq!(samples, expected);
    }

    #[test]
    fn test_video_frames_are_forwarded() {
        let (mut feed, rx) = feed(200, PartialReadPolicy::Truncate, false);
        let mut buf = vec![0u8; 1_000]; // more than the whole stream
        let pull = feed.read(&mut buf).unwrap();
        assert_eq!(pull, Pull::EndOfStream(800));

        let offsets: Vec<Duration> = rx
            .try_iter()
            .filter_map(|event| match event {
                FeedEvent::Video { frame, .. } => Some(frame.offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets.len(), 5);
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_end_of_stream_is_sticky() {
        let (mut feed, rx) = feed(100, PartialReadPolicy::Truncate, false);
        let mut buf = vec![0u8; 1_000];
        assert_eq!(feed.read(&mut buf).unwrap(), Pull::EndOfStream(400));
        assert_eq!(feed.read(&mut buf).unwrap(), Pull::EndOfStream(0));
        let ended = rx.try_iter().filter(|e| *e == FeedEvent::Ended).count();
        assert_eq!(ended, 1);
    }

    #[test]
    fn test_attach_anchors_next_byte() {
        let (mut feed, rx) = feed(1_000, PartialReadPolicy::Truncate, false);
        feed.attach();
        let mut buf = vec![0u8; 100];
        feed.read(&mut buf).unwrap();
        assert_eq!(anchors(&rx), vec![(0, Duration::ZERO, 0)]);

        // 100 bytes at 4000 B/s = 25ms consumed; the new sink starts there
        feed.attach();
        assert_eq!(anchors(&rx), vec![(0, Duration::from_millis(25), 0)]);
    }

    #[test]
    fn test_loop_rewinds_and_anchors_new_iteration() {
        let (mut feed, rx) = feed(100, PartialReadPolicy::Truncate, true);
        feed.attach();
        let mut buf = vec![0u8; 600]; // 150ms worth crosses the loop point
        assert_eq!(feed.read(&mut buf).unwrap(), Pull::Data(600));
        assert_eq!(
            anchors(&rx),
            vec![(0, Duration::ZERO, 0), (400, Duration::ZERO, 1)]
        );
        assert_eq!(feed.iteration(), 1);
    }

    #[test]
    fn test_decode_failure_ends_stream() {
        let mut source = SyntheticSource::new(Duration::from_secs(1), (25, 1)).with_audio(RATE);
        let probe = source.probe();
        source.open_decode().unwrap();
        source.open_stream(0).unwrap();
        source.open_stream(1).unwrap();
        let (tx, rx) = unbounded();
        let mut feed = AudioFeed::new(
            Box::new(source),
            0,
            1,
            RATE,
            PartialReadPolicy::Truncate,
            Arc::new(AtomicBool::new(false)),
            tx,
        );

        probe.inject_read_errors(1);
        let mut buf = vec![0u8; 40];
        assert_eq!(feed.read(&mut buf).unwrap(), Pull::EndOfStream(0));
        assert!(rx
            .try_iter()
            .any(|event| matches!(event, FeedEvent::Failed(DecodeError::Read(_)))));
    }

    #[test]
    fn test_seek_and_prime() {
        let (mut feed, _rx) = feed(1_000, PartialReadPolicy::Truncate, false);
        feed.seek(Duration::from_millis(500)).unwrap();
        let frame = feed.prime().unwrap().unwrap();
        assert_eq!(frame.offset, Duration::from_millis(480));
        assert_eq!(feed.buffered(), 0);
        assert_eq!(feed.iteration(), 1);
    }
}
