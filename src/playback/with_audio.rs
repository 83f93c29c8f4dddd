//! Audio-driven controller.
//!
//! The sink's played-byte counter is the clock. The sink pulls PCM from the
//! [`AudioFeed`], which decodes in packet order and forwards the video frames
//! it meets; those queue here until the audio position reaches them.
//!
//! The feed and its decoder move into the sink on play and come back when
//! the sink is closed on pause, stop or seek. Nothing in this controller is
//! shared with the sink thread except through the feed's event channel.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use tracing::{debug, warn};

use crate::audio::feed::{AudioFeed, FeedEvent};
use crate::audio::sink::{AudioOutput, AudioSink, SinkRejected};
use crate::config::PlayerConfig;
use crate::core::time;
use crate::decode::decoder::{DecodeError, MediaSource};
use crate::decode::frame::VideoFrame;
use crate::decode::stream_info::{AudioStreamInfo, VideoStreamInfo};
use crate::playback::controller::{CurrentFrame, PlaybackControl, SeekOutcome};
use crate::playback::cursor::FrameCursor;
use crate::playback::error::{ConfigError, PlaybackError};
use crate::playback::state::{PlaybackState, StopMode};

/// Who holds the feed
enum FeedSlot {
    Idle(AudioFeed),
    Attached(Box<dyn AudioSink>),
    Lost,
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    at_byte: u64,
    offset: Duration,
    iteration: u64,
}

pub struct AudioVideoController {
    slot: FeedSlot,
    output: Box<dyn AudioOutput>,
    events: Receiver<FeedEvent>,
    video_stream: usize,
    audio_stream: usize,
    bytes_per_second: u64,
    audio_buffer: Duration,
    duration: Duration,
    looping: Arc<AtomicBool>,
    volume: f32,
    muted: bool,

    cursor: FrameCursor,
    pending: VecDeque<(u64, VideoFrame)>, // (iteration, frame), decoded ahead
    anchors: VecDeque<Anchor>,
    active: Option<Anchor>,
    iteration: u64,
    position: Duration,
    feed_ended: bool,
    failure: Option<DecodeError>,

    state: PlaybackState,
    decoding: bool,
    closed: bool,
}

impl AudioVideoController {
    pub fn new(
        source: Box<dyn MediaSource>,
        video: VideoStreamInfo,
        audio: AudioStreamInfo,
        output: Box<dyn AudioOutput>,
        config: PlayerConfig,
    ) -> Result<Self, PlaybackError> {
        let frame_duration = video.frame_duration().ok_or(ConfigError::InvalidFrameRate(
            video.frame_rate.0,
            video.frame_rate.1,
        ))?;
        let looping = Arc::new(AtomicBool::new(false));
        let (events_tx, events) = channel::unbounded();
        let feed = AudioFeed::new(
            source,
            video.index(),
            audio.index(),
            audio.sample_rate,
            config.partial_reads,
            Arc::clone(&looping),
            events_tx,
        );

        Ok(Self {
            slot: FeedSlot::Idle(feed),
            output,
            events,
            video_stream: video.index(),
            audio_stream: audio.index(),
            bytes_per_second: audio.bytes_per_second(),
            audio_buffer: config.audio_buffer,
            duration: video.duration().max(audio.duration()),
            looping,
            volume: 1.0,
            muted: false,
            cursor: FrameCursor::new(frame_duration),
            pending: VecDeque::new(),
            anchors: VecDeque::new(),
            active: None,
            iteration: 0,
            position: Duration::ZERO,
            feed_ended: false,
            failure: None,
            state: PlaybackState::Stopped,
            decoding: false,
            closed: false,
        })
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        self.apply_volume();
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.apply_volume();
    }

    fn effective_volume(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.volume
        }
    }

    fn apply_volume(&mut self) {
        let volume = self.effective_volume();
        if let FeedSlot::Attached(sink) = &mut self.slot {
            sink.set_volume(volume);
        }
    }

    fn ensure_open(&self) -> Result<(), PlaybackError> {
        if self.closed {
            return Err(PlaybackError::Closed);
        }
        Ok(())
    }

    fn feed(&mut self) -> Result<&mut AudioFeed, PlaybackError> {
        match &mut self.slot {
            FeedSlot::Idle(feed) => Ok(feed),
            FeedSlot::Attached(_) | FeedSlot::Lost => Err(PlaybackError::AudioFeedLost),
        }
    }

    /// Pause and close the sink, taking the feed back
    fn halt_sink(&mut self) {
        self.slot = match mem::replace(&mut self.slot, FeedSlot::Lost) {
            FeedSlot::Attached(mut sink) => {
                if let Err(e) = sink.pause() {
                    warn!(error = %e, "pausing audio sink failed");
                }
                match sink.close() {
                    Some(feed) => FeedSlot::Idle(feed),
                    None => {
                        warn!("audio sink did not return its feed");
                        FeedSlot::Lost
                    }
                }
            }
            other => other,
        };
    }

    fn start_sink(&mut self) -> Result<(), PlaybackError> {
        let mut feed = match mem::replace(&mut self.slot, FeedSlot::Lost) {
            FeedSlot::Idle(feed) => feed,
            FeedSlot::Attached(sink) => {
                self.slot = FeedSlot::Attached(sink);
                return Ok(());
            }
            FeedSlot::Lost => return Err(PlaybackError::AudioFeedLost),
        };

        feed.attach();
        match self.output.create_sink(feed, self.audio_buffer) {
            Ok(mut sink) => {
                sink.set_volume(self.effective_volume());
                if let Err(e) = sink.play() {
                    self.slot = FeedSlot::Attached(sink);
                    self.halt_sink();
                    self.discard_anchors();
                    return Err(e.into());
                }
                self.slot = FeedSlot::Attached(sink);
                Ok(())
            }
            Err(SinkRejected { error, feed }) => {
                self.slot = FeedSlot::Idle(feed);
                self.discard_anchors();
                Err(error.into())
            }
        }
    }

    fn open_decoder(&mut self) -> Result<(), PlaybackError> {
        if self.decoding {
            return Ok(());
        }
        let (video, audio) = (self.video_stream, self.audio_stream);
        let source = self.feed()?.source_mut();
        source.open_decode()?;
        let opened = source
            .open_stream(video)
            .and_then(|_| source.open_stream(audio));
        if let Err(e) = opened {
            let _ = source.close_stream(video);
            let _ = source.close_decode();
            return Err(e.into());
        }
        self.decoding = true;
        Ok(())
    }

    /// Rewind and release the decoder. Every step is attempted; the first
    /// failure is reported.
    fn release_decoder(&mut self) -> Result<(), PlaybackError> {
        if !self.decoding {
            return Ok(());
        }
        self.decoding = false;
        let (video, audio) = (self.video_stream, self.audio_stream);
        let feed = self.feed()?;
        feed.reset();
        let source = feed.source_mut();
        let results = [
            source.rewind(video, Duration::ZERO),
            source.rewind(audio, Duration::ZERO),
            source.close_stream(video),
            source.close_stream(audio),
            source.close_decode(),
        ];
        results.into_iter().collect::<Result<Vec<()>, _>>()?;
        Ok(())
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                FeedEvent::Video { frame, iteration } => {
                    if iteration >= self.iteration {
                        self.pending.push_back((iteration, frame));
                    }
                }
                FeedEvent::Anchor {
                    at_byte,
                    offset,
                    iteration,
                } => self.anchors.push_back(Anchor {
                    at_byte,
                    offset,
                    iteration,
                }),
                FeedEvent::Ended => self.feed_ended = true,
                FeedEvent::Failed(e) => self.failure = Some(e),
            }
        }
    }

    /// Anchors are in the coordinates of one sink and die with it
    fn discard_anchors(&mut self) {
        self.drain_events();
        self.anchors.clear();
        self.active = None;
    }

    fn clear_session(&mut self) {
        self.drain_events();
        self.pending.clear();
        self.anchors.clear();
        self.active = None;
        self.feed_ended = false;
        self.failure = None;
    }

    /// Single transition into `Stopped`
    fn stop_with(&mut self, mode: StopMode) -> Result<(), PlaybackError> {
        self.halt_sink();
        self.clear_session();
        let released = self.release_decoder();
        match mode {
            StopMode::Manual => {
                self.cursor.clear();
                self.position = Duration::ZERO;
            }
            StopMode::EndOfStream => {
                self.position = self.duration;
            }
        }
        if self.state != PlaybackState::Stopped {
            debug!(?mode, "audio playback stopped");
        }
        self.state = PlaybackState::Stopped;
        released
    }

    fn activate(&mut self, anchor: Anchor) {
        if anchor.iteration > self.iteration {
            debug!(iteration = anchor.iteration, "audio looped");
            self.iteration = anchor.iteration;
            let current = self.iteration;
            self.pending.retain(|(iteration, _)| *iteration >= current);
            self.cursor.mark_loop();
        }
        self.active = Some(anchor);
    }

    /// Fold in feed events and the sink's progress; detect the end.
    fn sync(&mut self) -> Result<(), PlaybackError> {
        self.drain_events();
        if let Some(e) = self.failure.take() {
            warn!(error = %e, "decoding failed during playback");
            let _ = self.stop_with(StopMode::Manual);
            return Err(e.into());
        }
        if !self.state.is_playing() {
            return Ok(());
        }

        let (played, finished) = match &self.slot {
            FeedSlot::Attached(sink) => (sink.played_bytes(), sink.is_finished()),
            FeedSlot::Idle(_) | FeedSlot::Lost => return Ok(()),
        };
        while let Some(anchor) = self.anchors.front().copied() {
            if anchor.at_byte > played {
                break;
            }
            self.anchors.pop_front();
            self.activate(anchor);
        }

        if let Some(anchor) = self.active {
            let since = played.saturating_sub(anchor.at_byte);
            self.position = anchor.offset + time::bytes_to_duration(since, self.bytes_per_second);
        }

        let looping = self.looping.load(Ordering::Acquire);
        if (self.feed_ended && finished) || (!looping && self.position >= self.duration) {
            self.settle_final_frame();
            self.stop_with(StopMode::EndOfStream)?;
        } else if looping && self.position >= self.duration && !self.duration.is_zero() {
            self.position =
                Duration::from_nanos((self.position.as_nanos() % self.duration.as_nanos()) as u64);
        }
        Ok(())
    }

    /// Show the last frame decoded before a natural end, whether or not
    /// anyone polled while it played.
    fn settle_final_frame(&mut self) {
        self.halt_sink();
        self.drain_events();
        self.position = self.duration;
        self.advance_frames();
    }

    fn reached_end(&self) -> bool {
        self.state.is_stopped() && !self.duration.is_zero() && self.position == self.duration
    }

    fn advance_frames(&mut self) {
        let target = self.position;
        let iteration = self.iteration;
        let pending = &mut self.pending;
        let result = self.cursor.catch_up(target, || {
            while pending.front().map_or(false, |(it, _)| *it < iteration) {
                pending.pop_front();
            }
            let due = matches!(
                pending.front(),
                Some((it, frame)) if *it == iteration && frame.offset <= target
            );
            Ok::<_, std::convert::Infallible>(if due {
                pending.pop_front().map(|(_, frame)| frame)
            } else {
                None
            })
        });
        if let Err(never) = result {
            match never {}
        }
    }
}

impl PlaybackControl for AudioVideoController {
    fn play(&mut self) -> Result<(), PlaybackError> {
        self.ensure_open()?;
        match self.state {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Stopped => {
                self.open_decoder()?;
                self.clear_session();
                let feed = self.feed()?;
                feed.reset();
                self.iteration = feed.iteration();
                self.cursor.clear();
                self.position = Duration::ZERO;
            }
            PlaybackState::Paused => {}
        }
        self.start_sink()?;
        self.state = PlaybackState::Playing;
        debug!(position = ?self.position, "audio playback started");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        self.ensure_open()?;
        if !self.state.is_playing() {
            return Ok(());
        }
        self.sync()?;
        if !self.state.is_playing() {
            return Ok(());
        }
        self.halt_sink();
        self.discard_anchors();
        self.state = PlaybackState::Paused;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlaybackError> {
        if self.closed {
            return Ok(());
        }
        self.stop_with(StopMode::Manual)
    }

    fn close(&mut self) -> Result<(), PlaybackError> {
        if self.closed {
            return Ok(());
        }
        let stopped = self.stop_with(StopMode::Manual);
        if let Ok(feed) = self.feed() {
            feed.source_mut().close();
        }
        self.closed = true;
        debug!("audio controller closed");
        stopped
    }

    fn seek(&mut self, position: Duration) -> Result<SeekOutcome, PlaybackError> {
        self.ensure_open()?;
        if position >= self.duration {
            self.stop_with(StopMode::EndOfStream)?;
            return Ok(SeekOutcome::AtEnd);
        }

        let was_playing = self.state.is_playing();
        self.halt_sink();
        self.clear_session();
        self.open_decoder()?;

        let feed = self.feed()?;
        feed.seek(position)?;
        let primed = feed.prime()?;
        self.iteration = feed.iteration();
        let Some(frame) = primed else {
            self.stop_with(StopMode::EndOfStream)?;
            return Ok(SeekOutcome::AtEnd);
        };

        let frame = self.cursor.reset_to(frame);
        self.position = position;
        if was_playing {
            self.start_sink()?;
            self.state = PlaybackState::Playing;
        } else {
            self.state = PlaybackState::Paused;
        }
        debug!(?position, offset = ?frame.offset, "audio seek landed");
        Ok(SeekOutcome::Landed(frame))
    }

    fn position(&mut self) -> Result<Duration, PlaybackError> {
        self.ensure_open()?;
        self.sync()?;
        Ok(self.position)
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    fn set_looping(&mut self, looping: bool) -> Result<(), PlaybackError> {
        self.ensure_open()?;
        self.looping.store(looping, Ordering::Release);
        Ok(())
    }

    fn looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    fn state(&mut self) -> Result<PlaybackState, PlaybackError> {
        self.ensure_open()?;
        self.sync()?;
        Ok(self.state)
    }

    fn current_video_frame(&mut self) -> Result<CurrentFrame, PlaybackError> {
        self.ensure_open()?;
        self.sync()?;
        if self.state.is_playing() {
            self.advance_frames();
        }
        Ok(CurrentFrame {
            frame: self.cursor.last(),
            reached_end: self.reached_end(),
        })
    }
}

impl Drop for AudioVideoController {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing audio controller failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::manual::ManualOutput;
    use crate::decode::synthetic::{SourceProbe, SyntheticSource};

    // 1 kHz stereo s16: 4 bytes per millisecond
    const RATE: u32 = 1_000;

    fn ms(millis: usize) -> usize {
        millis * 4
    }

    fn controller(duration_ms: u64) -> (AudioVideoController, ManualOutput, SourceProbe) {
        let source =
            SyntheticSource::new(Duration::from_millis(duration_ms), (25, 1)).with_audio(RATE);
        let probe = source.probe();
        let video = source.video_streams().remove(0);
        let audio = source.audio_streams().remove(0);
        let output = ManualOutput::new(RATE);
        let controller = AudioVideoController::new(
            Box::new(source),
            video,
            audio,
            Box::new(output.clone()),
            PlayerConfig::default(),
        )
        .unwrap();
        (controller, output, probe)
    }

    fn offset(c: &mut AudioVideoController) -> Option<Duration> {
        c.current_video_frame().unwrap().frame.map(|f| f.offset)
    }

    #[test]
    fn test_position_follows_consumed_audio() {
        let (mut c, output, probe) = controller(1_000);
        c.play().unwrap();
        assert!(probe.is_decoding());
        assert_eq!(c.position().unwrap(), Duration::ZERO);
        assert_eq!(offset(&mut c), None);

        output.pull_total(ms(100), 64).unwrap();
        assert_eq!(c.position().unwrap(), Duration::from_millis(100));
        assert_eq!(offset(&mut c), Some(Duration::from_millis(80)));

        output.pull_total(ms(45), 64).unwrap();
        assert_eq!(offset(&mut c), Some(Duration::from_millis(120)));
    }

    #[test]
    fn test_pause_releases_sink_and_resumes() {
        let (mut c, output, _probe) = controller(1_000);
        c.play().unwrap();
        output.pull_total(ms(100), 100).unwrap();
        c.pause().unwrap();
        assert!(!output.has_sink());
        assert_eq!(c.position().unwrap(), Duration::from_millis(100));
        assert!(output.pull(64).unwrap().is_empty());

        c.play().unwrap();
        assert_eq!(output.sinks_created(), 2);
        output.pull_total(ms(50), 100).unwrap();
        assert_eq!(c.position().unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn test_natural_end_pins_to_duration() {
        let (mut c, output, probe) = controller(200);
        c.play().unwrap();
        output.pull_total(ms(150), 64).unwrap();
        let before = offset(&mut c).unwrap();

        output.pull_total(ms(100), 64).unwrap();
        let shown = c.current_video_frame().unwrap();
        assert!(shown.reached_end);
        assert!(before < Duration::from_millis(160));
        assert_eq!(shown.frame.unwrap().offset, Duration::from_millis(160));
        assert_eq!(c.state().unwrap(), PlaybackState::Stopped);
        assert_eq!(c.position().unwrap(), Duration::from_millis(200));
        assert!(!probe.is_decoding());
    }

    #[test]
    fn test_natural_end_without_polling_shows_last_frame() {
        let (mut c, output, _probe) = controller(200);
        c.play().unwrap();
        output.pull_total(ms(300), 64).unwrap();

        let shown = c.current_video_frame().unwrap();
        assert!(shown.reached_end);
        assert_eq!(shown.frame.unwrap().offset, Duration::from_millis(160));
        assert_eq!(c.position().unwrap(), Duration::from_millis(200));
    }

    #[test]
    fn test_loop_rebases_without_new_sink() {
        let (mut c, output, _probe) = controller(200);
        c.set_looping(true).unwrap();
        c.play().unwrap();

        output.pull_total(ms(190), 40).unwrap();
        assert_eq!(offset(&mut c), Some(Duration::from_millis(160)));

        output.pull_total(ms(60), 40).unwrap();
        assert_eq!(c.position().unwrap(), Duration::from_millis(50));
        assert_eq!(offset(&mut c), Some(Duration::from_millis(40)));
        assert_eq!(output.sinks_created(), 1);
        assert_eq!(c.state().unwrap(), PlaybackState::Playing);
    }

    #[test]
    fn test_seek_while_playing_keeps_playing() {
        let (mut c, output, _probe) = controller(1_000);
        c.play().unwrap();
        output.pull_total(ms(40), 40).unwrap();

        match c.seek(Duration::from_millis(500)).unwrap() {
            SeekOutcome::Landed(frame) => assert_eq!(frame.offset, Duration::from_millis(480)),
            SeekOutcome::AtEnd => panic!("seek inside the media stopped"),
        }
        assert_eq!(c.state().unwrap(), PlaybackState::Playing);
        assert_eq!(c.position().unwrap(), Duration::from_millis(500));

        output.pull_total(ms(60), 40).unwrap();
        let position = c.position().unwrap();
        assert!(position >= Duration::from_millis(540) && position <= Duration::from_millis(560));
    }

    #[test]
    fn test_volume_and_mute() {
        let (mut c, output, _probe) = controller(1_000);
        c.set_volume(0.5);
        c.play().unwrap();
        assert_eq!(output.volume(), Some(0.5));

        c.set_muted(true);
        assert_eq!(output.volume(), Some(0.0));
        assert_eq!(c.volume(), 0.5);

        c.set_muted(false);
        c.set_volume(3.0);
        assert_eq!(output.volume(), Some(1.0));
    }

    #[test]
    fn test_decode_failure_stops_and_surfaces() {
        let (mut c, output, probe) = controller(1_000);
        c.play().unwrap();
        output.pull_total(ms(20), 40).unwrap();
        probe.inject_read_errors(1);
        output.pull_total(ms(200), 40).unwrap();

        assert!(matches!(c.position(), Err(PlaybackError::Decode(_))));
        assert_eq!(c.state().unwrap(), PlaybackState::Stopped);
        assert_eq!(c.position().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_refused_sink_keeps_feed() {
        let (mut c, output, _probe) = controller(1_000);
        output.refuse_sinks(true);
        assert!(matches!(c.play(), Err(PlaybackError::Audio(_))));

        output.refuse_sinks(false);
        c.play().unwrap();
        assert_eq!(c.state().unwrap(), PlaybackState::Playing);
    }
}
