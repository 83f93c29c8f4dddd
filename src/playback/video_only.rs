//! Video-only controller.
//!
//! Wall-clock time is authoritative: the position is projected from the
//! reference clock, and frames are pulled from the decoder on demand until
//! the held frame covers that position.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::decode::decoder::{next_video_frame, MediaSource};
use crate::decode::stream_info::VideoStreamInfo;
use crate::playback::clock::{Projection, ReferenceClock, TimeSource};
use crate::playback::controller::{CurrentFrame, PlaybackControl, SeekOutcome};
use crate::playback::cursor::{CatchUp, FrameCursor};
use crate::playback::error::{ConfigError, PlaybackError};
use crate::playback::state::{PlaybackState, StopMode};

pub struct VideoController {
    source: Box<dyn MediaSource>,
    stream: usize,
    duration: Duration,
    time: Arc<dyn TimeSource>,
    clock: ReferenceClock,
    cursor: FrameCursor,
    state: PlaybackState,
    looping: bool,
    decoding: bool,
    closed: bool,
}

impl VideoController {
    pub fn new(
        source: Box<dyn MediaSource>,
        video: VideoStreamInfo,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, PlaybackError> {
        let frame_duration = video.frame_duration().ok_or(ConfigError::InvalidFrameRate(
            video.frame_rate.0,
            video.frame_rate.1,
        ))?;
        let clock = ReferenceClock::new(time.now());

        Ok(Self {
            source,
            stream: video.index(),
            duration: video.duration(),
            time,
            clock,
            cursor: FrameCursor::new(frame_duration),
            state: PlaybackState::Stopped,
            looping: false,
            decoding: false,
            closed: false,
        })
    }

    fn ensure_open(&self) -> Result<(), PlaybackError> {
        if self.closed {
            return Err(PlaybackError::Closed);
        }
        Ok(())
    }

    fn open_decoder(&mut self) -> Result<(), PlaybackError> {
        if self.decoding {
            return Ok(());
        }
        self.source.open_decode()?;
        if let Err(e) = self.source.open_stream(self.stream) {
            let _ = self.source.close_decode();
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
        let rewound = self.source.rewind(self.stream, Duration::ZERO);
        let closed_stream = self.source.close_stream(self.stream);
        let closed_decode = self.source.close_decode();
        rewound.and(closed_stream).and(closed_decode)?;
        Ok(())
    }

    /// Single transition into `Stopped`
    fn stop_with(&mut self, mode: StopMode) -> Result<(), PlaybackError> {
        let released = self.release_decoder();
        let now = self.time.now();
        match mode {
            StopMode::Manual => {
                self.cursor.clear();
                self.clock.rebase(Duration::ZERO, now);
            }
            StopMode::EndOfStream => {
                self.clock.rebase(self.duration, now);
            }
        }
        if self.state != PlaybackState::Stopped {
            debug!(?mode, "video playback stopped");
        }
        self.state = PlaybackState::Stopped;
        released
    }

    /// Position at now; detects the end and wraps loops
    fn project(&mut self) -> Result<Duration, PlaybackError> {
        if !self.state.is_playing() {
            return Ok(self.clock.reference_position());
        }
        match self
            .clock
            .project(self.time.now(), self.duration, self.looping)
        {
            Projection::Within(position) => Ok(position),
            Projection::Looped(position) => {
                debug!(?position, "video clock wrapped");
                if self.decoding {
                    self.source.rewind(self.stream, Duration::ZERO)?;
                }
                self.cursor.mark_loop();
                Ok(position)
            }
            Projection::PastEnd => {
                self.stop_with(StopMode::EndOfStream)?;
                Ok(self.duration)
            }
        }
    }

    fn reached_end(&self) -> bool {
        self.state.is_stopped()
            && !self.duration.is_zero()
            && self.clock.reference_position() == self.duration
    }

    fn stopped_frame(&self) -> CurrentFrame {
        CurrentFrame {
            frame: self.cursor.last(),
            reached_end: self.reached_end(),
        }
    }

    fn catch_up(&mut self, target: Duration) -> Result<CatchUp, PlaybackError> {
        let source = self.source.as_mut();
        let stream = self.stream;
        Ok(self
            .cursor
            .catch_up(target, || next_video_frame(source, stream))?)
    }
}

impl PlaybackControl for VideoController {
    fn play(&mut self) -> Result<(), PlaybackError> {
        self.ensure_open()?;
        match self.state {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Stopped => {
                self.open_decoder()?;
                self.cursor.clear();
                self.clock.rebase(Duration::ZERO, self.time.now());
            }
            PlaybackState::Paused => {
                let position = self.clock.reference_position();
                self.clock.rebase(position, self.time.now());
            }
        }
        self.state = PlaybackState::Playing;
        debug!("video playback started");
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        self.ensure_open()?;
        if !self.state.is_playing() {
            return Ok(());
        }
        let position = self.project()?;
        if self.state.is_playing() {
            self.clock.rebase(position, self.time.now());
            self.state = PlaybackState::Paused;
        }
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
        self.source.close();
        self.closed = true;
        debug!("video controller closed");
        stopped
    }

    fn seek(&mut self, position: Duration) -> Result<SeekOutcome, PlaybackError> {
        self.ensure_open()?;
        if position >= self.duration {
            self.stop_with(StopMode::EndOfStream)?;
            return Ok(SeekOutcome::AtEnd);
        }

        self.open_decoder()?;
        self.source.rewind(self.stream, position)?;
        let Some(frame) = next_video_frame(self.source.as_mut(), self.stream)? else {
            self.stop_with(StopMode::EndOfStream)?;
            return Ok(SeekOutcome::AtEnd);
        };

        let frame = self.cursor.reset_to(frame);
        self.clock.rebase(position, self.time.now());
        if self.state.is_stopped() {
            self.state = PlaybackState::Paused;
        }
        debug!(?position, offset = ?frame.offset, "video seek landed");
        Ok(SeekOutcome::Landed(frame))
    }

    fn position(&mut self) -> Result<Duration, PlaybackError> {
        self.ensure_open()?;
        self.project()
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    fn set_looping(&mut self, looping: bool) -> Result<(), PlaybackError> {
        self.ensure_open()?;
        self.looping = looping;
        Ok(())
    }

    fn looping(&self) -> bool {
        self.looping
    }

    fn state(&mut self) -> Result<PlaybackState, PlaybackError> {
        self.ensure_open()?;
        self.project()?;
        Ok(self.state)
    }

    fn current_video_frame(&mut self) -> Result<CurrentFrame, PlaybackError> {
        self.ensure_open()?;
        let target = self.project()?;
        if !self.state.is_playing() {
            return Ok(self.stopped_frame());
        }

        let mut rewound = false;
        loop {
            if self.catch_up(target)? == CatchUp::Caught {
                break;
            }
            if !self.looping || rewound {
                if rewound {
                    warn!("media produced no frame after a loop rewind");
                }
                self.stop_with(StopMode::EndOfStream)?;
                return Ok(self.stopped_frame());
            }

            // the stream ran out before the clock wrapped
            self.source.rewind(self.stream, Duration::ZERO)?;
            rewound = true;
            if !self.cursor.pending_loop() {
                self.clock.rebase(Duration::ZERO, self.time.now());
                self.cursor.mark_loop();
                debug!("video stream looped ahead of the clock");
                return Ok(CurrentFrame {
                    frame: self.cursor.last(),
                    reached_end: false,
                });
            }
        }

        Ok(CurrentFrame {
            frame: self.cursor.last(),
            reached_end: false,
        })
    }
}

impl Drop for VideoController {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing video controller failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::synthetic::SyntheticSource;
    use crate::playback::clock::ManualClock;

    fn controller(duration: Duration) -> (VideoController, ManualClock) {
        let source = SyntheticSource::new(duration, (25, 1));
        let video = source.video_streams().remove(0);
        let clock = ManualClock::new();
        let controller =
            VideoController::new(Box::new(source), video, Arc::new(clock.clone())).unwrap();
        (controller, clock)
    }

    #[test]
    fn test_play_pause_freezes_position() {
        let (mut c, clock) = controller(Duration::from_secs(10));
        c.play().unwrap();
        clock.advance(Duration::from_millis(300));
        c.pause().unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(c.position().unwrap(), Duration::from_millis(300));
        assert_eq!(c.state().unwrap(), PlaybackState::Paused);

        c.play().unwrap();
        clock.advance(Duration::from_millis(100));
        assert_eq!(c.position().unwrap(), Duration::from_millis(400));
    }

    #[test]
    fn test_natural_end_keeps_last_frame() {
        let (mut c, clock) = controller(Duration::from_millis(400));
        c.play().unwrap();
        clock.advance(Duration::from_millis(390));
        let shown = c.current_video_frame().unwrap();
        assert_eq!(shown.frame.unwrap().offset, Duration::from_millis(360));

        clock.advance(Duration::from_millis(20));
        let end = c.current_video_frame().unwrap();
        assert!(end.reached_end);
        assert_eq!(end.frame.unwrap().offset, Duration::from_millis(360));
        assert_eq!(c.position().unwrap(), Duration::from_millis(400));
        assert_eq!(c.state().unwrap(), PlaybackState::Stopped);
    }

    #[test]
    fn test_pause_at_end_stops() {
        let (mut c, clock) = controller(Duration::from_millis(400));
        c.play().unwrap();
        clock.advance(Duration::from_secs(1));
        c.pause().unwrap();
        assert_eq!(c.state().unwrap(), PlaybackState::Stopped);
        assert_eq!(c.position().unwrap(), Duration::from_millis(400));
    }

    #[test]
    fn test_seek_from_stopped_lands_paused() {
        let (mut c, _clock) = controller(Duration::from_secs(10));
        match c.seek(Duration::from_millis(1010)).unwrap() {
            SeekOutcome::Landed(frame) => assert_eq!(frame.offset, Duration::from_millis(1000)),
            SeekOutcome::AtEnd => panic!("seek inside the media stopped"),
        }
        assert_eq!(c.state().unwrap(), PlaybackState::Paused);
        assert_eq!(c.position().unwrap(), Duration::from_millis(1010));
        let shown = c.current_video_frame().unwrap();
        assert_eq!(shown.frame.unwrap().offset, Duration::from_millis(1000));
    }

    #[test]
    fn test_stream_shorter_than_duration_loops() {
        // reported 1s but the stream stops producing frames early
        let (mut c, clock) = controller(Duration::from_millis(200));
        c.duration = Duration::from_secs(1);
        c.set_looping(true).unwrap();
        c.play().unwrap();

        clock.advance(Duration::from_millis(300));
        let shown = c.current_video_frame().unwrap();
        assert!(!shown.reached_end);
        assert_eq!(c.position().unwrap(), Duration::ZERO);

        clock.advance(Duration::from_millis(50));
        let shown = c.current_video_frame().unwrap();
        assert_eq!(shown.frame.unwrap().offset, Duration::from_millis(40));
    }

    #[test]
    fn test_clock_wrap_rewinds_without_draining_iteration() {
        let source = SyntheticSource::new(Duration::from_secs(10), (25, 1));
        let probe = source.probe();
        let video = source.video_streams().remove(0);
        let clock = ManualClock::new();
        let mut c =
            VideoController::new(Box::new(source), video, Arc::new(clock.clone())).unwrap();
        c.set_looping(true).unwrap();
        c.play().unwrap();

        clock.advance(Duration::from_millis(1_010));
        c.current_video_frame().unwrap();
        let read_before_stall = probe.packets_read();

        // a long stall lands past the end of the first iteration
        clock.advance(Duration::from_millis(9_500));
        let shown = c.current_video_frame().unwrap();
        assert_eq!(shown.frame.unwrap().offset, Duration::from_millis(480));
        assert_eq!(probe.rewinds(), 1);
        assert!(probe.packets_read() - read_before_stall <= 13);
    }

    #[test]
    fn test_closed_controller_rejects_operations() {
        let (mut c, _clock) = controller(Duration::from_secs(1));
        c.close().unwrap();
        c.close().unwrap();
        c.stop().unwrap();
        assert!(matches!(c.play(), Err(PlaybackError::Closed)));
        assert!(matches!(c.position(), Err(PlaybackError::Closed)));
    }
}
