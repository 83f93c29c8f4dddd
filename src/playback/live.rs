//! Live controller.
//!
//! Two threads run per play session. The decode thread pulls frames from the
//! source into a bounded channel, backing off on starvation or read errors.
//! The schedule thread releases each frame at `wall_base + (pts - pts_base)`
//! and publishes it to the controller. Dropping the session's stop sender
//! wakes every blocking `select!` in both threads.
//!
//! The decode thread owns the source for the session and returns it through
//! its `JoinHandle`, so the source is never released while still in use.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, select, Receiver, Sender, TryRecvError};
use tracing::{debug, trace, warn};

use crate::config::PlayerConfig;
use crate::decode::decoder::{next_video_frame, MediaSource};
use crate::decode::frame::{SharedFrame, VideoFrame};
use crate::decode::stream_info::VideoStreamInfo;
use crate::playback::clock::{ReferenceClock, TimeSource};
use crate::playback::controller::{CurrentFrame, PlaybackControl, SeekOutcome};
use crate::playback::error::PlaybackError;
use crate::playback::state::PlaybackState;

/// A frame released by the scheduler
struct Published {
    frame: SharedFrame,
    position: Duration, // pts relative to the session base
    at: Instant,
}

struct LiveSession {
    stop: Sender<()>,
    control: Sender<bool>,
    published: Receiver<Published>,
    decode: JoinHandle<Box<dyn MediaSource>>,
    schedule: JoinHandle<()>,
}

pub struct LiveController {
    source: Option<Box<dyn MediaSource>>, // None while a session owns it
    stream: usize,
    config: PlayerConfig,
    time: Arc<dyn TimeSource>,
    clock: ReferenceClock,
    state: PlaybackState,
    last: Option<SharedFrame>,
    session: Option<LiveSession>,
    closed: bool,
}

impl LiveController {
    pub fn new(
        source: Box<dyn MediaSource>,
        video: VideoStreamInfo,
        config: PlayerConfig,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let clock = ReferenceClock::new(time.now());
        Self {
            source: Some(source),
            stream: video.index(),
            config,
            time,
            clock,
            state: PlaybackState::Stopped,
            last: None,
            session: None,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), PlaybackError> {
        if self.closed {
            return Err(PlaybackError::Closed);
        }
        Ok(())
    }

    fn start_session(&mut self) -> Result<(), PlaybackError> {
        let mut source = self.source.take().ok_or(PlaybackError::Closed)?;
        if let Err(e) = open_stream(source.as_mut(), self.stream) {
            self.source = Some(source);
            return Err(e);
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let (control_tx, control_rx) = channel::unbounded();
        let (frames_tx, frames_rx) = channel::bounded(self.config.live_queue_capacity);
        let (published_tx, published_rx) = channel::bounded(self.config.live_queue_capacity);

        let decoder = Decoder {
            stream: self.stream,
            frames: frames_tx,
            stop: stop_rx.clone(),
            backoff: self.config.live_backoff,
        };
        let decode = thread::Builder::new()
            .name("avsync-live-decode".to_string())
            .spawn(move || decoder.run(source))?;

        let scheduler = Scheduler {
            frames: frames_rx,
            control: control_rx,
            stop: stop_rx,
            published: published_tx,
            time: Arc::clone(&self.time),
            jitter: self.config.live_jitter,
            playing: true,
            base: None,
        };
        let schedule = match thread::Builder::new()
            .name("avsync-live-schedule".to_string())
            .spawn(move || scheduler.run())
        {
            Ok(handle) => handle,
            Err(e) => {
                drop(stop_tx);
                match decode.join() {
                    Ok(mut source) => {
                        release_stream(source.as_mut(), self.stream);
                        self.source = Some(source);
                    }
                    Err(_) => warn!("live decode thread panicked"),
                }
                return Err(e.into());
            }
        };

        self.session = Some(LiveSession {
            stop: stop_tx,
            control: control_tx,
            published: published_rx,
            decode,
            schedule,
        });
        debug!("live session started");
        Ok(())
    }

    /// Cancel both threads, wait for them and take the source back
    fn stop_session(&mut self) -> Result<(), PlaybackError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let LiveSession {
            stop,
            control,
            published,
            decode,
            schedule,
        } = session;
        drop(stop);
        drop(control);
        drop(published);

        let mut result = Ok(());
        if schedule.join().is_err() {
            warn!("live schedule thread panicked");
            result = Err(PlaybackError::TaskPanicked("live schedule"));
        }
        match decode.join() {
            Ok(mut source) => {
                release_stream(source.as_mut(), self.stream);
                self.source = Some(source);
            }
            Err(_) => {
                warn!("live decode thread panicked, source lost");
                result = Err(PlaybackError::TaskPanicked("live decode"));
            }
        }
        debug!("live session stopped");
        result
    }

    fn send_control(&self, playing: bool) {
        if let Some(session) = &self.session {
            if session.control.send(playing).is_err() {
                warn!("live scheduler is gone");
            }
        }
    }

    /// Take in everything the scheduler published. The clock only follows
    /// frames while playing.
    fn drain_published(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let playing = self.state.is_playing();
        while let Ok(published) = session.published.try_recv() {
            if playing {
                self.clock.rebase(published.position, published.at);
            }
            self.last = Some(published.frame);
        }
    }
}

fn open_stream(source: &mut dyn MediaSource, stream: usize) -> Result<(), PlaybackError> {
    source.open_decode()?;
    if let Err(e) = source.open_stream(stream) {
        let _ = source.close_decode();
        return Err(e.into());
    }
    Ok(())
}

fn release_stream(source: &mut dyn MediaSource, stream: usize) {
    if let Err(e) = source.close_stream(stream) {
        warn!(error = %e, "closing live stream failed");
    }
    if let Err(e) = source.close_decode() {
        warn!(error = %e, "closing live decoder failed");
    }
}

struct Decoder {
    stream: usize,
    frames: Sender<VideoFrame>,
    stop: Receiver<()>,
    backoff: Duration,
}

impl Decoder {
    fn run(self, mut source: Box<dyn MediaSource>) -> Box<dyn MediaSource> {
        loop {
            if matches!(self.stop.try_recv(), Err(TryRecvError::Disconnected)) {
                break;
            }
            match next_video_frame(source.as_mut(), self.stream) {
                Ok(Some(frame)) => {
                    select! {
                        send(self.frames, frame) -> sent => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        recv(self.stop) -> _ => break,
                    }
                }
                Ok(None) => {
                    trace!("live source starved");
                    if self.stopped_within(self.backoff) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "live read failed, retrying");
                    if self.stopped_within(self.backoff) {
                        break;
                    }
                }
            }
        }
        source
    }

    fn stopped_within(&self, wait: Duration) -> bool {
        select! {
            recv(self.stop) -> _ => true,
            default(wait) => false,
        }
    }
}

struct Scheduler {
    frames: Receiver<VideoFrame>,
    control: Receiver<bool>,
    stop: Receiver<()>,
    published: Sender<Published>,
    time: Arc<dyn TimeSource>,
    jitter: Duration,
    playing: bool,
    base: Option<(Duration, Instant)>, // (pts_base, wall_base), fixed per session
}

impl Scheduler {
    fn run(mut self) {
        loop {
            select! {
                recv(self.stop) -> _ => return,
                recv(self.control) -> msg => match msg {
                    Ok(playing) => self.set_playing(playing),
                    Err(_) => return,
                },
                recv(self.frames) -> msg => match msg {
                    Ok(frame) => {
                        if !self.release(frame) {
                            return;
                        }
                    }
                    Err(_) => return,
                },
            }
        }
    }

    /// Paused frames are published without waiting; the base stays put so a
    /// real-time source is on schedule again at once after a resume.
    fn set_playing(&mut self, playing: bool) {
        if playing != self.playing {
            trace!(playing, "live scheduler toggled");
        }
        self.playing = playing;
    }

    /// Wait until `frame` is due, then publish it. `false` once the session
    /// is over.
    fn release(&mut self, frame: VideoFrame) -> bool {
        let (pts_base, _) = *self.base.get_or_insert((frame.offset, self.time.now()));
        let position = frame.offset.saturating_sub(pts_base);

        loop {
            let now = self.time.now();
            let Some((_, wall_base)) = self.base else {
                break;
            };
            let due = wall_base + position;
            if !self.playing || due <= now + self.jitter {
                break;
            }
            select! {
                recv(self.stop) -> _ => return false,
                recv(self.control) -> msg => match msg {
                    Ok(playing) => self.set_playing(playing),
                    Err(_) => return false,
                },
                recv(channel::after(due - now)) -> _ => {}
            }
        }

        let published = Published {
            frame: Arc::new(frame),
            position,
            at: self.time.now(),
        };
        trace!(?position, "live frame published");
        select! {
            send(self.published, published) -> sent => sent.is_ok(),
            recv(self.stop) -> _ => false,
        }
    }
}

impl PlaybackControl for LiveController {
    fn play(&mut self) -> Result<(), PlaybackError> {
        self.ensure_open()?;
        match self.state {
            PlaybackState::Playing => return Ok(()),
            PlaybackState::Paused => {
                self.clock
                    .rebase(self.clock.reference_position(), self.time.now());
                self.send_control(true);
            }
            PlaybackState::Stopped => {
                self.start_session()?;
                self.clock.rebase(Duration::ZERO, self.time.now());
            }
        }
        self.state = PlaybackState::Playing;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        self.ensure_open()?;
        if !self.state.is_playing() {
            return Ok(());
        }
        self.drain_published();
        let now = self.time.now();
        self.clock.rebase(self.clock.position_at(now), now);
        self.send_control(false);
        self.state = PlaybackState::Paused;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlaybackError> {
        if self.closed {
            return Ok(());
        }
        let stopped = self.stop_session();
        self.state = PlaybackState::Stopped;
        self.clock.rebase(Duration::ZERO, self.time.now());
        self.last = None;
        stopped
    }

    fn close(&mut self) -> Result<(), PlaybackError> {
        if self.closed {
            return Ok(());
        }
        let stopped = self.stop();
        if let Some(source) = self.source.as_mut() {
            source.close();
        }
        self.closed = true;
        debug!("live controller closed");
        stopped
    }

    fn seek(&mut self, _position: Duration) -> Result<SeekOutcome, PlaybackError> {
        Err(PlaybackError::Unsupported("seek"))
    }

    fn position(&mut self) -> Result<Duration, PlaybackError> {
        self.ensure_open()?;
        self.drain_published();
        Ok(match self.state {
            PlaybackState::Playing => self.clock.position_at(self.time.now()),
            PlaybackState::Paused | PlaybackState::Stopped => self.clock.reference_position(),
        })
    }

    fn duration(&self) -> Duration {
        Duration::ZERO
    }

    fn set_looping(&mut self, _looping: bool) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unsupported("looping"))
    }

    fn looping(&self) -> bool {
        false
    }

    fn state(&mut self) -> Result<PlaybackState, PlaybackError> {
        self.ensure_open()?;
        Ok(self.state)
    }

    fn current_video_frame(&mut self) -> Result<CurrentFrame, PlaybackError> {
        self.ensure_open()?;
        self.drain_published();
        Ok(CurrentFrame {
            frame: self.last.clone(),
            reached_end: false,
        })
    }
}

impl Drop for LiveController {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing live controller failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::synthetic::{SourceProbe, SyntheticSource};
    use crate::playback::clock::{ManualClock, SystemClock};

    fn controller(source: SyntheticSource) -> (LiveController, SourceProbe) {
        controller_with_clock(source, Arc::new(SystemClock))
    }

    fn controller_with_clock(
        source: SyntheticSource,
        time: Arc<dyn TimeSource>,
    ) -> (LiveController, SourceProbe) {
        let probe = source.probe();
        let video = source.video_streams().remove(0);
        let controller = LiveController::new(Box::new(source), video, PlayerConfig::default(), time);
        (controller, probe)
    }

    fn wait_for_frame(c: &mut LiveController) -> SharedFrame {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(frame) = c.current_video_frame().unwrap().frame {
                return frame;
            }
            assert!(Instant::now() < deadline, "no frame published");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_frames_are_not_published_early() {
        let (mut c, _probe) = controller(SyntheticSource::live((50, 1)));
        let started = Instant::now();
        c.play().unwrap();
        wait_for_frame(&mut c);

        thread::sleep(Duration::from_millis(150));
        let frame = c.current_video_frame().unwrap().frame.unwrap();
        let jitter = PlayerConfig::default().live_jitter;
        assert!(frame.offset <= started.elapsed() + jitter);
        assert!(frame.offset >= Duration::from_millis(20));
        c.stop().unwrap();
    }

    #[test]
    fn test_paused_clock_freezes_but_frames_arrive() {
        let clock = ManualClock::new();
        let (mut c, _probe) =
            controller_with_clock(SyntheticSource::live((50, 1)), Arc::new(clock.clone()));
        c.play().unwrap();
        c.pause().unwrap();

        clock.advance(Duration::from_secs(1));
        wait_for_frame(&mut c);
        assert_eq!(c.position().unwrap(), Duration::ZERO);
        assert_eq!(c.state().unwrap(), PlaybackState::Paused);
        c.stop().unwrap();
    }

    #[test]
    fn test_resume_continues_with_live_frames() {
        let (mut c, _probe) = controller(SyntheticSource::live((50, 1)).paced());
        c.play().unwrap();
        wait_for_frame(&mut c);
        thread::sleep(Duration::from_millis(200));

        c.pause().unwrap();
        for _ in 0..12 {
            c.current_video_frame().unwrap();
            thread::sleep(Duration::from_millis(50));
        }
        let resumed = wait_for_frame(&mut c).offset;

        c.play().unwrap();
        let deadline = Instant::now() + Duration::from_millis(400);
        loop {
            let offset = wait_for_frame(&mut c).offset;
            if offset >= resumed + Duration::from_millis(100) {
                break;
            }
            assert!(Instant::now() < deadline, "no live frames after resume");
            thread::sleep(Duration::from_millis(5));
        }
        c.stop().unwrap();
    }

    #[test]
    fn test_position_relative_to_first_pts() {
        let source = SyntheticSource::live((50, 1)).with_pts_origin(Duration::from_secs(3_600));
        let (mut c, _probe) = controller(source);
        c.play().unwrap();
        wait_for_frame(&mut c);
        thread::sleep(Duration::from_millis(60));
        assert!(c.position().unwrap() < Duration::from_secs(1));
        c.stop().unwrap();
    }

    #[test]
    fn test_stop_joins_and_releases() {
        let (mut c, probe) = controller(SyntheticSource::live((100, 1)));
        c.play().unwrap();
        wait_for_frame(&mut c);

        c.stop().unwrap();
        assert!(!probe.is_decoding());
        assert!(probe.open_streams().is_empty());
        assert_eq!(c.position().unwrap(), Duration::ZERO);
        assert!(c.current_video_frame().unwrap().frame.is_none());

        c.play().unwrap();
        wait_for_frame(&mut c);
        c.close().unwrap();
        assert!(probe.is_closed());
    }

    #[test]
    fn test_survives_starvation_and_read_errors() {
        let source = SyntheticSource::live((100, 1)).starve_every(3);
        let (mut c, probe) = controller(source);
        probe.inject_read_errors(3);
        c.play().unwrap();
        wait_for_frame(&mut c);
        assert_eq!(c.state().unwrap(), PlaybackState::Playing);
        c.stop().unwrap();
    }

    #[test]
    fn test_seek_and_looping_unsupported() {
        let (mut c, _probe) = controller(SyntheticSource::live((25, 1)));
        assert!(matches!(
            c.seek(Duration::ZERO),
            Err(PlaybackError::Unsupported("seek"))
        ));
        assert!(matches!(
            c.set_looping(true),
            Err(PlaybackError::Unsupported("looping"))
        ));
        assert_eq!(c.duration(), Duration::ZERO);
    }
}
