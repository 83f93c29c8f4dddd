//! Controller contract and the controller sum type.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::audio::sink::AudioOutput;
use crate::config::PlayerConfig;
use crate::decode::decoder::MediaSource;
use crate::decode::frame::SharedFrame;
use crate::decode::stream_info::{AudioStreamInfo, VideoStreamInfo};
use crate::playback::clock::{SystemClock, TimeSource};
use crate::playback::error::{ConfigError, PlaybackError};
use crate::playback::live::LiveController;
use crate::playback::state::PlaybackState;
use crate::playback::video_only::VideoController;
use crate::playback::with_audio::AudioVideoController;

/// Frame to show now
#[derive(Debug, Clone, Default)]
pub struct CurrentFrame {
    pub frame: Option<SharedFrame>,
    /// Playback stopped because the media ran out
    pub reached_end: bool,
}

/// Outcome of a seek
#[derive(Debug, Clone)]
pub enum SeekOutcome {
    /// Decoded the frame at the target; the clock is rebased to it
    Landed(SharedFrame),
    /// Target at or past the end: playback stopped at the end
    AtEnd,
}

/// Operations shared by every controller variant
pub trait PlaybackControl {
    fn play(&mut self) -> Result<(), PlaybackError>;
    fn pause(&mut self) -> Result<(), PlaybackError>;
    fn stop(&mut self) -> Result<(), PlaybackError>;
    fn close(&mut self) -> Result<(), PlaybackError>;
    fn seek(&mut self, position: Duration) -> Result<SeekOutcome, PlaybackError>;

    /// Current logical position. May detect the end of the media and stop.
    fn position(&mut self) -> Result<Duration, PlaybackError>;
    fn duration(&self) -> Duration;

    fn set_looping(&mut self, looping: bool) -> Result<(), PlaybackError>;
    fn looping(&self) -> bool;

    /// Current state. May detect the end of the media and stop.
    fn state(&mut self) -> Result<PlaybackState, PlaybackError>;

    /// Frame due now. The only place frames are advanced.
    fn current_video_frame(&mut self) -> Result<CurrentFrame, PlaybackError>;
}

/// Any controller variant
pub enum Controller {
    VideoOnly(VideoController),
    WithAudio(AudioVideoController),
    Live(LiveController),
}

/// Audio-only operations, present for the audio-driven variant
pub struct AudioCapability<'a> {
    controller: &'a mut AudioVideoController,
}

impl AudioCapability<'_> {
    pub fn volume(&self) -> f32 {
        self.controller.volume()
    }

    /// Clamped to `0.0..=1.0`
    pub fn set_volume(&mut self, volume: f32) {
        self.controller.set_volume(volume);
    }

    pub fn muted(&self) -> bool {
        self.controller.muted()
    }

    /// Muting zeroes the effective volume and keeps the stored one
    pub fn set_muted(&mut self, muted: bool) {
        self.controller.set_muted(muted);
    }
}

impl Controller {
    /// Open a file-backed controller. Picks the audio-driven variant when the
    /// media has audio and audio is not ignored.
    pub fn open(
        source: Box<dyn MediaSource>,
        output: Option<Box<dyn AudioOutput>>,
        config: PlayerConfig,
    ) -> Result<Self, PlaybackError> {
        Self::open_with_clock(source, output, config, Arc::new(SystemClock))
    }

    /// [`Controller::open`] ignoring any audio stream
    pub fn open_without_audio(
        source: Box<dyn MediaSource>,
        config: PlayerConfig,
    ) -> Result<Self, PlaybackError> {
        Self::open(source, None, config.without_audio())
    }

    pub fn open_with_clock(
        mut source: Box<dyn MediaSource>,
        output: Option<Box<dyn AudioOutput>>,
        config: PlayerConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, PlaybackError> {
        let selected = select_streams(source.as_ref(), output.as_deref(), &config);
        let (video, audio) = match selected {
            Ok(streams) => streams,
            Err(e) => {
                source.close();
                return Err(e.into());
            }
        };

        match (audio, output) {
            (Some(audio), Some(output)) => {
                debug!(
                    video = video.index(),
                    audio = audio.index(),
                    "opening audio-driven controller"
                );
                Ok(Controller::WithAudio(AudioVideoController::new(
                    source, video, audio, output, config,
                )?))
            }
            _ => {
                debug!(video = video.index(), "opening video-only controller");
                Ok(Controller::VideoOnly(VideoController::new(
                    source, video, time,
                )?))
            }
        }
    }

    /// Open a controller over an unbounded source
    pub fn open_live(
        source: Box<dyn MediaSource>,
        config: PlayerConfig,
    ) -> Result<Self, PlaybackError> {
        Self::open_live_with_clock(source, config, Arc::new(SystemClock))
    }

    pub fn open_live_with_clock(
        mut source: Box<dyn MediaSource>,
        config: PlayerConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, PlaybackError> {
        let video = match first_video(source.as_ref()) {
            Ok(video) => video,
            Err(e) => {
                source.close();
                return Err(e.into());
            }
        };
        if !source.audio_streams().is_empty() {
            debug!("live audio is not played, ignoring audio streams");
        }
        Ok(Controller::Live(LiveController::new(
            source, video, config, time,
        )))
    }

    /// Audio controls, if this variant plays audio
    pub fn audio(&mut self) -> Option<AudioCapability<'_>> {
        match self {
            Controller::WithAudio(controller) => Some(AudioCapability { controller }),
            _ => None,
        }
    }

    pub fn has_audio(&self) -> bool {
        matches!(self, Controller::WithAudio(_))
    }

    fn inner(&mut self) -> &mut dyn PlaybackControl {
        match self {
            Controller::VideoOnly(c) => c,
            Controller::WithAudio(c) => c,
            Controller::Live(c) => c,
        }
    }

    fn inner_ref(&self) -> &dyn PlaybackControl {
        match self {
            Controller::VideoOnly(c) => c,
            Controller::WithAudio(c) => c,
            Controller::Live(c) => c,
        }
    }
}

impl PlaybackControl for Controller {
    fn play(&mut self) -> Result<(), PlaybackError> {
        self.inner().play()
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        self.inner().pause()
    }

    fn stop(&mut self) -> Result<(), PlaybackError> {
        self.inner().stop()
    }

    fn close(&mut self) -> Result<(), PlaybackError> {
        self.inner().close()
    }

    fn seek(&mut self, position: Duration) -> Result<SeekOutcome, PlaybackError> {
        self.inner().seek(position)
    }

    fn position(&mut self) -> Result<Duration, PlaybackError> {
        self.inner().position()
    }

    fn duration(&self) -> Duration {
        self.inner_ref().duration()
    }

    fn set_looping(&mut self, looping: bool) -> Result<(), PlaybackError> {
        self.inner().set_looping(looping)
    }

    fn looping(&self) -> bool {
        self.inner_ref().looping()
    }

    fn state(&mut self) -> Result<PlaybackState, PlaybackError> {
        self.inner().state()
    }

    fn current_video_frame(&mut self) -> Result<CurrentFrame, PlaybackError> {
        self.inner().current_video_frame()
    }
}

fn first_video(source: &dyn MediaSource) -> Result<VideoStreamInfo, ConfigError> {
    let mut videos = source.video_streams().into_iter();
    let video = videos.next().ok_or(ConfigError::NoVideo)?;
    if videos.next().is_some() {
        warn!(using = video.index(), "media has several video streams");
    }
    if video.frame_duration().is_none() {
        return Err(ConfigError::InvalidFrameRate(
            video.frame_rate.0,
            video.frame_rate.1,
        ));
    }
    Ok(video)
}

fn select_streams(
    source: &dyn MediaSource,
    output: Option<&dyn AudioOutput>,
    config: &PlayerConfig,
) -> Result<(VideoStreamInfo, Option<AudioStreamInfo>), ConfigError> {
    let video = first_video(source)?;
    if config.ignore_audio {
        return Ok((video, None));
    }

    let mut audios = source.audio_streams().into_iter();
    let Some(audio) = audios.next() else {
        return Ok((video, None));
    };
    if audios.next().is_some() {
        warn!(using = audio.index(), "media has several audio streams");
    }

    let output = output.ok_or(ConfigError::NoAudioOutput)?;
    if audio.sample_rate != output.sample_rate() {
        return Err(ConfigError::SampleRateMismatch {
            stream: audio.sample_rate,
            output: output.sample_rate(),
        });
    }
    if audio.channels > 2 {
        return Err(ConfigError::TooManyChannels(audio.channels));
    }
    if audio.channels < 2 {
        return Err(ConfigError::MonoAudio);
    }

    let (longer, shorter) = if video.duration() >= audio.duration() {
        (video.duration(), audio.duration())
    } else {
        (audio.duration(), video.duration())
    };
    if longer - shorter > config.duration_tolerance {
        return Err(ConfigError::DurationMismatch {
            video: video.duration(),
            audio: audio.duration(),
        });
    }

    Ok((video, Some(audio)))
}
