//! cpal audio output.
//!
//! `cpal::Stream` is not `Send` on every platform, so each sink runs its
//! stream on a dedicated thread and is commanded over a channel. The device
//! callback pulls s16 stereo from the [`AudioFeed`] and converts it to the
//! device's sample format and channel count.
//!
//! # Clock
//!
//! The played-byte counter advances when the callback hands samples to the
//! device, so it leads the speaker by the device latency (bounded by the
//! configured buffer).
//!
//! # Failure modes
//!
//! - No device or no usable config: `create_sink` fails and the feed is
//!   returned with the error.
//! - Device errors during playback are logged; the stream keeps running.
//! - A sink thread that dies takes nothing with it: the feed lives in
//!   shared state and is recovered on close.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SupportedBufferSize};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::audio::feed::{AudioFeed, Pull};
use crate::audio::sink::{AudioError, AudioOutput, AudioSink, SinkRejected};
use crate::core::time::STEREO_S16_FRAME_BYTES;

/// Commands sent to a sink thread
#[derive(Debug, Clone, Copy)]
enum SinkCommand {
    Play,
    Pause,
}

/// State shared between the device callback and the sink handle
struct SinkShared {
    feed: Option<AudioFeed>,
    volume: f32,
    played: u64,
    finished: bool,
    scratch: Vec<u8>,
}

/// Default output device of the default host
pub struct CpalOutput {
    sample_rate: u32,
}

impl CpalOutput {
    /// Probe the default output device.
    ///
    /// # Errors
    ///
    /// Returns `AudioError::NoDevice` if no output device is available.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
        let config = device
            .default_output_config()
            .map_err(|e| AudioError::Backend(e.to_string()))?;

        Ok(Self {
            sample_rate: config.sample_rate().0,
        })
    }
}

impl AudioOutput for CpalOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn create_sink(
        &self,
        feed: AudioFeed,
        buffer: Duration,
    ) -> Result<Box<dyn AudioSink>, SinkRejected> {
        let shared = Arc::new(Mutex::new(SinkShared {
            feed: None,
            volume: 1.0,
            played: 0,
            finished: false,
            scratch: Vec::new(),
        }));
        let (commands, command_rx) = channel::unbounded();
        let (ready_tx, ready_rx) = channel::bounded(1);

        let thread_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("avsync-audio-sink".to_string())
            .spawn(move || run_sink(thread_shared, buffer, command_rx, ready_tx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                return Err(SinkRejected {
                    error: AudioError::Backend(e.to_string()),
                    feed,
                })
            }
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                let _ = handle.join();
                return Err(SinkRejected { error, feed });
            }
            Err(_) => {
                let _ = handle.join();
                return Err(SinkRejected {
                    error: AudioError::SinkThread,
                    feed,
                });
            }
        }

        // the stream is paused until play(); until then the callback sees no feed
        shared.lock().feed = Some(feed);

        Ok(Box::new(CpalSink {
            commands: Some(commands),
            shared,
            thread: Some(handle),
        }))
    }
}

fn run_sink(
    shared: Arc<Mutex<SinkShared>>,
    buffer: Duration,
    commands: Receiver<SinkCommand>,
    ready: Sender<Result<(), AudioError>>,
) {
    let stream = match open_stream(&shared, buffer) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    // disconnect means the sink handle was closed
    for command in commands.iter() {
        let result = match command {
            SinkCommand::Play => stream.play().map_err(|e| e.to_string()),
            SinkCommand::Pause => stream.pause().map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            warn!(error = %e, ?command, "audio stream command failed");
        }
    }

    debug!("audio sink thread exiting");
}

fn open_stream(
    shared: &Arc<Mutex<SinkShared>>,
    buffer: Duration,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or(AudioError::NoDevice)?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Backend(e.to_string()))?;
    if supported.channels() == 0 {
        return Err(AudioError::UnsupportedChannels(0));
    }

    let mut config = supported.config();
    let frames = (buffer.as_secs_f64() * config.sample_rate.0 as f64) as u32;
    config.buffer_size = match supported.buffer_size() {
        SupportedBufferSize::Range { min, max } => BufferSize::Fixed(frames.clamp(*min, *max)),
        SupportedBufferSize::Unknown => BufferSize::Default,
    };

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, Arc::clone(shared)),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, Arc::clone(shared)),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, Arc::clone(shared)),
        other => Err(AudioError::Backend(format!(
            "unsupported sample format {other:?}"
        ))),
    }?;

    // some hosts start streams eagerly
    let _ = stream.pause();
    Ok(stream)
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: Arc<Mutex<SinkShared>>,
) -> Result<cpal::Stream, AudioError> {
    let channels = config.channels as usize;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                fill(data, channels, &shared);
            },
            |err| warn!(error = %err, "audio output error"),
            None,
        )
        .map_err(|e| AudioError::Backend(e.to_string()))
}

/// Device callback body: pull, convert, count
fn fill<T: cpal::SizedSample + cpal::FromSample<f32>>(
    data: &mut [T],
    channels: usize,
    shared: &Mutex<SinkShared>,
) {
    let frames = data.len() / channels;
    let mut guard = shared.lock();
    let state = &mut *guard;

    let mut served = 0;
    if let Some(feed) = state.feed.as_mut() {
        state.scratch.resize(frames * STEREO_S16_FRAME_BYTES, 0);
        match feed.read(&mut state.scratch) {
            Ok(pull) => {
                served = pull.len() / STEREO_S16_FRAME_BYTES;
                state.played += pull.len() as u64;
                if let Pull::EndOfStream(_) = pull {
                    state.finished = true;
                }
            }
            Err(e) => warn!(error = %e, "audio pull rejected"),
        }
    }

    let volume = state.volume;
    for (i, frame) in data.chunks_exact_mut(channels).enumerate() {
        let (left, right) = if i < served {
            let at = i * STEREO_S16_FRAME_BYTES;
            let bytes = &state.scratch[at..at + STEREO_S16_FRAME_BYTES];
            (
                i16::from_le_bytes([bytes[0], bytes[1]]) as f32 / 32768.0 * volume,
                i16::from_le_bytes([bytes[2], bytes[3]]) as f32 / 32768.0 * volume,
            )
        } else {
            (0.0, 0.0)
        };

        match frame {
            [mono] => *mono = T::from_sample((left + right) * 0.5),
            [l, r, rest @ ..] => {
                *l = T::from_sample(left);
                *r = T::from_sample(right);
                for sample in rest {
                    *sample = T::from_sample(0.0f32);
                }
            }
            [] => {}
        }
    }
}

struct CpalSink {
    commands: Option<Sender<SinkCommand>>,
    shared: Arc<Mutex<SinkShared>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CpalSink {
    fn send(&self, command: SinkCommand) -> Result<(), AudioError> {
        self.commands
            .as_ref()
            .ok_or(AudioError::SinkThread)?
            .send(command)
            .map_err(|_| AudioError::SinkThread)
    }
}

impl AudioSink for CpalSink {
    fn play(&mut self) -> Result<(), AudioError> {
        self.send(SinkCommand::Play)
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.send(SinkCommand::Pause)
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared.lock().volume = volume.clamp(0.0, 1.0);
    }

    fn played_bytes(&self) -> u64 {
        self.shared.lock().played
    }

    fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    fn close(mut self: Box<Self>) -> Option<AudioFeed> {
        // dropping the sender ends the command loop, which drops the stream
        self.commands = None;
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("audio sink thread panicked");
            }
        }
        self.shared.lock().feed.take()
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.commands = None;
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
