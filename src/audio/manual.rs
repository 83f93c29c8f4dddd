//! Headless audio output.
//!
//! Nothing is played on its own: the owner drives consumption with
//! [`ManualOutput::pull`], which behaves like one device callback. Handy for
//! offline rendering and for exercising the audio-driven controller without
//! a sound card.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::feed::{AudioFeed, FeedError, Pull};
use crate::audio::sink::{AudioError, AudioOutput, AudioSink, SinkRejected};

#[derive(Default)]
struct SinkState {
    feed: Option<AudioFeed>,
    playing: bool,
    volume: f32,
    played: u64,
    finished: bool,
}

#[derive(Default)]
struct Shared {
    current: Option<Arc<Mutex<SinkState>>>,
    sinks_created: usize,
    refuse_sinks: bool,
}

/// Audio output consumed on demand
#[derive(Clone)]
pub struct ManualOutput {
    sample_rate: u32,
    shared: Arc<Mutex<Shared>>,
}

impl ManualOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Pull up to `len` bytes from the playing sink. Returns nothing when no
    /// sink is attached, the sink is paused or the stream has ended.
    pub fn pull(&self, len: usize) -> Result<Vec<u8>, FeedError> {
        let Some(sink) = self.current() else {
            return Ok(Vec::new());
        };
        let mut sink = sink.lock();
        if !sink.playing || sink.finished {
            return Ok(Vec::new());
        }
        let Some(feed) = sink.feed.as_mut() else {
            return Ok(Vec::new());
        };

        let mut buf = vec![0u8; len];
        let pull = feed.read(&mut buf)?;
        buf.truncate(pull.len());
        sink.played += pull.len() as u64;
        if let Pull::EndOfStream(_) = pull {
            sink.finished = true;
        }
        Ok(buf)
    }

    /// Pull `len` bytes at a time until `total` bytes were consumed or the
    /// sink stops producing
    pub fn pull_total(&self, total: usize, len: usize) -> Result<usize, FeedError> {
        let mut pulled = 0;
        while pulled < total {
            let chunk = self.pull(len.min(total - pulled))?;
            if chunk.is_empty() {
                break;
            }
            pulled += chunk.len();
        }
        Ok(pulled)
    }

    pub fn sinks_created(&self) -> usize {
        self.shared.lock().sinks_created
    }

    pub fn has_sink(&self) -> bool {
        self.current().is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.current().map_or(false, |sink| sink.lock().playing)
    }

    /// Effective volume of the attached sink
    pub fn volume(&self) -> Option<f32> {
        self.current().map(|sink| sink.lock().volume)
    }

    /// Make subsequent `create_sink` calls fail, as a missing device would
    pub fn refuse_sinks(&self, refuse: bool) {
        self.shared.lock().refuse_sinks = refuse;
    }

    fn current(&self) -> Option<Arc<Mutex<SinkState>>> {
        self.shared.lock().current.clone()
    }
}

impl AudioOutput for ManualOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn create_sink(
        &self,
        feed: AudioFeed,
        _buffer: Duration,
    ) -> Result<Box<dyn AudioSink>, SinkRejected> {
        let mut shared = self.shared.lock();
        if shared.refuse_sinks {
            return Err(SinkRejected {
                error: AudioError::NoDevice,
                feed,
            });
        }

        let state = Arc::new(Mutex::new(SinkState {
            feed: Some(feed),
            volume: 1.0,
            ..SinkState::default()
        }));
        shared.current = Some(Arc::clone(&state));
        shared.sinks_created += 1;

        Ok(Box::new(ManualSink {
            state,
            output: Arc::clone(&self.shared),
        }))
    }
}

struct ManualSink {
    state: Arc<Mutex<SinkState>>,
    output: Arc<Mutex<Shared>>,
}

impl AudioSink for ManualSink {
    fn play(&mut self) -> Result<(), AudioError> {
        self.state.lock().playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.state.lock().playing = false;
        Ok(())
    }

    fn set_volume(&mut self, volume: f32) {
        self.state.lock().volume = volume;
    }

    fn played_bytes(&self) -> u64 {
        self.state.lock().played
    }

    fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn close(self: Box<Self>) -> Option<AudioFeed> {
        let mut output = self.output.lock();
        if output
            .current
            .as_ref()
            .map_or(false, |current| Arc::ptr_eq(current, &self.state))
        {
            output.current = None;
        }
        drop(output);

        let mut state = self.state.lock();
        state.playing = false;
        state.feed.take()
    }
}
