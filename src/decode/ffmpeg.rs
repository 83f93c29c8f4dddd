//! FFmpeg-backed media source.
//! All FFmpeg handles are confined to this module.
//! Video decodes to RGBA8, audio to interleaved s16 stereo at the stream's rate.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use ffmpeg_next as ffmpeg;
use ffmpeg::format::{context::Input, Pixel, Sample};
use ffmpeg::software::{resampling, scaling};
use ffmpeg::{codec, decoder, frame, media, ChannelLayout, Rational};
use tracing::{debug, trace};

use crate::core::time::{self, STEREO_S16_FRAME_BYTES};
use crate::decode::decoder::{DecodeError, Decoded, MediaSource, Packet, StreamKind};
use crate::decode::frame::{AudioFrame, VideoFrame};
use crate::decode::stream_info::{AudioStreamInfo, StreamInfo, VideoStreamInfo};

const AV_TIME_BASE: i32 = ffmpeg::ffi::AV_TIME_BASE as i32;

fn backend(e: ffmpeg::Error) -> DecodeError {
    DecodeError::Backend(e.to_string())
}

fn is_again(e: &ffmpeg::Error) -> bool {
    matches!(e, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
}

enum StreamDecoder {
    Video {
        decoder: decoder::Video,
        scaler: scaling::Context,
        time_base: Rational,
        frame_duration: Duration,
    },
    Audio {
        decoder: decoder::Audio,
        resampler: resampling::Context,
        time_base: Rational,
        bytes_per_second: u64,
    },
}

/// Work queued for the next frame read
enum Pending {
    Packet(ffmpeg::Packet),
    // the demuxer is exhausted; pull frames the decoder still holds
    Drain(usize),
}

impl Pending {
    fn stream(&self) -> usize {
        match self {
            Pending::Packet(packet) => packet.stream(),
            Pending::Drain(index) => *index,
        }
    }
}

/// End-of-input bookkeeping: which decoders still hold frames after the
/// demuxer ran dry. Streams are drained in index order.
#[derive(Debug, Default)]
struct DecoderDrain {
    streams: BTreeMap<usize, bool>, // index -> drained
}

impl DecoderDrain {
    fn is_started(&self) -> bool {
        !self.streams.is_empty()
    }

    fn start(&mut self, streams: impl IntoIterator<Item = usize>) {
        self.streams = streams.into_iter().map(|index| (index, false)).collect();
    }

    fn next(&self) -> Option<usize> {
        self.streams
            .iter()
            .find(|(_, drained)| !**drained)
            .map(|(index, _)| *index)
    }

    fn finish(&mut self, index: usize) {
        if let Some(drained) = self.streams.get_mut(&index) {
            *drained = true;
        }
    }

    fn remove(&mut self, index: usize) {
        self.streams.remove(&index);
    }

    fn clear(&mut self) {
        self.streams.clear();
    }
}

/// Container opened with libavformat
pub struct FfmpegSource {
    input: Option<Input>,
    live: bool,
    video: Vec<VideoStreamInfo>,
    audio: Vec<AudioStreamInfo>,
    decoding: bool,
    streams: HashMap<usize, StreamDecoder>,
    pending: Option<Pending>,
    drain: DecoderDrain,
    // frames ending before the last seek target are skipped, per stream
    seek_floor: HashMap<usize, Duration>,
    last_seek: Option<Duration>,
}

// SAFETY: the format, codec, scaler and resampler contexts are owned by this
// struct alone and only touched through `&mut self`, so moving the source to
// another thread never leaves an alias behind.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    /// Open a media file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        ffmpeg::init().map_err(backend)?;
        let input = ffmpeg::format::input(&path.as_ref()).map_err(backend)?;
        Self::from_input(input, false)
    }

    /// Open a network stream. Durations are reported as zero and rewinding
    /// is refused.
    pub fn open_live(url: &str) -> Result<Self, DecodeError> {
        ffmpeg::init().map_err(backend)?;
        ffmpeg::format::network::init();
        let input = ffmpeg::format::input(&url).map_err(backend)?;
        Self::from_input(input, true)
    }

    fn from_input(input: Input, live: bool) -> Result<Self, DecodeError> {
        let container_duration = if input.duration() > 0 {
            time::from_timebase(input.duration(), 1, AV_TIME_BASE)
        } else {
            Duration::ZERO
        };

        let mut video = Vec::new();
        let mut audio = Vec::new();
        for stream in input.streams() {
            let parameters = stream.parameters();
            let medium = parameters.medium();
            let codec_name = parameters.id().name().to_string();
            let time_base = stream.time_base();
            let duration = if live {
                Duration::ZERO
            } else if stream.duration() > 0 {
                time::from_timebase(
                    stream.duration(),
                    time_base.numerator(),
                    time_base.denominator(),
                )
            } else {
                container_duration
            };
            let stream_info = StreamInfo {
                index: stream.index(),
                duration,
                codec_name,
            };

            match medium {
                media::Type::Video => {
                    let context = codec::context::Context::from_parameters(parameters)
                        .map_err(backend)?;
                    let decoder = context.decoder().video().map_err(backend)?;
                    let mut rate = stream.avg_frame_rate();
                    if rate.numerator() <= 0 || rate.denominator() <= 0 {
                        rate = stream.rate();
                    }
                    video.push(VideoStreamInfo {
                        stream_info,
                        width: decoder.width(),
                        height: decoder.height(),
                        frame_rate: (
                            rate.numerator().max(0) as u32,
                            rate.denominator().max(0) as u32,
                        ),
                    });
                }
                media::Type::Audio => {
                    let context = codec::context::Context::from_parameters(parameters)
                        .map_err(backend)?;
                    let decoder = context.decoder().audio().map_err(backend)?;
                    audio.push(AudioStreamInfo {
                        stream_info,
                        sample_rate: decoder.rate(),
                        channels: decoder.channels() as u32,
                    });
                }
                _ => {}
            }
        }

        debug!(
            video_streams = video.len(),
            audio_streams = audio.len(),
            live,
            "media opened"
        );
        Ok(Self {
            input: Some(input),
            live,
            video,
            audio,
            decoding: false,
            streams: HashMap::new(),
            pending: None,
            drain: DecoderDrain::default(),
            seek_floor: HashMap::new(),
            last_seek: None,
        })
    }

    fn input(&mut self) -> Result<&mut Input, DecodeError> {
        self.input
            .as_mut()
            .ok_or_else(|| DecodeError::Backend("source closed".to_string()))
    }

    fn open_decoder(&mut self, index: usize) -> Result<StreamDecoder, DecodeError> {
        let input = self.input()?;
        let stream = input
            .stream(index)
            .ok_or(DecodeError::InvalidStreamIndex(index))?;
        let time_base = stream.time_base();
        let context =
            codec::context::Context::from_parameters(stream.parameters()).map_err(backend)?;

        if let Some(info) = self.video.iter().find(|info| info.index() == index) {
            let decoder = context.decoder().video().map_err(backend)?;
            let scaler = scaling::Context::get(
                decoder.format(),
                decoder.width(),
                decoder.height(),
                Pixel::RGBA,
                decoder.width(),
                decoder.height(),
                scaling::Flags::BILINEAR,
            )
            .map_err(backend)?;
            return Ok(StreamDecoder::Video {
                decoder,
                scaler,
                time_base,
                frame_duration: info.frame_duration().unwrap_or_default(),
            });
        }
        if let Some(info) = self.audio.iter().find(|info| info.index() == index) {
            let decoder = context.decoder().audio().map_err(backend)?;
            let resampler = resampling::Context::get(
                decoder.format(),
                decoder.channel_layout(),
                decoder.rate(),
                Sample::I16(ffmpeg::format::sample::Type::Packed),
                ChannelLayout::STEREO,
                decoder.rate(),
            )
            .map_err(backend)?;
            return Ok(StreamDecoder::Audio {
                decoder,
                resampler,
                time_base,
                bytes_per_second: info.bytes_per_second(),
            });
        }
        Err(DecodeError::InvalidStreamIndex(index))
    }

    fn take_pending(&mut self, index: usize) -> Result<Option<Pending>, DecodeError> {
        if !self.decoding {
            return Err(DecodeError::NotOpen);
        }
        if !self.streams.contains_key(&index) {
            return Err(DecodeError::StreamNotOpen(index));
        }
        Ok(match self.pending.take() {
            Some(pending) if pending.stream() == index => Some(pending),
            other => {
                self.pending = other;
                None
            }
        })
    }

    /// Frames wholly before the last seek target are dropped
    fn past_floor(&mut self, index: usize, end: Duration) -> bool {
        match self.seek_floor.get(&index) {
            Some(floor) if end <= *floor => false,
            Some(_) => {
                self.seek_floor.remove(&index);
                true
            }
            None => true,
        }
    }

    /// Signal end of input to every open decoder once, then hand out one
    /// drain slot per stream until each decoder reports it is empty.
    fn next_drain(&mut self) -> Result<Option<Packet>, DecodeError> {
        if !self.drain.is_started() {
            for decoder in self.streams.values_mut() {
                let sent = match decoder {
                    StreamDecoder::Video { decoder, .. } => decoder.send_eof(),
                    StreamDecoder::Audio { decoder, .. } => decoder.send_eof(),
                };
                sent.map_err(backend)?;
            }
            self.drain.start(self.streams.keys().copied());
            trace!(streams = self.streams.len(), "draining decoders");
        }

        let Some(index) = self.drain.next() else {
            return Ok(None);
        };
        let kind = match self.streams.get(&index) {
            Some(StreamDecoder::Video { .. }) => StreamKind::Video,
            Some(StreamDecoder::Audio { .. }) => StreamKind::Audio,
            None => StreamKind::Other,
        };
        self.pending = Some(Pending::Drain(index));
        Ok(Some(Packet {
            stream_index: index,
            kind,
        }))
    }
}

/// RGBA rows without the stride padding
fn extract_rgba(frame: &frame::Video) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let data = frame.data(0);
    let stride = frame.stride(0);

    let mut rgba = Vec::with_capacity(width * height * 4);
    for y in 0..height {
        let start = y * stride;
        rgba.extend_from_slice(&data[start..start + width * 4]);
    }
    rgba
}

impl MediaSource for FfmpegSource {
    fn video_streams(&self) -> Vec<VideoStreamInfo> {
        self.video.clone()
    }

    fn audio_streams(&self) -> Vec<AudioStreamInfo> {
        self.audio.clone()
    }

    fn open_decode(&mut self) -> Result<(), DecodeError> {
        self.input()?;
        self.decoding = true;
        Ok(())
    }

    fn close_decode(&mut self) -> Result<(), DecodeError> {
        self.decoding = false;
        self.streams.clear();
        self.pending = None;
        self.drain.clear();
        self.seek_floor.clear();
        Ok(())
    }

    fn open_stream(&mut self, index: usize) -> Result<(), DecodeError> {
        if !self.decoding {
            return Err(DecodeError::NotOpen);
        }
        if self.streams.contains_key(&index) {
            return Ok(());
        }
        let decoder = self.open_decoder(index)?;
        self.streams.insert(index, decoder);
        Ok(())
    }

    fn close_stream(&mut self, index: usize) -> Result<(), DecodeError> {
        self.streams.remove(&index);
        self.seek_floor.remove(&index);
        self.drain.remove(index);
        if matches!(&self.pending, Some(pending) if pending.stream() == index) {
            self.pending = None;
        }
        Ok(())
    }

    fn rewind(&mut self, index: usize, position: Duration) -> Result<(), DecodeError> {
        if self.live {
            return Err(DecodeError::SeekFailed("live stream".to_string()));
        }
        if !self.decoding {
            return Err(DecodeError::NotOpen);
        }
        if !self.streams.contains_key(&index) {
            return Err(DecodeError::StreamNotOpen(index));
        }

        // the container seeks every stream at once
        if self.last_seek != Some(position) {
            let target = time::to_timebase(position, 1, AV_TIME_BASE);
            self.input()?
                .seek(target, ..target)
                .map_err(|e| DecodeError::SeekFailed(e.to_string()))?;
            self.pending = None;
            self.drain.clear();
            self.last_seek = Some(position);
            for decoder in self.streams.values_mut() {
                match decoder {
                    StreamDecoder::Video { decoder, .. } => decoder.flush(),
                    StreamDecoder::Audio { decoder, .. } => decoder.flush(),
                }
            }
        }

        if position.is_zero() {
            self.seek_floor.remove(&index);
        } else {
            self.seek_floor.insert(index, position);
        }
        trace!(stream = index, ?position, "rewound");
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, DecodeError> {
        if !self.decoding {
            return Err(DecodeError::NotOpen);
        }
        // a drain slot nobody decoded means the caller dropped that stream
        if let Some(Pending::Drain(index)) = self.pending.take() {
            self.drain.finish(index);
        }
        let live = self.live;
        let input = self.input()?;
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                self.last_seek = None;
                return self.next_drain();
            }
            Err(e) if live && is_again(&e) => return Ok(None),
            Err(e) => return Err(DecodeError::Read(e.to_string())),
        }

        let index = packet.stream();
        let kind = match self.streams.get(&index) {
            Some(StreamDecoder::Video { .. }) => StreamKind::Video,
            Some(StreamDecoder::Audio { .. }) => StreamKind::Audio,
            None if self.video.iter().any(|info| info.index() == index) => StreamKind::Video,
            None if self.audio.iter().any(|info| info.index() == index) => StreamKind::Audio,
            None => StreamKind::Other,
        };
        self.last_seek = None;
        self.pending = Some(Pending::Packet(packet));
        Ok(Some(Packet {
            stream_index: index,
            kind,
        }))
    }

    fn read_video_frame(&mut self, index: usize) -> Result<Decoded<VideoFrame>, DecodeError> {
        let Some(pending) = self.take_pending(index)? else {
            return Ok(Decoded::Empty);
        };
        let Some(StreamDecoder::Video {
            decoder,
            scaler,
            time_base,
            frame_duration,
        }) = self.streams.get_mut(&index)
        else {
            return Err(DecodeError::StreamNotOpen(index));
        };

        if let Pending::Packet(packet) = &pending {
            decoder.send_packet(packet).map_err(backend)?;
        }
        let mut decoded = frame::Video::empty();
        match decoder.receive_frame(&mut decoded) {
            Ok(()) => {}
            Err(e) if is_again(&e) => return Ok(Decoded::Skipped),
            Err(ffmpeg::Error::Eof) => {
                self.drain.finish(index);
                return Ok(Decoded::Skipped);
            }
            Err(e) => return Err(backend(e)),
        }

        let pts = decoded.timestamp().ok_or(DecodeError::MissingTimestamp)?;
        let offset = time::from_timebase(pts, time_base.numerator(), time_base.denominator());
        let end = offset + *frame_duration;

        let mut rgba = frame::Video::empty();
        scaler.run(&decoded, &mut rgba).map_err(backend)?;
        let data = extract_rgba(&rgba);
        let (width, height) = (rgba.width(), rgba.height());

        if !self.past_floor(index, end) {
            return Ok(Decoded::Skipped);
        }
        Ok(Decoded::Frame(VideoFrame::new(data, width, height, offset)))
    }

    fn read_audio_frame(&mut self, index: usize) -> Result<Decoded<AudioFrame>, DecodeError> {
        let Some(pending) = self.take_pending(index)? else {
            return Ok(Decoded::Empty);
        };
        let Some(StreamDecoder::Audio {
            decoder,
            resampler,
            time_base,
            bytes_per_second,
        }) = self.streams.get_mut(&index)
        else {
            return Err(DecodeError::StreamNotOpen(index));
        };

        if let Pending::Packet(packet) = &pending {
            decoder.send_packet(packet).map_err(backend)?;
        }
        let mut decoded = frame::Audio::empty();
        match decoder.receive_frame(&mut decoded) {
            Ok(()) => {}
            Err(e) if is_again(&e) => return Ok(Decoded::Skipped),
            Err(ffmpeg::Error::Eof) => {
                self.drain.finish(index);
                return Ok(Decoded::Skipped);
            }
            Err(e) => return Err(backend(e)),
        }

        let pts = decoded.timestamp().ok_or(DecodeError::MissingTimestamp)?;
        let offset = time::from_timebase(pts, time_base.numerator(), time_base.denominator());

        let mut resampled = frame::Audio::empty();
        resampler.run(&decoded, &mut resampled).map_err(backend)?;
        let len = resampled.samples() * STEREO_S16_FRAME_BYTES;
        let data = resampled.data(0)[..len].to_vec();
        let end = offset + time::bytes_to_duration(len as u64, *bytes_per_second);

        if !self.past_floor(index, end) {
            return Ok(Decoded::Skipped);
        }
        Ok(Decoded::Frame(AudioFrame { data, offset }))
    }

    fn close(&mut self) {
        self.streams.clear();
        self.pending = None;
        self.drain.clear();
        self.decoding = false;
        self.input = None;
        debug!("media closed");
    }
}
