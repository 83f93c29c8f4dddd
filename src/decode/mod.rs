pub mod decoder;
pub mod frame;
pub mod stream_info;
pub mod synthetic;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use decoder::{next_video_frame, DecodeError, Decoded, MediaSource, Packet, StreamKind};
pub use frame::{AudioFrame, SharedFrame, VideoFrame};
pub use stream_info::{AudioStreamInfo, StreamInfo, VideoStreamInfo};
pub use synthetic::{SourceProbe, SyntheticSource};
#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;
