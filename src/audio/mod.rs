pub mod feed;
pub mod manual;
#[cfg(feature = "cpal")]
pub mod player;
pub mod sink;

pub use feed::{AudioFeed, FeedError, FeedEvent, PartialReadPolicy, Pull};
pub use manual::ManualOutput;
#[cfg(feature = "cpal")]
pub use player::CpalOutput;
pub use sink::{AudioError, AudioOutput, AudioSink, SinkRejected};
