pub mod clock;
pub mod controller;
pub mod cursor;
pub mod error;
pub mod live;
pub mod state;
pub mod video_only;
pub mod with_audio;

pub use clock::{ManualClock, SystemClock, TimeSource};
pub use controller::{AudioCapability, Controller, CurrentFrame, PlaybackControl, SeekOutcome};
pub use error::{ConfigError, PlaybackError};
pub use live::LiveController;
pub use state::{PlaybackState, StopMode};
pub use video_only::VideoController;
pub use with_audio::AudioVideoController;
