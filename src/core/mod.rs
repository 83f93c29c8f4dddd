//! Core helpers shared across the crate.
//!
//! Positions, presentation offsets and durations are `std::time::Duration`;
//! this module holds the conversions between them and frame rates,
//! container timebases and PCM byte counts.

pub mod time;

pub use time::{frame_duration, STEREO_S16_FRAME_BYTES};
