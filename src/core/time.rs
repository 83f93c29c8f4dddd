//! Duration helpers shared by the decoders, the audio feed and the controllers.
//! Positions and presentation offsets are `std::time::Duration` throughout.

use std::time::Duration;

/// Time constants for conversions
pub mod constants {
    pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
}

/// Bytes in one interleaved s16 stereo sample frame
pub const STEREO_S16_FRAME_BYTES: usize = 4;

/// Duration of a single frame for a `num/den` frames-per-second ratio.
/// Returns `None` for a zero numerator or denominator.
pub fn frame_duration(num: u32, den: u32) -> Option<Duration> {
    if num == 0 || den == 0 {
        return None;
    }
    let nanos = constants::NANOS_PER_SECOND as u128 * den as u128 / num as u128;
    Some(Duration::from_nanos(nanos as u64))
}

/// Convert a timestamp expressed in a rational timebase to a duration.
/// Negative timestamps clamp to zero.
pub fn from_timebase(pts: i64, num: i32, den: i32) -> Duration {
    if den == 0 || pts <= 0 || num <= 0 {
        return Duration::ZERO;
    }
    // i128 to avoid overflow on long streams with fine timebases
    let nanos = pts as i128 * num as i128 * constants::NANOS_PER_SECOND as i128 / den as i128;
    Duration::from_nanos(nanos.clamp(0, u64::MAX as i128) as u64)
}

/// Reverse of [`from_timebase`]
pub fn to_timebase(position: Duration, num: i32, den: i32) -> i64 {
    if num <= 0 {
        return 0;
    }
    let ticks = position.as_nanos() as i128 * den as i128
        / (num as i128 * constants::NANOS_PER_SECOND as i128);
    ticks as i64
}

/// Playback duration of `bytes` of PCM at `bytes_per_second`
pub fn bytes_to_duration(bytes: u64, bytes_per_second: u64) -> Duration {
    if bytes_per_second == 0 {
        return Duration::ZERO;
    }
    let nanos = bytes as u128 * constants::NANOS_PER_SECOND as u128 / bytes_per_second as u128;
    Duration::from_nanos(nanos as u64)
}

/// Number of whole bytes covering `duration` at `bytes_per_second`
pub fn duration_to_bytes(duration: Duration, bytes_per_second: u64) -> u64 {
    (duration.as_nanos() * bytes_per_second as u128 / constants::NANOS_PER_SECOND as u128) as u64
}
