//! Reference clock and wall-clock sources.
//!
//! A [`ReferenceClock`] is a `(position, instant)` anchor. While playing, the
//! logical position at `now` is `position + (now - instant)`; otherwise it is
//! `position`. Rebasing moves the anchor without a jump in position.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

/// Source of wall-clock instants
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

/// `Instant::now()`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }

    /// Move the clock backwards, simulating a misbehaving time source
    pub fn rewind(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = elapsed.saturating_sub(by);
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }
}

/// Result of projecting the position against a finite duration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Inside `[0, duration)`
    Within(Duration),
    /// Wrapped past the end; the clock has been rebased to the wrapped position
    Looped(Duration),
    /// At or past the end without looping
    PastEnd,
}

/// `(position, instant)` anchor for position projection
#[derive(Debug, Clone, Copy)]
pub struct ReferenceClock {
    position: Duration,
    at: Instant,
}

impl ReferenceClock {
    pub fn new(now: Instant) -> Self {
        Self {
            position: Duration::ZERO,
            at: now,
        }
    }

    pub fn rebase(&mut self, position: Duration, now: Instant) {
        self.position = position;
        self.at = now;
    }

    /// Position stored at the last rebase
    pub fn reference_position(&self) -> Duration {
        self.position
    }

    /// Running position at `now`. A `now` earlier than the anchor is clamped
    /// to the anchor.
    pub fn position_at(&self, now: Instant) -> Duration {
        match now.checked_duration_since(self.at) {
            Some(elapsed) => self.position + elapsed,
            None => {
                warn!(
                    skew = ?self.at.duration_since(now),
                    "time source went backwards, clamping"
                );
                self.position
            }
        }
    }

    /// Running position at `now` checked against `duration`.
    pub fn project(&mut self, now: Instant, duration: Duration, looping: bool) -> Projection {
        let position = self.position_at(now);
        if position < duration {
            return Projection::Within(position);
        }
        if !looping || duration.is_zero() {
            return Projection::PastEnd;
        }

        let wrapped = Duration::from_nanos((position.as_nanos() % duration.as_nanos()) as u64);
        self.rebase(wrapped, now);
        Projection::Looped(wrapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_position() {
        let clock = ManualClock::new();
        let mut reference = ReferenceClock::new(clock.now());
        reference.rebase(Duration::from_secs(1), clock.now());

        clock.advance(Duration::from_millis(250));
        assert_eq!(
            reference.position_at(clock.now()),
            Duration::from_millis(1250)
        );
        assert_eq!(reference.reference_position(), Duration::from_secs(1));
    }

    #[test]
    fn test_skew_clamps_to_anchor() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(5));
        let reference = ReferenceClock::new(clock.now());

        clock.rewind(Duration::from_secs(1));
        assert_eq!(reference.position_at(clock.now()), Duration::ZERO);
    }

    #[test]
    fn test_projection_wraps_when_looping() {
        let clock = ManualClock::new();
        let mut reference = ReferenceClock::new(clock.now());
        clock.advance(Duration::from_millis(10_500));

        let duration = Duration::from_secs(10);
        assert_eq!(
            reference.project(clock.now(), duration, true),
            Projection::Looped(Duration::from_millis(500))
        );
        // rebased: no second wrap
        assert_eq!(
            reference.project(clock.now(), duration, true),
            Projection::Within(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_projection_past_end() {
        let clock = ManualClock::new();
        let mut reference = ReferenceClock::new(clock.now());
        clock.advance(Duration::from_secs(10));
        assert_eq!(
            reference.project(clock.now(), Duration::from_secs(10), false),
            Projection::PastEnd
        );
        assert_eq!(
            reference.project(clock.now(), Duration::ZERO, true),
            Projection::PastEnd
        );
    }
}
