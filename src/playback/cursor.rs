//! Frame cursor: decides which decoded frame is current for a target position.
//!
//! The held frame is stale once `offset + frame_duration < target`; stale
//! frames are replaced by pulling from a supplier until the held frame covers
//! the target. After a loop rewind the supplier's offsets restart lower than
//! the held frame, so a pending-loop flag forces pulling until that drop is
//! actually observed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::decode::frame::{SharedFrame, VideoFrame};

/// Outcome of a catch-up pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUp {
    /// The held frame covers the target
    Caught,
    /// The supplier ran dry first
    Exhausted,
}

#[derive(Debug)]
pub struct FrameCursor {
    frame_duration: Duration,
    last: Option<SharedFrame>,
    pending_loop: bool,
}

impl FrameCursor {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            frame_duration,
            last: None,
            pending_loop: false,
        }
    }

    pub fn last(&self) -> Option<SharedFrame> {
        self.last.clone()
    }

    pub fn pending_loop(&self) -> bool {
        self.pending_loop
    }

    /// Expect the next frame to restart at a lower offset
    pub fn mark_loop(&mut self) {
        if self.last.is_some() {
            self.pending_loop = true;
        }
    }

    pub fn clear(&mut self) {
        self.last = None;
        self.pending_loop = false;
    }

    /// Hold `frame` unconditionally (after a seek)
    pub fn reset_to(&mut self, frame: VideoFrame) -> SharedFrame {
        let frame = Arc::new(frame);
        self.last = Some(Arc::clone(&frame));
        self.pending_loop = false;
        frame
    }

    fn is_stale(&self, target: Duration) -> bool {
        match &self.last {
            None => true,
            Some(_) if self.pending_loop => true,
            Some(frame) => frame.offset + self.frame_duration < target,
        }
    }

    /// Pull frames from `next` until the held frame covers `target`.
    pub fn catch_up<E, F>(&mut self, target: Duration, mut next: F) -> Result<CatchUp, E>
    where
        F: FnMut() -> Result<Option<VideoFrame>, E>,
    {
        while self.is_stale(target) {
            let Some(frame) = next()? else {
                return Ok(CatchUp::Exhausted);
            };
            self.advance(frame);
        }
        Ok(CatchUp::Caught)
    }

    fn advance(&mut self, frame: VideoFrame) {
        if let Some(previous) = &self.last {
            if frame.offset < previous.offset {
                if self.pending_loop {
                    debug!(offset = ?frame.offset, "loop discontinuity observed");
                    self.pending_loop = false;
                } else {
                    warn!(
                        previous = ?previous.offset,
                        offset = ?frame.offset,
                        "frame offset went backwards outside a loop"
                    );
                }
            }
        }
        self.last = Some(Arc::new(frame));
    }
}
