//! Audio/Video Synchronization primitives
//!
//! Audio is the master clock. Its position is published as a
//! [`ClockAnchor`]: the PTS that was current at a given wall-clock instant.
//! Everyone else extrapolates from the anchor instead of asking the audio
//! thread directly.

use std::time::{Duration, Instant};

use crate::packet::{Pts, NO_PTS};

/// (PTS, wall-clock) pair describing where a clock was at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockAnchor {
    pub pts: Pts,
    pub time: Instant,
}

impl ClockAnchor {
    pub fn new(pts: Pts, time: Instant) -> Self {
        Self { pts, time }
    }

    /// Anchor with no PTS yet
    pub fn unset() -> Self {
        Self {
            pts: NO_PTS,
            time: Instant::now(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.pts != NO_PTS
    }

    /// `pts + (now - time)`, or [`NO_PTS`] when unset
    pub fn pts_at(&self, now: Instant) -> Pts {
        if !self.is_set() {
            return NO_PTS;
        }
        let elapsed = now.saturating_duration_since(self.time).as_micros() as i64;
        self.pts + elapsed
    }
}

/// Free-running video clock used until audio produces its first block
#[derive(Debug, Default)]
pub struct FreeRunClock {
    anchor: Option<ClockAnchor>,
}

impl FreeRunClock {
    pub fn new() -> Self {
        Self { anchor: None }
    }

    /// Start counting from `pts` unless already running
    pub fn seed(&mut self, pts: Pts, now: Instant) {
        if self.anchor.is_none() && pts != NO_PTS {
            self.anchor = Some(ClockAnchor::new(pts, now));
        }
    }

    pub fn target(&self, now: Instant) -> Option<Pts> {
        self.anchor.map(|a| a.pts_at(now))
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }
}

/// Frame timer for pacing the render tick
pub struct FrameTimer {
    target: Duration,
    last: Instant,
    count: u64,
    start: Instant,
}

impl FrameTimer {
    pub fn new(fps: f64) -> Self {
        let target = if fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::from_millis(16)
        };
        Self {
            target,
            last: Instant::now(),
            count: 0,
            start: Instant::now(),
        }
    }

    pub fn wait(&mut self) {
        let elapsed = self.last.elapsed();
        if elapsed < self.target {
            std::thread::sleep(self.target - elapsed);
        }
        self.last = Instant::now();
        self.count += 1;
    }

    pub fn fps(&self) -> f64 {
        let secs = self.start.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.count as f64 / secs
        } else {
            0.0
        }
    }
}
