//! Pipeline configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Decoded pictures kept in the video texture pool
pub const SCREEN_POOL_SIZE: usize = 32;
/// Ring slots that must be filled before the audio callback starts draining
pub const AUDIO_POOL_SIZE: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Audio ring buffer slot count
    pub ring_slots: usize,
    /// Stereo frames per ring slot
    pub slot_frames: usize,
    /// Output sample rate (Hz)
    pub sample_rate: u32,
    pub screen_pool_size: usize,
    pub audio_pool_size: usize,
    /// A ring write blocked longer than this is reported as a stall
    pub stall_threshold_ms: u64,
    /// Stage loops re-check their state at least this often
    pub pop_timeout_ms: u64,
    /// Pictures held back by the hardware adapter for PTS reordering
    pub hw_reorder_depth: usize,
    /// Render ticks per second when the renderer drives itself
    pub refresh_hz: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_slots: 64,
            slot_frames: 1024,
            sample_rate: 48_000,
            screen_pool_size: SCREEN_POOL_SIZE,
            audio_pool_size: AUDIO_POOL_SIZE,
            stall_threshold_ms: 500,
            pop_timeout_ms: 250,
            hw_reorder_depth: 4,
            refresh_hz: 60.0,
        }
    }
}

impl PipelineConfig {
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms.max(1))
    }

    /// Priming threshold clamped to what the ring can actually hold
    pub fn priming_slots(&self) -> usize {
        self.audio_pool_size.min(self.ring_slots.max(2) - 1)
    }
}
