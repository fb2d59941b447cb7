//! # Audio Ring Buffer - Timestamped Sample Blocks
//!
//! Fixed number of fixed-size slots of interleaved stereo `f32`, each tagged
//! with the PTS of its first sample. The decode thread writes whole blocks
//! (blocking while full), the audio hardware callback reads on its own
//! schedule and never blocks. Reading publishes the audio clock anchor.
//!
//! ```text
//!            start                 end
//!              │                    │
//!   ┌────┬────┬▼───┬────┬────┬────┬▼───┬────┐
//!   │    │    │ B0 │ B1 │ B2 │ B3 │    │    │   full  ⇔ (end + 1) % count == start
//!   └────┴────┴────┴────┴────┴────┴────┴────┘   empty ⇔ end == start
//!              ▲ read_offset inside B0
//! ```
//!
//! One mutex guards all fields; two condition variables carry the two wake
//! conditions (`not_full` for the writer, `not_empty` for blocking readers).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::packet::{samples_to_us, Pts, NO_PTS};
use crate::sync::ClockAnchor;

/// One interleaved stereo frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct StereoSample {
    pub left: f32,
    pub right: f32,
}

/// Reinterpret interleaved `[L, R, L, R, ...]` as stereo frames.
/// A trailing odd sample is ignored.
pub fn as_stereo(samples: &[f32]) -> &[StereoSample] {
    bytemuck::cast_slice(&samples[..samples.len() & !1])
}

pub fn as_stereo_mut(samples: &mut [f32]) -> &mut [StereoSample] {
    let even = samples.len() & !1;
    bytemuck::cast_slice_mut(&mut samples[..even])
}

struct RingState {
    /// index of oldest element
    start: usize,
    /// index at which to write new element
    end: usize,
    /// frames of slot `start` already handed to the callback
    read_offset: usize,
    stopped: bool,
    /// set by the first read after a flush/reset
    live: bool,
    /// bumped by every flush/reset
    epoch: u64,
    data: Vec<StereoSample>,
    lens: Vec<usize>,
    pts: Vec<Pts>,
    anchor: ClockAnchor,
}

/// Ring buffer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub filled_slots: usize,
    pub capacity: usize,
    pub blocks_written: u64,
    pub stalled_writes: u64,
    pub underruns: u64,
}

/// Bounded single-producer/single-consumer channel of audio blocks
pub struct AudioRingBuffer {
    count: usize,
    slot_frames: usize,
    sample_rate: u32,
    stall_threshold: Duration,

    state: Mutex<RingState>,
    not_full: Condvar,
    not_empty: Condvar,

    blocks_written: AtomicU64,
    stalled_writes: AtomicU64,
    underruns: AtomicU64,
}

impl AudioRingBuffer {
    /// `count` slots of `slot_frames` stereo frames each. One slot is always
    /// kept free to tell full from empty, so `count` is raised to at least 2.
    pub fn new(count: usize, slot_frames: usize, sample_rate: u32) -> Self {
        let count = count.max(2);
        let slot_frames = slot_frames.max(1);
        Self {
            count,
            slot_frames,
            sample_rate,
            stall_threshold: Duration::from_millis(500),
            state: Mutex::new(RingState {
                start: 0,
                end: 0,
                read_offset: 0,
                stopped: false,
                live: false,
                epoch: 0,
                data: vec![StereoSample::default(); count * slot_frames],
                lens: vec![0; count],
                pts: vec![NO_PTS; count],
                anchor: ClockAnchor::unset(),
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            blocks_written: AtomicU64::new(0),
            stalled_writes: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    /// How long a write may wait on a full buffer before it counts as stalled
    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold.max(Duration::from_millis(1));
        self
    }

    pub fn slot_frames(&self) -> usize {
        self.slot_frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Usable slots
    pub fn capacity(&self) -> usize {
        self.count - 1
    }

    fn is_full(&self, state: &RingState) -> bool {
        (state.end + 1) % self.count == state.start
    }

    fn is_empty(state: &RingState) -> bool {
        state.end == state.start
    }

    // ========================================================================
    // Writer (decode thread)
    // ========================================================================

    /// Write one block of interleaved stereo samples tagged with `pts`.
    /// Samples past `slot_frames` frames are ignored; callers split blocks.
    /// Blocks while full. Returns false if the buffer is (or becomes) stopped.
    /// A block still waiting when the buffer is flushed or reset is dropped.
    pub fn write(&self, samples: &[f32], pts: Pts) -> bool {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        self.write_locked(&mut state, samples, pts, epoch)
    }

    /// Like [`write`](Self::write), but the block only lands if no flush or
    /// reset happened since `epoch` was read with [`epoch`](Self::epoch).
    /// A stale block is dropped and the call still returns true.
    pub fn write_in_epoch(&self, samples: &[f32], pts: Pts, epoch: u64) -> bool {
        let mut state = self.state.lock();
        self.write_locked(&mut state, samples, pts, epoch)
    }

    fn write_locked(&self, state: &mut MutexGuard<'_, RingState>, samples: &[f32], pts: Pts, epoch: u64) -> bool {
        let frames = as_stereo(samples);

        let mut stalled = false;
        while self.is_full(state) && !state.stopped {
            let timed_out = self.not_full.wait_for(state, self.stall_threshold).timed_out();
            if timed_out && self.is_full(state) && !state.stopped && !stalled {
                stalled = true;
                self.stalled_writes.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Audio ring buffer full for {:?}, output callback may have stalled",
                    self.stall_threshold
                );
            }
        }
        if state.stopped {
            return false;
        }
        if state.epoch != epoch {
            tracing::trace!("Dropping audio block at {} from before a flush", pts);
            return true;
        }

        let n = frames.len().min(self.slot_frames);
        let slot = state.end;
        let base = slot * self.slot_frames;
        state.data[base..base + n].copy_from_slice(&frames[..n]);
        state.lens[slot] = n;
        state.pts[slot] = pts;
        state.end = (slot + 1) % self.count;

        self.blocks_written.fetch_add(1, Ordering::Relaxed);
        self.not_empty.notify_one();
        true
    }

    // ========================================================================
    // Reader (audio hardware callback)
    // ========================================================================

    /// Fill `out` (interleaved stereo) from the oldest blocks. Never blocks on
    /// data: whatever cannot be filled is silence. Returns frames copied.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let mut state = self.state.lock();
        let copied = self.read_locked(&mut state, out);
        if copied == 0 {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        copied
    }

    /// Blocking read variant: waits up to `timeout` for data to arrive.
    pub fn read_timeout(&self, out: &mut [f32], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while Self::is_empty(&state) && !state.stopped {
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        self.read_locked(&mut state, out)
    }

    fn read_locked(&self, state: &mut RingState, out: &mut [f32]) -> usize {
        let out_frames = as_stereo_mut(out);
        let wanted = out_frames.len();
        let mut filled = 0;
        let mut freed = false;

        if !state.stopped {
            while filled < wanted && !Self::is_empty(state) {
                let slot = state.start;
                let len = state.lens[slot];
                let offset = state.read_offset;

                if filled == 0 && state.pts[slot] != NO_PTS {
                    let pts = state.pts[slot] + samples_to_us(offset, self.sample_rate);
                    state.anchor = ClockAnchor::new(pts, Instant::now());
                    state.live = true;
                }

                let n = (len - offset).min(wanted - filled);
                let base = slot * self.slot_frames + offset;
                out_frames[filled..filled + n].copy_from_slice(&state.data[base..base + n]);
                filled += n;
                state.read_offset += n;

                if state.read_offset >= len {
                    state.start = (slot + 1) % self.count;
                    state.read_offset = 0;
                    freed = true;
                }
            }
        }

        out_frames[filled..].fill(StereoSample::default());
        if out.len() % 2 == 1 {
            if let Some(last) = out.last_mut() {
                *last = 0.0;
            }
        }

        if freed {
            self.not_full.notify_one();
        }
        filled
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Drop every block. The clock anchor is left as it was.
    /// Also re-arms a stopped buffer.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        Self::clear(&mut state);
        state.stopped = false;
        self.not_full.notify_all();
    }

    /// Drop every block and seed the clock at `pts` (after a seek)
    pub fn flush(&self, pts: Pts) {
        let mut state = self.state.lock();
        Self::clear(&mut state);
        state.anchor = ClockAnchor::new(pts, Instant::now());
        self.not_full.notify_all();
    }

    fn clear(state: &mut RingState) {
        state.start = 0;
        state.end = 0;
        state.read_offset = 0;
        state.live = false;
        state.epoch = state.epoch.wrapping_add(1);
    }

    /// Wake every waiter; writes fail until `start`/`reset`
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn start(&self) {
        self.state.lock().stopped = false;
    }

    // ========================================================================
    // Status API
    // ========================================================================

    /// Atomic snapshot of the clock anchor
    pub fn current_pts(&self) -> ClockAnchor {
        self.state.lock().anchor
    }

    /// Counter bumped by every flush/reset, for [`write_in_epoch`](Self::write_in_epoch)
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// True once a block has been played since the last flush/reset
    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }

    /// Number of filled slots
    pub fn count(&self) -> usize {
        let state = self.state.lock();
        (state.end + self.count - state.start) % self.count
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            filled_slots: self.count(),
            capacity: self.capacity(),
            blocks_written: self.blocks_written.load(Ordering::Relaxed),
            stalled_writes: self.stalled_writes.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn block(value: f32, frames: usize) -> Vec<f32> {
        vec![value; frames * 2]
    }

    #[test]
    fn test_full_and_empty_invariants() {
        let rb = AudioRingBuffer::new(4, 8, 48_000);
        assert_eq!(rb.count(), 0);
        assert_eq!(rb.capacity(), 3);

        for i in 0..3 {
            assert!(rb.write(&block(i as f32, 8), i * 1000));
        }
        assert_eq!(rb.count(), 3);
        {
            let state = rb.state.lock();
            assert!(rb.is_full(&state));
        }

        let mut out = vec![0.0; 16];
        assert_eq!(rb.read(&mut out), 8);
        assert_eq!(rb.count(), 2);
    }

    #[test]
    fn test_no_block_overwritten_before_read() {
        let rb = Arc::new(AudioRingBuffer::new(3, 4, 48_000));
        let writer = {
            let rb = rb.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    assert!(rb.write(&block(i as f32, 4), i as i64 * 100));
                }
            })
        };

        let mut seen = Vec::new();
        let mut out = vec![0.0; 8];
        while seen.len() < 50 {
            if rb.read_timeout(&mut out, Duration::from_millis(200)) == 4 {
                seen.push(out[0] as i32);
            }
        }
        writer.join().unwrap();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_partial_reads_consume_slot_once() {
        let rb = AudioRingBuffer::new(4, 4, 1000);
        rb.write(&[1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0], 10_000);

        let mut out = vec![0.0; 4];
        assert_eq!(rb.read(&mut out), 2);
        assert_eq!(out, vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(rb.count(), 1);
        // Anchor at block start
        assert_eq!(rb.current_pts().pts, 10_000);

        assert_eq!(rb.read(&mut out), 2);
        assert_eq!(out, vec![3.0, 3.0, 4.0, 4.0]);
        assert_eq!(rb.count(), 0);
        // Two frames into the block at 1 kHz = 2 ms
        assert_eq!(rb.current_pts().pts, 12_000);
    }

    #[test]
    fn test_empty_read_is_silence() {
        let rb = AudioRingBuffer::new(4, 4, 48_000);
        let mut out = vec![9.0; 8];
        assert_eq!(rb.read(&mut out), 0);
        assert!(out.iter().all(|s| *s == 0.0));
        assert_eq!(rb.stats().underruns, 1);
        assert!(!rb.is_live());
    }

    #[test]
    fn test_stop_unblocks_writer() {
        let rb = Arc::new(AudioRingBuffer::new(2, 4, 48_000));
        assert!(rb.write(&block(1.0, 4), 0));

        let writer = {
            let rb = rb.clone();
            thread::spawn(move || rb.write(&block(2.0, 4), 100))
        };
        thread::sleep(Duration::from_millis(50));
        rb.stop();
        assert!(!writer.join().unwrap());

        rb.start();
        assert_eq!(rb.count(), 1);
    }

    #[test]
    fn test_stop_unblocks_blocking_reader() {
        let rb = Arc::new(AudioRingBuffer::new(4, 4, 48_000));
        let reader = {
            let rb = rb.clone();
            thread::spawn(move || {
                let mut out = vec![0.0; 8];
                rb.read_timeout(&mut out, Duration::from_secs(10))
            })
        };
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        rb.stop();
        assert_eq!(reader.join().unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_writer_wakes_blocking_reader() {
        let rb = Arc::new(AudioRingBuffer::new(2, 4, 48_000));
        let reader = {
            let rb = rb.clone();
            thread::spawn(move || {
                let mut out = vec![0.0; 8];
                rb.read_timeout(&mut out, Duration::from_secs(10))
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(rb.write(&block(0.5, 4), 0));
        assert_eq!(reader.join().unwrap(), 4);
    }

    #[test]
    fn test_flush_seeds_anchor_and_reset_keeps_it() {
        let rb = AudioRingBuffer::new(4, 4, 48_000);
        rb.write(&block(1.0, 4), 1000);
        let mut out = vec![0.0; 8];
        rb.read(&mut out);
        assert!(rb.is_live());

        rb.write(&block(1.0, 4), 2000);
        rb.flush(5_000_000);
        assert_eq!(rb.count(), 0);
        assert_eq!(rb.current_pts().pts, 5_000_000);
        assert!(!rb.is_live());

        // Flushing an empty buffer again is harmless
        rb.flush(5_000_000);
        assert_eq!(rb.current_pts().pts, 5_000_000);

        rb.write(&block(1.0, 4), 6_000_000);
        rb.reset();
        assert_eq!(rb.count(), 0);
        assert_eq!(rb.current_pts().pts, 5_000_000);
    }

    #[test]
    fn test_write_waiting_across_flush_is_dropped() {
        let rb = Arc::new(AudioRingBuffer::new(2, 4, 48_000));
        assert!(rb.write(&block(1.0, 4), 0));

        let writer = {
            let rb = rb.clone();
            thread::spawn(move || rb.write(&block(2.0, 4), 100))
        };
        thread::sleep(Duration::from_millis(50));
        rb.flush(1_000_000);
        assert!(writer.join().unwrap());
        assert_eq!(rb.count(), 0);
    }

    #[test]
    fn test_write_from_older_epoch_is_dropped() {
        let rb = AudioRingBuffer::new(4, 4, 1000);
        let before = rb.epoch();

        // Flush lands between the writer's check and its write
        rb.flush(100_000_000);
        assert!(rb.write_in_epoch(&block(1.0, 4), 0, before));
        assert_eq!(rb.count(), 0);

        let mut out = vec![0.0; 8];
        rb.read(&mut out);
        assert_eq!(rb.current_pts().pts, 100_000_000);

        assert!(rb.write_in_epoch(&block(2.0, 4), 100_000_000, rb.epoch()));
        assert_eq!(rb.count(), 1);
        rb.reset();
        assert!(rb.write_in_epoch(&block(3.0, 4), 0, before + 1));
        assert_eq!(rb.count(), 0);
    }

    #[test]
    fn test_stalled_write_is_counted() {
        let rb = Arc::new(
            AudioRingBuffer::new(2, 4, 48_000).with_stall_threshold(Duration::from_millis(10)),
        );
        rb.write(&block(1.0, 4), 0);

        let writer = {
            let rb = rb.clone();
            thread::spawn(move || rb.write(&block(2.0, 4), 100))
        };
        thread::sleep(Duration::from_millis(60));
        let mut out = vec![0.0; 8];
        rb.read(&mut out);
        assert!(writer.join().unwrap());
        assert_eq!(rb.stats().stalled_writes, 1);
    }

    #[test]
    fn test_clock_monotonic_without_flush() {
        let rb = Arc::new(AudioRingBuffer::new(8, 16, 48_000));
        let writer = {
            let rb = rb.clone();
            thread::spawn(move || {
                for i in 0..40i64 {
                    rb.write(&block(0.0, 16), i * samples_to_us(16, 48_000));
                }
            })
        };

        let mut last = NO_PTS;
        let mut out = vec![0.0; 10];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            rb.read_timeout(&mut out, Duration::from_millis(20));
            let pts = rb.current_pts().pts;
            assert!(pts >= last, "clock went backwards: {} < {}", pts, last);
            last = pts;
            if writer.is_finished() && rb.count() == 0 {
                break;
            }
        }
        writer.join().unwrap();
    }
}
