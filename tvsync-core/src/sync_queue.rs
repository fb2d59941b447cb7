//! # Sync Queue - Blocking FIFO Between Pipeline Stages
//!
//! Strict FIFO hand-off used between the demuxer-facing `push_packet` calls
//! and the per-stream decode workers.
//!
//! ```text
//! ┌──────────┐  push   ┌───────────┐  pop (blocks)  ┌──────────────┐
//! │ Renderer │────────►│ SyncQueue │───────────────►│ Decode Thread│
//! └──────────┘         └───────────┘                └──────────────┘
//!                            │ flush / stop
//!                      ┌─────┴─────┐
//!                      │  release  │
//!                      └───────────┘
//! ```
//!
//! One mutex guards every field. `pop` waits on a condition variable that is
//! signalled by `push` (one waiter) and by `stop` (all waiters).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::packet::{Pts, NO_PTS};

/// Per-element hook run for every item drained by `flush`/`stop`
pub type ReleaseHook<T> = Box<dyn Fn(T) + Send + Sync>;

/// Result of a bounded pop
#[derive(Debug, PartialEq, Eq)]
pub enum PopResult<T> {
    Item(T),
    Stopped,
    TimedOut,
}

struct QueueState<T> {
    items: VecDeque<T>,
    stopped: bool,
    flush_pts: Pts,
}

/// Thread-safe FIFO with blocking pop and stop/start lifecycle
pub struct SyncQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    release: Option<ReleaseHook<T>>,
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                stopped: false,
                flush_pts: NO_PTS,
            }),
            not_empty: Condvar::new(),
            release: None,
        }
    }

    /// Create a queue that hands drained items to `hook` instead of dropping them
    pub fn with_release(hook: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(hook)),
            ..Self::new()
        }
    }

    // ========================================================================
    // Producer API
    // ========================================================================

    /// Append an item. Returns false (and gives the item back) once stopped.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(item);
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    // ========================================================================
    // Consumer API
    // ========================================================================

    /// Block until an item is available or the queue is stopped.
    /// Returns `None` on stop.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return None;
            }
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> PopResult<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return PopResult::Stopped;
            }
            if let Some(item) = state.items.pop_front() {
                return PopResult::Item(item);
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                // A push or stop may have raced the timeout
                if state.stopped {
                    return PopResult::Stopped;
                }
                return match state.items.pop_front() {
                    Some(item) => PopResult::Item(item),
                    None => PopResult::TimedOut,
                };
            }
        }
    }

    /// Non-blocking peek at the oldest item
    pub fn front(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.lock().items.front().cloned()
    }

    // ========================================================================
    // Control API
    // ========================================================================

    /// Drain every pending item through the release hook.
    /// `Some(pts)` also records the flush watermark.
    pub fn flush(&self, pts: Option<Pts>) {
        let drained: Vec<T> = {
            let mut state = self.state.lock();
            if let Some(pts) = pts {
                state.flush_pts = pts;
            }
            let drained = state.items.drain(..).collect();
            self.not_empty.notify_all();
            drained
        };
        self.release_all(drained);
    }

    /// Mark stopped, wake every waiter and drain
    pub fn stop(&self) {
        let drained: Vec<T> = {
            let mut state = self.state.lock();
            state.stopped = true;
            let drained = state.items.drain(..).collect();
            self.not_empty.notify_all();
            drained
        };
        self.release_all(drained);
    }

    /// Clear the stopped flag. Pending items are untouched.
    pub fn start(&self) {
        self.state.lock().stopped = false;
    }

    fn release_all(&self, drained: Vec<T>) {
        match &self.release {
            Some(hook) => drained.into_iter().for_each(|item| hook(item)),
            None => drop(drained),
        }
    }

    // ========================================================================
    // Status API
    // ========================================================================

    pub fn size(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Watermark recorded by the last `flush(Some(pts))`, [`NO_PTS`] if none
    pub fn flush_pts(&self) -> Pts {
        self.state.lock().flush_pts
    }
}

// ============================================================================
// Tests
// ============================================================================
