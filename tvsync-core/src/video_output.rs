//! # Video Output Stage
//!
//! Packet queue → decode thread → [`TexturePool`] → render tick.
//!
//! The render tick asks [`VideoOutput::update_with_pts`] which picture belongs
//! on screen at a given clock value. It never waits for the decoder: if
//! nothing suitable is decoded yet the current picture is held.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::PipelineConfig;
use crate::decode::{Decoder, VideoFrame};
use crate::packet::{CodecParams, Packet, Pts, NO_PTS};
use crate::stage::{OutputError, StageEvent, StageKind};
use crate::sync_queue::{PopResult, SyncQueue};
use crate::texture::{PoolStats, PtsTexture, TextureKind, TexturePool};

/// Result of one render-tick query
#[derive(Debug, Clone)]
pub struct VideoUpdate {
    /// PTS of the picture that should be on screen, [`NO_PTS`] if none yet
    pub pts: Pts,
    /// The picture changed since the previous query
    pub updated: bool,
    /// The chosen picture was more than one frame interval behind target
    pub late: bool,
    /// Snapshot of the new picture when `updated`
    pub texture: Option<PtsTexture>,
}

impl VideoUpdate {
    fn hold(pts: Pts) -> Self {
        Self {
            pts,
            updated: false,
            late: false,
            texture: None,
        }
    }
}

struct PoolState {
    pool: TexturePool,
    /// PTS of the picture last handed to the renderer
    displayed: Pts,
    stopped: bool,
}

struct VideoShared {
    queue: SyncQueue<Packet>,
    pool: Mutex<PoolState>,
    /// Signalled whenever the pool gains free space
    space: Condvar,
    frame_interval: i64,
    decoded_packets: AtomicU64,
    late_frames: AtomicU64,
    last_decoded_pts: AtomicI64,
    generation: AtomicU64,
}

pub struct VideoOutput {
    shared: Arc<VideoShared>,
    events: Receiver<StageEvent>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl VideoOutput {
    /// Open `decoder` and start the decode thread
    pub fn new<D>(config: &PipelineConfig, mut decoder: D, params: &CodecParams) -> Result<Self, OutputError>
    where
        D: Decoder<Frame = VideoFrame> + 'static,
    {
        decoder.open(params).map_err(|source| OutputError::Open {
            stage: StageKind::Video,
            source,
        })?;

        let pool = TexturePool::new(config.screen_pool_size);
        let pool_size = pool.capacity();
        let shared = Arc::new(VideoShared {
            queue: SyncQueue::new(),
            pool: Mutex::new(PoolState {
                pool,
                displayed: NO_PTS,
                stopped: false,
            }),
            space: Condvar::new(),
            frame_interval: params.frame_interval_us(),
            decoded_packets: AtomicU64::new(0),
            late_frames: AtomicU64::new(0),
            last_decoded_pts: AtomicI64::new(NO_PTS),
            generation: AtomicU64::new(0),
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let pop_timeout = config.pop_timeout();
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("video-decode".into())
                .spawn(move || decode_loop(shared, decoder, tx, pop_timeout))
                .map_err(|source| OutputError::Spawn {
                    stage: StageKind::Video,
                    source,
                })?
        };

        tracing::info!(
            "Video output started: {:?} {}x{}, pool of {}, frame interval {}us",
            params.codec,
            params.width,
            params.height,
            pool_size,
            params.frame_interval_us()
        );

        Ok(Self {
            shared,
            events: rx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a compressed packet. False once stopped.
    pub fn push_packet(&self, packet: Packet) -> bool {
        self.shared.queue.push(packet).is_ok()
    }

    /// Pick the newest decoded picture with `pts <= target`.
    ///
    /// Older pictures can never be shown again and are recycled. A pick that
    /// trails `target` by more than one frame interval counts as late; it is
    /// still shown.
    pub fn update_with_pts(&self, target: Pts) -> VideoUpdate {
        let shared = &self.shared;
        let mut state = shared.pool.lock();

        let Some(index) = state.pool.select(target) else {
            return VideoUpdate::hold(state.displayed);
        };
        if state.pool.retire_before(index) > 0 {
            shared.space.notify_one();
        }

        let Some(chosen) = state.pool.get(0) else {
            return VideoUpdate::hold(state.displayed);
        };
        let pts = chosen.pts;
        let late = target - pts > shared.frame_interval;
        if late {
            shared.late_frames.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Late picture {} for target {}", pts, target);
        }

        let updated = pts != state.displayed;
        let texture = updated.then(|| chosen.clone());
        state.displayed = pts;

        VideoUpdate {
            pts,
            updated,
            late,
            texture,
        }
    }

    /// PTS of the picture on screen
    pub fn current_pts(&self) -> Pts {
        self.shared.pool.lock().displayed
    }

    /// Oldest decoded picture not yet passed by the clock
    pub fn oldest_pts(&self) -> Option<Pts> {
        self.shared.pool.lock().pool.oldest_pts()
    }

    pub fn last_decoded_pts(&self) -> Pts {
        self.shared.last_decoded_pts.load(Ordering::Relaxed)
    }

    pub fn decoded_packet_count(&self) -> u64 {
        self.shared.decoded_packets.load(Ordering::Relaxed)
    }

    pub fn late_frames(&self) -> u64 {
        self.shared.late_frames.load(Ordering::Relaxed)
    }

    pub fn frame_interval(&self) -> i64 {
        self.shared.frame_interval
    }

    pub fn texture_kind(&self) -> Option<TextureKind> {
        self.shared.pool.lock().pool.kind()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.lock().pool.stats()
    }

    pub fn queued_packets(&self) -> usize {
        self.shared.queue.size()
    }

    /// Fatal errors reported by the decode thread
    pub fn events(&self) -> Receiver<StageEvent> {
        self.events.clone()
    }

    /// Drop queued packets and decoded pictures (after a seek)
    pub fn flush(&self, pts: Pts) {
        let shared = &self.shared;
        shared.generation.fetch_add(1, Ordering::AcqRel);
        shared.queue.flush(Some(pts));
        {
            let mut state = shared.pool.lock();
            state.pool.clear();
            state.displayed = NO_PTS;
        }
        shared.last_decoded_pts.store(NO_PTS, Ordering::Relaxed);
        shared.space.notify_all();
        tracing::debug!("Video flushed to {}", pts);
    }

    pub fn stop(&self) {
        let shared = &self.shared;
        shared.queue.stop();
        shared.pool.lock().stopped = true;
        shared.space.notify_all();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Video decode thread panicked");
            }
            tracing::info!("Video output stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.is_stopped()
    }
}

impl Drop for VideoOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Decode Thread
// ============================================================================

struct DecodeState {
    generation: u64,
    /// Expected PTS of the next picture, for pictures without one
    next_pts: Pts,
    /// Decoder output already drained during the current idle period
    drained: bool,
}

fn decode_loop<D>(shared: Arc<VideoShared>, mut decoder: D, events: Sender<StageEvent>, pop_timeout: Duration)
where
    D: Decoder<Frame = VideoFrame>,
{
    let mut st = DecodeState {
        generation: shared.generation.load(Ordering::Acquire),
        next_pts: NO_PTS,
        drained: true,
    };

    loop {
        let packet = match shared.queue.pop_timeout(pop_timeout) {
            PopResult::Item(packet) => packet,
            PopResult::TimedOut => {
                // Input dried up: release whatever the decoder still holds
                if !st.drained {
                    st.drained = true;
                    for frame in decoder.flush() {
                        if !store_frame(&shared, &mut st, frame, pop_timeout) {
                            break;
                        }
                    }
                }
                continue;
            }
            PopResult::Stopped => break,
        };

        let current = shared.generation.load(Ordering::Acquire);
        if current != st.generation {
            st.generation = current;
            st.next_pts = NO_PTS;
            decoder.reset();
        }

        let watermark = shared.queue.flush_pts();
        if packet.has_pts() && watermark != NO_PTS && packet.best_pts() < watermark && !packet.keyframe {
            tracing::trace!("Dropping video packet at {} before flush point {}", packet.best_pts(), watermark);
            continue;
        }

        let frames = match decoder.decode(&packet) {
            Ok(frames) => frames,
            Err(e) if !e.is_fatal() => {
                tracing::warn!("Skipping bad video packet at {}: {}", packet.best_pts(), e);
                continue;
            }
            Err(e) => {
                tracing::error!("Video decoder {} failed: {}", decoder.name(), e);
                shared.queue.stop();
                shared.pool.lock().stopped = true;
                let _ = events.send(StageEvent::Fatal {
                    stage: StageKind::Video,
                    error: e.to_string(),
                });
                break;
            }
        };
        shared.decoded_packets.fetch_add(1, Ordering::Relaxed);
        st.drained = false;

        for frame in frames {
            if !store_frame(&shared, &mut st, frame, pop_timeout) {
                break;
            }
        }
    }

    decoder.close();
    tracing::debug!("Video decode thread exiting");
}

/// Put one picture into the pool, waiting for space. False once stopped.
fn store_frame(shared: &VideoShared, st: &mut DecodeState, mut frame: VideoFrame, wait: Duration) -> bool {
    if frame.pts == NO_PTS {
        if st.next_pts == NO_PTS {
            tracing::debug!("Dropping picture without timestamp");
            return true;
        }
        frame.pts = st.next_pts;
    }
    st.next_pts = frame.pts + shared.frame_interval;

    let watermark = shared.queue.flush_pts();
    if watermark != NO_PTS && frame.pts < watermark {
        return true;
    }

    let mut state = shared.pool.lock();
    while state.pool.is_full() && !state.stopped {
        if shared.generation.load(Ordering::Acquire) != st.generation {
            return true;
        }
        shared.space.wait_for(&mut state, wait);
    }
    if state.stopped {
        return false;
    }
    if shared.generation.load(Ordering::Acquire) != st.generation {
        return true;
    }

    match state.pool.insert(&frame) {
        Ok(Some(evicted)) => tracing::debug!("Evicted picture {} from full pool", evicted),
        Ok(None) => {}
        Err(e) => {
            tracing::warn!("Dropping picture {}: {}", frame.pts, e);
            return true;
        }
    }
    shared.last_decoded_pts.store(frame.pts, Ordering::Relaxed);
    true
}
