//! # Audio Output Stage
//!
//! Packet queue → decode thread → [`AudioRingBuffer`] → hardware callback.
//!
//! The ring buffer's clock anchor is the playback clock for the whole
//! pipeline. The decode thread blocks on the ring when it is full, the
//! callback side ([`AudioOutput::pull`]) never blocks.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::config::PipelineConfig;
use crate::decode::{AudioFrame, Decoder};
use crate::packet::{samples_to_us, CodecParams, Packet, Pts, NO_PTS, US_PER_SEC};
use crate::ring_buffer::{AudioRingBuffer, RingStats};
use crate::stage::{OutputError, StageEvent, StageKind};
use crate::sync::ClockAnchor;
use crate::sync_queue::{PopResult, SyncQueue};

struct AudioShared {
    queue: SyncQueue<Packet>,
    ring: AudioRingBuffer,
    decoded_packets: AtomicU64,
    /// Bumped by flush/reset so the worker drops decoder state
    generation: AtomicU64,
    /// Callback outputs silence until the ring is primed
    buffering: AtomicBool,
    /// Packets pushed and not yet fully written to the ring or released
    pending: Arc<AtomicU64>,
    priming_slots: usize,
    /// f32 bits
    volume: AtomicU32,
}

pub struct AudioOutput {
    shared: Arc<AudioShared>,
    events: Receiver<StageEvent>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AudioOutput {
    /// Open `decoder` and start the decode thread
    pub fn new<D>(config: &PipelineConfig, mut decoder: D, params: &CodecParams) -> Result<Self, OutputError>
    where
        D: Decoder<Frame = AudioFrame> + 'static,
    {
        decoder.open(params).map_err(|source| OutputError::Open {
            stage: StageKind::Audio,
            source,
        })?;

        if params.sample_rate != config.sample_rate {
            tracing::warn!(
                "Audio stream is {}Hz but output runs at {}Hz, playback speed will be off",
                params.sample_rate,
                config.sample_rate
            );
        }

        let ring = AudioRingBuffer::new(config.ring_slots, config.slot_frames, config.sample_rate)
            .with_stall_threshold(config.stall_threshold());

        let pending = Arc::new(AtomicU64::new(0));
        let queue = {
            let pending = pending.clone();
            SyncQueue::with_release(move |_: Packet| {
                pending.fetch_sub(1, Ordering::AcqRel);
            })
        };

        let shared = Arc::new(AudioShared {
            queue,
            ring,
            decoded_packets: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            buffering: AtomicBool::new(true),
            pending,
            priming_slots: config.priming_slots().max(1),
            volume: AtomicU32::new(1.0f32.to_bits()),
        });

        let (tx, rx) = crossbeam_channel::unbounded();
        let pop_timeout = config.pop_timeout();
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("audio-decode".into())
                .spawn(move || decode_loop(shared, decoder, tx, pop_timeout))
                .map_err(|source| OutputError::Spawn {
                    stage: StageKind::Audio,
                    source,
                })?
        };

        tracing::info!(
            "Audio output started: {} slots x {} frames @ {}Hz",
            config.ring_slots,
            config.slot_frames,
            config.sample_rate
        );

        Ok(Self {
            shared,
            events: rx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a compressed packet. False once stopped.
    pub fn push_packet(&self, packet: Packet) -> bool {
        let shared = &self.shared;
        shared.pending.fetch_add(1, Ordering::AcqRel);
        if shared.queue.push(packet).is_err() {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    // ========================================================================
    // Hardware callback side
    // ========================================================================

    /// Fill `out` with interleaved stereo. Silence while buffering or starved.
    /// Returns frames of real audio written.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        let shared = &self.shared;
        if shared.buffering.load(Ordering::Acquire) {
            let filled = shared.ring.count();
            // A short tail that never fills the priming window still plays
            let drained = shared.pending.load(Ordering::Acquire) == 0;
            if filled >= shared.priming_slots || (filled > 0 && drained) {
                shared.buffering.store(false, Ordering::Release);
                tracing::debug!("Audio primed with {} blocks", filled);
            } else {
                out.fill(0.0);
                return 0;
            }
        }

        let frames = shared.ring.read(out);
        let volume = f32::from_bits(shared.volume.load(Ordering::Relaxed));
        if volume != 1.0 {
            out.iter_mut().for_each(|s| *s *= volume);
        }
        frames
    }

    pub fn is_buffering(&self) -> bool {
        self.shared.buffering.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume.load(Ordering::Relaxed))
    }

    // ========================================================================
    // Clock
    // ========================================================================

    pub fn current_pts_with_time(&self) -> ClockAnchor {
        self.shared.ring.current_pts()
    }

    /// Playback position in seconds, extrapolated to now
    pub fn current_time(&self) -> f64 {
        let pts = self.current_pts_with_time().pts_at(Instant::now());
        if pts == NO_PTS {
            0.0
        } else {
            pts as f64 / US_PER_SEC as f64
        }
    }

    /// True once the callback has played a block since the last flush/reset
    pub fn has_audio(&self) -> bool {
        self.shared.ring.is_live()
    }

    pub fn decoded_packet_count(&self) -> u64 {
        self.shared.decoded_packets.load(Ordering::Relaxed)
    }

    pub fn ring_stats(&self) -> RingStats {
        self.shared.ring.stats()
    }

    pub fn queued_packets(&self) -> usize {
        self.shared.queue.size()
    }

    /// Fatal errors reported by the decode thread
    pub fn events(&self) -> Receiver<StageEvent> {
        self.events.clone()
    }

    // ========================================================================
    // Control
    // ========================================================================

    /// Drop queued and buffered audio and restart the clock at `pts`
    pub fn flush(&self, pts: Pts) {
        let shared = &self.shared;
        shared.queue.flush(Some(pts));
        shared.ring.flush(pts);
        // After the ring: a worker that sees the new generation also sees the new epoch
        shared.generation.fetch_add(1, Ordering::AcqRel);
        shared.buffering.store(true, Ordering::Release);
        tracing::debug!("Audio flushed to {}", pts);
    }

    /// Drop queued and buffered audio, keeping the clock where it is
    pub fn reset(&self) {
        let shared = &self.shared;
        shared.queue.flush(None);
        shared.ring.reset();
        shared.generation.fetch_add(1, Ordering::AcqRel);
        shared.buffering.store(true, Ordering::Release);
    }

    /// Stop the queue and the ring, then wait for the decode thread
    pub fn stop(&self) {
        self.shared.queue.stop();
        self.shared.ring.stop();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("Audio decode thread panicked");
            }
            tracing::info!("Audio output stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.queue.is_stopped()
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Decode Thread
// ============================================================================

/// Decode thread state carried between packets
struct LoopState {
    generation: u64,
    /// Ring epoch matching `generation`
    epoch: u64,
    next_pts: Pts,
}

fn decode_loop<D>(shared: Arc<AudioShared>, mut decoder: D, events: Sender<StageEvent>, pop_timeout: Duration)
where
    D: Decoder<Frame = AudioFrame>,
{
    let generation = shared.generation.load(Ordering::Acquire);
    let mut state = LoopState {
        generation,
        epoch: shared.ring.epoch(),
        next_pts: NO_PTS,
    };

    loop {
        let packet = match shared.queue.pop_timeout(pop_timeout) {
            PopResult::Item(packet) => packet,
            PopResult::TimedOut => continue,
            PopResult::Stopped => break,
        };
        let keep_going = handle_packet(&shared, &mut decoder, &events, &mut state, packet);
        shared.pending.fetch_sub(1, Ordering::AcqRel);
        if !keep_going {
            break;
        }
    }

    decoder.close();
    tracing::debug!("Audio decode thread exiting");
}

/// Decode one packet into the ring. False when the thread should exit.
fn handle_packet<D>(
    shared: &AudioShared,
    decoder: &mut D,
    events: &Sender<StageEvent>,
    state: &mut LoopState,
    packet: Packet,
) -> bool
where
    D: Decoder<Frame = AudioFrame>,
{
    let current = shared.generation.load(Ordering::Acquire);
    if current != state.generation {
        state.generation = current;
        state.epoch = shared.ring.epoch();
        state.next_pts = NO_PTS;
        decoder.reset();
    }

    let watermark = shared.queue.flush_pts();
    if packet.has_pts() && watermark != NO_PTS && packet.best_pts() < watermark {
        tracing::trace!("Dropping audio packet at {} before flush point {}", packet.best_pts(), watermark);
        return true;
    }

    let frames = match decoder.decode(&packet) {
        Ok(frames) => frames,
        Err(e) if !e.is_fatal() => {
            tracing::warn!("Skipping bad audio packet at {}: {}", packet.best_pts(), e);
            return true;
        }
        Err(e) => {
            tracing::error!("Audio decoder {} failed: {}", decoder.name(), e);
            shared.queue.stop();
            shared.ring.stop();
            let _ = events.send(StageEvent::Fatal {
                stage: StageKind::Audio,
                error: e.to_string(),
            });
            return false;
        }
    };
    shared.decoded_packets.fetch_add(1, Ordering::Relaxed);

    let slot_frames = shared.ring.slot_frames();
    for frame in frames {
        let base = if frame.pts != NO_PTS { frame.pts } else { state.next_pts };
        let rate = if frame.sample_rate > 0 { frame.sample_rate } else { shared.ring.sample_rate() };

        for (i, block) in frame.samples.chunks(slot_frames * 2).enumerate() {
            let pts = if base == NO_PTS {
                NO_PTS
            } else {
                base + samples_to_us(i * slot_frames, rate)
            };
            // Dropped under the ring lock if a flush got in first
            if !shared.ring.write_in_epoch(block, pts, state.epoch) {
                return true;
            }
        }

        if base != NO_PTS {
            state.next_pts = base + samples_to_us(frame.frames(), rate);
        }
    }
    true
}
