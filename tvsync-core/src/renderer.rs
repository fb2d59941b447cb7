//! # Renderer - A/V Synchronization
//!
//! Audio is the master clock. Every render tick computes a target PTS from
//! the audio clock anchor and asks the video stage for the picture that
//! belongs on screen at that moment. Video catches up by skipping pictures or
//! holds the current one; it never slows audio down.
//!
//! Until audio has played its first block (stream start, after a seek) the
//! target comes from a free-running clock seeded at the oldest decoded
//! picture.
//!
//! ```text
//!  Idle ──start()──► Running ──stop() / fatal stage error──► Stopped
//! ```

use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::audio_output::AudioOutput;
use crate::config::PipelineConfig;
use crate::packet::{Packet, Pts, NO_PTS};
use crate::ring_buffer::RingStats;
use crate::stage::StageEvent;
use crate::sync::{ClockAnchor, FrameTimer, FreeRunClock};
use crate::texture::PtsTexture;
use crate::video_output::{VideoOutput, VideoUpdate};

// ============================================================================
// Collaborators
// ============================================================================

/// Where decoded pictures end up
pub trait RenderSurface: Send {
    fn present(&mut self, texture: &PtsTexture);
}

/// What the renderer needs from the audio side
pub trait AudioStage: Send + Sync {
    fn push_packet(&self, packet: Packet) -> bool;
    fn current_pts_with_time(&self) -> ClockAnchor;
    /// Audio has actually been played since the last flush
    fn has_audio(&self) -> bool;
    fn decoded_packet_count(&self) -> u64;
    fn ring_stats(&self) -> RingStats;
    fn events(&self) -> Receiver<StageEvent>;
    fn flush(&self, pts: Pts);
    fn stop(&self);
}

/// What the renderer needs from the video side
pub trait VideoStage: Send + Sync {
    fn push_packet(&self, packet: Packet) -> bool;
    fn update_with_pts(&self, target: Pts) -> VideoUpdate;
    fn oldest_pts(&self) -> Option<Pts>;
    fn decoded_packet_count(&self) -> u64;
    fn late_frames(&self) -> u64;
    fn events(&self) -> Receiver<StageEvent>;
    fn flush(&self, pts: Pts);
    fn stop(&self);
}

impl AudioStage for AudioOutput {
    fn push_packet(&self, packet: Packet) -> bool {
        AudioOutput::push_packet(self, packet)
    }
    fn current_pts_with_time(&self) -> ClockAnchor {
        AudioOutput::current_pts_with_time(self)
    }
    fn has_audio(&self) -> bool {
        AudioOutput::has_audio(self)
    }
    fn decoded_packet_count(&self) -> u64 {
        AudioOutput::decoded_packet_count(self)
    }
    fn ring_stats(&self) -> RingStats {
        AudioOutput::ring_stats(self)
    }
    fn events(&self) -> Receiver<StageEvent> {
        AudioOutput::events(self)
    }
    fn flush(&self, pts: Pts) {
        AudioOutput::flush(self, pts)
    }
    fn stop(&self) {
        AudioOutput::stop(self)
    }
}

impl VideoStage for VideoOutput {
    fn push_packet(&self, packet: Packet) -> bool {
        VideoOutput::push_packet(self, packet)
    }
    fn update_with_pts(&self, target: Pts) -> VideoUpdate {
        VideoOutput::update_with_pts(self, target)
    }
    fn oldest_pts(&self) -> Option<Pts> {
        VideoOutput::oldest_pts(self)
    }
    fn decoded_packet_count(&self) -> u64 {
        VideoOutput::decoded_packet_count(self)
    }
    fn late_frames(&self) -> u64 {
        VideoOutput::late_frames(self)
    }
    fn events(&self) -> Receiver<StageEvent> {
        VideoOutput::events(self)
    }
    fn flush(&self, pts: Pts) {
        VideoOutput::flush(self, pts)
    }
    fn stop(&self) {
        VideoOutput::stop(self)
    }
}

impl<T: AudioStage + ?Sized> AudioStage for Arc<T> {
    fn push_packet(&self, packet: Packet) -> bool {
        (**self).push_packet(packet)
    }
    fn current_pts_with_time(&self) -> ClockAnchor {
        (**self).current_pts_with_time()
    }
    fn has_audio(&self) -> bool {
        (**self).has_audio()
    }
    fn decoded_packet_count(&self) -> u64 {
        (**self).decoded_packet_count()
    }
    fn ring_stats(&self) -> RingStats {
        (**self).ring_stats()
    }
    fn events(&self) -> Receiver<StageEvent> {
        (**self).events()
    }
    fn flush(&self, pts: Pts) {
        (**self).flush(pts)
    }
    fn stop(&self) {
        (**self).stop()
    }
}

impl<T: VideoStage + ?Sized> VideoStage for Arc<T> {
    fn push_packet(&self, packet: Packet) -> bool {
        (**self).push_packet(packet)
    }
    fn update_with_pts(&self, target: Pts) -> VideoUpdate {
        (**self).update_with_pts(target)
    }
    fn oldest_pts(&self) -> Option<Pts> {
        (**self).oldest_pts()
    }
    fn decoded_packet_count(&self) -> u64 {
        (**self).decoded_packet_count()
    }
    fn late_frames(&self) -> u64 {
        (**self).late_frames()
    }
    fn events(&self) -> Receiver<StageEvent> {
        (**self).events()
    }
    fn flush(&self, pts: Pts) {
        (**self).flush(pts)
    }
    fn stop(&self) {
        (**self).stop()
    }
}

// ============================================================================
// Renderer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RenderState {
    Idle,
    Running,
    Stopped,
}

/// Which clock produced the last tick's target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClockSource {
    None,
    FreeRun,
    Audio,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RenderStats {
    pub ticks: u64,
    pub presented: u64,
    pub late_frames: u64,
    pub audio_packets: u64,
    pub video_packets: u64,
    pub underruns: u64,
    pub stalled_writes: u64,
}

pub struct Renderer<A: AudioStage, V: VideoStage> {
    config: PipelineConfig,
    audio_index: usize,
    video_index: usize,
    audio: A,
    video: V,
    surface: Box<dyn RenderSurface>,
    events: Vec<Receiver<StageEvent>>,

    state: RenderState,
    clock: ClockSource,
    free_run: FreeRunClock,
    last_target: Pts,

    ticks: u64,
    presented: u64,
    last_error: Option<String>,
}

impl<A: AudioStage, V: VideoStage> Renderer<A, V> {
    pub fn new(
        config: PipelineConfig,
        audio_index: usize,
        video_index: usize,
        audio: A,
        video: V,
        surface: Box<dyn RenderSurface>,
    ) -> Self {
        let events = vec![audio.events(), video.events()];
        Self {
            config,
            audio_index,
            video_index,
            audio,
            video,
            surface,
            events,
            state: RenderState::Idle,
            clock: ClockSource::None,
            free_run: FreeRunClock::new(),
            last_target: NO_PTS,
            ticks: 0,
            presented: 0,
            last_error: None,
        }
    }

    pub fn start(&mut self) {
        if self.state == RenderState::Idle {
            self.state = RenderState::Running;
            tracing::info!(
                "Renderer running (audio stream {}, video stream {})",
                self.audio_index,
                self.video_index
            );
        }
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn clock_source(&self) -> ClockSource {
        self.clock
    }

    /// Target PTS computed by the last tick
    pub fn last_target(&self) -> Pts {
        self.last_target
    }

    /// First fatal stage error, if the pipeline died
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn audio(&self) -> &A {
        &self.audio
    }

    pub fn video(&self) -> &V {
        &self.video
    }

    /// Route a packet to the stage owning its stream
    pub fn push_packet(&mut self, packet: Packet) -> bool {
        self.drain_events();
        if self.state == RenderState::Stopped {
            return false;
        }

        if packet.stream_index == self.audio_index {
            self.audio.push_packet(packet)
        } else if packet.stream_index == self.video_index {
            self.video.push_packet(packet)
        } else {
            tracing::debug!("Dropping packet for unknown stream {}", packet.stream_index);
            false
        }
    }

    /// One render tick. Returns the PTS of the picture presented, if any.
    pub fn tick(&mut self) -> Option<Pts> {
        self.drain_events();
        if self.state != RenderState::Running {
            return None;
        }
        self.ticks += 1;

        let now = Instant::now();
        let target = if self.audio.has_audio() {
            self.switch_clock(ClockSource::Audio);
            self.audio.current_pts_with_time().pts_at(now)
        } else {
            if !self.free_run.is_running() {
                if let Some(pts) = self.video.oldest_pts() {
                    self.free_run.seed(pts, now);
                }
            }
            match self.free_run.target(now) {
                Some(target) => {
                    self.switch_clock(ClockSource::FreeRun);
                    target
                }
                None => return None,
            }
        };
        if target == NO_PTS {
            return None;
        }
        self.last_target = target;

        let update = self.video.update_with_pts(target);
        if !update.updated {
            return None;
        }
        let texture = update.texture?;
        self.surface.present(&texture);
        self.presented += 1;
        Some(texture.pts)
    }

    fn switch_clock(&mut self, clock: ClockSource) {
        if self.clock != clock {
            tracing::debug!("Render clock: {:?} -> {:?}", self.clock, clock);
            self.clock = clock;
        }
    }

    /// Tick at `refresh_hz` until stopped or until `between_ticks` returns
    /// false. `between_ticks` runs after every tick and is where a caller
    /// feeds packets.
    pub fn run(&mut self, refresh_hz: f64, mut between_ticks: impl FnMut(&mut Self) -> bool) {
        self.start();
        let mut timer = FrameTimer::new(refresh_hz);
        while self.state == RenderState::Running {
            self.tick();
            if !between_ticks(self) {
                break;
            }
            timer.wait();
        }
        tracing::debug!("Render loop left after {} ticks ({:.1} fps)", self.ticks, timer.fps());
    }

    /// Tick at the configured refresh rate
    pub fn run_configured(&mut self, between_ticks: impl FnMut(&mut Self) -> bool) {
        let refresh_hz = self.config.refresh_hz;
        self.run(refresh_hz, between_ticks);
    }

    /// Seek: drop everything buffered in both stages
    pub fn flush(&mut self, pts: Pts) {
        self.audio.flush(pts);
        self.video.flush(pts);
        self.free_run.reset();
        self.clock = ClockSource::None;
        self.last_target = NO_PTS;
        tracing::info!("Pipeline flushed to {}", pts);
    }

    pub fn stop(&mut self) {
        if self.state == RenderState::Stopped {
            return;
        }
        self.audio.stop();
        self.video.stop();
        self.state = RenderState::Stopped;
        tracing::info!("Renderer stopped after {} ticks, {} pictures", self.ticks, self.presented);
    }

    fn drain_events(&mut self) {
        let mut fatal = None;
        for events in &self.events {
            while let Ok(event) = events.try_recv() {
                match event {
                    StageEvent::Fatal { stage, error } => {
                        tracing::error!("{} stage failed: {}", stage, error);
                        if fatal.is_none() {
                            fatal = Some(format!("{}: {}", stage, error));
                        }
                    }
                }
            }
        }
        if let Some(error) = fatal {
            if self.last_error.is_none() {
                self.last_error = Some(error);
            }
            self.stop();
        }
    }

    pub fn stats(&self) -> RenderStats {
        let ring = self.audio.ring_stats();
        RenderStats {
            ticks: self.ticks,
            presented: self.presented,
            late_frames: self.video.late_frames(),
            audio_packets: self.audio.decoded_packet_count(),
            video_packets: self.video.decoded_packet_count(),
            underruns: ring.underruns,
            stalled_writes: ring.stalled_writes,
        }
    }
}

impl<A: AudioStage, V: VideoStage> Drop for Renderer<A, V> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageKind;
    use crate::texture::TextureKind;
    use crossbeam_channel::Sender;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct MockAudio {
        anchor: Mutex<ClockAnchor>,
        live: AtomicBool,
        pushed: Mutex<Vec<Pts>>,
        flushed: Mutex<Option<Pts>>,
        stopped: AtomicBool,
        tx: Sender<StageEvent>,
        rx: Receiver<StageEvent>,
    }

    impl MockAudio {
        fn new() -> Arc<Self> {
            let (tx, rx) = crossbeam_channel::unbounded();
            Arc::new(Self {
                anchor: Mutex::new(ClockAnchor::unset()),
                live: AtomicBool::new(false),
                pushed: Mutex::new(Vec::new()),
                flushed: Mutex::new(None),
                stopped: AtomicBool::new(false),
                tx,
                rx,
            })
        }

        fn play_at(&self, pts: Pts) {
            *self.anchor.lock() = ClockAnchor::new(pts, Instant::now());
            self.live.store(true, Ordering::SeqCst);
        }
    }

    impl AudioStage for MockAudio {
        fn push_packet(&self, packet: Packet) -> bool {
            self.pushed.lock().push(packet.pts);
            true
        }
        fn current_pts_with_time(&self) -> ClockAnchor {
            *self.anchor.lock()
        }
        fn has_audio(&self) -> bool {
            self.live.load(Ordering::SeqCst)
        }
        fn decoded_packet_count(&self) -> u64 {
            self.pushed.lock().len() as u64
        }
        fn ring_stats(&self) -> RingStats {
            RingStats {
                underruns: 3,
                ..Default::default()
            }
        }
        fn events(&self) -> Receiver<StageEvent> {
            self.rx.clone()
        }
        fn flush(&self, pts: Pts) {
            *self.flushed.lock() = Some(pts);
            self.live.store(false, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    /// Pictures at fixed PTS values, selection as in the real stage
    struct MockVideo {
        frames: Mutex<Vec<Pts>>,
        displayed: Mutex<Pts>,
        targets: Mutex<Vec<Pts>>,
        pushed: Mutex<Vec<Pts>>,
        flushed: Mutex<Option<Pts>>,
        stopped: AtomicBool,
        rx: Receiver<StageEvent>,
        _tx: Sender<StageEvent>,
    }

    impl MockVideo {
        fn with_frames(frames: &[Pts]) -> Arc<Self> {
            let (tx, rx) = crossbeam_channel::unbounded();
            Arc::new(Self {
                frames: Mutex::new(frames.to_vec()),
                displayed: Mutex::new(NO_PTS),
                targets: Mutex::new(Vec::new()),
                pushed: Mutex::new(Vec::new()),
                flushed: Mutex::new(None),
                stopped: AtomicBool::new(false),
                rx,
                _tx: tx,
            })
        }
    }

    impl VideoStage for MockVideo {
        fn push_packet(&self, packet: Packet) -> bool {
            self.pushed.lock().push(packet.pts);
            true
        }
        fn update_with_pts(&self, target: Pts) -> VideoUpdate {
            self.targets.lock().push(target);
            let mut displayed = self.displayed.lock();
            let best = self.frames.lock().iter().copied().filter(|p| *p <= target).max();
            match best {
                Some(pts) if pts != *displayed => {
                    *displayed = pts;
                    let mut texture = PtsTexture::new(TextureKind::Packed);
                    texture.pts = pts;
                    VideoUpdate {
                        pts,
                        updated: true,
                        late: false,
                        texture: Some(texture),
                    }
                }
                _ => VideoUpdate {
                    pts: *displayed,
                    updated: false,
                    late: false,
                    texture: None,
                },
            }
        }
        fn oldest_pts(&self) -> Option<Pts> {
            self.frames.lock().iter().copied().min()
        }
        fn decoded_packet_count(&self) -> u64 {
            self.pushed.lock().len() as u64
        }
        fn late_frames(&self) -> u64 {
            2
        }
        fn events(&self) -> Receiver<StageEvent> {
            self.rx.clone()
        }
        fn flush(&self, pts: Pts) {
            *self.flushed.lock() = Some(pts);
            self.frames.lock().clear();
            *self.displayed.lock() = NO_PTS;
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSurface {
        shown: Arc<Mutex<Vec<Pts>>>,
    }

    impl RenderSurface for RecordingSurface {
        fn present(&mut self, texture: &PtsTexture) {
            self.shown.lock().push(texture.pts);
        }
    }

    type TestRenderer = Renderer<Arc<MockAudio>, Arc<MockVideo>>;

    fn renderer(audio: &Arc<MockAudio>, video: &Arc<MockVideo>) -> (TestRenderer, RecordingSurface) {
        let surface = RecordingSurface::default();
        let r = Renderer::new(
            PipelineConfig::default(),
            0,
            1,
            audio.clone(),
            video.clone(),
            Box::new(surface.clone()),
        );
        (r, surface)
    }

    #[test]
    fn test_tick_does_nothing_until_started() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[0]);
        let (mut r, surface) = renderer(&audio, &video);

        assert_eq!(r.state(), RenderState::Idle);
        assert_eq!(r.tick(), None);
        assert!(video.targets.lock().is_empty());

        r.start();
        assert_eq!(r.state(), RenderState::Running);
        assert_eq!(r.tick(), Some(0));
        assert_eq!(*surface.shown.lock(), vec![0]);
    }

    #[test]
    fn test_audio_clock_drives_target() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[1_000_000, 1_033_000, 1_066_000, 1_100_000]);
        let (mut r, surface) = renderer(&audio, &video);
        r.start();

        audio.play_at(1_070_000);
        assert_eq!(r.tick(), Some(1_066_000));
        assert_eq!(r.clock_source(), ClockSource::Audio);

        let target = video.targets.lock()[0];
        assert!((1_070_000..1_570_000).contains(&target), "target {}", target);

        // Same picture on the next tick: nothing presented
        assert_eq!(r.tick(), None);
        assert_eq!(surface.shown.lock().len(), 1);
    }

    #[test]
    fn test_free_run_until_audio_plays() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[5_000_000, 5_040_000]);
        let (mut r, _surface) = renderer(&audio, &video);
        r.start();

        assert_eq!(r.tick(), Some(5_000_000));
        assert_eq!(r.clock_source(), ClockSource::FreeRun);

        thread_sleep_ms(60);
        assert_eq!(r.tick(), Some(5_040_000));

        audio.play_at(0);
        assert_eq!(r.tick(), None);
        assert_eq!(r.clock_source(), ClockSource::Audio);
        assert!(r.last_target() < 1_000_000);
    }

    fn thread_sleep_ms(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    #[test]
    fn test_no_target_without_any_clock() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[]);
        let (mut r, _surface) = renderer(&audio, &video);
        r.start();
        assert_eq!(r.tick(), None);
        assert_eq!(r.clock_source(), ClockSource::None);
        assert!(video.targets.lock().is_empty());
    }

    #[test]
    fn test_packets_routed_by_stream_index() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[]);
        let (mut r, _surface) = renderer(&audio, &video);

        assert!(r.push_packet(Packet::new(0, 10, vec![0u8])));
        assert!(r.push_packet(Packet::new(1, 20, vec![0u8])));
        assert!(r.push_packet(Packet::new(0, 30, vec![0u8])));
        assert!(!r.push_packet(Packet::new(7, 40, vec![0u8])));

        assert_eq!(*audio.pushed.lock(), vec![10, 30]);
        assert_eq!(*video.pushed.lock(), vec![20]);
    }

    #[test]
    fn test_fatal_stage_error_stops_pipeline() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[0]);
        let (mut r, _surface) = renderer(&audio, &video);
        r.start();

        audio
            .tx
            .send(StageEvent::Fatal {
                stage: StageKind::Audio,
                error: "device lost".into(),
            })
            .unwrap();

        assert_eq!(r.tick(), None);
        assert_eq!(r.state(), RenderState::Stopped);
        assert!(r.last_error().unwrap().contains("device lost"));
        assert!(audio.stopped.load(Ordering::SeqCst));
        assert!(video.stopped.load(Ordering::SeqCst));
        assert!(!r.push_packet(Packet::new(0, 0, vec![0u8])));

        // Stopped is final
        r.start();
        assert_eq!(r.state(), RenderState::Stopped);
    }

    #[test]
    fn test_flush_reaches_both_stages_and_reseeds_clock() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[0]);
        let (mut r, _surface) = renderer(&audio, &video);
        r.start();
        assert_eq!(r.tick(), Some(0));

        r.flush(9_000_000);
        assert_eq!(*audio.flushed.lock(), Some(9_000_000));
        assert_eq!(*video.flushed.lock(), Some(9_000_000));
        assert_eq!(r.clock_source(), ClockSource::None);

        video.frames.lock().push(9_000_000);
        assert_eq!(r.tick(), Some(9_000_000));
        assert!(r.last_target() >= 9_000_000);
    }

    #[test]
    fn test_stats_collects_stage_counters() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[0]);
        let (mut r, _surface) = renderer(&audio, &video);
        r.push_packet(Packet::new(0, 0, vec![0u8]));
        r.start();
        r.tick();
        r.tick();

        let stats = r.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.presented, 1);
        assert_eq!(stats.late_frames, 2);
        assert_eq!(stats.audio_packets, 1);
        assert_eq!(stats.underruns, 3);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["ticks"], 2);
    }

    #[test]
    fn test_real_stages_follow_pulled_audio_clock() {
        use crate::audio_decode::SymphoniaAudioDecoder;
        use crate::decode::RawVideoDecoder;
        use crate::packet::{CodecId, CodecParams, RawFormat};

        let config = PipelineConfig {
            ring_slots: 8,
            slot_frames: 4,
            sample_rate: 1000,
            audio_pool_size: 1,
            pop_timeout_ms: 20,
            ..Default::default()
        };
        let audio = AudioOutput::new(
            &config,
            SymphoniaAudioDecoder::new(),
            &CodecParams::audio(CodecId::PcmF32Le, 1000, 2),
        )
        .unwrap();
        let video = VideoOutput::new(
            &config,
            RawVideoDecoder::new(),
            &CodecParams::video(CodecId::RawVideo(RawFormat::Rgba), 2, 2, 25.0),
        )
        .unwrap();
        let surface = RecordingSurface::default();
        let mut r = Renderer::new(config, 0, 1, audio, video, Box::new(surface.clone()));

        // 200 ms of audio at 1 kHz from 1 s, pictures every 40 ms
        for i in 0..5i64 {
            let data: Vec<u8> = (0..80).flat_map(|_| 0.1f32.to_le_bytes()).collect();
            assert!(r.push_packet(Packet::new(0, 1_000_000 + i * 40_000, data)));
        }
        let pictures = [1_000_000, 1_040_000, 1_080_000, 1_120_000];
        for pts in pictures {
            assert!(r.push_packet(Packet::new(1, pts, vec![0u8; 16])));
        }
        r.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while r.video().pool_stats().live < pictures.len() {
            assert!(Instant::now() < deadline, "video never decoded");
            thread_sleep_ms(5);
        }

        // Play audio like a device callback until the clock passes 1.05 s
        let mut out = vec![0.0f32; 8];
        while r.audio().current_pts_with_time().pts < 1_050_000 {
            assert!(Instant::now() < deadline, "audio never played");
            if r.audio().pull(&mut out) == 0 {
                thread_sleep_ms(1);
            }
        }
        let anchor = r.audio().current_pts_with_time().pts;

        let shown = r.tick();
        assert_eq!(r.clock_source(), ClockSource::Audio);
        let target = r.last_target();
        assert!(target >= anchor && target < anchor + 500_000, "target {}", target);

        let expected = pictures.iter().copied().filter(|p| *p <= target).max();
        assert_eq!(shown, expected);
        assert!(shown >= Some(1_040_000));
        assert_eq!(*surface.shown.lock(), vec![expected.unwrap()]);
        assert!(r.stats().audio_packets >= 2);
        r.stop();
    }

    #[test]
    fn test_run_until_caller_stops() {
        let audio = MockAudio::new();
        let video = MockVideo::with_frames(&[0]);
        let (mut r, surface) = renderer(&audio, &video);

        let mut rounds = 0;
        r.run(500.0, |_| {
            rounds += 1;
            rounds < 5
        });
        assert_eq!(r.stats().ticks, 5);
        assert_eq!(*surface.shown.lock(), vec![0]);

        r.run(500.0, |r| {
            r.stop();
            true
        });
        assert_eq!(r.state(), RenderState::Stopped);
    }
}
