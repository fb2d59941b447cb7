//! # tvsync Player
//!
//! Headless driver for the tvsync pipeline. Generates a synthetic stream
//! (PCM sine audio + raw RGBA video), plays it in real time through the
//! audio-clocked renderer and prints the render statistics as JSON.
//!
//! ```text
//! tvsync [--config FILE] [--seconds N] [--seek-at N --seek-to M]
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use tvsync_core::decode::{create_audio_decoder, create_video_decoder};
use tvsync_core::packet::{samples_to_us, RawFormat, US_PER_SEC};
use tvsync_core::renderer::RenderState;
use tvsync_core::texture::PtsTexture;
use tvsync_core::{
    AudioOutput, CodecId, CodecParams, Packet, PipelineConfig, Pts, RenderSurface, Renderer, VideoOutput,
};

const AUDIO_STREAM: usize = 0;
const VIDEO_STREAM: usize = 1;

/// How far the synthetic demuxer runs ahead of the wall clock
const DEMUX_LEAD: Duration = Duration::from_millis(500);

// ============================================================================
// Options
// ============================================================================

#[derive(Debug)]
struct Options {
    config: Option<PathBuf>,
    seconds: f64,
    seek_at: Option<f64>,
    seek_to: f64,
}

impl Options {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut options = Self {
            config: None,
            seconds: 5.0,
            seek_at: None,
            seek_to: 0.0,
        };

        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            let mut value = |name: &str| {
                iter.next()
                    .cloned()
                    .with_context(|| format!("{} needs a value", name))
            };
            match arg.as_str() {
                "--config" => options.config = Some(PathBuf::from(value("--config")?)),
                "--seconds" => options.seconds = value("--seconds")?.parse::<f64>().context("--seconds")?,
                "--seek-at" => options.seek_at = Some(value("--seek-at")?.parse::<f64>().context("--seek-at")?),
                "--seek-to" => options.seek_to = value("--seek-to")?.parse::<f64>().context("--seek-to")?,
                "-h" | "--help" => {
                    println!("usage: tvsync [--config FILE] [--seconds N] [--seek-at N --seek-to M]");
                    std::process::exit(0);
                }
                other => bail!("unknown argument: {}", other),
            }
        }
        Ok(options)
    }

    fn load_config(&self) -> Result<PipelineConfig> {
        let Some(path) = &self.config else {
            return Ok(PipelineConfig::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

// ============================================================================
// Synthetic demuxer
// ============================================================================

/// Interleaved audio/video packets in PTS order, like a demuxer would give
struct SyntheticSource {
    sample_rate: u32,
    audio_frames: usize,
    width: u32,
    height: u32,
    fps: f64,
    /// Stream time of the next audio / video packet
    audio_pts: Pts,
    video_pts: Pts,
    video_index: u64,
    phase: f32,
}

impl SyntheticSource {
    const TONE_HZ: f32 = 440.0;

    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            audio_frames: 1024,
            width: 64,
            height: 36,
            fps: 25.0,
            audio_pts: 0,
            video_pts: 0,
            video_index: 0,
            phase: 0.0,
        }
    }

    fn audio_params(&self) -> CodecParams {
        CodecParams::audio(CodecId::PcmF32Le, self.sample_rate, 2)
    }

    fn video_params(&self) -> CodecParams {
        CodecParams::video(CodecId::RawVideo(RawFormat::Rgba), self.width, self.height, self.fps)
    }

    /// Restart both streams at `pts`
    fn seek(&mut self, pts: Pts) {
        self.audio_pts = pts;
        self.video_pts = pts;
        self.video_index = (pts as f64 * self.fps / US_PER_SEC as f64) as u64;
    }

    fn audio_packet(&mut self) -> Packet {
        let step = 2.0 * std::f32::consts::PI * Self::TONE_HZ / self.sample_rate as f32;
        let mut data = Vec::with_capacity(self.audio_frames * 8);
        for _ in 0..self.audio_frames {
            let s = self.phase.sin() * 0.2;
            self.phase = (self.phase + step) % (2.0 * std::f32::consts::PI);
            data.extend_from_slice(&s.to_le_bytes());
            data.extend_from_slice(&s.to_le_bytes());
        }
        let packet = Packet::new(AUDIO_STREAM, self.audio_pts, data).with_keyframe(true);
        self.audio_pts += samples_to_us(self.audio_frames, self.sample_rate);
        packet
    }

    fn video_packet(&mut self) -> Packet {
        let shade = (self.video_index % 256) as u8;
        let pixels = (self.width * self.height) as usize;
        let mut data = Vec::with_capacity(pixels * 4);
        for _ in 0..pixels {
            data.extend_from_slice(&[shade, 255 - shade, 128, 255]);
        }
        let packet = Packet::new(VIDEO_STREAM, self.video_pts, data).with_keyframe(true);
        self.video_index += 1;
        self.video_pts = (self.video_index as f64 * US_PER_SEC as f64 / self.fps) as Pts;
        packet
    }

    /// Packets with PTS before `until`, interleaved by PTS
    fn packets_until(&mut self, until: Pts) -> Vec<Packet> {
        let mut out = Vec::new();
        loop {
            let next = self.audio_pts.min(self.video_pts);
            if next >= until {
                break;
            }
            if self.audio_pts <= self.video_pts {
                out.push(self.audio_packet());
            } else {
                out.push(self.video_packet());
            }
        }
        out
    }
}

// ============================================================================
// Render surface
// ============================================================================

/// Logs every presented picture
struct LogSurface {
    presented: u64,
}

impl RenderSurface for LogSurface {
    fn present(&mut self, texture: &PtsTexture) {
        self.presented += 1;
        let vertices = texture.vertices();
        let vertex_buffer = texture.vertex_bytes();
        tracing::debug!(
            "present #{} pts={}us {}x{} {:?} u_max={} ({} vertex bytes)",
            self.presented,
            texture.pts,
            texture.width(),
            texture.height(),
            texture.kind(),
            vertices[1].tex_coords[0],
            vertex_buffer.len()
        );
    }
}

// ============================================================================
// Audio callback
// ============================================================================

/// Pulls from the audio stage on a real-time schedule, like a sound card
struct SimulatedDevice {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SimulatedDevice {
    fn start(audio: Arc<AudioOutput>, sample_rate: u32, period_frames: usize) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let period = Duration::from_micros(samples_to_us(period_frames, sample_rate) as u64);
        let thread = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-callback".into())
                .spawn(move || {
                    let mut buf = vec![0.0f32; period_frames * 2];
                    let mut next = Instant::now();
                    while running.load(Ordering::Relaxed) {
                        audio.pull(&mut buf);
                        next += period;
                        let now = Instant::now();
                        if next > now {
                            thread::sleep(next - now);
                        } else {
                            next = now;
                        }
                    }
                })
                .context("spawning audio callback thread")?
        };
        tracing::info!("Simulated audio device: {} frames every {:?}", period_frames, period);
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

enum AudioSink {
    Simulated(SimulatedDevice),
    #[cfg(feature = "audio")]
    Device(tvsync_core::device::CpalOutput),
}

fn open_audio_sink(audio: Arc<AudioOutput>, config: &PipelineConfig) -> Result<AudioSink> {
    #[cfg(feature = "audio")]
    {
        match tvsync_core::device::CpalOutput::open(audio.clone(), config.sample_rate) {
            Ok(device) => return Ok(AudioSink::Device(device)),
            Err(e) => tracing::warn!("Audio device unavailable ({}), simulating callback", e),
        }
    }
    let period = (config.slot_frames / 2).max(64);
    Ok(AudioSink::Simulated(SimulatedDevice::start(audio, config.sample_rate, period)?))
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = Options::from_args(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("tvsync player v{}", tvsync_core::VERSION);
    let config = options.load_config()?;
    tracing::debug!("Config: {:?}", config);

    let mut source = SyntheticSource::new(config.sample_rate);
    let audio_params = source.audio_params();
    let video_params = source.video_params();

    let audio_decoder = create_audio_decoder(audio_params.codec)?;
    let video_decoder = create_video_decoder(video_params.codec)?;
    let audio = Arc::new(AudioOutput::new(&config, audio_decoder, &audio_params).context("opening audio")?);
    let video = VideoOutput::new(&config, video_decoder, &video_params).context("opening video")?;

    let mut sink = open_audio_sink(audio.clone(), &config)?;
    let surface = Box::new(LogSurface { presented: 0 });
    let mut renderer = Renderer::new(
        config.clone(),
        AUDIO_STREAM,
        VIDEO_STREAM,
        audio.clone(),
        video,
        surface,
    );

    let started = Instant::now();
    let end = started + Duration::from_secs_f64(options.seconds.max(0.0));
    let mut seek_at = options.seek_at.map(|s| started + Duration::from_secs_f64(s.max(0.0)));
    // Stream time the wall clock maps to, moved by a seek
    let mut stream_origin = (started, 0 as Pts);

    renderer.run_configured(|r| {
        let now = Instant::now();
        if let Some(at) = seek_at {
            if now >= at {
                let pts = (options.seek_to.max(0.0) * US_PER_SEC as f64) as Pts;
                r.flush(pts);
                source.seek(pts);
                stream_origin = (now, pts);
                seek_at = None;
            }
        }

        let (origin_time, origin_pts) = stream_origin;
        let elapsed = (now - origin_time + DEMUX_LEAD).as_micros() as Pts;
        for packet in source.packets_until(origin_pts + elapsed) {
            r.push_packet(packet);
        }

        now < end && r.state() == RenderState::Running
    });

    renderer.stop();
    match &mut sink {
        AudioSink::Simulated(device) => device.stop(),
        #[cfg(feature = "audio")]
        AudioSink::Device(device) => {
            tracing::info!("Closing audio device {}", device.device_name());
        }
    }

    let stats = renderer.stats();
    tracing::info!(
        "Played {:.1}s: {} pictures, {} late, audio clock at {:.3}s",
        started.elapsed().as_secs_f64(),
        stats.presented,
        stats.late_frames,
        audio.current_time()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let Some(error) = renderer.last_error() {
        bail!("pipeline failed: {}", error);
    }
    Ok(())
}
