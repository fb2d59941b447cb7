//! # tvsync Core
//!
//! Synchronized audio/video decode-and-render pipeline.
//!
//! ```text
//! demuxer ──► Renderer::push_packet ──┬──► AudioOutput ──► SyncQueue ──► Decoder ──► AudioRingBuffer ──► device callback
//!                                     └──► VideoOutput ──► SyncQueue ──► Decoder ──► TexturePool
//!                                                                                        │
//!                  render tick: audio clock ──► VideoOutput::update_with_pts ◄───────────┘ ──► RenderSurface
//! ```

// ============================================================================
// Packets / Timing
// ============================================================================
pub mod packet;
pub mod sync;
pub mod config;

// ============================================================================
// Buffers
// ============================================================================
pub mod sync_queue;
pub mod ring_buffer;
pub mod texture;

// ============================================================================
// Decoders
// ============================================================================
pub mod decode;
pub mod audio_decode;
#[cfg(feature = "software-decode")]
pub mod h264_decode;
pub mod hw_decode;
pub mod bitstream;

// ============================================================================
// Output Stages / Renderer
// ============================================================================
pub mod stage;
pub mod audio_output;
pub mod video_output;
pub mod renderer;

// ============================================================================
// Audio Device (cpal)
// ============================================================================
#[cfg(feature = "audio")]
pub mod device;

pub use audio_output::AudioOutput;
pub use config::PipelineConfig;
pub use decode::{AudioFrame, DecodeError, Decoder, VideoFrame};
pub use packet::{CodecId, CodecParams, Packet, Pts, NO_PTS};
pub use renderer::{RenderStats, RenderSurface, Renderer};
pub use stage::{OutputError, StageEvent};
pub use video_output::VideoOutput;

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
