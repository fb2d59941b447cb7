//! Compressed packets and stream parameters handed over by the demuxer.
//!
//! All timestamps in the pipeline are microseconds. [`NO_PTS`] marks an
//! undefined timestamp the same way the demuxer does.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Presentation/decode timestamp in microseconds.
pub type Pts = i64;

/// Undefined timestamp.
pub const NO_PTS: Pts = i64::MIN;

/// Microseconds per second
pub const US_PER_SEC: i64 = 1_000_000;

/// Convert a sample count at `sample_rate` into a duration in microseconds.
pub fn samples_to_us(samples: usize, sample_rate: u32) -> i64 {
    if sample_rate == 0 {
        return 0;
    }
    (samples as i64 * US_PER_SEC) / sample_rate as i64
}

/// One compressed unit from the demuxer.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Stream the packet belongs to
    pub stream_index: usize,
    /// Presentation timestamp (may be [`NO_PTS`])
    pub pts: Pts,
    /// Decode timestamp (may be [`NO_PTS`])
    pub dts: Pts,
    /// Compressed payload
    pub data: Bytes,
    /// Is this a keyframe/IDR?
    pub keyframe: bool,
}

impl Packet {
    pub fn new(stream_index: usize, pts: Pts, data: impl Into<Bytes>) -> Self {
        Self {
            stream_index,
            pts,
            dts: pts,
            data: data.into(),
            keyframe: false,
        }
    }

    pub fn with_dts(mut self, dts: Pts) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    /// PTS if defined, else DTS, else [`NO_PTS`].
    pub fn best_pts(&self) -> Pts {
        if self.pts != NO_PTS {
            self.pts
        } else {
            self.dts
        }
    }

    pub fn has_pts(&self) -> bool {
        self.best_pts() != NO_PTS
    }
}

/// Uncompressed layouts understood by the raw video decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawFormat {
    Rgba,
    Bgra,
    I420,
}

/// Codec identifiers the pipeline can open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecId {
    H264,
    RawVideo(RawFormat),
    Aac,
    Mp3,
    Flac,
    Vorbis,
    PcmF32Le,
    PcmS16Le,
}

impl CodecId {
    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            Self::Aac | Self::Mp3 | Self::Flac | Self::Vorbis | Self::PcmF32Le | Self::PcmS16Le
        )
    }
}

/// Codec parameters supplied once at stream open
#[derive(Debug, Clone)]
pub struct CodecParams {
    pub codec: CodecId,
    pub sample_rate: u32,
    pub channels: u16,
    pub width: u32,
    pub height: u32,
    /// Frames per second, 0.0 if unknown
    pub frame_rate: f64,
    /// avcC / AudioSpecificConfig / Annex-B parameter sets
    pub extradata: Option<Bytes>,
}

impl CodecParams {
    pub fn audio(codec: CodecId, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec,
            sample_rate,
            channels,
            width: 0,
            height: 0,
            frame_rate: 0.0,
            extradata: None,
        }
    }

    pub fn video(codec: CodecId, width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            codec,
            sample_rate: 0,
            channels: 0,
            width,
            height,
            frame_rate,
            extradata: None,
        }
    }

    pub fn with_extradata(mut self, extradata: impl Into<Bytes>) -> Self {
        self.extradata = Some(extradata.into());
        self
    }

    /// Duration of one video frame in microseconds (25 fps when unknown)
    pub fn frame_interval_us(&self) -> i64 {
        if self.frame_rate > 0.0 {
            (US_PER_SEC as f64 / self.frame_rate) as i64
        } else {
            40_000
        }
    }
}
