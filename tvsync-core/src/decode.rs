//! # Decode Module
//!
//! One capability contract for every decoder backend. The output stages are
//! generic over it, so audio, software video and hardware video decoders are
//! interchangeable behind the same worker loop.
//!
//! ## Outcomes of `decode`
//! - `Ok(frames)` with frames: output produced
//! - `Ok(vec![])`: packet consumed, nothing to show yet (needs more input)
//! - `Err(e)` with `!e.is_fatal()`: this packet was bad, keep feeding
//! - `Err(e)` with `e.is_fatal()`: the stream can no longer be decoded

use thiserror::Error;

use crate::packet::{CodecId, CodecParams, Packet, Pts, RawFormat};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Decoder is not open")]
    NotOpen,
    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),
    #[error("Failed to open decoder: {0}")]
    Open(String),
    #[error("Corrupt packet: {0}")]
    Corrupt(String),
    #[error("Decode failed: {0}")]
    Fatal(String),
}

impl DecodeError {
    /// Whether the stream is dead (as opposed to one bad packet)
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Corrupt(_))
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Pixel format of decoded pictures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Packed 8-bit RGBA
    Rgba,
    /// Packed 8-bit BGRA
    Bgra,
    /// 4:2:0 planar (Y + U + V separate)
    I420,
}

impl FrameFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Rgba | Self::Bgra => 1,
            Self::I420 => 3,
        }
    }

    pub fn is_planar(&self) -> bool {
        self.plane_count() > 1
    }
}

impl From<RawFormat> for FrameFormat {
    fn from(f: RawFormat) -> Self {
        match f {
            RawFormat::Rgba => Self::Rgba,
            RawFormat::Bgra => Self::Bgra,
            RawFormat::I420 => Self::I420,
        }
    }
}

/// One plane of pixel data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes per row, may include padding
    pub stride: usize,
}

/// A decoded video picture
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: Pts,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub planes: Vec<Plane>,
}

/// Decoded audio as interleaved stereo f32
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: Pts,
    /// `[L, R, L, R, ...]`
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }
}

// ============================================================================
// Decoder trait
// ============================================================================

/// Decoder trait - implemented by all decoder backends
pub trait Decoder: Send {
    type Frame: Send + 'static;

    /// Open with the stream's codec parameters
    fn open(&mut self, params: &CodecParams) -> Result<(), DecodeError>;

    /// Release codec state; `open` may be called again afterwards
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Decode a compressed packet into zero or more frames
    fn decode(&mut self, packet: &Packet) -> Result<Vec<Self::Frame>, DecodeError>;

    /// Drain frames still buffered inside the decoder
    fn flush(&mut self) -> Vec<Self::Frame> {
        Vec::new()
    }

    /// Drop buffered state after a seek
    fn reset(&mut self) {}

    /// Get decoder name for debugging
    fn name(&self) -> &str;
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    type Frame = D::Frame;

    fn open(&mut self, params: &CodecParams) -> Result<(), DecodeError> {
        (**self).open(params)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<Self::Frame>, DecodeError> {
        (**self).decode(packet)
    }

    fn flush(&mut self) -> Vec<Self::Frame> {
        (**self).flush()
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

pub type BoxedVideoDecoder = Box<dyn Decoder<Frame = VideoFrame>>;
pub type BoxedAudioDecoder = Box<dyn Decoder<Frame = AudioFrame>>;

/// Create the software decoder for a video codec
pub fn create_video_decoder(codec: CodecId) -> Result<BoxedVideoDecoder, DecodeError> {
    match codec {
        CodecId::RawVideo(_) => Ok(Box::new(RawVideoDecoder::new())),
        #[cfg(feature = "software-decode")]
        CodecId::H264 => Ok(Box::new(crate::h264_decode::OpenH264Decoder::new())),
        other => Err(DecodeError::UnsupportedCodec(format!("{:?}", other))),
    }
}

/// Create the decoder for an audio codec
pub fn create_audio_decoder(codec: CodecId) -> Result<BoxedAudioDecoder, DecodeError> {
    if codec.is_audio() {
        Ok(Box::new(crate::audio_decode::SymphoniaAudioDecoder::new()))
    } else {
        Err(DecodeError::UnsupportedCodec(format!("{:?}", codec)))
    }
}

// ============================================================================
// Raw video
// ============================================================================

/// Uncompressed pictures carried one per packet
pub struct RawVideoDecoder {
    format: Option<FrameFormat>,
    width: u32,
    height: u32,
}

impl RawVideoDecoder {
    pub fn new() -> Self {
        Self {
            format: None,
            width: 0,
            height: 0,
        }
    }

    /// (stride, rows) of every plane
    fn layout(&self, format: FrameFormat) -> Vec<(usize, usize)> {
        let w = self.width as usize;
        let h = self.height as usize;
        match format {
            FrameFormat::Rgba | FrameFormat::Bgra => vec![(w * 4, h)],
            FrameFormat::I420 => {
                let cw = w.div_ceil(2);
                let ch = h.div_ceil(2);
                vec![(w, h), (cw, ch), (cw, ch)]
            }
        }
    }
}

impl Default for RawVideoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RawVideoDecoder {
    type Frame = VideoFrame;

    fn open(&mut self, params: &CodecParams) -> Result<(), DecodeError> {
        let CodecId::RawVideo(raw) = params.codec else {
            return Err(DecodeError::UnsupportedCodec(format!("{:?}", params.codec)));
        };
        if params.width == 0 || params.height == 0 {
            return Err(DecodeError::Open(format!(
                "invalid dimensions {}x{}",
                params.width, params.height
            )));
        }
        self.format = Some(raw.into());
        self.width = params.width;
        self.height = params.height;
        Ok(())
    }

    fn close(&mut self) {
        self.format = None;
    }

    fn is_open(&self) -> bool {
        self.format.is_some()
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>, DecodeError> {
        let format = self.format.ok_or(DecodeError::NotOpen)?;
        let layout = self.layout(format);
        let needed: usize = layout.iter().map(|(stride, rows)| stride * rows).sum();
        if packet.data.len() < needed {
            return Err(DecodeError::Corrupt(format!(
                "raw picture needs {} bytes, got {}",
                needed,
                packet.data.len()
            )));
        }

        let mut offset = 0;
        let planes = layout
            .into_iter()
            .map(|(stride, rows)| {
                let data = packet.data[offset..offset + stride * rows].to_vec();
                offset += stride * rows;
                Plane { data, stride }
            })
            .collect();

        Ok(vec![VideoFrame {
            pts: packet.best_pts(),
            width: self.width,
            height: self.height,
            format,
            planes,
        }])
    }

    fn name(&self) -> &str {
        "rawvideo"
    }
}
