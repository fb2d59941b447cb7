//! Audio decoding via symphonia
//!
//! Packets come from an external demuxer, so the symphonia decoder is built
//! straight from codec parameters (no format reader). Output is always
//! interleaved stereo f32 at the stream's sample rate.

use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{
    CodecParameters, CodecType, DecoderOptions, CODEC_TYPE_AAC, CODEC_TYPE_FLAC, CODEC_TYPE_MP3,
    CODEC_TYPE_PCM_F32LE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_VORBIS,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::sample::SampleFormat;

use crate::decode::{AudioFrame, DecodeError, Decoder};
use crate::packet::{CodecId, CodecParams, Packet, NO_PTS};

/// Largest PCM packet we accept, in frames
const PCM_MAX_FRAMES_PER_PACKET: u64 = 16_384;

fn codec_type(codec: CodecId) -> Option<CodecType> {
    match codec {
        CodecId::Aac => Some(CODEC_TYPE_AAC),
        CodecId::Mp3 => Some(CODEC_TYPE_MP3),
        CodecId::Flac => Some(CODEC_TYPE_FLAC),
        CodecId::Vorbis => Some(CODEC_TYPE_VORBIS),
        CodecId::PcmF32Le => Some(CODEC_TYPE_PCM_F32LE),
        CodecId::PcmS16Le => Some(CODEC_TYPE_PCM_S16LE),
        _ => None,
    }
}

fn channel_layout(channels: u16) -> Channels {
    match channels {
        1 => Channels::FRONT_CENTRE,
        _ => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
    }
}

/// Fold any channel count into interleaved stereo.
/// Mono is duplicated, extra channels beyond the first two are dropped.
pub fn to_stereo(interleaved: &[f32], channels: usize) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        2 => interleaved.to_vec(),
        1 => interleaved.iter().flat_map(|s| [*s, *s]).collect(),
        n => interleaved
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    }
}

pub struct SymphoniaAudioDecoder {
    decoder: Option<Box<dyn symphonia::core::codecs::Decoder>>,
    sample_rate: u32,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl SymphoniaAudioDecoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            sample_rate: 0,
            sample_buf: None,
        }
    }

    fn build_params(params: &CodecParams) -> Result<CodecParameters, DecodeError> {
        let codec = codec_type(params.codec)
            .ok_or_else(|| DecodeError::UnsupportedCodec(format!("{:?}", params.codec)))?;

        let mut cp = CodecParameters::new();
        cp.for_codec(codec)
            .with_sample_rate(params.sample_rate)
            .with_channels(channel_layout(params.channels));

        match params.codec {
            CodecId::PcmF32Le => {
                cp.with_sample_format(SampleFormat::F32)
                    .with_bits_per_sample(32)
                    .with_bits_per_coded_sample(32)
                    .with_max_frames_per_packet(PCM_MAX_FRAMES_PER_PACKET);
            }
            CodecId::PcmS16Le => {
                cp.with_sample_format(SampleFormat::S16)
                    .with_bits_per_sample(16)
                    .with_bits_per_coded_sample(16)
                    .with_max_frames_per_packet(PCM_MAX_FRAMES_PER_PACKET);
            }
            _ => {}
        }

        if let Some(extra) = &params.extradata {
            cp.with_extra_data(extra.to_vec().into_boxed_slice());
        }
        Ok(cp)
    }
}

impl Default for SymphoniaAudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SymphoniaAudioDecoder {
    type Frame = AudioFrame;

    fn open(&mut self, params: &CodecParams) -> Result<(), DecodeError> {
        let cp = Self::build_params(params)?;
        let decoder = symphonia::default::get_codecs()
            .make(&cp, &DecoderOptions::default())
            .map_err(|e| DecodeError::Open(e.to_string()))?;

        tracing::info!(
            "Audio decoder opened: {:?} {}Hz {}ch",
            params.codec,
            params.sample_rate,
            params.channels
        );
        self.decoder = Some(decoder);
        self.sample_rate = params.sample_rate;
        self.sample_buf = None;
        Ok(())
    }

    fn close(&mut self) {
        self.decoder = None;
        self.sample_buf = None;
    }

    fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<AudioFrame>, DecodeError> {
        let decoder = self.decoder.as_mut().ok_or(DecodeError::NotOpen)?;

        let ts = if packet.has_pts() { packet.best_pts().max(0) as u64 } else { 0 };
        let sym_packet = symphonia::core::formats::Packet::new_from_slice(0, ts, 0, &packet.data);

        let decoded = match decoder.decode(&sym_packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                return Err(DecodeError::Corrupt(e.to_string()));
            }
            Err(SymphoniaError::ResetRequired) => {
                tracing::debug!("Audio decoder requested reset");
                decoder.reset();
                return Ok(Vec::new());
            }
            Err(e) => return Err(DecodeError::Fatal(e.to_string())),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if decoded.frames() == 0 || channels == 0 {
            return Ok(Vec::new());
        }

        let needs_new_buf = self
            .sample_buf
            .as_ref()
            .map(|b| b.capacity() < decoded.capacity() * channels)
            .unwrap_or(true);
        if needs_new_buf {
            self.sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }

        let Some(buf) = self.sample_buf.as_mut() else {
            return Ok(Vec::new());
        };
        buf.copy_interleaved_ref(decoded);

        let sample_rate = if spec.rate > 0 { spec.rate } else { self.sample_rate };
        Ok(vec![AudioFrame {
            pts: if packet.has_pts() { packet.best_pts() } else { NO_PTS },
            samples: to_stereo(buf.samples(), channels),
            sample_rate,
        }])
    }

    fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
    }

    fn name(&self) -> &str {
        "symphonia"
    }
}
