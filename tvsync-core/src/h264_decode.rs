//! OpenH264 software decoder
//!
//! OpenH264 consumes Annex B. Length-prefixed packets (MP4/MKV style) are
//! rewritten with the NAL length size taken from the avcC extradata, and the
//! parameter sets from extradata are fed once at open.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use openh264::decoder::Decoder as OpenH264;
use openh264::formats::YUVSource;

use crate::bitstream::{self, is_annexb};
use crate::decode::{DecodeError, Decoder, FrameFormat, Plane, VideoFrame};
use crate::packet::{CodecId, CodecParams, Packet, Pts, NO_PTS};

/// Bound on PTS kept for packets that never produced a picture
const MAX_PENDING_PTS: usize = 16;

pub struct OpenH264Decoder {
    decoder: Option<OpenH264>,
    nal_length_size: usize,
    /// PTS of submitted packets still waiting for a picture. Pictures come
    /// out in display order, so each takes the smallest pending PTS.
    pending_pts: BinaryHeap<Reverse<Pts>>,
}

impl OpenH264Decoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            nal_length_size: 4,
            pending_pts: BinaryHeap::new(),
        }
    }

    fn to_annexb(&self, data: &[u8]) -> Vec<u8> {
        if is_annexb(data) {
            data.to_vec()
        } else {
            bitstream::avcc_to_annexb(data, self.nal_length_size)
        }
    }
}

impl Default for OpenH264Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for OpenH264Decoder {
    type Frame = VideoFrame;

    fn open(&mut self, params: &CodecParams) -> Result<(), DecodeError> {
        if params.codec != CodecId::H264 {
            return Err(DecodeError::UnsupportedCodec(format!("{:?}", params.codec)));
        }

        let mut decoder = OpenH264::new().map_err(|e| DecodeError::Open(e.to_string()))?;

        if let Some(extra) = params.extradata.as_deref() {
            let sets = if is_annexb(extra) {
                Some(extra.to_vec())
            } else {
                bitstream::parse_avcc_extradata(extra).map(|(sets, nal_length_size)| {
                    self.nal_length_size = nal_length_size;
                    sets
                })
            };
            if let Some(sets) = sets {
                // Parameter sets alone never yield a picture
                if let Err(e) = decoder.decode(&sets) {
                    tracing::warn!("OpenH264 rejected parameter sets: {}", e);
                }
            }
        }

        tracing::info!("OpenH264 decoder created for {}x{}", params.width, params.height);
        self.decoder = Some(decoder);
        self.pending_pts.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.decoder = None;
        self.pending_pts.clear();
    }

    fn is_open(&self) -> bool {
        self.decoder.is_some()
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>, DecodeError> {
        if self.decoder.is_none() {
            return Err(DecodeError::NotOpen);
        }
        let annexb = self.to_annexb(&packet.data);
        let pts = packet.best_pts();
        if pts != NO_PTS {
            self.pending_pts.push(Reverse(pts));
            while self.pending_pts.len() > MAX_PENDING_PTS {
                self.pending_pts.pop();
            }
        }

        let Some(decoder) = self.decoder.as_mut() else {
            return Err(DecodeError::NotOpen);
        };
        let yuv = match decoder.decode(&annexb) {
            Ok(Some(yuv)) => yuv,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => {
                self.pending_pts.retain(|Reverse(p)| *p != pts);
                return Err(DecodeError::Corrupt(e.to_string()));
            }
        };

        let (width, height) = yuv.dimensions();
        let (y_stride, u_stride, v_stride) = yuv.strides();
        let planes = vec![
            Plane { data: yuv.y().to_vec(), stride: y_stride },
            Plane { data: yuv.u().to_vec(), stride: u_stride },
            Plane { data: yuv.v().to_vec(), stride: v_stride },
        ];

        let pts = self.pending_pts.pop().map(|Reverse(p)| p).unwrap_or(NO_PTS);
        Ok(vec![VideoFrame {
            pts,
            width: width as u32,
            height: height as u32,
            format: FrameFormat::I420,
            planes,
        }])
    }

    fn reset(&mut self) {
        self.pending_pts.clear();
    }

    fn name(&self) -> &str {
        "OpenH264"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_other_codecs() {
        let mut dec = OpenH264Decoder::new();
        let err = dec
            .open(&CodecParams::audio(CodecId::Aac, 48_000, 2))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedCodec(_)));
    }

    #[test]
    fn test_decode_before_open() {
        let mut dec = OpenH264Decoder::new();
        let err = dec.decode(&Packet::new(0, 0, vec![0, 0, 0, 1, 0x65])).unwrap_err();
        assert!(matches!(err, DecodeError::NotOpen));
    }

    #[test]
    fn test_length_prefixed_input_is_rewritten() {
        let dec = OpenH264Decoder::new();
        let avcc = [0x00, 0x00, 0x00, 0x02, 0x65, 0x88];
        assert_eq!(dec.to_annexb(&avcc), vec![0, 0, 0, 1, 0x65, 0x88]);

        let annexb = [0x00, 0x00, 0x01, 0x65, 0x88];
        assert_eq!(dec.to_annexb(&annexb), annexb.to_vec());
    }
}
