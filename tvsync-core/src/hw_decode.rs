// HW_DECODE - Hardware Video Decoder Adapter
//
// Wraps a platform hardware decoder behind the common Decoder trait.
// • The backend is opened with an avcC configuration record
// • Packets are submitted as length-prefixed NAL units
// • Decoded pictures come back on the backend's own thread through an HwSink,
//   which only posts into a channel. The adapter drains that inbox on its own
//   schedule and never gets called back.
// • Completions may arrive in any order; the adapter reorders by PTS.

use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::bitstream::{self, BitstreamError};
use crate::decode::{DecodeError, Decoder, VideoFrame};
use crate::packet::{CodecId, CodecParams, Packet, Pts};

/// How long `flush` keeps listening for stragglers after asking the backend
const FLUSH_WAIT: Duration = Duration::from_millis(50);

/// One asynchronous result from the backend
#[derive(Debug)]
pub struct HwCompletion {
    /// PTS of the packet this picture was decoded from
    pub pts: Pts,
    pub result: Result<VideoFrame, String>,
}

/// Handle the backend uses to deliver pictures from any thread
#[derive(Clone)]
pub struct HwSink {
    tx: Sender<HwCompletion>,
}

impl HwSink {
    /// Post a decoded picture. Returns false once the adapter is gone.
    pub fn deliver(&self, pts: Pts, frame: VideoFrame) -> bool {
        self.tx
            .send(HwCompletion {
                pts,
                result: Ok(frame),
            })
            .is_ok()
    }

    /// Post a per-picture decode failure
    pub fn fail(&self, pts: Pts, error: impl Into<String>) -> bool {
        self.tx
            .send(HwCompletion {
                pts,
                result: Err(error.into()),
            })
            .is_ok()
    }
}

/// Platform hardware decoder
pub trait HwBackend: Send {
    /// Open with an avcC configuration record
    fn open(&mut self, record: &[u8], params: &CodecParams, sink: HwSink) -> Result<(), String>;

    /// Submit one length-prefixed access unit. Must not block on decoding.
    fn submit(&mut self, data: &[u8], pts: Pts) -> Result<(), String>;

    /// Ask the backend to emit everything it is holding
    fn flush(&mut self) {}

    fn close(&mut self);

    fn name(&self) -> &str;
}

impl From<BitstreamError> for DecodeError {
    fn from(e: BitstreamError) -> Self {
        match e {
            BitstreamError::MissingSps => DecodeError::Open(e.to_string()),
            other => DecodeError::Corrupt(other.to_string()),
        }
    }
}

enum AdapterState {
    Closed,
    /// No extradata: waiting for a packet carrying SPS/PPS in-band
    AwaitingParameterSets(CodecParams),
    Open,
}

/// [`Decoder`] over an asynchronous [`HwBackend`]
pub struct HwDecodeAdapter<B: HwBackend> {
    backend: B,
    state: AdapterState,
    inbox: Option<Receiver<HwCompletion>>,
    /// (pts, arrival sequence) keeps pictures with equal PTS apart
    reorder: BTreeMap<(Pts, u64), VideoFrame>,
    reorder_depth: usize,
    sequence: u64,
    record: Vec<u8>,
    failed: u64,
}

impl<B: HwBackend> HwDecodeAdapter<B> {
    pub fn new(backend: B, reorder_depth: usize) -> Self {
        Self {
            backend,
            state: AdapterState::Closed,
            inbox: None,
            reorder: BTreeMap::new(),
            reorder_depth,
            sequence: 0,
            record: Vec::new(),
            failed: 0,
        }
    }

    /// Configuration record the backend was opened with
    pub fn record(&self) -> &[u8] {
        &self.record
    }

    /// Completions that reported a decode failure
    pub fn failed_pictures(&self) -> u64 {
        self.failed
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn open_backend(&mut self, record: Vec<u8>, params: &CodecParams) -> Result<(), DecodeError> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.backend
            .open(&record, params, HwSink { tx })
            .map_err(DecodeError::Open)?;

        tracing::info!(
            "Hardware decoder {} opened for {}x{} ({} byte config record)",
            self.backend.name(),
            params.width,
            params.height,
            record.len()
        );
        self.record = record;
        self.inbox = Some(rx);
        self.state = AdapterState::Open;
        Ok(())
    }

    fn accept(&mut self, completion: HwCompletion) {
        match completion.result {
            Ok(mut frame) => {
                frame.pts = completion.pts;
                self.sequence += 1;
                self.reorder.insert((completion.pts, self.sequence), frame);
            }
            Err(e) => {
                self.failed += 1;
                tracing::warn!("Hardware decode failed for pts {}: {}", completion.pts, e);
            }
        }
    }

    /// Move everything waiting in the inbox into the reorder buffer
    fn drain_inbox(&mut self) -> Result<(), DecodeError> {
        let Some(inbox) = self.inbox.clone() else {
            return Ok(());
        };
        loop {
            match inbox.try_recv() {
                Ok(completion) => self.accept(completion),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(DecodeError::Fatal(format!(
                        "{} stopped delivering pictures",
                        self.backend.name()
                    )));
                }
            }
        }
    }

    /// Release pictures in PTS order while more than `keep` are buffered
    fn release(&mut self, keep: usize) -> Vec<VideoFrame> {
        let mut out = Vec::new();
        while self.reorder.len() > keep {
            if let Some((_, frame)) = self.reorder.pop_first() {
                out.push(frame);
            }
        }
        out
    }
}

impl<B: HwBackend> Decoder for HwDecodeAdapter<B> {
    type Frame = VideoFrame;

    fn open(&mut self, params: &CodecParams) -> Result<(), DecodeError> {
        if params.codec != CodecId::H264 {
            return Err(DecodeError::UnsupportedCodec(format!("{:?}", params.codec)));
        }

        match params.extradata.as_deref() {
            Some(extra) if !extra.is_empty() => {
                let record = bitstream::convert_extradata(extra)?.as_bytes().to_vec();
                self.open_backend(record, params)
            }
            _ => {
                tracing::debug!("No extradata, waiting for in-band parameter sets");
                self.state = AdapterState::AwaitingParameterSets(params.clone());
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        if matches!(self.state, AdapterState::Open) {
            self.backend.close();
        }
        self.state = AdapterState::Closed;
        self.inbox = None;
        self.reorder.clear();
    }

    fn is_open(&self) -> bool {
        !matches!(self.state, AdapterState::Closed)
    }

    fn decode(&mut self, packet: &Packet) -> Result<Vec<VideoFrame>, DecodeError> {
        match &self.state {
            AdapterState::Closed => return Err(DecodeError::NotOpen),
            AdapterState::AwaitingParameterSets(params) => {
                if packet.data.len() < bitstream::MIN_CONFIG_LEN || !bitstream::is_annexb(&packet.data) {
                    return Ok(Vec::new());
                }
                let params = params.clone();
                match bitstream::build_avcc_record(&packet.data) {
                    Ok(record) => self.open_backend(record, &params)?,
                    Err(BitstreamError::MissingSps) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                }
            }
            AdapterState::Open => {}
        }

        let data = if bitstream::is_annexb(&packet.data) {
            bitstream::annexb_to_length_prefixed(&packet.data)?
        } else {
            packet.data.to_vec()
        };
        self.backend
            .submit(&data, packet.best_pts())
            .map_err(DecodeError::Fatal)?;

        self.drain_inbox()?;
        Ok(self.release(self.reorder_depth))
    }

    fn flush(&mut self) -> Vec<VideoFrame> {
        if matches!(self.state, AdapterState::Open) {
            self.backend.flush();
            if let Some(inbox) = self.inbox.clone() {
                loop {
                    match inbox.recv_timeout(FLUSH_WAIT) {
                        Ok(completion) => self.accept(completion),
                        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
        }
        self.release(0)
    }

    fn reset(&mut self) {
        if let Some(inbox) = &self.inbox {
            while inbox.try_recv().is_ok() {}
        }
        self.reorder.clear();
    }

    fn name(&self) -> &str {
        self.backend.name()
    }
}
