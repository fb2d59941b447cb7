//! cpal audio device pulling from an [`AudioOutput`]
//!
//! The stream is opened in stereo f32 at the pipeline's sample rate, so the
//! callback copies straight out of the ring buffer.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, SampleRate, Stream, StreamConfig};
use thiserror::Error;

use crate::audio_output::AudioOutput;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No audio output device")]
    NoDevice,
    #[error("Failed to build output stream: {0}")]
    Build(#[from] cpal::BuildStreamError),
    #[error("Failed to start output stream: {0}")]
    Play(#[from] cpal::PlayStreamError),
    #[error("Failed to pause output stream: {0}")]
    Pause(#[from] cpal::PauseStreamError),
}

/// Default output device, alive as long as this value is.
/// Not `Send` on every platform; keep it on the thread that opened it.
pub struct CpalOutput {
    stream: Stream,
    device_name: String,
}

impl CpalOutput {
    pub fn open(output: Arc<AudioOutput>, sample_rate: u32) -> Result<Self, DeviceError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or(DeviceError::NoDevice)?;
        let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());

        let config = StreamConfig {
            channels: 2,
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Default,
        };

        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                output.pull(data);
            },
            |err| tracing::error!("Audio stream error: {}", err),
            None,
        )?;
        stream.play()?;

        tracing::info!("Audio device {} opened at {}Hz stereo", device_name, sample_rate);
        Ok(Self {
            stream,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn pause(&self) -> Result<(), DeviceError> {
        self.stream.pause()?;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), DeviceError> {
        self.stream.play()?;
        Ok(())
    }
}
