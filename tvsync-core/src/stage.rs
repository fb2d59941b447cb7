//! Shared pieces of the audio and video output stages

use serde::Serialize;
use thiserror::Error;

use crate::decode::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageKind {
    Audio,
    Video,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported by a stage's worker thread to whoever drives the pipeline
#[derive(Debug, Clone)]
pub enum StageEvent {
    /// The stream can no longer be decoded; the stage has stopped itself
    Fatal { stage: StageKind, error: String },
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("Failed to open {stage} decoder: {source}")]
    Open {
        stage: StageKind,
        #[source]
        source: DecodeError,
    },
    #[error("Failed to spawn {stage} decode thread: {source}")]
    Spawn {
        stage: StageKind,
        #[source]
        source: std::io::Error,
    },
}
