//! Speaker identification: persisted voiceprint store, in-memory cosine
//! index, and the manager tying them to the embedding extractor.

pub mod index;
pub mod manager;
pub mod store;

pub use index::EmbeddingIndex;
pub use manager::{IdentifyResult, SpeakerInfo, SpeakerManager, SpeakerStats, VerifyResult};
pub use store::{SpeakerDatabase, SpeakerRecord};

use thiserror::Error;

use crate::audio::AudioError;
use crate::engine::EngineError;

/// Errors surfaced by the speaker module. The HTTP layer maps these onto
/// 400 (client-correctable input), 404 (unknown speaker), and 500.
#[derive(Debug, Error)]
pub enum SpeakerError {
    #[error("speaker {0} not found")]
    NotFound(String),
    #[error("insufficient audio data for embedding extraction")]
    InsufficientAudio,
    #[error("invalid WAV file: {0}")]
    InvalidWav(String),
    #[error("unsupported number of channels: {0}")]
    UnsupportedChannels(u16),
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("failed to persist speaker database: {0}")]
    Persistence(String),
    #[error("failed to extract embedding: {0}")]
    Extraction(String),
}

impl From<AudioError> for SpeakerError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::InvalidWav(msg) => SpeakerError::InvalidWav(msg),
            AudioError::UnsupportedChannels(n) => SpeakerError::UnsupportedChannels(n),
        }
    }
}

impl From<EngineError> for SpeakerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InsufficientAudio => SpeakerError::InsufficientAudio,
            other => SpeakerError::Extraction(other.to_string()),
        }
    }
}
