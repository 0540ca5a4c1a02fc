//! Inference engine seams.
//!
//! The server core never names a concrete model. Voice activity detection,
//! speech recognition, and speaker embedding extraction are reached through
//! the traits in this module; the ONNX-backed implementations live in the
//! submodules and are constructed once at startup from configured model
//! paths. Tests substitute their own implementations through the same
//! traits.

pub mod embedding;
pub mod recognizer;
pub mod vad;

pub use embedding::{EmbeddingExtractor, OnnxEmbeddingExtractor};
pub use recognizer::{OnnxRecognizer, RecognitionEngine, RecognitionStream};
pub use vad::{
    Detector, DetectorFactory, FrameClassifier, SileroDetectorFactory, SpeechSegment,
    VoiceDetector,
};

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the inference engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The submitted clip is too short for the extractor to produce a vector.
    #[error("insufficient audio for embedding extraction")]
    InsufficientAudio,
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("unsupported VAD provider: {0}")]
    UnsupportedProvider(String),
    #[error("inference failed: {0}")]
    Inference(String),
}
