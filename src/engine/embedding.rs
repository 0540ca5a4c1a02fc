//! Speaker embedding extraction seam and the ONNX-backed implementation.

use std::sync::{Arc, Mutex};

use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::Value;
use tracing::info;

use super::EngineError;
use crate::config::SpeakerSection;

/// Clips shorter than this cannot produce a stable voiceprint.
const MIN_CLIP_SECONDS: f32 = 0.5;

/// Produces fixed-length voiceprint vectors from mono audio clips.
pub trait EmbeddingExtractor: Send + Sync {
    /// Embedding dimension D; every produced vector has this length.
    fn dim(&self) -> usize;

    /// Extract one embedding from a complete clip.
    ///
    /// Returns [`EngineError::InsufficientAudio`] when the clip is too
    /// short for the model to be ready.
    fn compute(&self, sample_rate: u32, samples: &[f32]) -> Result<Vec<f32>, EngineError>;
}

/// Waveform-in / vector-out speaker embedding model.
pub struct OnnxEmbeddingExtractor {
    session: Arc<Mutex<Session>>,
    dim: usize,
}

impl OnnxEmbeddingExtractor {
    /// Load the model and establish the embedding dimension with a warmup
    /// inference over one second of silence.
    pub fn new(config: &SpeakerSection) -> Result<Self, EngineError> {
        if !config.model_path.exists() {
            return Err(EngineError::ModelNotFound(config.model_path.clone()));
        }

        let session = SessionBuilder::new()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(config.num_threads.max(1)))
            .and_then(|b| b.commit_from_file(&config.model_path))
            .map_err(|e| EngineError::Inference(format!("failed to load speaker model: {e}")))?;

        let mut extractor = Self {
            session: Arc::new(Mutex::new(session)),
            dim: 0,
        };
        let warmup = extractor.run(&vec![0.0f32; 16000])?;
        extractor.dim = warmup.len();
        info!("Speaker embedding model loaded (dim={})", extractor.dim);

        Ok(extractor)
    }

    fn run(&self, samples: &[f32]) -> Result<Vec<f32>, EngineError> {
        let input_len = samples.len();
        let input_value = Value::from_array(([1, input_len], samples.to_vec()))
            .map_err(|e| EngineError::Inference(format!("input tensor: {e}")))?
            .into();

        let inputs: Vec<(&str, Value)> = vec![("input", input_value)];
        let mut session = self
            .session
            .lock()
            .map_err(|_| EngineError::Inference("speaker session poisoned".to_string()))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| EngineError::Inference(format!("embedding inference: {e}")))?;

        let (_, embedding) = outputs
            .get("embedding")
            .or_else(|| outputs.get("output"))
            .ok_or_else(|| EngineError::Inference("no embedding tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Inference(format!("embedding tensor: {e}")))?;

        if embedding.is_empty() {
            return Err(EngineError::Inference("empty embedding".to_string()));
        }
        Ok(embedding.to_vec())
    }
}

impl EmbeddingExtractor for OnnxEmbeddingExtractor {
    fn dim(&self) -> usize {
        self.dim
    }

    fn compute(&self, sample_rate: u32, samples: &[f32]) -> Result<Vec<f32>, EngineError> {
        let min_samples = (MIN_CLIP_SECONDS * sample_rate as f32) as usize;
        if samples.len() < min_samples {
            return Err(EngineError::InsufficientAudio);
        }
        self.run(samples)
    }
}
