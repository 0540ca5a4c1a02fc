//! Voice activity detection seams and the Silero-backed implementations.
//!
//! Two detector variants exist behind one interface:
//!
//! - **Buffering** ([`VoiceDetector`]): the detector assembles complete
//!   utterances internally and exposes a segment queue
//!   (accept / is_empty / pop / reset).
//! - **Frame-level** ([`FrameClassifier`]): the detector labels fixed-size
//!   hops speech/non-speech and the session assembles utterances.
//!
//! Detectors are *not* safe for concurrent use; the pool hands each one to
//! at most one session at a time.

mod model;
mod segmenter;

pub use model::VadModel;
pub use segmenter::{SegmentAssembler, SegmentAssemblerConfig};

use super::EngineError;
use crate::config::ServerConfig;

/// Type tag for the buffering (Silero) variant.
pub const SILERO_TYPE: &str = "silero_vad";
/// Type tag for the frame-level variant.
pub const TEN_TYPE: &str = "ten_vad";

/// VAD inference is lightweight; a single thread is sufficient.
const VAD_NUM_THREADS: usize = 1;

/// A complete speech utterance emitted by a detector.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Mono f32 samples in [-1, 1] at the pipeline sample rate.
    pub samples: Vec<f32>,
}

/// Buffering detector: utterance assembly happens inside the detector.
pub trait VoiceDetector: Send {
    /// Feed normalized samples; may complete zero or more segments.
    fn accept_waveform(&mut self, samples: &[f32]) -> Result<(), EngineError>;

    /// Whether the internal segment queue is empty.
    fn is_empty(&self) -> bool;

    /// Dequeue the oldest completed segment.
    fn pop_front(&mut self) -> Option<SpeechSegment>;

    /// Drop all pending segments and accumulated state.
    fn reset(&mut self);
}

/// Frame-level detector: yields one speech/non-speech flag per hop.
pub trait FrameClassifier: Send {
    /// Samples per classified hop.
    fn hop_size(&self) -> usize;

    /// Classify one hop. Short final hops are accepted.
    fn classify(&mut self, frame: &[f32]) -> Result<bool, EngineError>;

    /// Clear model state.
    fn reset(&mut self);
}

/// A detector instance, tagged by variant.
///
/// Variant-specific tuning travels with the variant: the buffering side
/// carries segmentation policy inside the detector, the frame-level side
/// leaves it to the session.
pub enum Detector {
    Buffering(Box<dyn VoiceDetector>),
    FrameLevel(Box<dyn FrameClassifier>),
}

impl Detector {
    /// The configured provider tag for this variant.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Detector::Buffering(_) => SILERO_TYPE,
            Detector::FrameLevel(_) => TEN_TYPE,
        }
    }

    /// Reset detector state; for the buffering variant this drains the
    /// pending segment queue.
    pub fn reset(&mut self) {
        match self {
            Detector::Buffering(d) => d.reset(),
            Detector::FrameLevel(c) => c.reset(),
        }
    }
}

/// Builds detector instances for the pool: both the pre-constructed set at
/// initialization and transient instances on pool exhaustion.
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Result<Detector, EngineError>;

    /// The provider tag of the detectors this factory builds.
    fn detector_type(&self) -> &'static str;
}

/// Which detector variant a factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadVariant {
    Buffering,
    FrameLevel,
}

/// Factory for Silero-model-backed detectors.
///
/// Each `create` call loads a fresh ONNX session: detector instances carry
/// recurrent model state and are owned exclusively by one session at a
/// time, so they cannot share a session object.
pub struct SileroDetectorFactory {
    variant: VadVariant,
    model_path: std::path::PathBuf,
    sample_rate: u32,
    window_size: usize,
    num_threads: usize,
    threshold: f32,
    assembler: SegmentAssemblerConfig,
    hop_size: usize,
}

impl SileroDetectorFactory {
    /// Build a factory from the server configuration.
    ///
    /// Fails when the model file is missing or the configured provider is
    /// unknown; both abort startup.
    pub fn from_config(config: &ServerConfig) -> Result<Self, EngineError> {
        let variant = match config.vad.provider.as_str() {
            SILERO_TYPE => VadVariant::Buffering,
            TEN_TYPE => VadVariant::FrameLevel,
            other => return Err(EngineError::UnsupportedProvider(other.to_string())),
        };

        let silero = &config.vad.silero_vad;
        if !silero.model_path.exists() {
            return Err(EngineError::ModelNotFound(silero.model_path.clone()));
        }

        let sample_rate = config.audio.sample_rate;
        Ok(Self {
            variant,
            model_path: silero.model_path.clone(),
            sample_rate,
            window_size: silero.window_size,
            num_threads: VAD_NUM_THREADS,
            threshold: silero.threshold,
            assembler: SegmentAssemblerConfig {
                threshold: silero.threshold,
                min_silence_samples: (silero.min_silence_duration * sample_rate as f32) as usize,
                max_speech_samples: (silero.max_speech_duration * sample_rate as f32) as usize,
                capacity_hint: (silero.buffer_size_seconds * sample_rate as f32) as usize,
            },
            hop_size: config.vad.ten_vad.hop_size,
        })
    }
}

impl DetectorFactory for SileroDetectorFactory {
    fn create(&self) -> Result<Detector, EngineError> {
        let model = VadModel::load(
            &self.model_path,
            self.sample_rate,
            self.window_size,
            self.num_threads,
        )?;

        Ok(match self.variant {
            VadVariant::Buffering => Detector::Buffering(Box::new(SileroDetector::new(
                model,
                self.assembler.clone(),
            ))),
            VadVariant::FrameLevel => Detector::FrameLevel(Box::new(SileroFrameClassifier::new(
                model,
                self.threshold,
                self.hop_size,
            ))),
        })
    }

    fn detector_type(&self) -> &'static str {
        match self.variant {
            VadVariant::Buffering => SILERO_TYPE,
            VadVariant::FrameLevel => TEN_TYPE,
        }
    }
}

/// Buffering detector combining the Silero model with segment assembly.
pub struct SileroDetector {
    model: VadModel,
    assembler: SegmentAssembler,
    /// Samples waiting for a full model window.
    pending: Vec<f32>,
}

impl SileroDetector {
    pub fn new(model: VadModel, config: SegmentAssemblerConfig) -> Self {
        let window = model.window_size();
        Self {
            model,
            assembler: SegmentAssembler::new(config),
            pending: Vec::with_capacity(window * 2),
        }
    }
}

impl VoiceDetector for SileroDetector {
    fn accept_waveform(&mut self, samples: &[f32]) -> Result<(), EngineError> {
        self.pending.extend_from_slice(samples);

        let window = self.model.window_size();
        while self.pending.len() >= window {
            let frame: Vec<f32> = self.pending.drain(..window).collect();
            let probability = self.model.process(&frame)?;
            self.assembler.push(&frame, probability);
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.assembler.is_empty()
    }

    fn pop_front(&mut self) -> Option<SpeechSegment> {
        self.assembler.pop_front()
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.assembler.reset();
        self.model.reset();
    }
}

/// Frame-level classifier backed by the same Silero model.
pub struct SileroFrameClassifier {
    model: VadModel,
    threshold: f32,
    hop_size: usize,
    /// Scratch window reused across hops.
    window: Vec<f32>,
}

impl SileroFrameClassifier {
    pub fn new(model: VadModel, threshold: f32, hop_size: usize) -> Self {
        let window_size = model.window_size();
        Self {
            model,
            threshold,
            hop_size,
            window: vec![0.0; window_size],
        }
    }
}

impl FrameClassifier for SileroFrameClassifier {
    fn hop_size(&self) -> usize {
        self.hop_size
    }

    fn classify(&mut self, frame: &[f32]) -> Result<bool, EngineError> {
        // Zero-pad short hops up to the model window.
        let take = frame.len().min(self.window.len());
        self.window[..take].copy_from_slice(&frame[..take]);
        for slot in self.window[take..].iter_mut() {
            *slot = 0.0;
        }
        let probability = self.model.process(&self.window)?;
        Ok(probability > self.threshold)
    }

    fn reset(&mut self) {
        self.model.reset();
    }
}
