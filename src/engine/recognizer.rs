//! Offline speech recognition seam and the ONNX-backed implementation.
//!
//! The engine is shared across all sessions and is safe for concurrent use
//! through per-request stream objects: every speech segment gets its own
//! [`RecognitionStream`], which accepts one waveform, decodes once, and is
//! dropped afterwards.

use std::path::Path;
use std::sync::{Arc, Mutex};

use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::Value;
use tracing::info;

use super::EngineError;
use crate::config::RecognitionSection;

/// Shared offline recognition engine.
pub trait RecognitionEngine: Send + Sync {
    /// Create a stream for one recognition request.
    fn create_stream(&self) -> Result<Box<dyn RecognitionStream>, EngineError>;
}

/// A single-use decoding stream. Dropping the stream releases its resources.
pub trait RecognitionStream: Send {
    /// Submit the complete utterance waveform.
    fn accept_waveform(&mut self, sample_rate: u32, samples: &[f32]);

    /// Decode the submitted audio and return the transcript.
    fn decode(&mut self) -> Result<String, EngineError>;
}

/// CTC acoustic model: waveform in, per-frame token logits out, greedy
/// decode against a token table.
pub struct OnnxRecognizer {
    session: Arc<Mutex<Session>>,
    tokens: Arc<Vec<String>>,
}

/// Token id 0 is the CTC blank by convention of the exported models.
const BLANK_ID: usize = 0;

impl OnnxRecognizer {
    /// Load the acoustic model and its token table.
    pub fn new(config: &RecognitionSection) -> Result<Self, EngineError> {
        if !config.model_path.exists() {
            return Err(EngineError::ModelNotFound(config.model_path.clone()));
        }
        if !config.tokens_path.exists() {
            return Err(EngineError::ModelNotFound(config.tokens_path.clone()));
        }

        let session = SessionBuilder::new()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(config.num_threads.max(1)))
            .and_then(|b| b.commit_from_file(&config.model_path))
            .map_err(|e| EngineError::Inference(format!("failed to load recognizer: {e}")))?;

        let tokens = load_tokens(&config.tokens_path)?;
        info!(
            "Recognition model loaded ({} tokens, {} threads)",
            tokens.len(),
            config.num_threads
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tokens: Arc::new(tokens),
        })
    }
}

impl RecognitionEngine for OnnxRecognizer {
    fn create_stream(&self) -> Result<Box<dyn RecognitionStream>, EngineError> {
        Ok(Box::new(OnnxStream {
            session: Arc::clone(&self.session),
            tokens: Arc::clone(&self.tokens),
            samples: Vec::new(),
        }))
    }
}

struct OnnxStream {
    session: Arc<Mutex<Session>>,
    tokens: Arc<Vec<String>>,
    samples: Vec<f32>,
}

impl RecognitionStream for OnnxStream {
    fn accept_waveform(&mut self, _sample_rate: u32, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    fn decode(&mut self) -> Result<String, EngineError> {
        if self.samples.is_empty() {
            return Ok(String::new());
        }

        let input = std::mem::take(&mut self.samples);
        let input_len = input.len();
        let input_value = Value::from_array(([1, input_len], input))
            .map_err(|e| EngineError::Inference(format!("input tensor: {e}")))?
            .into();

        let inputs: Vec<(&str, Value)> = vec![("input", input_value)];
        let mut session = self
            .session
            .lock()
            .map_err(|_| EngineError::Inference("recognizer session poisoned".to_string()))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| EngineError::Inference(format!("recognition inference: {e}")))?;

        let (shape, logits) = outputs
            .get("logits")
            .or_else(|| outputs.get("output"))
            .ok_or_else(|| EngineError::Inference("no logits tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Inference(format!("logits tensor: {e}")))?;

        // Expect [1, frames, vocab].
        if shape.len() != 3 {
            return Err(EngineError::Inference(format!(
                "unexpected logits rank: {:?}",
                shape
            )));
        }
        let frames = shape[1] as usize;
        let vocab = shape[2] as usize;

        let mut ids = Vec::with_capacity(frames);
        for t in 0..frames {
            let row = &logits[t * vocab..(t + 1) * vocab];
            let best = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(BLANK_ID);
            ids.push(best);
        }

        Ok(render_tokens(&greedy_collapse(&ids, BLANK_ID), &self.tokens))
    }
}

/// Collapse a CTC alignment: drop repeats, then drop blanks.
fn greedy_collapse(ids: &[usize], blank: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut previous = None;
    for &id in ids {
        if Some(id) != previous && id != blank {
            out.push(id);
        }
        previous = Some(id);
    }
    out
}

/// Map token ids through the table, expanding sentencepiece word markers.
fn render_tokens(ids: &[usize], tokens: &[String]) -> String {
    let mut text = String::new();
    for &id in ids {
        let Some(token) = tokens.get(id) else {
            continue;
        };
        if token.starts_with('<') && token.ends_with('>') {
            // <blk>, <unk>, <sos/eos> and friends carry no text.
            continue;
        }
        text.push_str(&token.replace('\u{2581}', " "));
    }
    text.trim().to_string()
}

/// Parse a `token id` table, one entry per line.
fn load_tokens(path: &Path) -> Result<Vec<String>, EngineError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::Inference(format!("failed to read tokens file: {e}")))?;

    let mut entries: Vec<(usize, String)> = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (token, id) = match line.rsplit_once(char::is_whitespace) {
            Some((token, id)) => (token.to_string(), id),
            // A line holding only an id maps a literal space token.
            None => (" ".to_string(), line),
        };
        let id: usize = id
            .parse()
            .map_err(|_| EngineError::Inference(format!("bad tokens line: {line:?}")))?;
        entries.push((id, token));
    }

    let size = entries.iter().map(|(id, _)| id + 1).max().unwrap_or(0);
    let mut table = vec![String::new(); size];
    for (id, token) in entries {
        table[id] = token;
    }
    Ok(table)
}
