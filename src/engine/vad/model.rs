//! ONNX inference for the Silero VAD model.
//!
//! The model is recurrent: an LSTM state tensor and a short context window
//! of trailing samples are carried between consecutive frames. A `VadModel`
//! therefore belongs to exactly one audio stream and is reset when its pool
//! instance is recycled.
//!
//! Tensor layout:
//! - inputs: `input` `[1, context + window]`, `state` `[2, 1, 128]`,
//!   `sr` `[1]` (int64)
//! - outputs: `output` `[1, 1]` speech probability, `stateN` `[2, 1, 128]`
//!   (older exports use separate `hn`/`cn`)

use std::path::Path;

use ndarray::Array3;
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::value::Value;
use tracing::{debug, info};

use crate::engine::EngineError;

/// LSTM state tensor: 2 * 1 * 128 elements.
const STATE_DIM_0: usize = 2;
const STATE_DIM_1: usize = 1;
const STATE_DIM_2: usize = 128;
const STATE_SIZE: usize = STATE_DIM_0 * STATE_DIM_1 * STATE_DIM_2;

/// Silero VAD ONNX session with its recurrent state.
pub struct VadModel {
    session: Session,
    window_size: usize,
    context: Vec<f32>,
    state: Array3<f32>,
    sample_rate: i64,
}

impl VadModel {
    /// Load the model from disk and initialize recurrent state to zeros.
    pub fn load(
        model_path: &Path,
        sample_rate: u32,
        window_size: usize,
        num_threads: usize,
    ) -> Result<Self, EngineError> {
        if !model_path.exists() {
            return Err(EngineError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = SessionBuilder::new()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(num_threads.max(1)))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| EngineError::Inference(format!("failed to load VAD model: {e}")))?;

        let context_size = context_size_for(sample_rate);

        info!(
            "Silero VAD model loaded (sample_rate={}, window_size={}, context={})",
            sample_rate, window_size, context_size
        );

        Ok(Self {
            session,
            window_size,
            context: vec![0.0; context_size],
            state: Array3::zeros((STATE_DIM_0, STATE_DIM_1, STATE_DIM_2)),
            sample_rate: sample_rate as i64,
        })
    }

    /// Samples per inference window.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Run one window through the model and return the speech probability.
    ///
    /// `frame` must be exactly `window_size` normalized samples.
    pub fn process(&mut self, frame: &[f32]) -> Result<f32, EngineError> {
        if frame.len() != self.window_size {
            return Err(EngineError::Inference(format!(
                "invalid VAD frame size: got {}, expected {}",
                frame.len(),
                self.window_size
            )));
        }

        let context_size = self.context.len();
        let mut input = Vec::with_capacity(context_size + frame.len());
        input.extend_from_slice(&self.context);
        input.extend_from_slice(frame);

        // Keep the frame tail as context for the next window.
        self.context.copy_from_slice(&frame[frame.len() - context_size..]);

        let input_len = input.len();
        let input_value = Value::from_array(([1, input_len], input))
            .map_err(|e| EngineError::Inference(format!("input tensor: {e}")))?
            .into();

        let state_data: Vec<f32> = self.state.iter().copied().collect();
        let state_value = Value::from_array(([STATE_DIM_0, STATE_DIM_1, STATE_DIM_2], state_data))
            .map_err(|e| EngineError::Inference(format!("state tensor: {e}")))?
            .into();

        let sr_value = Value::from_array(([1], vec![self.sample_rate]))
            .map_err(|e| EngineError::Inference(format!("sample rate tensor: {e}")))?
            .into();

        let inputs: Vec<(&str, Value)> = vec![
            ("input", input_value),
            ("state", state_value),
            ("sr", sr_value),
        ];

        let outputs = self
            .session
            .run(inputs)
            .map_err(|e| EngineError::Inference(format!("VAD inference: {e}")))?;

        let (_, output_data) = outputs
            .get("output")
            .ok_or_else(|| EngineError::Inference("no 'output' tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::Inference(format!("output tensor: {e}")))?;
        let probability = output_data.first().copied().unwrap_or(0.0);

        if let Some(state_tensor) = outputs.get("stateN") {
            let (_, state_data) = state_tensor
                .try_extract_tensor::<f32>()
                .map_err(|e| EngineError::Inference(format!("stateN tensor: {e}")))?;
            if state_data.len() == STATE_SIZE {
                self.state = Array3::from_shape_vec(
                    (STATE_DIM_0, STATE_DIM_1, STATE_DIM_2),
                    state_data.to_vec(),
                )
                .map_err(|e| EngineError::Inference(format!("state reshape: {e}")))?;
            }
        } else if let (Some(hn), Some(cn)) = (outputs.get("hn"), outputs.get("cn")) {
            // Older exports split the recurrent state in two.
            let (_, hn_data) = hn
                .try_extract_tensor::<f32>()
                .map_err(|e| EngineError::Inference(format!("hn tensor: {e}")))?;
            let (_, cn_data) = cn
                .try_extract_tensor::<f32>()
                .map_err(|e| EngineError::Inference(format!("cn tensor: {e}")))?;
            if hn_data.len() + cn_data.len() == STATE_SIZE {
                let mut combined = Vec::with_capacity(STATE_SIZE);
                combined.extend_from_slice(hn_data);
                combined.extend_from_slice(cn_data);
                self.state = Array3::from_shape_vec(
                    (STATE_DIM_0, STATE_DIM_1, STATE_DIM_2),
                    combined,
                )
                .map_err(|e| EngineError::Inference(format!("state reshape: {e}")))?;
            }
        }

        debug!("VAD speech probability: {:.4}", probability);
        Ok(probability)
    }

    /// Zero the LSTM state and context buffer.
    pub fn reset(&mut self) {
        self.state = Array3::zeros((STATE_DIM_0, STATE_DIM_1, STATE_DIM_2));
        self.context.iter_mut().for_each(|s| *s = 0.0);
    }
}

fn context_size_for(sample_rate: u32) -> usize {
    match sample_rate {
        8000 => 32,
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dimensions_consistent() {
        assert_eq!(STATE_DIM_0 * STATE_DIM_1 * STATE_DIM_2, STATE_SIZE);
        assert_eq!(STATE_SIZE, 256);
    }

    #[test]
    fn context_sizes_per_rate() {
        assert_eq!(context_size_for(8000), 32);
        assert_eq!(context_size_for(16000), 64);
    }
}
