//! Segment assembly for the buffering detector variant.
//!
//! Pure state machine: consumes (frame, speech probability) pairs and
//! produces complete utterances. Keeping this separate from the ONNX model
//! lets the segmentation policy be tested without a model file.

use std::collections::VecDeque;

use super::SpeechSegment;

/// Segmentation policy, in samples at the pipeline sample rate.
#[derive(Debug, Clone)]
pub struct SegmentAssemblerConfig {
    /// Speech probability threshold.
    pub threshold: f32,
    /// Continuous silence that completes an utterance.
    pub min_silence_samples: usize,
    /// Utterances are force-split at this length.
    pub max_speech_samples: usize,
    /// Initial capacity of the accumulator.
    pub capacity_hint: usize,
}

/// Assembles speech segments from per-frame probabilities.
pub struct SegmentAssembler {
    config: SegmentAssemblerConfig,
    in_speech: bool,
    current: Vec<f32>,
    silence_run: usize,
    completed: VecDeque<SpeechSegment>,
}

impl SegmentAssembler {
    pub fn new(config: SegmentAssemblerConfig) -> Self {
        let capacity = config.capacity_hint.min(config.max_speech_samples.max(1));
        Self {
            config,
            in_speech: false,
            current: Vec::with_capacity(capacity),
            silence_run: 0,
            completed: VecDeque::new(),
        }
    }

    /// Feed one model window and its speech probability.
    pub fn push(&mut self, frame: &[f32], probability: f32) {
        let is_speech = probability > self.config.threshold;

        if is_speech {
            if !self.in_speech {
                self.in_speech = true;
                self.current.clear();
            }
            self.silence_run = 0;
            self.current.extend_from_slice(frame);

            if self.current.len() >= self.config.max_speech_samples {
                self.finalize_current();
                // Still inside speech: the next frame opens a new segment.
                self.in_speech = false;
            }
        } else if self.in_speech {
            // Trailing silence is kept in the segment until the run is long
            // enough to end the utterance.
            self.current.extend_from_slice(frame);
            self.silence_run += frame.len();

            if self.silence_run >= self.config.min_silence_samples {
                self.finalize_current();
                self.in_speech = false;
                self.silence_run = 0;
            }
        }
    }

    fn finalize_current(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let mut samples = std::mem::take(&mut self.current);
        samples.truncate(self.config.max_speech_samples);
        self.completed.push_back(SpeechSegment { samples });
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    pub fn pop_front(&mut self) -> Option<SpeechSegment> {
        self.completed.pop_front()
    }

    /// Drop pending segments and any partially assembled utterance.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.current.clear();
        self.silence_run = 0;
        self.completed.clear();
    }
}
