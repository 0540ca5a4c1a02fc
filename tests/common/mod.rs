//! Shared stubs and server bootstrap for integration tests.
//!
//! All inference engines are replaced through the public engine traits so
//! the full pipeline runs without model files.
#![allow(dead_code)]

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use voiceline::ServerConfig;
use voiceline::engine::{
    Detector, DetectorFactory, EmbeddingExtractor, RecognitionEngine, RecognitionStream,
    SpeechSegment, VoiceDetector,
};
use voiceline::engine::EngineError;
use voiceline::routes;
use voiceline::state::AppState;

/// Amplitude above which a sample counts as speech for [`EnergyDetector`].
pub const SPEECH_AMPLITUDE: f32 = 0.05;
/// Samples of continuous quiet that complete a segment.
pub const SILENCE_SAMPLES: usize = 2048;

/// Buffering detector stub: segments on amplitude, so silence produces
/// nothing and a loud burst followed by quiet produces one utterance.
pub struct EnergyDetector {
    in_speech: bool,
    current: Vec<f32>,
    silence_run: usize,
    completed: Vec<SpeechSegment>,
}

impl EnergyDetector {
    pub fn new() -> Self {
        Self {
            in_speech: false,
            current: Vec::new(),
            silence_run: 0,
            completed: Vec::new(),
        }
    }
}

impl VoiceDetector for EnergyDetector {
    fn accept_waveform(&mut self, samples: &[f32]) -> Result<(), EngineError> {
        for &sample in samples {
            if sample.abs() > SPEECH_AMPLITUDE {
                if !self.in_speech {
                    self.in_speech = true;
                    self.current.clear();
                }
                self.current.push(sample);
                self.silence_run = 0;
            } else if self.in_speech {
                self.current.push(sample);
                self.silence_run += 1;
                if self.silence_run >= SILENCE_SAMPLES {
                    self.completed.push(SpeechSegment {
                        samples: std::mem::take(&mut self.current),
                    });
                    self.in_speech = false;
                    self.silence_run = 0;
                }
            }
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    fn pop_front(&mut self) -> Option<SpeechSegment> {
        if self.completed.is_empty() {
            None
        } else {
            Some(self.completed.remove(0))
        }
    }

    fn reset(&mut self) {
        self.in_speech = false;
        self.current.clear();
        self.silence_run = 0;
        self.completed.clear();
    }
}

pub struct EnergyDetectorFactory;

impl DetectorFactory for EnergyDetectorFactory {
    fn create(&self) -> Result<Detector, EngineError> {
        Ok(Detector::Buffering(Box::new(EnergyDetector::new())))
    }
    fn detector_type(&self) -> &'static str {
        "silero_vad"
    }
}

/// Recognizer stub returning a fixed transcript for every utterance.
pub struct FixedRecognizer {
    pub text: &'static str,
}

impl RecognitionEngine for FixedRecognizer {
    fn create_stream(&self) -> Result<Box<dyn RecognitionStream>, EngineError> {
        Ok(Box::new(FixedStream {
            text: self.text,
            got_audio: false,
        }))
    }
}

struct FixedStream {
    text: &'static str,
    got_audio: bool,
}

impl RecognitionStream for FixedStream {
    fn accept_waveform(&mut self, _sample_rate: u32, samples: &[f32]) {
        self.got_audio = !samples.is_empty();
    }
    fn decode(&mut self) -> Result<String, EngineError> {
        Ok(if self.got_audio {
            self.text.to_string()
        } else {
            String::new()
        })
    }
}

/// Deterministic extractor: the embedding is the first `PREFIX_DIM`
/// samples of the clip, so identical clips embed identically and clips
/// with orthogonal prefixes embed orthogonally.
pub const PREFIX_DIM: usize = 4;

pub struct PrefixExtractor;

impl EmbeddingExtractor for PrefixExtractor {
    fn dim(&self) -> usize {
        PREFIX_DIM
    }
    fn compute(&self, _sample_rate: u32, samples: &[f32]) -> Result<Vec<f32>, EngineError> {
        if samples.len() < 8000 {
            return Err(EngineError::InsufficientAudio);
        }
        Ok(samples[..PREFIX_DIM].to_vec())
    }
}

/// Session manager statistics from a fully initialized test state.
pub fn session_stats(state: &AppState) -> voiceline::session::SessionManagerStats {
    state
        .session_manager
        .as_ref()
        .expect("session manager initialized")
        .stats()
}

/// Spawn a server over an uninitialized state: no pool, no session
/// manager. `/health` must report initializing.
pub async fn spawn_uninitialized_server(config: ServerConfig) -> SocketAddr {
    let state = AppState::uninitialized(config);
    let app = routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Spawn the server with stub engines on an ephemeral port.
pub async fn spawn_server(config: ServerConfig, with_speaker: bool) -> (SocketAddr, Arc<AppState>) {
    let extractor: Option<Arc<dyn EmbeddingExtractor>> = if with_speaker {
        Some(Arc::new(PrefixExtractor))
    } else {
        None
    };

    let state = AppState::with_engines(
        config,
        Arc::new(FixedRecognizer {
            text: "hello world",
        }),
        Arc::new(EnergyDetectorFactory),
        extractor,
    )
    .await
    .expect("state init");

    let app = routes::build_router(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

/// An in-memory 16-bit mono WAV clip whose first samples are `prefix`
/// (as raw i16 values), padded with `pad_samples` zeros.
pub fn wav_clip(prefix: &[i16], pad_samples: usize) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in prefix {
            writer.write_sample(s).unwrap();
        }
        for _ in 0..pad_samples {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Raw little-endian PCM frame with every sample set to `value`.
pub fn pcm_frame(samples: usize, value: i16) -> Vec<u8> {
    let mut data = Vec::with_capacity(samples * 2);
    for _ in 0..samples {
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}
