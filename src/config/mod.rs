//! Configuration module for the Voiceline server
//!
//! Configuration is loaded from a YAML file; every key carries a default so
//! the server is runnable with a partial (or missing) file. After loading,
//! the final configuration is validated before any component is constructed.
//!
//! # Example
//! ```rust,no_run
//! use voiceline::config::ServerConfig;
//! use std::path::Path;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ServerConfig::from_file(Path::new("config.yaml"))?;
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level server configuration.
///
/// Mirrors the recognized option keys:
/// - `server`: bind address and WebSocket limits
/// - `session`: outbound queue depth and send-error threshold
/// - `vad`: detector variant, pool size, per-variant tuning
/// - `recognition`: offline recognizer model settings
/// - `speaker`: speaker identification module settings
/// - `audio`: PCM interpretation on both ingest paths
/// - `response`: per-frame VAD processing deadline
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub session: SessionSection,
    pub vad: VadSection,
    pub recognition: RecognitionSection,
    pub speaker: SpeakerSection,
    pub audio: AudioSection,
    pub response: ResponseSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub websocket: WebSocketSection,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            websocket: WebSocketSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketSection {
    /// Per-frame read deadline in seconds. Refreshed on every inbound frame;
    /// 0 disables the deadline.
    pub read_timeout: u64,
    /// Inbound frames larger than this close the session. 0 disables the cap.
    pub max_message_size: usize,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            read_timeout: 300,
            max_message_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Outbound message queue depth per session.
    pub send_queue_size: usize,
    /// Consecutive send errors before a session is forcibly closed.
    pub max_send_errors: u32,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            send_queue_size: 100,
            max_send_errors: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadSection {
    /// Detector variant: `silero_vad` (buffering) or `ten_vad` (frame-level).
    pub provider: String,
    /// Number of detectors constructed at pool initialization.
    pub pool_size: usize,
    pub silero_vad: SileroVadSection,
    pub ten_vad: TenVadSection,
}

impl Default for VadSection {
    fn default() -> Self {
        Self {
            provider: "silero_vad".to_string(),
            pool_size: 4,
            silero_vad: SileroVadSection::default(),
            ten_vad: TenVadSection::default(),
        }
    }
}

/// Tuning for the buffering (Silero) detector variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SileroVadSection {
    pub model_path: PathBuf,
    /// Speech probability threshold (0.0 to 1.0).
    pub threshold: f32,
    /// Seconds of continuous silence that complete an utterance.
    pub min_silence_duration: f32,
    /// Segments shorter than this many seconds are discarded.
    pub min_speech_duration: f32,
    /// Segments longer than this many seconds are truncated.
    pub max_speech_duration: f32,
    /// Model inference window in samples (512 at 16 kHz).
    pub window_size: usize,
    /// Capacity hint for the per-detector segment accumulator.
    pub buffer_size_seconds: f32,
}

impl Default for SileroVadSection {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/silero_vad.onnx"),
            threshold: 0.5,
            min_silence_duration: 0.5,
            min_speech_duration: 0.25,
            max_speech_duration: 30.0,
            window_size: 512,
            buffer_size_seconds: 60.0,
        }
    }
}

/// Tuning for the frame-level detector variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TenVadSection {
    /// Samples per classified hop.
    pub hop_size: usize,
    /// Minimum accumulated frames for a segment to be emitted.
    pub min_speech_frames: usize,
    /// Silence frames tolerated before a segment is finalized.
    pub max_silence_frames: usize,
}

impl Default for TenVadSection {
    fn default() -> Self {
        Self {
            hop_size: 256,
            min_speech_frames: 10,
            max_silence_frames: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionSection {
    pub model_path: PathBuf,
    pub tokens_path: PathBuf,
    pub num_threads: usize,
    /// ONNX execution provider name (informational; CPU is always used).
    pub provider: String,
}

impl Default for RecognitionSection {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/recognizer.onnx"),
            tokens_path: PathBuf::from("models/tokens.txt"),
            num_threads: 2,
            provider: "cpu".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeakerSection {
    pub enabled: bool,
    pub model_path: PathBuf,
    /// Cosine similarity threshold for identify/verify.
    pub threshold: f32,
    /// Directory holding the persisted voiceprint database.
    pub data_dir: PathBuf,
    pub num_threads: usize,
}

impl Default for SpeakerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            model_path: PathBuf::from("models/speaker.onnx"),
            threshold: 0.6,
            data_dir: PathBuf::from("data"),
            num_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub sample_rate: u32,
    /// Divisor applied when widening i16 PCM to f32 in [-1, 1].
    pub normalize_factor: f32,
    /// Capacity hint for per-frame sample buffers.
    pub chunk_size: usize,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            normalize_factor: 32768.0,
            chunk_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResponseSection {
    /// Per-frame VAD processing deadline in seconds.
    pub timeout: u64,
}

impl Default for ResponseSection {
    fn default() -> Self {
        Self { timeout: 5 }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file is not an error: defaults are used so the server can
    /// start with nothing but model paths in place. A present-but-malformed
    /// file is an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let config: ServerConfig = serde_yaml::from_str(&raw)
                .with_context(|| format!("failed to parse config file {}", path.display()))?;
            tracing::info!("Using config file: {}", path.display());
            config
        } else {
            tracing::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            ServerConfig::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// The socket address the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Reject configurations no component can run with.
    pub fn validate(&self) -> Result<()> {
        if self.vad.pool_size == 0 {
            anyhow::bail!("vad.pool_size must be at least 1");
        }
        if self.session.send_queue_size == 0 {
            anyhow::bail!("session.send_queue_size must be at least 1");
        }
        if self.audio.normalize_factor <= 0.0 {
            anyhow::bail!("audio.normalize_factor must be positive");
        }
        if self.audio.sample_rate != 8000 && self.audio.sample_rate != 16000 {
            anyhow::bail!(
                "audio.sample_rate must be 8000 or 16000, got {}",
                self.audio.sample_rate
            );
        }
        if self.vad.silero_vad.window_size == 0 {
            anyhow::bail!("vad.silero_vad.window_size must be at least 1");
        }
        if self.vad.ten_vad.hop_size == 0 {
            anyhow::bail!("vad.ten_vad.hop_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.vad.silero_vad.threshold) {
            anyhow::bail!("vad.silero_vad.threshold must be within [0, 1]");
        }
        Ok(())
    }
}
