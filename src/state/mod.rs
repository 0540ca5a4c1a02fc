//! Application state shared across handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::engine::{
    DetectorFactory, EmbeddingExtractor, OnnxEmbeddingExtractor, OnnxRecognizer, RecognitionEngine,
    SileroDetectorFactory,
};
use crate::pool::VadPool;
use crate::session::SessionManager;
use crate::speaker::SpeakerManager;

/// Shared application state.
///
/// The VAD pool and session manager are mandatory components but are
/// optional here so a state without them is representable: `/health`
/// reports 503/"initializing" until both are present, and the streaming
/// endpoint refuses upgrades.
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub session_manager: Option<Arc<SessionManager>>,
    pub vad_pool: Option<Arc<VadPool>>,
    pub speaker: Option<Arc<SpeakerManager>>,
}

impl AppState {
    /// A state with no components constructed yet.
    pub fn uninitialized(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            session_manager: None,
            vad_pool: None,
            speaker: None,
        })
    }

    /// Whether every mandatory component is in place.
    pub fn is_initialized(&self) -> bool {
        self.session_manager.is_some() && self.vad_pool.is_some()
    }

    /// Construct state with the production ONNX engines.
    ///
    /// Recognizer and VAD pool construction failures abort startup; the
    /// speaker module is optional and degrades to disabled with a warning.
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let recognition = config.recognition.clone();
        let recognizer = tokio::task::spawn_blocking(move || OnnxRecognizer::new(&recognition))
            .await
            .context("recognizer construction task failed")?
            .context("failed to initialize recognizer")?;

        let factory =
            SileroDetectorFactory::from_config(&config).context("failed to configure VAD")?;

        let extractor: Option<Arc<dyn EmbeddingExtractor>> = if config.speaker.enabled {
            let speaker_config = config.speaker.clone();
            let built =
                tokio::task::spawn_blocking(move || OnnxEmbeddingExtractor::new(&speaker_config))
                    .await
                    .context("speaker extractor construction task failed")?;
            match built {
                Ok(extractor) => Some(Arc::new(extractor)),
                Err(e) => {
                    warn!(
                        "Failed to initialize speaker recognition module, continuing without it: {}",
                        e
                    );
                    None
                }
            }
        } else {
            None
        };

        Self::with_engines(config, Arc::new(recognizer), Arc::new(factory), extractor).await
    }

    /// Construct state with caller-provided engines.
    ///
    /// This is the capability seam: tests and embedders inject their own
    /// engine implementations here; nothing in the pipeline reaches for a
    /// process-wide singleton.
    pub async fn with_engines(
        config: ServerConfig,
        recognizer: Arc<dyn RecognitionEngine>,
        detector_factory: Arc<dyn DetectorFactory>,
        extractor: Option<Arc<dyn EmbeddingExtractor>>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        let vad_pool = Arc::new(VadPool::new(config.vad.pool_size, detector_factory));
        vad_pool
            .initialize()
            .await
            .context("failed to initialize VAD pool")?;

        let session_manager = Arc::new(SessionManager::new(
            recognizer,
            Arc::clone(&vad_pool),
            Arc::clone(&config),
        ));

        let speaker = match extractor {
            Some(extractor) => match SpeakerManager::new(&config.speaker, extractor) {
                Ok(manager) => Some(Arc::new(manager)),
                Err(e) => {
                    warn!(
                        "Failed to initialize speaker manager, continuing without it: {}",
                        e
                    );
                    None
                }
            },
            None => None,
        };

        info!("All components initialized");
        Ok(Arc::new(Self {
            config,
            session_manager: Some(session_manager),
            vad_pool: Some(vad_pool),
            speaker,
        }))
    }

    /// Close all sessions, then tear down the pool.
    pub async fn shutdown(&self) {
        if let Some(session_manager) = &self.session_manager {
            session_manager.shutdown();
        }
        if let Some(vad_pool) = &self.vad_pool {
            vad_pool.shutdown().await;
        }
    }
}
