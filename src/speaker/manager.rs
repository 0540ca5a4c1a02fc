//! Speaker manager: registration, identification, and verification against
//! the persisted voiceprint database.
//!
//! One reader-writer lock guards the database and the in-memory index
//! together, so the two can never be observed out of sync: register and
//! delete take the writer side, identify/verify/list/stats take the reader
//! side. Embedding extraction is CPU-bound and runs under
//! `spawn_blocking`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::index::{EmbeddingIndex, max_similarity};
use super::store::{self, DATABASE_FILENAME, SpeakerDatabase, SpeakerRecord};
use super::SpeakerError;
use crate::config::SpeakerSection;
use crate::engine::EmbeddingExtractor;

#[derive(Debug, Clone, Serialize)]
pub struct IdentifyResult {
    pub identified: bool,
    pub speaker_id: String,
    pub speaker_name: String,
    pub confidence: f32,
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub speaker_id: String,
    pub speaker_name: String,
    pub verified: bool,
    pub confidence: f32,
    pub threshold: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakerInfo {
    pub id: String,
    pub name: String,
    pub sample_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeakerStats {
    pub total_speakers: usize,
    pub total_samples: usize,
    pub embedding_dim: usize,
    pub threshold: f32,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

struct SpeakerState {
    database: SpeakerDatabase,
    index: EmbeddingIndex,
}

pub struct SpeakerManager {
    extractor: Arc<dyn EmbeddingExtractor>,
    state: RwLock<SpeakerState>,
    db_path: PathBuf,
    threshold: f32,
}

impl SpeakerManager {
    /// Open (or create) the database under the configured data directory
    /// and rebuild the in-memory index from it.
    pub fn new(
        config: &SpeakerSection,
        extractor: Arc<dyn EmbeddingExtractor>,
    ) -> Result<Self, SpeakerError> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| SpeakerError::Persistence(e.to_string()))?;
        let db_path = config.data_dir.join(DATABASE_FILENAME);

        let database = match store::load(&db_path) {
            Ok(database) => database,
            Err(e) => {
                if db_path.exists() {
                    warn!("Failed to load existing speaker database: {}", e);
                }
                SpeakerDatabase::default()
            }
        };

        let dim = extractor.dim();
        let mut index = EmbeddingIndex::new(dim);
        let mut loaded = 0usize;
        let mut total_embeddings = 0usize;
        for (speaker_id, record) in &database.speakers {
            if record.embeddings.is_empty() {
                continue;
            }
            if index.register(speaker_id, &record.embeddings) {
                loaded += 1;
                total_embeddings += record.embeddings.len();
            } else {
                warn!("Failed to register speaker {} to memory index", speaker_id);
            }
        }
        info!(
            "Loaded {} speakers with {} embeddings into memory index (dim={})",
            loaded, total_embeddings, dim
        );

        Ok(Self {
            extractor,
            state: RwLock::new(SpeakerState { database, index }),
            db_path,
            threshold: config.threshold,
        })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    async fn extract(&self, sample_rate: u32, samples: Vec<f32>) -> Result<Vec<f32>, SpeakerError> {
        let extractor = Arc::clone(&self.extractor);
        tokio::task::spawn_blocking(move || extractor.compute(sample_rate, &samples))
            .await
            .map_err(|e| SpeakerError::Extraction(e.to_string()))?
            .map_err(SpeakerError::from)
    }

    async fn persist(&self, database: &SpeakerDatabase) -> Result<(), SpeakerError> {
        let database = database.clone();
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || store::save_atomic(&path, &database))
            .await
            .map_err(|e| SpeakerError::Persistence(e.to_string()))?
            .map_err(|e| SpeakerError::Persistence(e.to_string()))
    }

    /// Enroll one clip for a speaker, creating the record on first use.
    ///
    /// Re-registration appends an embedding and updates the display name
    /// (last writer wins).
    pub async fn register(
        &self,
        speaker_id: &str,
        speaker_name: &str,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> Result<(), SpeakerError> {
        let mut state = self.state.write().await;

        let embedding = self.extract(sample_rate, samples).await?;

        let record = state
            .database
            .speakers
            .entry(speaker_id.to_string())
            .or_insert_with(|| {
                SpeakerRecord::new(speaker_id.to_string(), speaker_name.to_string())
            });
        record.embeddings.push(embedding);
        record.updated_at = Utc::now();
        record.sample_count += 1;
        record.name = speaker_name.to_string();

        // The index expects the complete vector set on every registration.
        let embeddings = record.embeddings.clone();
        let sample_count = record.sample_count;
        if !state.index.register(speaker_id, &embeddings) {
            return Err(SpeakerError::Extraction(
                "failed to register speaker to memory index".to_string(),
            ));
        }
        state.database.updated_at = Utc::now();

        self.persist(&state.database).await?;
        info!(
            "Registered speaker {} ({}) with {} samples",
            speaker_id, speaker_name, sample_count
        );
        Ok(())
    }

    /// Find the closest enrolled speaker for a clip.
    ///
    /// Never fails on an empty database: the result simply comes back
    /// unidentified.
    pub async fn identify(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> Result<IdentifyResult, SpeakerError> {
        let state = self.state.read().await;

        let embedding = self.extract(sample_rate, samples).await?;

        let mut result = IdentifyResult {
            identified: false,
            speaker_id: String::new(),
            speaker_name: String::new(),
            confidence: 0.0,
            threshold: self.threshold,
        };

        if let Some(speaker_id) = state.index.search(&embedding, self.threshold) {
            if let Some(record) = state.database.speakers.get(&speaker_id) {
                result.identified = true;
                result.speaker_id = speaker_id;
                result.speaker_name = record.name.clone();
                // Exact score against the matched record's full vector set.
                result.confidence = max_similarity(&embedding, &record.embeddings);
            }
        }

        Ok(result)
    }

    /// One-to-one check of a clip against a known speaker.
    pub async fn verify(
        &self,
        speaker_id: &str,
        samples: Vec<f32>,
        sample_rate: u32,
    ) -> Result<VerifyResult, SpeakerError> {
        let state = self.state.read().await;

        let record = state
            .database
            .speakers
            .get(speaker_id)
            .ok_or_else(|| SpeakerError::NotFound(speaker_id.to_string()))?;
        let speaker_name = record.name.clone();
        let embeddings = record.embeddings.clone();

        let embedding = self.extract(sample_rate, samples).await?;
        let confidence = max_similarity(&embedding, &embeddings);

        Ok(VerifyResult {
            speaker_id: speaker_id.to_string(),
            speaker_name,
            verified: confidence >= self.threshold,
            confidence,
            threshold: self.threshold,
        })
    }

    pub async fn list(&self) -> Vec<SpeakerInfo> {
        let state = self.state.read().await;
        state
            .database
            .speakers
            .values()
            .map(|record| SpeakerInfo {
                id: record.id.clone(),
                name: record.name.clone(),
                sample_count: record.sample_count,
                created_at: record.created_at,
                updated_at: record.updated_at,
            })
            .collect()
    }

    /// Remove a speaker from both the database and the index.
    pub async fn delete(&self, speaker_id: &str) -> Result<(), SpeakerError> {
        let mut state = self.state.write().await;

        if state.database.speakers.remove(speaker_id).is_none() {
            return Err(SpeakerError::NotFound(speaker_id.to_string()));
        }
        state.index.remove(speaker_id);
        state.database.updated_at = Utc::now();

        self.persist(&state.database).await?;
        info!("Deleted speaker {}", speaker_id);
        Ok(())
    }

    pub async fn stats(&self) -> SpeakerStats {
        let state = self.state.read().await;
        let total_samples = state
            .database
            .speakers
            .values()
            .map(|record| record.sample_count)
            .sum();
        SpeakerStats {
            total_speakers: state.database.speakers.len(),
            total_samples,
            embedding_dim: state.index.dim(),
            threshold: self.threshold,
            version: state.database.version.clone(),
            updated_at: state.database.updated_at,
        }
    }
}
