//! Persisted voiceprint database.
//!
//! A single JSON document is the source of truth at rest; the in-memory
//! index is reconstructed from it on startup. Every mutation re-serializes
//! the whole database to a temporary file and renames it into place so a
//! crash mid-write can never leave a torn document behind.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DATABASE_VERSION: &str = "1.0.0";
pub const DATABASE_FILENAME: &str = "speaker.json";

/// One enrolled speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerRecord {
    pub id: String,
    pub name: String,
    pub embeddings: Vec<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sample_count: usize,
}

impl SpeakerRecord {
    pub fn new(id: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            embeddings: Vec::new(),
            created_at: now,
            updated_at: now,
            sample_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerDatabase {
    pub speakers: HashMap<String, SpeakerRecord>,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

impl Default for SpeakerDatabase {
    fn default() -> Self {
        Self {
            speakers: HashMap::new(),
            version: DATABASE_VERSION.to_string(),
            updated_at: Utc::now(),
        }
    }
}

/// Load the database from disk.
pub fn load(path: &Path) -> std::io::Result<SpeakerDatabase> {
    let raw = std::fs::read(path)?;
    serde_json::from_slice(&raw).map_err(std::io::Error::other)
}

/// Atomically persist the database: write a sibling temp file, then rename
/// it over the target.
pub fn save_atomic(path: &Path, database: &SpeakerDatabase) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(database).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
