//! Speaker identification HTTP handlers.
//!
//! All audio arrives as multipart WAV uploads. Field validation failures
//! map to 400, an unknown speaker to 404, and persistence or engine
//! failures to 500 (see `AppError`).

use std::sync::Arc;

use axum::{
    Json,
    extract::{Multipart, Path, State},
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::audio;
use crate::errors::{AppError, AppResult};
use crate::speaker::{SpeakerError, SpeakerManager};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub message: String,
    pub speaker_id: String,
    pub speaker_name: String,
}

/// Parsed multipart upload: optional form fields plus the decoded clip.
struct SpeakerUpload {
    speaker_id: Option<String>,
    speaker_name: Option<String>,
    samples: Vec<f32>,
    sample_rate: u32,
}

fn speaker_manager(state: &AppState) -> Result<&Arc<SpeakerManager>, AppError> {
    state
        .speaker
        .as_ref()
        .ok_or_else(|| AppError::NotFound("speaker recognition is disabled".to_string()))
}

/// Pull the form fields and WAV clip out of a multipart body.
async fn parse_upload(
    mut multipart: Multipart,
    normalize_factor: f32,
) -> Result<SpeakerUpload, SpeakerError> {
    let mut speaker_id = None;
    let mut speaker_name = None;
    let mut decoded = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| SpeakerError::InvalidWav(e.to_string()))?
    {
        // Field consumption moves the field, so the name is copied out first.
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("speaker_id") => {
                speaker_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| SpeakerError::InvalidWav(e.to_string()))?,
                );
            }
            Some("speaker_name") => {
                speaker_name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| SpeakerError::InvalidWav(e.to_string()))?,
                );
            }
            Some("audio") => {
                let filename = field.file_name().unwrap_or_default().to_lowercase();
                if !filename.ends_with(".wav") {
                    return Err(SpeakerError::InvalidWav(
                        "only WAV files are supported".to_string(),
                    ));
                }
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| SpeakerError::InvalidWav(e.to_string()))?;
                debug!("Received audio upload {} ({} bytes)", filename, bytes.len());
                decoded = Some(audio::decode_wav(&bytes, normalize_factor)?);
            }
            _ => {}
        }
    }

    let decoded = decoded.ok_or(SpeakerError::MissingField("audio file"))?;
    Ok(SpeakerUpload {
        speaker_id,
        speaker_name,
        samples: decoded.samples,
        sample_rate: decoded.sample_rate,
    })
}

/// `POST /api/v1/speaker/register`
pub async fn register_speaker(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> AppResult<Json<RegisterResponse>> {
    let manager = speaker_manager(&state)?;
    let upload = parse_upload(multipart, state.config.audio.normalize_factor).await?;

    let speaker_id = upload
        .speaker_id
        .filter(|id| !id.is_empty())
        .ok_or(SpeakerError::MissingField("speaker_id"))?;
    let speaker_name = upload
        .speaker_name
        .filter(|name| !name.is_empty())
        .ok_or(SpeakerError::MissingField("speaker_name"))?;

    manager
        .register(&speaker_id, &speaker_name, upload.samples, upload.sample_rate)
        .await?;

    Ok(Json(RegisterResponse {
        message: "Speaker registered successfully".to_string(),
        speaker_id,
        speaker_name,
    }))
}

/// `POST /api/v1/speaker/identify`
pub async fn identify_speaker(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> AppResult<Json<crate::speaker::IdentifyResult>> {
    let manager = speaker_manager(&state)?;
    let upload = parse_upload(multipart, state.config.audio.normalize_factor).await?;

    let result = manager.identify(upload.samples, upload.sample_rate).await?;
    Ok(Json(result))
}

/// `POST /api/v1/speaker/verify/{speaker_id}`
pub async fn verify_speaker(
    State(state): State<Arc<AppState>>,
    Path(speaker_id): Path<String>,
    multipart: Multipart,
) -> AppResult<Json<crate::speaker::VerifyResult>> {
    let manager = speaker_manager(&state)?;
    if speaker_id.is_empty() {
        return Err(SpeakerError::MissingField("speaker_id").into());
    }
    let upload = parse_upload(multipart, state.config.audio.normalize_factor).await?;

    let result = manager
        .verify(&speaker_id, upload.samples, upload.sample_rate)
        .await?;
    Ok(Json(result))
}

/// `GET /api/v1/speaker/list`
pub async fn list_speakers(State(state): State<Arc<AppState>>) -> AppResult<Json<Value>> {
    let manager = speaker_manager(&state)?;
    let speakers = manager.list().await;
    Ok(Json(json!({
        "speakers": speakers,
        "total": speakers.len(),
    })))
}

/// `DELETE /api/v1/speaker/{speaker_id}`
pub async fn delete_speaker(
    State(state): State<Arc<AppState>>,
    Path(speaker_id): Path<String>,
) -> AppResult<Json<Value>> {
    let manager = speaker_manager(&state)?;
    manager.delete(&speaker_id).await?;
    Ok(Json(json!({
        "message": "Speaker deleted successfully",
        "speaker_id": speaker_id,
    })))
}

/// `GET /api/v1/speaker/stats`
pub async fn speaker_stats(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<crate::speaker::SpeakerStats>> {
    let manager = speaker_manager(&state)?;
    Ok(Json(manager.stats().await))
}
