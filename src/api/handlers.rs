//! Route handlers

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{Response, header},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;

use super::ApiError;
use crate::service::{GenerationService, ImageArtifact, MusicArtifact};

/// Music generation request
#[derive(Debug, Deserialize)]
pub struct GenerateMusicRequest {
    pub prompt: String,
}

/// Image generation request
#[derive(Debug, Deserialize)]
pub struct GenerateImageRequest {
    pub prompt: String,

    #[serde(default)]
    pub negative_prompt: Option<String>,
}

pub async fn root() -> Json<Value> {
    Json(json!({ "status": "ok", "docs": "/docs" }))
}

pub async fn docs() -> Json<Value> {
    Json(json!({
        "title": "musicgen-api",
        "endpoints": [
            { "method": "GET", "path": "/", "description": "Health check" },
            { "method": "POST", "path": "/generate-music", "body": { "prompt": "string" },
              "description": "Generate a 10 second WAV clip" },
            { "method": "POST", "path": "/generate-image",
              "body": { "prompt": "string", "negative_prompt": "string (optional)" },
              "description": "Generate a 256x256 PNG image" },
            { "method": "GET", "path": "/files/{filename}", "description": "Download a generated file" }
        ]
    }))
}

pub async fn generate_music(
    State(service): State<Arc<GenerationService>>,
    Json(req): Json<GenerateMusicRequest>,
) -> Result<Json<MusicArtifact>, ApiError> {
    let artifact = service
        .generate_music(&req.prompt)
        .await
        .map_err(|e| ApiError::from_generation("music", e))?;
    Ok(Json(artifact))
}

pub async fn generate_image(
    State(service): State<Arc<GenerationService>>,
    Json(req): Json<GenerateImageRequest>,
) -> Result<Json<ImageArtifact>, ApiError> {
    let artifact = service
        .generate_image(&req.prompt, req.negative_prompt.as_deref())
        .await
        .map_err(|e| ApiError::from_generation("image", e))?;
    Ok(Json(artifact))
}

pub async fn get_file(
    State(service): State<Arc<GenerationService>>,
    Path(filename): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let resolved = service.store().resolve(&filename).await?;
    let file = tokio::fs::File::open(&resolved.path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;

    Response::builder()
        .header(header::CONTENT_TYPE, resolved.media_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {e}")))
}
