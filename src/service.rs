//! The generation-request lifecycle.
//!
//! validate → draw seed → invoke pipeline → write artifact → describe artifact.
//!
//! Both flows share this shape. Pipelines are reached only through their
//! [`GenerationManager`], which serializes invocations and releases
//! per-call resources.

use chrono::Local;
use rand::Rng;
use serde::Serialize;

use crate::artifact::{ArtifactKind, ArtifactStore, StoredArtifact};
use crate::audio::encode_wav;
use crate::config::{ImageConfig, MusicConfig};
use crate::manager::GenerationManager;
use crate::pipeline::{AudioParams, GeneratedAudio, GeneratedImage, ImageParams};
use crate::png::encode_png;
use crate::{Error, Result};

pub type MusicManager = GenerationManager<AudioParams, GeneratedAudio>;
pub type ImageManager = GenerationManager<ImageParams, GeneratedImage>;

/// Detail reported when the image pipeline never came up.
pub const IMAGE_MODEL_UNAVAILABLE: &str =
    "Image model not loaded. Ensure the model download succeeded.";

/// The image pipeline as it stands after startup.
#[derive(Debug, Clone)]
pub enum ImageBackend {
    Ready(ImageManager),
    /// Loading failed or was skipped; holds the reason for logs.
    Unavailable(String),
}

/// Response body for a generated music artifact.
#[derive(Debug, Clone, Serialize)]
pub struct MusicArtifact {
    pub file: String,
    #[serde(rename = "fileUrl")]
    pub file_url: String,
    pub filename: String,
    pub seconds: u32,
    pub seed: u32,
}

/// Response body for a generated image artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ImageArtifact {
    pub file: String,
    #[serde(rename = "fileUrl")]
    pub file_url: String,
    pub filename: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub seed: u32,
}

/// Everything a request needs: pipelines, artifact store and fixed settings.
#[derive(Debug)]
pub struct GenerationService {
    music: MusicManager,
    image: ImageBackend,
    store: ArtifactStore,
    music_config: MusicConfig,
    image_config: ImageConfig,
}

impl GenerationService {
    pub fn new(
        music: MusicManager,
        image: ImageBackend,
        store: ArtifactStore,
        music_config: MusicConfig,
        image_config: ImageConfig,
    ) -> Self {
        Self {
            music,
            image,
            store,
            music_config,
            image_config,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn image_available(&self) -> bool {
        matches!(self.image, ImageBackend::Ready(_))
    }

    /// Generate a fixed-length music clip for `prompt`.
    pub async fn generate_music(&self, prompt: &str) -> Result<MusicArtifact> {
        validate_prompt(prompt)?;
        let seed = draw_seed();
        tracing::info!(seed, seconds = self.music_config.seconds, "generating music");

        let params = AudioParams {
            prompt: prompt.to_string(),
            seed,
            max_length: self.music_config.max_length(),
            guidance_scale: self.music_config.guidance_scale,
            top_k: self.music_config.top_k,
        };
        let stored = self
            .produce_music(params)
            .await
            .inspect_err(|error| tracing::error!(seed, %error, "music generation failed"))?;

        Ok(MusicArtifact {
            file: stored.path.display().to_string(),
            file_url: stored.url,
            filename: stored.filename,
            seconds: self.music_config.seconds,
            seed,
        })
    }

    async fn produce_music(&self, params: AudioParams) -> Result<StoredArtifact> {
        let seed = params.seed;
        let audio = self.music.generate(params).await?;
        let bytes = encode_wav(&audio.samples, audio.sample_rate, audio.channels)?;
        let filename = ArtifactKind::Music.filename(Local::now(), seed);
        self.store.write(&filename, &bytes).await
    }

    /// Generate one image for `prompt`, steered away from `negative_prompt`.
    pub async fn generate_image(
        &self,
        prompt: &str,
        negative_prompt: Option<&str>,
    ) -> Result<ImageArtifact> {
        validate_prompt(prompt)?;
        let manager = match &self.image {
            ImageBackend::Ready(manager) => manager,
            ImageBackend::Unavailable(reason) => {
                tracing::error!(%reason, "image generation requested but model is not loaded");
                return Err(Error::ModelUnavailable(IMAGE_MODEL_UNAVAILABLE.to_string()));
            }
        };
        let seed = draw_seed();
        tracing::info!(
            seed,
            steps = self.image_config.steps,
            negative = negative_prompt.is_some(),
            "generating image"
        );

        let params = ImageParams {
            prompt: prompt.to_string(),
            negative_prompt: negative_prompt.map(str::to_string),
            width: self.image_config.width,
            height: self.image_config.height,
            steps: self.image_config.steps,
            guidance_scale: self.image_config.guidance_scale,
            seed,
        };
        let stored = self
            .produce_image(manager, params)
            .await
            .inspect_err(|error| tracing::error!(seed, %error, "image generation failed"))?;

        Ok(ImageArtifact {
            file: stored.path.display().to_string(),
            file_url: stored.url,
            filename: stored.filename,
            width: self.image_config.width,
            height: self.image_config.height,
            steps: self.image_config.steps,
            seed,
        })
    }

    async fn produce_image(&self, manager: &ImageManager, params: ImageParams) -> Result<StoredArtifact> {
        let seed = params.seed;
        let image = manager.generate(params).await?;
        let bytes = encode_png(&image)?;
        let filename = ArtifactKind::Image.filename(Local::now(), seed);
        self.store.write(&filename, &bytes).await
    }
}

/// Reject empty or whitespace-only prompts. Accepted prompts are used as given.
pub fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(Error::InvalidArgument("prompt is required".to_string()));
    }
    Ok(())
}

/// Fresh per-request seed, uniform over the full `u32` range.
pub fn draw_seed() -> u32 {
    rand::rng().random::<u32>()
}
