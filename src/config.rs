//! Configuration for the generation service.
//!
//! The generation constants (10 s of music, 256×256 images in 8 steps) are part
//! of the HTTP contract and are echoed back in every response, so they live
//! here as defaults rather than as request parameters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Text-to-music settings (MusicGen).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicConfig {
    /// HuggingFace repo holding `config.json`, `model.safetensors` and `tokenizer.json`.
    pub model_id: String,
    /// Fixed output duration in seconds.
    pub seconds: u32,
    /// Decoder positions per second of audio (EnCodec 32 kHz frame rate).
    pub frames_per_second: usize,
    /// Classifier-free guidance scale.
    pub guidance_scale: f64,
    /// Top-k sampling cutoff.
    pub top_k: usize,
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            model_id: "facebook/musicgen-small".to_string(),
            seconds: 10,
            frames_per_second: 50,
            guidance_scale: 3.0,
            top_k: 250,
        }
    }
}

impl MusicConfig {
    /// Total decoder length, BOS included.
    pub fn max_length(&self) -> usize {
        self.seconds as usize * self.frames_per_second
    }
}

/// Text-to-image settings (Stable Diffusion v1.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// HuggingFace repo holding the `unet/`, `vae/` and `text_encoder/` weights.
    pub model_id: String,
    /// HuggingFace repo holding the CLIP `tokenizer.json`.
    pub tokenizer_id: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    /// Skip loading at startup; the image endpoint then reports the model as unavailable.
    pub disabled: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            model_id: "stable-diffusion-v1-5/stable-diffusion-v1-5".to_string(),
            tokenizer_id: "openai/clip-vit-base-patch32".to_string(),
            width: 256,
            height: 256,
            steps: 8,
            guidance_scale: 7.5,
            disabled: false,
        }
    }
}

/// HTTP server and artifact storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Flat directory all artifacts are written to and served from.
    pub outputs_dir: PathBuf,
    /// Public URL prefix for artifacts; the filename is appended after a `/`.
    pub public_base_url: String,
    pub cors_origins: Vec<String>,
    /// CUDA device ordinal. Ignored when CUDA is unavailable.
    pub cuda_device: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            outputs_dir: PathBuf::from("outputs"),
            public_base_url: "http://localhost:8000/files".to_string(),
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            cuda_device: 0,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_music_defaults() {
        let cfg = MusicConfig::default();
        assert_eq!(cfg.seconds, 10);
        assert_eq!(cfg.max_length(), 500);
        assert_eq!(cfg.top_k, 250);
    }

    #[test]
    fn test_image_defaults() {
        let cfg = ImageConfig::default();
        assert_eq!((cfg.width, cfg.height, cfg.steps), (256, 256, 8));
        assert!(!cfg.disabled);
    }

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8000");
        assert_eq!(cfg.outputs_dir, PathBuf::from("outputs"));
        assert_eq!(cfg.cors_origins.len(), 2);
    }
}
