//! Generation pipelines.
//!
//! A [`Pipeline`] is a resident, stateful model that turns one set of
//! parameters into one artifact. The service never talks to a pipeline
//! directly: a [`crate::manager::GenerationManager`] owns it on a worker
//! thread and wraps every call in an invocation scope that releases
//! per-call resources afterwards.
//!
//! Two production pipelines ship with the crate:
//!
//! - [`musicgen`]: MusicGen (T5 encoder → codebook decoder → EnCodec) for text-to-music
//! - [`stable_diffusion`]: Stable Diffusion v1.5 (CLIP → UNet/DDIM → VAE) for text-to-image

pub mod musicgen;
pub mod stable_diffusion;

use crate::Result;

pub use musicgen::MusicGenPipeline;
pub use stable_diffusion::StableDiffusionPipeline;

/// A resident model invoked once per request.
pub trait Pipeline: Send + 'static {
    type Params: Send + 'static;
    type Output: Send + 'static;

    /// Run one generation.
    fn generate(&mut self, params: &Self::Params) -> Result<Self::Output>;

    /// Drop per-invocation state and hand accelerator memory back.
    ///
    /// Runs after every invocation, whether it succeeded, failed or panicked.
    fn release(&mut self) {}
}

/// Parameters for one text-to-music invocation.
#[derive(Debug, Clone)]
pub struct AudioParams {
    pub prompt: String,
    pub seed: u32,
    /// Decoder length including the BOS position.
    pub max_length: usize,
    pub guidance_scale: f64,
    pub top_k: usize,
}

/// Parameters for one text-to-image invocation.
#[derive(Debug, Clone)]
pub struct ImageParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
    pub seed: u32,
}

/// Raw audio returned by a text-to-music pipeline.
#[derive(Debug, Clone)]
pub struct GeneratedAudio {
    /// Interleaved samples, nominally in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// An RGB8 image returned by a text-to-image pipeline.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB bytes, `width * height * 3` long.
    pub pixels: Vec<u8>,
}
