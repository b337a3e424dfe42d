//! Text-to-music and text-to-image generation over HTTP.
//!
//! Two resident candle pipelines sit behind a small axum API:
//!
//! ```text
//! POST /generate-music → MusicGen (T5 → codebook decoder → EnCodec) → WAV
//! POST /generate-image → Stable Diffusion v1.5 (CLIP → UNet/DDIM → VAE) → PNG
//! GET  /files/{name}   → stored artifact
//! ```
//!
//! Every request follows the same lifecycle: validate the prompt, draw a
//! seed, invoke the pipeline through its [`manager::GenerationManager`],
//! write the artifact to the output directory and describe it.
//!
//! ## Modules
//!
//! - [`api`]: axum router, handlers, error responses, CORS
//! - [`service`]: the request lifecycle
//! - [`artifact`]: filenames, storage and media types
//! - [`manager`]: resident pipeline workers with scoped cleanup, device helpers
//! - [`pipeline`]: the `Pipeline` trait plus MusicGen and Stable Diffusion
//! - [`model`]: MusicGen codebook decoder
//! - [`audio`], [`png`]: WAV and PNG encoding
//! - [`config`]: generation and server settings

pub mod api;
pub mod artifact;
pub mod audio;
pub mod config;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod png;
pub mod service;

mod error;

pub use error::{Error, Result};
